//! Integration tests for sealing, unsealing and versioning documents

mod common;

use ::common::document::{SealScope, UnsealKey};
use ::common::prelude::*;

#[tokio::test]
async fn test_seal_for_keysafe_and_unseal() {
    let (courier, member) = common::setup().await;
    let details = Details {
        subject: Some("contract".into()),
        comment: Some("second draft".into()),
        ..Default::default()
    };

    let mut tx = courier.begin().await.unwrap();
    let sealed = courier
        .documents()
        .seal(tx.as_mut(), &details, SealScope::KeySafe(&member.vault))
        .await
        .unwrap();
    assert_eq!(sealed.version, 1);
    assert_eq!(sealed.keysafe, Some(member.vault.id));
    tx.commit().await.unwrap();

    let capability = member.session.capability(member.vault.id).unwrap();
    let mut tx = courier.begin().await.unwrap();
    let opened = courier
        .documents()
        .unseal::<Details>(tx.as_mut(), sealed.id, UnsealKey::Capability(&capability))
        .await
        .unwrap();
    assert_eq!(opened.body(), &details);
    assert_eq!(opened.serial(), sealed.serial);
}

#[tokio::test]
async fn test_wrong_key_fails_to_unseal() {
    let (courier, member) = common::setup().await;
    let other = common::member(&courier).await;

    let mut tx = courier.begin().await.unwrap();
    let sealed = courier
        .documents()
        .seal(tx.as_mut(), &Details::default(), SealScope::KeySafe(&member.vault))
        .await
        .unwrap();

    let capability = other.session.capability(other.vault.id).unwrap();
    let result = courier
        .documents()
        .unseal::<Details>(tx.as_mut(), sealed.id, UnsealKey::Capability(&capability))
        .await;
    assert!(matches!(result, Err(Error::UnlockFailure)));

    let result = courier
        .documents()
        .unseal::<Details>(tx.as_mut(), sealed.id, UnsealKey::Code("12345678"))
        .await;
    assert!(matches!(result, Err(Error::UnlockFailure)));
}

#[tokio::test]
async fn test_code_sealed_document() {
    let courier = Courier::memory();
    let mut tx = courier.begin().await.unwrap();
    let sealed = courier
        .documents()
        .seal(tx.as_mut(), &Details::default(), SealScope::Code("24681357"))
        .await
        .unwrap();

    assert!(courier
        .documents()
        .unseal::<Details>(tx.as_mut(), sealed.id, UnsealKey::Code("24681357"))
        .await
        .is_ok());
    assert!(matches!(
        courier
            .documents()
            .unseal::<Details>(tx.as_mut(), sealed.id, UnsealKey::Code("24681358"))
            .await,
        Err(Error::UnlockFailure)
    ));
}

#[tokio::test]
async fn test_unseal_key_must_match_scope() {
    let (courier, member) = common::setup().await;
    let capability = member.session.capability(member.vault.id).unwrap();

    let mut tx = courier.begin().await.unwrap();
    let plain = courier
        .documents()
        .seal(tx.as_mut(), &Details::default(), SealScope::Plain)
        .await
        .unwrap();
    let coded = courier
        .documents()
        .seal(tx.as_mut(), &Details::default(), SealScope::Code("24681357"))
        .await
        .unwrap();

    for key in [UnsealKey::Code("24681357"), UnsealKey::Capability(&capability)] {
        let result = courier
            .documents()
            .unseal::<Details>(tx.as_mut(), plain.id, key)
            .await;
        assert!(matches!(result, Err(Error::UnlockFailure)));
    }
    let result = courier
        .documents()
        .unseal::<Details>(tx.as_mut(), coded.id, UnsealKey::Plain)
        .await;
    assert!(matches!(result, Err(Error::UnlockFailure)));

    assert!(courier
        .documents()
        .unseal::<Details>(tx.as_mut(), plain.id, UnsealKey::Plain)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_update_chains_versions() {
    let courier = Courier::memory();
    let mut tx = courier.begin().await.unwrap();
    let v1 = courier
        .documents()
        .seal(tx.as_mut(), &Details::default(), SealScope::Code("11223344"))
        .await
        .unwrap();

    let mut opened = courier
        .documents()
        .unseal::<Details>(tx.as_mut(), v1.id, UnsealKey::Code("11223344"))
        .await
        .unwrap();
    opened.body_mut().subject = Some("edited".into());
    let v2 = courier
        .documents()
        .update(tx.as_mut(), &opened, v1.id)
        .await
        .unwrap();

    assert_eq!(v2.serial, v1.serial);
    assert_eq!(v2.version, 2);
    assert_ne!(v2.id, v1.id);

    let latest = courier
        .documents()
        .latest(tx.as_mut(), v1.serial)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.id, v2.id);

    // the new version opens with the same code
    let reopened = courier
        .documents()
        .unseal::<Details>(tx.as_mut(), v2.id, UnsealKey::Code("11223344"))
        .await
        .unwrap();
    assert_eq!(reopened.body().subject.as_deref(), Some("edited"));
    assert_eq!(reopened.version(), 2);
}

#[tokio::test]
async fn test_update_from_old_version_is_stale() {
    let courier = Courier::memory();
    let mut tx = courier.begin().await.unwrap();
    let v1 = courier
        .documents()
        .seal(tx.as_mut(), &Details::default(), SealScope::Plain)
        .await
        .unwrap();
    let opened = courier
        .documents()
        .unseal::<Details>(tx.as_mut(), v1.id, UnsealKey::Plain)
        .await
        .unwrap();

    courier
        .documents()
        .update(tx.as_mut(), &opened, v1.id)
        .await
        .unwrap();
    let result = courier.documents().update(tx.as_mut(), &opened, v1.id).await;
    assert!(matches!(result, Err(Error::StaleVersion)));
}

#[tokio::test]
async fn test_concurrent_updates_conflict_on_commit() {
    let courier = Courier::memory();
    let mut tx = courier.begin().await.unwrap();
    let v1 = courier
        .documents()
        .seal(tx.as_mut(), &Details::default(), SealScope::Plain)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut first = courier.begin().await.unwrap();
    let mut second = courier.begin().await.unwrap();
    let a = courier
        .documents()
        .unseal::<Details>(first.as_mut(), v1.id, UnsealKey::Plain)
        .await
        .unwrap();
    let b = courier
        .documents()
        .unseal::<Details>(second.as_mut(), v1.id, UnsealKey::Plain)
        .await
        .unwrap();

    courier
        .documents()
        .update(first.as_mut(), &a, v1.id)
        .await
        .unwrap();
    courier
        .documents()
        .update(second.as_mut(), &b, v1.id)
        .await
        .unwrap();

    first.commit().await.unwrap();
    let result: ::common::Result<()> = second.commit().await.map_err(Error::from);
    assert!(matches!(result, Err(Error::StaleVersion)));
}

#[tokio::test]
async fn test_update_against_other_serial() {
    let courier = Courier::memory();
    let mut tx = courier.begin().await.unwrap();
    let first = courier
        .documents()
        .seal(tx.as_mut(), &Details::default(), SealScope::Plain)
        .await
        .unwrap();
    let second = courier
        .documents()
        .seal(tx.as_mut(), &Details::default(), SealScope::Plain)
        .await
        .unwrap();

    let opened = courier
        .documents()
        .unseal::<Details>(tx.as_mut(), first.id, UnsealKey::Plain)
        .await
        .unwrap();
    let result = courier
        .documents()
        .update(tx.as_mut(), &opened, second.id)
        .await;
    assert!(matches!(result, Err(Error::SerialMismatch { .. })));
}

#[tokio::test]
async fn test_purge_removes_every_version() {
    let courier = Courier::memory();
    let mut tx = courier.begin().await.unwrap();
    let v1 = courier
        .documents()
        .seal(tx.as_mut(), &Details::default(), SealScope::Plain)
        .await
        .unwrap();
    let opened = courier
        .documents()
        .unseal::<Details>(tx.as_mut(), v1.id, UnsealKey::Plain)
        .await
        .unwrap();
    courier
        .documents()
        .update(tx.as_mut(), &opened, v1.id)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = courier.begin().await.unwrap();
    assert_eq!(courier.documents().purge(tx.as_mut(), v1.serial).await.unwrap(), 2);
    tx.commit().await.unwrap();

    let mut tx = courier.begin().await.unwrap();
    let result = courier
        .documents()
        .unseal::<Details>(tx.as_mut(), v1.id, UnsealKey::Plain)
        .await;
    assert!(matches!(result, Err(Error::UnlockFailure)));
}
