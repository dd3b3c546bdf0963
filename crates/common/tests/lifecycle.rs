//! Integration tests for the allocation lifecycle: downloads, expiry,
//! clearing and derived allocations

mod common;

use chrono::{Duration, Utc};

use ::common::prelude::*;
use ::common::store::{ContentStore, ListingCriteria};

#[tokio::test]
async fn test_download_decrypts_and_records() {
    let (courier, member) = common::setup().await;
    let dispatch = common::dispatch(&courier, &member, vec![common::upload("a.txt", "hello")]).await;

    let mut tx = courier.begin().await.unwrap();
    let files = courier
        .allocations()
        .retrieve_files(&member.session, tx.as_mut(), dispatch.id)
        .await
        .unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].descriptor.name, "a.txt");
    assert_eq!(files[0].descriptor.mime_type, "text/plain");

    let downloaded = courier
        .allocations()
        .download(&member.session, tx.as_mut(), files[0].file.id)
        .await
        .unwrap();
    assert_eq!(&downloaded.data[..], b"hello");
    assert_eq!(downloaded.file.download_count, 1);

    let events = courier
        .backend()
        .events
        .file_downloads(dispatch.id)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn test_max_downloads_expires_file() {
    let (courier, member) = common::setup().await;
    let file = common::upload("report.pdf", "%PDF-1.7").with_max_downloads(2);
    let dispatch = common::dispatch(&courier, &member, vec![file]).await;

    let mut tx = courier.begin().await.unwrap();
    let files = courier
        .allocations()
        .retrieve_files(&member.session, tx.as_mut(), dispatch.id)
        .await
        .unwrap();
    let file_id = files[0].file.id;

    let first = courier
        .allocations()
        .download(&member.session, tx.as_mut(), file_id)
        .await
        .unwrap();
    assert!(first.file.expires.is_none());

    // the download that reaches the limit still succeeds
    let second = courier
        .allocations()
        .download(&member.session, tx.as_mut(), file_id)
        .await
        .unwrap();
    assert_eq!(second.file.download_count, 2);
    assert!(second.file.expires.is_some());

    let third = courier
        .allocations()
        .download(&member.session, tx.as_mut(), file_id)
        .await;
    assert!(matches!(third, Err(Error::Expired)));
}

#[tokio::test]
async fn test_download_limit_expires_only_that_file() {
    let (courier, member) = common::setup().await;
    let dispatch = common::dispatch(
        &courier,
        &member,
        vec![
            common::upload("terms.txt", "unlimited"),
            common::upload("key.txt", "once").with_max_downloads(1),
        ],
    )
    .await;

    let mut tx = courier.begin().await.unwrap();
    let files = courier
        .allocations()
        .retrieve_files(&member.session, tx.as_mut(), dispatch.id)
        .await
        .unwrap();
    let (terms, key) = (files[0].file.id, files[1].file.id);

    let downloaded = courier
        .allocations()
        .download(&member.session, tx.as_mut(), key)
        .await
        .unwrap();
    assert_eq!(&downloaded.data[..], b"once");

    let mut tx = courier.begin().await.unwrap();
    let now = Utc::now();
    let key = tx.file(key).await.unwrap().unwrap();
    assert!(key.is_expired_at(now));
    let terms = tx.file(terms).await.unwrap().unwrap();
    assert!(terms.is_active());
    assert!(!terms.is_expired_at(now));

    let allocation = tx.allocation(dispatch.id).await.unwrap().unwrap();
    assert_eq!(allocation.state(), AllocationState::Active);

    let again = courier
        .allocations()
        .download(&member.session, tx.as_mut(), terms.id)
        .await
        .unwrap();
    assert_eq!(&again.data[..], b"unlimited");
}

#[tokio::test]
async fn test_dropped_clear_keeps_content() {
    let (courier, member) = common::setup().await;
    let dispatch = common::dispatch(&courier, &member, vec![common::upload("a.txt", "kept")]).await;

    let mut tx = courier.begin().await.unwrap();
    let files = courier
        .allocations()
        .retrieve_files(&member.session, tx.as_mut(), dispatch.id)
        .await
        .unwrap();
    courier
        .allocations()
        .clear_allocation_file(tx.as_mut(), files[0].file.id, true)
        .await
        .unwrap();
    drop(tx);

    let content = files[0].descriptor.content;
    assert!(courier
        .backend()
        .content
        .retrieve(content)
        .await
        .unwrap()
        .is_some());

    let mut tx = courier.begin().await.unwrap();
    let downloaded = courier
        .allocations()
        .download(&member.session, tx.as_mut(), files[0].file.id)
        .await
        .unwrap();
    assert_eq!(&downloaded.data[..], b"kept");
}

#[tokio::test]
async fn test_dropped_upload_stores_nothing() {
    let (courier, member) = common::setup().await;

    let mut tx = courier.begin().await.unwrap();
    let dispatch = courier
        .dispatches()
        .create_dispatch(
            &member.session,
            tx.as_mut(),
            member.vault.id,
            Details::default(),
            None,
            vec![common::upload("draft.txt", "never sent")],
        )
        .await
        .unwrap();
    let contents: Vec<_> = tx
        .files_for_allocation(dispatch.id)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|f| f.content)
        .collect();
    assert_eq!(contents.len(), 1);
    assert!(courier
        .backend()
        .content
        .retrieve(contents[0])
        .await
        .unwrap()
        .is_none());
    drop(tx);

    assert!(courier
        .backend()
        .content
        .retrieve(contents[0])
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_clearing_last_file_expires_allocation() {
    let (courier, member) = common::setup().await;
    let dispatch = common::dispatch(
        &courier,
        &member,
        vec![common::upload("a.txt", "a"), common::upload("b.txt", "b")],
    )
    .await;

    let mut tx = courier.begin().await.unwrap();
    let files = courier
        .allocations()
        .retrieve_files(&member.session, tx.as_mut(), dispatch.id)
        .await
        .unwrap();
    let contents: Vec<_> = files.iter().map(|f| f.descriptor.content).collect();

    courier
        .allocations()
        .clear_allocation_file(tx.as_mut(), files[0].file.id, true)
        .await
        .unwrap();
    let allocation = tx.allocation(dispatch.id).await.unwrap().unwrap();
    assert_eq!(allocation.state(), AllocationState::Active);

    courier
        .allocations()
        .clear_allocation_file(tx.as_mut(), files[1].file.id, true)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = courier.begin().await.unwrap();
    let allocation = tx.allocation(dispatch.id).await.unwrap().unwrap();
    assert_eq!(allocation.state(), AllocationState::Expired);

    let cleared = tx.file(files[0].file.id).await.unwrap().unwrap();
    assert!(!cleared.is_active());
    assert!(cleared.content.is_none());
    for content in contents {
        assert!(courier
            .backend()
            .content
            .retrieve(content)
            .await
            .unwrap()
            .is_none());
    }
}

#[tokio::test]
async fn test_purged_allocation_is_gone() {
    let (courier, member) = common::setup().await;
    let dispatch = common::dispatch(&courier, &member, vec![common::upload("a.txt", "a")]).await;
    let document = dispatch.document.unwrap();

    let mut tx = courier.begin().await.unwrap();
    let files = courier
        .allocations()
        .retrieve_files(&member.session, tx.as_mut(), dispatch.id)
        .await
        .unwrap();
    courier
        .allocations()
        .clear_allocation(tx.as_mut(), dispatch.id)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = courier.begin().await.unwrap();
    let purged = tx.allocation(dispatch.id).await.unwrap().unwrap();
    assert_eq!(purged.state(), AllocationState::Purged);
    assert!(purged.document.is_none());
    assert!(tx.document(document).await.unwrap().is_none());

    let result = courier
        .allocations()
        .unlock_allocation(&member.session, tx.as_mut(), &purged)
        .await;
    assert!(matches!(result, Err(Error::NotFound)));

    // the cached file goes too
    let result = courier
        .allocations()
        .retrieve_file(&member.session, tx.as_mut(), files[0].file.id)
        .await;
    assert!(matches!(result, Err(Error::NotFound)));

    let expired = courier
        .allocations()
        .retrieve_oldest_expired(tx.as_mut(), Utc::now(), 10)
        .await
        .unwrap();
    assert!(expired.iter().all(|a| a.id != dispatch.id));
}

#[tokio::test]
async fn test_force_expire_and_oldest_expired() {
    let (courier, member) = common::setup().await;
    let mut first = common::dispatch(&courier, &member, vec![common::upload("a.txt", "a")]).await;
    let mut second = common::dispatch(&courier, &member, vec![common::upload("b.txt", "b")]).await;
    let untouched = common::dispatch(&courier, &member, vec![common::upload("c.txt", "c")]).await;

    courier
        .allocations()
        .force_expire_allocation(&mut first)
        .await
        .unwrap();
    courier
        .allocations()
        .force_expire_allocation(&mut second)
        .await
        .unwrap();
    assert!(first.expires.unwrap() <= Utc::now());

    let mut tx = courier.begin().await.unwrap();
    let expired = courier
        .allocations()
        .retrieve_oldest_expired(tx.as_mut(), Utc::now(), 10)
        .await
        .unwrap();
    let ids: Vec<_> = expired.iter().map(|a| a.id).collect();
    assert_eq!(ids, vec![first.id, second.id]);
    assert!(!ids.contains(&untouched.id));

    let oldest = courier
        .allocations()
        .retrieve_oldest_expired(tx.as_mut(), Utc::now(), 1)
        .await
        .unwrap();
    assert_eq!(oldest.len(), 1);
    assert_eq!(oldest[0].id, first.id);
}

#[tokio::test]
async fn test_force_expire_never_extends() {
    let (courier, member) = common::setup().await;
    let mut dispatch = common::dispatch(&courier, &member, vec![common::upload("a.txt", "a")]).await;
    courier
        .allocations()
        .force_expire_allocation(&mut dispatch)
        .await
        .unwrap();
    let expired_at = dispatch.expires;

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    courier
        .allocations()
        .force_expire_allocation(&mut dispatch)
        .await
        .unwrap();
    assert_eq!(dispatch.expires, expired_at);
}

#[tokio::test]
async fn test_derived_allocations_share_content() {
    let (courier, member) = common::setup().await;
    let dispatch = common::dispatch(
        &courier,
        &member,
        vec![common::upload("a.txt", "alpha"), common::upload("b.txt", "beta")],
    )
    .await;

    let mut tx = courier.begin().await.unwrap();
    let mut request = CreateTransfer::new(FileSource::Dispatch(dispatch.id), common::tomorrow());
    request.max_downloads = Some(5);
    let created = courier
        .anonymous()
        .create_transfer(&member.session, tx.as_mut(), request)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(created.allocation.derived_from, Some(dispatch.id));

    let mut tx = courier.begin().await.unwrap();
    assert_eq!(
        courier
            .allocations()
            .retrieve_derived_count(tx.as_mut(), dispatch.id)
            .await
            .unwrap(),
        1
    );

    // clearing the origin's file keeps the body the copy still points at
    let origin_files = courier
        .allocations()
        .retrieve_files(&member.session, tx.as_mut(), dispatch.id)
        .await
        .unwrap();
    courier
        .allocations()
        .clear_allocation_file(tx.as_mut(), origin_files[0].file.id, false)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert!(courier
        .backend()
        .content
        .retrieve(origin_files[0].descriptor.content)
        .await
        .unwrap()
        .is_some());

    let recipient = Session::anonymous();
    let mut tx = courier.begin().await.unwrap();
    let unlocked = courier
        .anonymous()
        .unlock(
            &recipient,
            tx.as_mut(),
            &created.token.path,
            created.code.canonical(),
        )
        .await
        .unwrap();
    assert_eq!(unlocked.bundle().len(), 2);
    assert!(unlocked.bundle().iter().all(|d| d.max_downloads == Some(5)));

    let files = courier
        .allocations()
        .retrieve_files(&recipient, tx.as_mut(), created.allocation.id)
        .await
        .unwrap();
    assert_eq!(files[0].file.derived_from, Some(origin_files[0].file.id));
    let downloaded = courier
        .allocations()
        .download(&recipient, tx.as_mut(), files[0].file.id)
        .await
        .unwrap();
    assert_eq!(&downloaded.data[..], b"alpha");

    let populated = courier
        .allocations()
        .retrieve_populated_downloads(&member.session, tx.as_mut(), created.allocation.id)
        .await
        .unwrap();
    assert_eq!(populated.len(), 1);
    assert_eq!(
        populated[0].file.as_ref().map(|f| f.id),
        Some(origin_files[0].file.id)
    );
    assert_eq!(
        populated[0].descriptor.as_ref().map(|d| d.name.as_str()),
        Some("a.txt")
    );
}

#[tokio::test]
async fn test_derived_listing_pages() {
    let (courier, member) = common::setup().await;
    let dispatch = common::dispatch(&courier, &member, vec![common::upload("a.txt", "a")]).await;

    let mut created = Vec::new();
    for _ in 0..3 {
        let mut tx = courier.begin().await.unwrap();
        let request = CreateTransfer::new(FileSource::Dispatch(dispatch.id), common::tomorrow());
        let transfer = courier
            .anonymous()
            .create_transfer(&member.session, tx.as_mut(), request)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        created.push(transfer.allocation.id);
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    let mut tx = courier.begin().await.unwrap();
    let page = courier
        .allocations()
        .retrieve_derived_listing(tx.as_mut(), dispatch.id, &ListingCriteria::page(0, 2))
        .await
        .unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].id, created[2]);

    let rest = courier
        .allocations()
        .retrieve_derived_listing(tx.as_mut(), dispatch.id, &ListingCriteria::page(2, 2))
        .await
        .unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].id, created[0]);
}

#[tokio::test]
async fn test_update_details_writes_new_version() {
    let (courier, member) = common::setup().await;
    let dispatch = common::dispatch(&courier, &member, vec![common::upload("a.txt", "a")]).await;

    let mut tx = courier.begin().await.unwrap();
    let mut unlocked = courier
        .dispatches()
        .retrieve_dispatch(&member.session, tx.as_mut(), dispatch.id)
        .await
        .unwrap();
    assert_eq!(unlocked.details().subject.as_deref(), Some("quarterly numbers"));
    unlocked.document.body_mut().details.comment = Some("revised".into());

    let updated = courier
        .allocations()
        .update_details(&member.session, tx.as_mut(), &unlocked)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(updated.document.version(), 2);
    assert_ne!(updated.allocation.document, dispatch.document);

    // a fresh session with the vault unlocked reads the new version
    let session = Session::member(member.id);
    let mut tx = courier.begin().await.unwrap();
    courier
        .keysafes()
        .unlock_vault(&session, tx.as_mut(), member.vault.id, common::PASSWORD)
        .await
        .unwrap();
    let reread = courier
        .dispatches()
        .retrieve_dispatch(&session, tx.as_mut(), dispatch.id)
        .await
        .unwrap();
    assert_eq!(reread.details().comment.as_deref(), Some("revised"));
    assert_eq!(reread.document.version(), 2);

    // the first copy is now behind
    let result = courier
        .allocations()
        .update_details(&member.session, tx.as_mut(), &unlocked)
        .await;
    assert!(matches!(result, Err(Error::StaleVersion)));
}

#[tokio::test]
async fn test_release_details_skips_empty_slots() {
    let (courier, member) = common::setup().await;
    let first = common::dispatch(&courier, &member, vec![common::upload("a.txt", "a")]).await;
    let second = common::dispatch(&courier, &member, vec![common::upload("b.txt", "b")]).await;

    let session = Session::member(member.id);
    let mut tx = courier.begin().await.unwrap();
    courier
        .keysafes()
        .unlock_vault(&session, tx.as_mut(), member.vault.id, common::PASSWORD)
        .await
        .unwrap();
    let released = courier
        .allocations()
        .release_details(
            &session,
            tx.as_mut(),
            &[Some(first.clone()), None, Some(second.clone())],
        )
        .await
        .unwrap();
    assert_eq!(released.len(), 2);

    let context = session.context().unwrap();
    assert!(context.contains(first.id));
    assert!(context.contains(second.id));
}

#[tokio::test]
async fn test_locked_keysafe_blocks_unseal() {
    let (courier, member) = common::setup().await;
    let dispatch = common::dispatch(&courier, &member, vec![common::upload("a.txt", "a")]).await;

    let session = Session::member(member.id);
    let mut tx = courier.begin().await.unwrap();
    let result = courier
        .dispatches()
        .retrieve_dispatch(&session, tx.as_mut(), dispatch.id)
        .await;
    assert!(matches!(result, Err(Error::LockedResource(id)) if id == member.vault.id));
}

#[tokio::test]
async fn test_expired_allocation_refuses_download() {
    let (courier, member) = common::setup().await;
    let mut tx = courier.begin().await.unwrap();
    let dispatch = courier
        .dispatches()
        .create_dispatch(
            &member.session,
            tx.as_mut(),
            member.vault.id,
            Details::default(),
            Some(Utc::now() - Duration::minutes(1)),
            vec![common::upload("a.txt", "a")],
        )
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = courier.begin().await.unwrap();
    let files = courier
        .allocations()
        .retrieve_files(&member.session, tx.as_mut(), dispatch.id)
        .await
        .unwrap();
    let result = courier
        .allocations()
        .download(&member.session, tx.as_mut(), files[0].file.id)
        .await;
    assert!(matches!(result, Err(Error::Expired)));
}
