//! Shared setup for courier integration tests
#![allow(dead_code)]

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use common::anonymous::CreatedTransfer;
use common::keysafe::KeySafe;
use common::prelude::*;
use uuid::Uuid;

pub const PASSWORD: &str = "correct horse battery staple";

/// A member with one vault, unlocked in their session
pub struct Member {
    pub id: Uuid,
    pub session: Session,
    pub vault: KeySafe,
}

pub async fn member(courier: &Courier) -> Member {
    let id = Uuid::new_v4();
    let session = Session::member(id);

    let mut tx = courier.begin().await.unwrap();
    let vault = courier
        .keysafes()
        .create_vault(tx.as_mut(), id, "personal", PASSWORD)
        .await
        .unwrap();
    courier
        .keysafes()
        .unlock_vault(&session, tx.as_mut(), vault.id, PASSWORD)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    Member { id, session, vault }
}

/// Route core logs to the test harness; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Set up an in-memory courier and one member
pub async fn setup() -> (Courier, Member) {
    init_tracing();
    let courier = Courier::memory();
    let member = member(&courier).await;
    (courier, member)
}

pub fn tomorrow() -> DateTime<Utc> {
    Utc::now() + Duration::days(1)
}

pub fn upload(name: &str, data: &'static str) -> UploadedFile {
    UploadedFile::new(name, Bytes::from_static(data.as_bytes()))
}

/// A committed dispatch sealed for the member's vault
pub async fn dispatch(courier: &Courier, member: &Member, files: Vec<UploadedFile>) -> Allocation {
    let mut tx = courier.begin().await.unwrap();
    let details = Details {
        subject: Some("quarterly numbers".into()),
        ..Default::default()
    };
    let allocation = courier
        .dispatches()
        .create_dispatch(
            &member.session,
            tx.as_mut(),
            member.vault.id,
            details,
            Some(tomorrow()),
            files,
        )
        .await
        .unwrap();
    tx.commit().await.unwrap();
    allocation
}

/// A committed anonymous transfer
pub async fn transfer(courier: &Courier, request: CreateTransfer) -> CreatedTransfer {
    let session = Session::anonymous();
    let mut tx = courier.begin().await.unwrap();
    let created = courier
        .anonymous()
        .create_transfer(&session, tx.as_mut(), request)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    created
}
