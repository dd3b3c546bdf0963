use std::fmt::Debug;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::StoreError;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    TransferCreated,
    TransferUnlock { success: bool },
    FileDownload { file: Uuid },
    AgreementAccepted,
}

/// An audit record about one allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: Uuid,
    pub allocation: Uuid,
    pub kind: EventKind,
    pub initiated: DateTime<Utc>,
    pub member: Option<Uuid>,
    pub remote_address: Option<String>,
}

impl Event {
    /// An event attributed to whoever is acting in `session`
    pub fn new(allocation: Uuid, kind: EventKind, session: &Session) -> Self {
        Self {
            id: Uuid::new_v4(),
            allocation,
            kind,
            initiated: Utc::now(),
            member: session.member_id(),
            remote_address: session.remote_address().map(str::to_string),
        }
    }
}

/// Append-only event log.
///
/// Recording is never part of the caller's transaction: a failed unlock is
/// recorded even though nothing else about the request is kept.
#[async_trait]
pub trait EventRecorder: Send + Sync + Debug {
    async fn record(&self, event: Event) -> Result<(), StoreError>;

    /// Every event for an allocation, oldest first
    async fn events_for(&self, allocation: Uuid) -> Result<Vec<Event>, StoreError>;

    async fn unlock_attempts(&self, allocation: Uuid) -> Result<Vec<Event>, StoreError> {
        Ok(self
            .events_for(allocation)
            .await?
            .into_iter()
            .filter(|e| matches!(e.kind, EventKind::TransferUnlock { .. }))
            .collect())
    }

    async fn failed_unlock_attempts(&self, allocation: Uuid) -> Result<usize, StoreError> {
        Ok(self
            .unlock_attempts(allocation)
            .await?
            .iter()
            .filter(|e| e.kind == EventKind::TransferUnlock { success: false })
            .count())
    }

    /// The first acceptance of the allocation's agreement
    async fn agreement(&self, allocation: Uuid) -> Result<Option<Event>, StoreError> {
        Ok(self
            .events_for(allocation)
            .await?
            .into_iter()
            .find(|e| e.kind == EventKind::AgreementAccepted))
    }

    async fn file_downloads(&self, allocation: Uuid) -> Result<Vec<Event>, StoreError> {
        Ok(self
            .events_for(allocation)
            .await?
            .into_iter()
            .filter(|e| matches!(e.kind, EventKind::FileDownload { .. }))
            .collect())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryEventRecorder {
    events: Arc<RwLock<Vec<Event>>>,
}

impl MemoryEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventRecorder for MemoryEventRecorder {
    async fn record(&self, event: Event) -> Result<(), StoreError> {
        self.events
            .write()
            .map_err(|e| StoreError::Provider(format!("failed to acquire write lock: {}", e)))?
            .push(event);
        Ok(())
    }

    async fn events_for(&self, allocation: Uuid) -> Result<Vec<Event>, StoreError> {
        let events = self
            .events
            .read()
            .map_err(|e| StoreError::Provider(format!("failed to acquire read lock: {}", e)))?;
        Ok(events
            .iter()
            .filter(|e| e.allocation == allocation)
            .cloned()
            .collect())
    }
}
