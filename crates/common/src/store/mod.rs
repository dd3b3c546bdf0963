//! Persistence seams
//!
//! - [`EntityStore`]: transactional storage for allocations, files,
//!   documents, tokens, KeySafes and inboxes
//! - [`ContentStore`]: encrypted file bodies keyed by content id
//! - [`EventRecorder`]: append-only audit events
//!
//! Each comes with an in-memory implementation used by the gateway's
//! default backend and by tests.

mod content;
mod events;
mod memory;

use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::allocation::{Allocation, AllocationFile};
use crate::document::EncryptedDocument;
use crate::inbox::Inbox;
use crate::keysafe::KeySafe;
use crate::token::Token;

pub use content::{ContentStore, ContentStoreError, MemoryContentStore};
pub use events::{Event, EventKind, EventRecorder, MemoryEventRecorder};
pub use memory::{MemoryEntityStore, MemoryTransaction};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The record changed since it was read, or a unique key was taken
    /// concurrently
    #[error("conflicting write to {entity} '{id}'")]
    Conflict { entity: &'static str, id: String },
    #[error("{entity} '{id}' already exists")]
    Duplicate { entity: &'static str, id: String },
    #[error("{entity} '{id}' does not exist")]
    Missing { entity: &'static str, id: String },
    #[error("store provider error: {0}")]
    Provider(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Paging and ordering for listings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListingCriteria {
    pub offset: usize,
    pub limit: usize,
    pub order: Order,
}

impl Default for ListingCriteria {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
            order: Order::NewestFirst,
        }
    }
}

impl ListingCriteria {
    pub fn page(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit,
            ..Default::default()
        }
    }

    /// Order, then page, a set of allocations.
    pub fn apply(&self, mut allocations: Vec<Allocation>) -> Vec<Allocation> {
        allocations.sort_by_key(|a| (a.created, a.id));
        if self.order == Order::NewestFirst {
            allocations.reverse();
        }
        allocations
            .into_iter()
            .skip(self.offset)
            .take(self.limit)
            .collect()
    }
}

/// Storage for entities.
#[async_trait]
pub trait EntityStore: Send + Sync + Debug {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError>;
}

/// A unit of work against an [`EntityStore`].
///
/// Reads see the transaction's own writes. Nothing is visible to other
/// transactions until [`Transaction::commit`]; dropping a transaction
/// discards its writes. Updates carry the revision they were read at and
/// fail with [`StoreError::Conflict`] if another transaction committed a
/// newer one first.
///
/// Encrypted bodies follow the same rule: staged bodies are stored, and
/// released ones purged, only by a successful commit.
#[async_trait]
pub trait Transaction: Send {
    async fn allocation(&mut self, id: Uuid) -> Result<Option<Allocation>, StoreError>;

    async fn allocation_by_token(&mut self, token: &str)
        -> Result<Option<Allocation>, StoreError>;

    async fn create_allocation(&mut self, allocation: &Allocation) -> Result<(), StoreError>;

    /// Write the allocation back; returns it with its new revision.
    async fn update_allocation(&mut self, allocation: &Allocation)
        -> Result<Allocation, StoreError>;

    async fn derived_allocations(
        &mut self,
        origin: Uuid,
        criteria: &ListingCriteria,
    ) -> Result<Vec<Allocation>, StoreError>;

    async fn derived_allocation_count(&mut self, origin: Uuid) -> Result<usize, StoreError>;

    async fn deposits_for_inbox(&mut self, inbox: Uuid) -> Result<Vec<Allocation>, StoreError>;

    /// Unpurged allocations whose expiry is at or before `now`, oldest
    /// expiry first
    async fn oldest_expired(
        &mut self,
        now: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<Allocation>, StoreError>;

    async fn file(&mut self, id: Uuid) -> Result<Option<AllocationFile>, StoreError>;

    async fn create_file(&mut self, file: &AllocationFile) -> Result<(), StoreError>;

    async fn update_file(&mut self, file: &AllocationFile) -> Result<AllocationFile, StoreError>;

    /// All files of an allocation in bundle order, deleted ones included
    async fn files_for_allocation(
        &mut self,
        allocation: Uuid,
    ) -> Result<Vec<AllocationFile>, StoreError>;

    /// Undeleted files in any allocation that reference `content`
    async fn active_files_for_content(
        &mut self,
        content: Uuid,
    ) -> Result<Vec<AllocationFile>, StoreError>;

    async fn document(&mut self, id: Uuid) -> Result<Option<EncryptedDocument>, StoreError>;

    async fn latest_document(
        &mut self,
        serial: Uuid,
    ) -> Result<Option<EncryptedDocument>, StoreError>;

    /// Insert a new version; conflicts if the serial already has it.
    async fn insert_document(&mut self, document: &EncryptedDocument) -> Result<(), StoreError>;

    async fn purge_documents(&mut self, serial: Uuid) -> Result<usize, StoreError>;

    async fn token(&mut self, path: &str) -> Result<Option<Token>, StoreError>;

    async fn create_token(&mut self, token: &Token) -> Result<(), StoreError>;

    async fn keysafe(&mut self, id: Uuid) -> Result<Option<KeySafe>, StoreError>;

    async fn put_keysafe(&mut self, keysafe: &KeySafe) -> Result<(), StoreError>;

    async fn inbox(&mut self, id: Uuid) -> Result<Option<Inbox>, StoreError>;

    async fn inbox_by_token(&mut self, token: &str) -> Result<Option<Inbox>, StoreError>;

    async fn create_inbox(&mut self, inbox: &Inbox) -> Result<(), StoreError>;

    /// Store an encrypted body in the content store on commit.
    fn stage_content(&mut self, id: Uuid, data: Bytes);

    /// Purge a body from the content store after commit, unless a committed
    /// file still references it.
    fn release_content(&mut self, id: Uuid);

    async fn commit(&mut self) -> Result<(), StoreError>;
}
