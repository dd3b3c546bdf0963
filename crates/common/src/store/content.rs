use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ContentStoreError {
    #[error("content store provider error: {0}")]
    Provider(String),
}

/// Encrypted file bodies, keyed by content id.
///
/// Several allocation files may share one body; the store itself does not
/// count references.
#[async_trait]
pub trait ContentStore: Send + Sync + Debug {
    async fn store(&self, id: Uuid, data: Bytes) -> Result<(), ContentStoreError>;

    async fn retrieve(&self, id: Uuid) -> Result<Option<Bytes>, ContentStoreError>;

    /// Returns whether anything was removed.
    async fn purge(&self, id: Uuid) -> Result<bool, ContentStoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryContentStore {
    blobs: Arc<RwLock<HashMap<Uuid, Bytes>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.blobs
            .read()
            .map(|blobs| blobs.contains_key(&id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|blobs| blobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock_error(e: impl std::fmt::Display) -> ContentStoreError {
    ContentStoreError::Provider(format!("failed to acquire lock: {}", e))
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn store(&self, id: Uuid, data: Bytes) -> Result<(), ContentStoreError> {
        self.blobs.write().map_err(lock_error)?.insert(id, data);
        Ok(())
    }

    async fn retrieve(&self, id: Uuid) -> Result<Option<Bytes>, ContentStoreError> {
        Ok(self.blobs.read().map_err(lock_error)?.get(&id).cloned())
    }

    async fn purge(&self, id: Uuid) -> Result<bool, ContentStoreError> {
        Ok(self.blobs.write().map_err(lock_error)?.remove(&id).is_some())
    }
}
