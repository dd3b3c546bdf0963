use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::{Arc, RwLock, RwLockReadGuard};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    ContentStore, ContentStoreError, EntityStore, ListingCriteria, MemoryContentStore, StoreError,
    Transaction,
};
use crate::allocation::{Allocation, AllocationFile, AllocationKind};
use crate::document::EncryptedDocument;
use crate::inbox::Inbox;
use crate::keysafe::KeySafe;
use crate::token::Token;

/// In-memory entity store using HashMaps
///
/// Bodies staged or released by a transaction reach `content` only when
/// that transaction commits.
#[derive(Debug, Clone)]
pub struct MemoryEntityStore {
    inner: Arc<RwLock<Tables>>,
    content: Arc<dyn ContentStore>,
}

#[derive(Debug, Default)]
struct Tables {
    allocations: HashMap<Uuid, Allocation>,
    files: HashMap<Uuid, AllocationFile>,
    /// Every stored document version, keyed by document id
    documents: HashMap<Uuid, EncryptedDocument>,
    tokens: HashMap<String, Token>,
    keysafes: HashMap<Uuid, KeySafe>,
    inboxes: HashMap<Uuid, Inbox>,
}

impl Default for MemoryEntityStore {
    fn default() -> Self {
        Self::with_content(Arc::new(MemoryContentStore::new()))
    }
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content(content: Arc<dyn ContentStore>) -> Self {
        Self {
            inner: Arc::default(),
            content,
        }
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        Ok(Box::new(MemoryTransaction::new(
            self.inner.clone(),
            self.content.clone(),
        )))
    }
}

/// A write buffered in a transaction.
///
/// `base` is the committed revision the write was made against, `None` for
/// a record created in this transaction.
#[derive(Debug)]
struct Pending<T> {
    base: Option<u64>,
    record: T,
}

/// Buffered writes over a [`MemoryEntityStore`], applied on commit
#[derive(Debug)]
pub struct MemoryTransaction {
    shared: Arc<RwLock<Tables>>,
    content: Arc<dyn ContentStore>,
    /// Bodies written to the content store on commit
    staged: Vec<(Uuid, Bytes)>,
    /// Bodies purged after a successful commit, unless a committed file
    /// still references them
    released: HashSet<Uuid>,
    allocations: HashMap<Uuid, Pending<Allocation>>,
    files: HashMap<Uuid, Pending<AllocationFile>>,
    documents: HashMap<Uuid, EncryptedDocument>,
    purged_serials: HashSet<Uuid>,
    tokens: HashMap<String, Token>,
    keysafes: HashMap<Uuid, KeySafe>,
    inboxes: HashMap<Uuid, Inbox>,
}

fn lock_error(e: impl std::fmt::Display) -> StoreError {
    StoreError::Provider(format!("failed to acquire lock: {}", e))
}

fn content_error(e: ContentStoreError) -> StoreError {
    StoreError::Provider(e.to_string())
}

impl MemoryTransaction {
    fn new(shared: Arc<RwLock<Tables>>, content: Arc<dyn ContentStore>) -> Self {
        Self {
            shared,
            content,
            staged: Vec::new(),
            released: HashSet::new(),
            allocations: HashMap::new(),
            files: HashMap::new(),
            documents: HashMap::new(),
            purged_serials: HashSet::new(),
            tokens: HashMap::new(),
            keysafes: HashMap::new(),
            inboxes: HashMap::new(),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.shared.read().map_err(lock_error)
    }

    fn merged_allocations(&self) -> Result<Vec<Allocation>, StoreError> {
        let shared = self.read()?;
        let mut merged = shared.allocations.clone();
        for (id, pending) in &self.allocations {
            merged.insert(*id, pending.record.clone());
        }
        Ok(merged.into_values().collect())
    }

    fn merged_files(&self) -> Result<Vec<AllocationFile>, StoreError> {
        let shared = self.read()?;
        let mut merged = shared.files.clone();
        for (id, pending) in &self.files {
            merged.insert(*id, pending.record.clone());
        }
        Ok(merged.into_values().collect())
    }

    fn merged_documents(&self) -> Result<Vec<EncryptedDocument>, StoreError> {
        let shared = self.read()?;
        Ok(shared
            .documents
            .values()
            .filter(|d| !self.purged_serials.contains(&d.serial))
            .chain(self.documents.values())
            .cloned()
            .collect())
    }
}

/// Check a buffered write against what is committed now.
fn validate<T>(
    entity: &'static str,
    id: Uuid,
    pending: &Pending<T>,
    committed: Option<u64>,
) -> Result<(), StoreError> {
    match (pending.base, committed) {
        (None, None) => Ok(()),
        (Some(base), Some(current)) if base == current => Ok(()),
        _ => Err(StoreError::Conflict {
            entity,
            id: id.to_string(),
        }),
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn allocation(&mut self, id: Uuid) -> Result<Option<Allocation>, StoreError> {
        if let Some(pending) = self.allocations.get(&id) {
            return Ok(Some(pending.record.clone()));
        }
        Ok(self.read()?.allocations.get(&id).cloned())
    }

    async fn allocation_by_token(
        &mut self,
        token: &str,
    ) -> Result<Option<Allocation>, StoreError> {
        Ok(self
            .merged_allocations()?
            .into_iter()
            .find(|a| a.kind.token() == Some(token)))
    }

    async fn create_allocation(&mut self, allocation: &Allocation) -> Result<(), StoreError> {
        if self.allocation(allocation.id).await?.is_some() {
            return Err(StoreError::Duplicate {
                entity: "allocation",
                id: allocation.id.to_string(),
            });
        }
        self.allocations.insert(
            allocation.id,
            Pending {
                base: None,
                record: allocation.clone(),
            },
        );
        Ok(())
    }

    async fn update_allocation(
        &mut self,
        allocation: &Allocation,
    ) -> Result<Allocation, StoreError> {
        let base = match self.allocations.get(&allocation.id) {
            Some(pending) => pending.base,
            None => {
                let committed = self
                    .read()?
                    .allocations
                    .get(&allocation.id)
                    .map(|a| a.revision)
                    .ok_or_else(|| StoreError::Missing {
                        entity: "allocation",
                        id: allocation.id.to_string(),
                    })?;
                if committed != allocation.revision {
                    return Err(StoreError::Conflict {
                        entity: "allocation",
                        id: allocation.id.to_string(),
                    });
                }
                Some(committed)
            }
        };

        let mut record = allocation.clone();
        record.revision = base.map_or(0, |b| b + 1);
        self.allocations.insert(
            allocation.id,
            Pending {
                base,
                record: record.clone(),
            },
        );
        Ok(record)
    }

    async fn derived_allocations(
        &mut self,
        origin: Uuid,
        criteria: &ListingCriteria,
    ) -> Result<Vec<Allocation>, StoreError> {
        let derived = self
            .merged_allocations()?
            .into_iter()
            .filter(|a| a.derived_from == Some(origin) && !a.is_purged())
            .collect();
        Ok(criteria.apply(derived))
    }

    async fn derived_allocation_count(&mut self, origin: Uuid) -> Result<usize, StoreError> {
        Ok(self
            .merged_allocations()?
            .iter()
            .filter(|a| a.derived_from == Some(origin) && !a.is_purged())
            .count())
    }

    async fn deposits_for_inbox(&mut self, inbox: Uuid) -> Result<Vec<Allocation>, StoreError> {
        let mut deposits: Vec<Allocation> = self
            .merged_allocations()?
            .into_iter()
            .filter(|a| {
                matches!(a.kind, AllocationKind::Deposit { inbox: i, .. } if i == inbox)
                    && !a.is_purged()
            })
            .collect();
        deposits.sort_by_key(|a| (a.created, a.id));
        Ok(deposits)
    }

    async fn oldest_expired(
        &mut self,
        now: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<Allocation>, StoreError> {
        let mut expired: Vec<Allocation> = self
            .merged_allocations()?
            .into_iter()
            .filter(|a| !a.is_purged() && a.expires.is_some_and(|e| e <= now))
            .collect();
        expired.sort_by_key(|a| (a.expires, a.id));
        expired.truncate(max);
        Ok(expired)
    }

    async fn file(&mut self, id: Uuid) -> Result<Option<AllocationFile>, StoreError> {
        if let Some(pending) = self.files.get(&id) {
            return Ok(Some(pending.record.clone()));
        }
        Ok(self.read()?.files.get(&id).cloned())
    }

    async fn create_file(&mut self, file: &AllocationFile) -> Result<(), StoreError> {
        if self.file(file.id).await?.is_some() {
            return Err(StoreError::Duplicate {
                entity: "file",
                id: file.id.to_string(),
            });
        }
        self.files.insert(
            file.id,
            Pending {
                base: None,
                record: file.clone(),
            },
        );
        Ok(())
    }

    async fn update_file(&mut self, file: &AllocationFile) -> Result<AllocationFile, StoreError> {
        let base = match self.files.get(&file.id) {
            Some(pending) => pending.base,
            None => {
                let committed = self
                    .read()?
                    .files
                    .get(&file.id)
                    .map(|f| f.revision)
                    .ok_or_else(|| StoreError::Missing {
                        entity: "file",
                        id: file.id.to_string(),
                    })?;
                if committed != file.revision {
                    return Err(StoreError::Conflict {
                        entity: "file",
                        id: file.id.to_string(),
                    });
                }
                Some(committed)
            }
        };

        let mut record = file.clone();
        record.revision = base.map_or(0, |b| b + 1);
        self.files.insert(
            file.id,
            Pending {
                base,
                record: record.clone(),
            },
        );
        Ok(record)
    }

    async fn files_for_allocation(
        &mut self,
        allocation: Uuid,
    ) -> Result<Vec<AllocationFile>, StoreError> {
        let mut files: Vec<AllocationFile> = self
            .merged_files()?
            .into_iter()
            .filter(|f| f.allocation == allocation)
            .collect();
        files.sort_by_key(|f| (f.position, f.id));
        Ok(files)
    }

    async fn active_files_for_content(
        &mut self,
        content: Uuid,
    ) -> Result<Vec<AllocationFile>, StoreError> {
        Ok(self
            .merged_files()?
            .into_iter()
            .filter(|f| f.is_active() && f.content == Some(content))
            .collect())
    }

    async fn document(&mut self, id: Uuid) -> Result<Option<EncryptedDocument>, StoreError> {
        if let Some(document) = self.documents.get(&id) {
            return Ok(Some(document.clone()));
        }
        Ok(self
            .read()?
            .documents
            .get(&id)
            .filter(|d| !self.purged_serials.contains(&d.serial))
            .cloned())
    }

    async fn latest_document(
        &mut self,
        serial: Uuid,
    ) -> Result<Option<EncryptedDocument>, StoreError> {
        Ok(self
            .merged_documents()?
            .into_iter()
            .filter(|d| d.serial == serial)
            .max_by_key(|d| d.version))
    }

    async fn insert_document(&mut self, document: &EncryptedDocument) -> Result<(), StoreError> {
        let taken = self
            .merged_documents()?
            .iter()
            .any(|d| d.serial == document.serial && d.version == document.version);
        if taken {
            return Err(StoreError::Conflict {
                entity: "document",
                id: format!("{}@{}", document.serial, document.version),
            });
        }
        self.documents.insert(document.id, document.clone());
        Ok(())
    }

    async fn purge_documents(&mut self, serial: Uuid) -> Result<usize, StoreError> {
        let before = self.documents.len();
        self.documents.retain(|_, d| d.serial != serial);
        let pending = before - self.documents.len();

        let committed = if self.purged_serials.insert(serial) {
            self.read()?
                .documents
                .values()
                .filter(|d| d.serial == serial)
                .count()
        } else {
            0
        };
        Ok(pending + committed)
    }

    async fn token(&mut self, path: &str) -> Result<Option<Token>, StoreError> {
        if let Some(token) = self.tokens.get(path) {
            return Ok(Some(token.clone()));
        }
        Ok(self.read()?.tokens.get(path).cloned())
    }

    async fn create_token(&mut self, token: &Token) -> Result<(), StoreError> {
        if self.token(&token.path).await?.is_some() {
            return Err(StoreError::Duplicate {
                entity: "token",
                id: token.path.clone(),
            });
        }
        self.tokens.insert(token.path.clone(), token.clone());
        Ok(())
    }

    async fn keysafe(&mut self, id: Uuid) -> Result<Option<KeySafe>, StoreError> {
        if let Some(keysafe) = self.keysafes.get(&id) {
            return Ok(Some(keysafe.clone()));
        }
        Ok(self.read()?.keysafes.get(&id).cloned())
    }

    async fn put_keysafe(&mut self, keysafe: &KeySafe) -> Result<(), StoreError> {
        self.keysafes.insert(keysafe.id, keysafe.clone());
        Ok(())
    }

    async fn inbox(&mut self, id: Uuid) -> Result<Option<Inbox>, StoreError> {
        if let Some(inbox) = self.inboxes.get(&id) {
            return Ok(Some(inbox.clone()));
        }
        Ok(self.read()?.inboxes.get(&id).cloned())
    }

    async fn inbox_by_token(&mut self, token: &str) -> Result<Option<Inbox>, StoreError> {
        if let Some(inbox) = self
            .inboxes
            .values()
            .find(|i| i.token.as_deref() == Some(token))
        {
            return Ok(Some(inbox.clone()));
        }
        Ok(self
            .read()?
            .inboxes
            .values()
            .find(|i| i.token.as_deref() == Some(token))
            .cloned())
    }

    async fn create_inbox(&mut self, inbox: &Inbox) -> Result<(), StoreError> {
        if self.inbox(inbox.id).await?.is_some() {
            return Err(StoreError::Duplicate {
                entity: "inbox",
                id: inbox.id.to_string(),
            });
        }
        self.inboxes.insert(inbox.id, inbox.clone());
        Ok(())
    }

    fn stage_content(&mut self, id: Uuid, data: Bytes) {
        self.staged.push((id, data));
    }

    fn release_content(&mut self, id: Uuid) {
        self.released.insert(id);
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let staged = mem::take(&mut self.staged);
        let mut stored = Vec::with_capacity(staged.len());
        let mut result = Ok(Vec::new());
        for (id, data) in staged {
            if let Err(e) = self.content.store(id, data).await {
                result = Err(content_error(e));
                break;
            }
            stored.push(id);
        }
        if result.is_ok() {
            result = self.apply();
        }

        let purge = match result {
            Ok(purge) => purge,
            Err(e) => {
                // nothing committed references the bodies staged here
                for id in stored {
                    if let Err(e) = self.content.purge(id).await {
                        tracing::warn!("failed to drop staged content {}: {}", id, e);
                    }
                }
                return Err(e);
            }
        };
        for id in purge {
            self.content.purge(id).await.map_err(content_error)?;
            tracing::debug!("purged released content {}", id);
        }
        Ok(())
    }
}

impl MemoryTransaction {
    /// Validate and apply the buffered writes; returns the released bodies
    /// no committed file references anymore.
    fn apply(&mut self) -> Result<Vec<Uuid>, StoreError> {
        let lock = self.shared.clone();
        let mut shared = lock.write().map_err(lock_error)?;

        for (id, pending) in &self.allocations {
            let committed = shared.allocations.get(id).map(|a| a.revision);
            validate("allocation", *id, pending, committed)?;
        }
        for (id, pending) in &self.files {
            let committed = shared.files.get(id).map(|f| f.revision);
            validate("file", *id, pending, committed)?;
        }
        for document in self.documents.values() {
            let taken = shared
                .documents
                .values()
                .any(|d| d.serial == document.serial && d.version == document.version);
            if taken {
                return Err(StoreError::Conflict {
                    entity: "document",
                    id: format!("{}@{}", document.serial, document.version),
                });
            }
        }
        if let Some(path) = self.tokens.keys().find(|p| shared.tokens.contains_key(*p)) {
            return Err(StoreError::Conflict {
                entity: "token",
                id: path.clone(),
            });
        }

        let purged = mem::take(&mut self.purged_serials);
        shared.documents.retain(|_, d| !purged.contains(&d.serial));

        for (id, pending) in mem::take(&mut self.allocations) {
            shared.allocations.insert(id, pending.record);
        }
        for (id, pending) in mem::take(&mut self.files) {
            shared.files.insert(id, pending.record);
        }
        shared.documents.extend(mem::take(&mut self.documents));
        shared.tokens.extend(mem::take(&mut self.tokens));
        shared.keysafes.extend(mem::take(&mut self.keysafes));
        shared.inboxes.extend(mem::take(&mut self.inboxes));

        let released = mem::take(&mut self.released);
        Ok(released
            .into_iter()
            .filter(|id| {
                !shared
                    .files
                    .values()
                    .any(|f| f.is_active() && f.content == Some(*id))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatch() -> Allocation {
        Allocation::new(
            AllocationKind::Dispatch {
                keysafe: Uuid::new_v4(),
            },
            None,
            None,
        )
    }

    #[tokio::test]
    async fn test_writes_invisible_until_commit() {
        let store = MemoryEntityStore::new();
        let allocation = dispatch();

        let mut tx = store.begin().await.unwrap();
        tx.create_allocation(&allocation).await.unwrap();
        assert!(tx.allocation(allocation.id).await.unwrap().is_some());

        let mut other = store.begin().await.unwrap();
        assert!(other.allocation(allocation.id).await.unwrap().is_none());

        tx.commit().await.unwrap();
        assert!(other.allocation(allocation.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_content_follows_commit() {
        let content = Arc::new(MemoryContentStore::new());
        let store = MemoryEntityStore::with_content(content.clone());
        let body = Uuid::new_v4();

        {
            let mut tx = store.begin().await.unwrap();
            tx.stage_content(body, Bytes::from_static(b"sealed"));
        }
        assert!(!content.contains(body));

        let mut tx = store.begin().await.unwrap();
        tx.stage_content(body, Bytes::from_static(b"sealed"));
        tx.commit().await.unwrap();
        assert!(content.contains(body));

        let mut tx = store.begin().await.unwrap();
        tx.release_content(body);
        drop(tx);
        assert!(content.contains(body));

        let mut tx = store.begin().await.unwrap();
        tx.release_content(body);
        tx.commit().await.unwrap();
        assert!(content.is_empty());
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_released_content() {
        let content = Arc::new(MemoryContentStore::new());
        let store = MemoryEntityStore::with_content(content.clone());
        let allocation = dispatch();
        let body = Uuid::new_v4();

        let mut tx = store.begin().await.unwrap();
        tx.create_allocation(&allocation).await.unwrap();
        tx.stage_content(body, Bytes::from_static(b"sealed"));
        tx.commit().await.unwrap();

        let mut loser = store.begin().await.unwrap();
        let mut winner = store.begin().await.unwrap();
        let mut stale = loser.allocation(allocation.id).await.unwrap().unwrap();
        stale.deleted = Some(Utc::now());
        loser.update_allocation(&stale).await.unwrap();
        loser.release_content(body);

        let current = winner.allocation(allocation.id).await.unwrap().unwrap();
        winner.update_allocation(&current).await.unwrap();
        winner.commit().await.unwrap();

        assert!(matches!(
            loser.commit().await,
            Err(StoreError::Conflict { .. })
        ));
        assert!(content.contains(body));
    }

    #[tokio::test]
    async fn test_dropped_transaction_discards() {
        let store = MemoryEntityStore::new();
        let allocation = dispatch();
        {
            let mut tx = store.begin().await.unwrap();
            tx.create_allocation(&allocation).await.unwrap();
        }
        let mut tx = store.begin().await.unwrap();
        assert!(tx.allocation(allocation.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_update_conflicts() {
        let store = MemoryEntityStore::new();
        let allocation = dispatch();
        let mut tx = store.begin().await.unwrap();
        tx.create_allocation(&allocation).await.unwrap();
        tx.commit().await.unwrap();

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        let mut a = first.allocation(allocation.id).await.unwrap().unwrap();
        let mut b = second.allocation(allocation.id).await.unwrap().unwrap();

        a.expires = Some(Utc::now());
        first.update_allocation(&a).await.unwrap();
        b.deleted = Some(Utc::now());
        second.update_allocation(&b).await.unwrap();

        first.commit().await.unwrap();
        assert!(matches!(
            second.commit().await,
            Err(StoreError::Conflict { entity: "allocation", .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_revision_rejected_on_update() {
        let store = MemoryEntityStore::new();
        let allocation = dispatch();
        let mut tx = store.begin().await.unwrap();
        tx.create_allocation(&allocation).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let current = tx.allocation(allocation.id).await.unwrap().unwrap();
        let updated = tx.update_allocation(&current).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(updated.revision, current.revision + 1);

        let mut tx = store.begin().await.unwrap();
        assert!(matches!(
            tx.update_allocation(&current).await,
            Err(StoreError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_purge_hides_committed_versions() {
        let store = MemoryEntityStore::new();
        let serial = Uuid::new_v4();
        let document = EncryptedDocument {
            id: Uuid::new_v4(),
            serial,
            version: 1,
            keysafe: None,
            key: None,
            content: b"{}".to_vec(),
            created: Utc::now(),
        };
        let mut tx = store.begin().await.unwrap();
        tx.insert_document(&document).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.purge_documents(serial).await.unwrap(), 1);
        assert!(tx.document(document.id).await.unwrap().is_none());
        assert!(tx.latest_document(serial).await.unwrap().is_none());
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(tx.document(document.id).await.unwrap().is_none());
    }
}
