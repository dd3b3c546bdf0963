//! Allocation lifecycle
//!
//! Allocations move `Active -> Expired -> Purged` and never back. Expiry
//! comes from the allocation's own date, from the last file being cleared,
//! or from a forced expire; purging is done by [`AllocationManager::clear_allocation`],
//! normally from the gateway's reaper.
//!
//! File bodies are shared between an origin dispatch and the allocations
//! copied from it, so a body is only purged from the content store when the
//! last active file referencing it is cleared, and only once that clear has
//! committed.

mod bundle;
mod model;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::document::{DocumentManager, UnsealKey};
use crate::session::Session;
use crate::store::{Event, EventKind, ListingCriteria, Transaction};
use crate::{Backend, Error, Result};

pub use bundle::PreparedBundle;
pub use model::{
    Allocation, AllocationDocument, AllocationFile, AllocationKind, AllocationState, Details,
    DownloadedFile, FileDescriptor, FileSource, UnlockedAllocation, UnlockedFile, UploadedFile,
};

/// A download event matched with the origin file it served
#[derive(Debug, Clone)]
pub struct PopulatedDownload {
    pub event: Event,
    pub file: Option<AllocationFile>,
    pub descriptor: Option<FileDescriptor>,
}

#[derive(Debug, Clone)]
pub struct AllocationManager {
    backend: Backend,
    documents: DocumentManager,
}

impl AllocationManager {
    pub fn new(backend: Backend) -> Self {
        let documents = DocumentManager::new(backend.keys.clone());
        Self { backend, documents }
    }

    /// Unseal an allocation's document for `session`, or reuse the copy
    /// already cached there.
    ///
    /// KeySafe-sealed allocations need the KeySafe unlocked in the session.
    /// Anonymous transfers can only come from the cache, after an unlock.
    pub async fn unlock_allocation(
        &self,
        session: &Session,
        tx: &mut dyn Transaction,
        allocation: &Allocation,
    ) -> Result<UnlockedAllocation> {
        let context = session.context()?;
        if allocation.is_purged() {
            context.remove(allocation.id);
            return Err(Error::NotFound);
        }

        if let Some(mut cached) = context.retrieve::<UnlockedAllocation>(allocation.id)? {
            tracing::debug!("allocation {} unsealed from context", allocation.id);
            cached.allocation = allocation.clone();
            return Ok(cached);
        }

        let document_id = allocation.document.ok_or(Error::NotFound)?;
        let Some(keysafe) = allocation.kind.keysafe() else {
            return Err(Error::LockedResource(allocation.id));
        };
        let capability = session.capability(keysafe)?;
        let document = self
            .documents
            .unseal(tx, document_id, UnsealKey::Capability(&capability))
            .await?;

        let unlocked = UnlockedAllocation {
            allocation: allocation.clone(),
            document,
        };
        context.retain(allocation.id, unlocked.clone());
        tracing::debug!("unsealed allocation {}", allocation.id);
        Ok(unlocked)
    }

    /// Look up an allocation file and its descriptor, from the session cache
    /// when possible.
    pub async fn retrieve_file(
        &self,
        session: &Session,
        tx: &mut dyn Transaction,
        file_id: Uuid,
    ) -> Result<UnlockedFile> {
        let context = session.context()?;

        if let Some(cached) = context.retrieve::<UnlockedFile>(file_id)? {
            let file = tx.file(file_id).await?;
            let allocation = match &file {
                Some(file) => tx.allocation(file.allocation).await?,
                None => None,
            };
            return match (file, allocation) {
                (Some(file), Some(allocation)) if file.is_active() && !allocation.is_purged() => {
                    tracing::debug!("file {} served from context", file_id);
                    let refreshed = UnlockedFile {
                        file,
                        descriptor: cached.descriptor,
                    };
                    context.retain(file_id, refreshed.clone());
                    Ok(refreshed)
                }
                (_, allocation) => {
                    context.remove(file_id);
                    if let Some(allocation) = allocation.filter(Allocation::is_purged) {
                        context.remove(allocation.id);
                    }
                    Err(Error::NotFound)
                }
            };
        }

        let file = tx
            .file(file_id)
            .await?
            .filter(AllocationFile::is_active)
            .ok_or(Error::NotFound)?;
        let allocation = tx
            .allocation(file.allocation)
            .await?
            .filter(|a| !a.is_purged())
            .ok_or(Error::NotFound)?;

        let unlocked = self.unlock_allocation(session, tx, &allocation).await?;
        let descriptor = file
            .content
            .and_then(|content| unlocked.document.body().descriptor(content))
            .cloned()
            .ok_or(Error::NotFound)?;

        let unlocked_file = UnlockedFile { file, descriptor };
        context.retain(file_id, unlocked_file.clone());
        Ok(unlocked_file)
    }

    /// The active files of an allocation in bundle order, each unlocked.
    pub async fn retrieve_files(
        &self,
        session: &Session,
        tx: &mut dyn Transaction,
        allocation: Uuid,
    ) -> Result<Vec<UnlockedFile>> {
        let mut files = Vec::new();
        for file in tx.files_for_allocation(allocation).await? {
            if file.is_active() {
                files.push(self.retrieve_file(session, tx, file.id).await?);
            }
        }
        Ok(files)
    }

    /// Count one download in a transaction of its own.
    ///
    /// The file expires when the count reaches the descriptor's
    /// `max_downloads`; the download that reaches it still succeeds.
    pub async fn increment_download_counter(&self, file: &UnlockedFile) -> Result<AllocationFile> {
        let max_downloads = file.descriptor.max_downloads.unwrap_or(u32::MAX);

        let mut tx = self.backend.entities.begin().await?;
        let mut managed = tx.file(file.file.id).await?.ok_or(Error::NotFound)?;
        managed.download_count = managed.download_count.saturating_add(1);
        if managed.download_count == max_downloads {
            managed.expire_at(Utc::now());
            tracing::info!(
                "file {} reached {} downloads, expiring",
                managed.id,
                max_downloads
            );
        }
        let managed = tx.update_file(&managed).await?;
        tx.commit().await?;
        Ok(managed)
    }

    /// Decrypt a file for delivery, record the download and count it.
    pub async fn download(
        &self,
        session: &Session,
        tx: &mut dyn Transaction,
        file_id: Uuid,
    ) -> Result<DownloadedFile> {
        let unlocked = self.retrieve_file(session, tx, file_id).await?;
        let now = Utc::now();
        if unlocked.file.is_expired_at(now) {
            return Err(Error::Expired);
        }

        let allocation = tx
            .allocation(unlocked.file.allocation)
            .await?
            .ok_or(Error::NotFound)?;
        match allocation.state_at(now) {
            AllocationState::Active => {}
            AllocationState::Expired => return Err(Error::Expired),
            AllocationState::Purged => return Err(Error::NotFound),
        }

        let content = unlocked.file.content.ok_or(Error::NotFound)?;
        let encrypted = self
            .backend
            .content
            .retrieve(content)
            .await?
            .ok_or(Error::NotFound)?;
        let data = unlocked.descriptor.key.decrypt(&encrypted)?;

        self.backend
            .events
            .record(Event::new(
                allocation.id,
                EventKind::FileDownload { file: file_id },
                session,
            ))
            .await?;
        let file = self.increment_download_counter(&unlocked).await?;

        Ok(DownloadedFile {
            file,
            descriptor: unlocked.descriptor,
            data: data.into(),
        })
    }

    /// Delete one file, releasing its body when nothing else references it.
    /// The body leaves the content store when `tx` commits.
    ///
    /// With `cascade`, clearing the last active file expires the allocation.
    pub async fn clear_allocation_file(
        &self,
        tx: &mut dyn Transaction,
        file_id: Uuid,
        cascade: bool,
    ) -> Result<()> {
        let mut file = tx.file(file_id).await?.ok_or(Error::NotFound)?;
        if !file.is_active() {
            return Ok(());
        }
        let now = Utc::now();

        let sole_reference = match file.content {
            Some(content) => tx
                .active_files_for_content(content)
                .await?
                .iter()
                .all(|f| f.id == file.id),
            None => false,
        };

        if cascade {
            let last_active = tx
                .files_for_allocation(file.allocation)
                .await?
                .iter()
                .all(|f| f.id == file.id || !f.is_active());
            if last_active {
                if let Some(mut allocation) = tx.allocation(file.allocation).await? {
                    if allocation.expire_at(now) {
                        tx.update_allocation(&allocation).await?;
                        tracing::info!(
                            "allocation {} expired after clearing its last file",
                            allocation.id
                        );
                    }
                }
            }
        }

        let content = file.content.take();
        file.deleted = Some(now);
        tx.update_file(&file).await?;

        if let (true, Some(content)) = (sole_reference, content) {
            tx.release_content(content);
            tracing::debug!("released content {} with file {}", content, file.id);
        }
        Ok(())
    }

    /// Purge an allocation: clear its files, drop its document and mark it
    /// deleted.
    pub async fn clear_allocation(&self, tx: &mut dyn Transaction, allocation_id: Uuid) -> Result<()> {
        let allocation = tx.allocation(allocation_id).await?.ok_or(Error::NotFound)?;
        if allocation.is_purged() {
            return Ok(());
        }

        for file in tx.files_for_allocation(allocation_id).await? {
            if file.is_active() {
                self.clear_allocation_file(tx, file.id, false).await?;
            }
        }

        // files were cleared without cascading, so this is still the record we read
        let mut allocation = allocation;
        let serial = match allocation.document {
            Some(document) => tx.document(document).await?.map(|d| d.serial),
            None => None,
        };

        let now = Utc::now();
        allocation.expire_at(now);
        allocation.deleted = Some(now);
        allocation.document = None;
        tx.update_allocation(&allocation).await?;

        if let Some(serial) = serial {
            self.documents.purge(tx, serial).await?;
        }
        tracing::info!("purged {} {}", allocation.kind.name(), allocation.id);
        Ok(())
    }

    /// Expire an allocation now, in a transaction of its own, and mirror the
    /// new expiry into `allocation`.
    pub async fn force_expire_allocation(&self, allocation: &mut Allocation) -> Result<()> {
        let mut tx = self.backend.entities.begin().await?;
        let mut managed = tx.allocation(allocation.id).await?.ok_or(Error::NotFound)?;
        if managed.expire_at(Utc::now()) {
            tx.update_allocation(&managed).await?;
            tx.commit().await?;
            tracing::info!("force expired allocation {}", managed.id);
        }
        allocation.expires = managed.expires;
        Ok(())
    }

    pub async fn retrieve_derived_listing(
        &self,
        tx: &mut dyn Transaction,
        origin: Uuid,
        criteria: &ListingCriteria,
    ) -> Result<Vec<Allocation>> {
        Ok(tx.derived_allocations(origin, criteria).await?)
    }

    pub async fn retrieve_derived_count(&self, tx: &mut dyn Transaction, origin: Uuid) -> Result<usize> {
        Ok(tx.derived_allocation_count(origin).await?)
    }

    /// Unseal each listed allocation once and bind it into the session.
    pub async fn release_details(
        &self,
        session: &Session,
        tx: &mut dyn Transaction,
        allocations: &[Option<Allocation>],
    ) -> Result<Vec<UnlockedAllocation>> {
        let mut released = Vec::new();
        for allocation in allocations.iter().flatten() {
            released.push(self.unlock_allocation(session, tx, allocation).await?);
        }
        Ok(released)
    }

    /// Write edited details back as a new document version.
    pub async fn update_details(
        &self,
        session: &Session,
        tx: &mut dyn Transaction,
        unlocked: &UnlockedAllocation,
    ) -> Result<UnlockedAllocation> {
        let mut allocation = tx
            .allocation(unlocked.allocation.id)
            .await?
            .filter(|a| !a.is_purged())
            .ok_or(Error::NotFound)?;
        let current = allocation.document.ok_or(Error::NotFound)?;

        let sealed = self
            .documents
            .update(tx, &unlocked.document, current)
            .await?;
        allocation.document = Some(sealed.id);
        let allocation = tx.update_allocation(&allocation).await?;

        let refreshed = UnlockedAllocation {
            allocation,
            document: unlocked.document.advanced_to(&sealed),
        };
        let context = session.context()?;
        context.retain(refreshed.allocation.id, refreshed.clone());
        if let Some(token) = refreshed.allocation.kind.token() {
            context.retain(token, refreshed.clone());
        }
        Ok(refreshed)
    }

    /// Download events of an allocation, each matched with the origin file
    /// it served.
    ///
    /// For a derived allocation the origin is its dispatch, reached through
    /// each file's `derived_from`; otherwise the allocation itself.
    pub async fn retrieve_populated_downloads(
        &self,
        session: &Session,
        tx: &mut dyn Transaction,
        allocation_id: Uuid,
    ) -> Result<Vec<PopulatedDownload>> {
        let managed = tx.allocation(allocation_id).await?.ok_or(Error::NotFound)?;
        let source = match managed.derived_from {
            Some(origin) => tx.allocation(origin).await?.ok_or(Error::NotFound)?,
            None => managed.clone(),
        };
        let unlocked = self.unlock_allocation(session, tx, &source).await?;
        let source_files = tx.files_for_allocation(source.id).await?;

        let mut populated = Vec::new();
        for event in self.backend.events.file_downloads(managed.id).await? {
            let EventKind::FileDownload { file: downloaded } = event.kind else {
                continue;
            };
            let downloaded = tx.file(downloaded).await?;
            let origin_id = match (&downloaded, managed.derived_from) {
                (Some(f), Some(_)) => f.derived_from,
                (Some(f), None) => Some(f.id),
                (None, _) => None,
            };
            let file = origin_id.and_then(|id| source_files.iter().find(|f| f.id == id).cloned());

            // a cleared origin file has lost its content link, the copy may still hold it
            let content = file
                .as_ref()
                .and_then(|f| f.content)
                .or_else(|| downloaded.as_ref().and_then(|f| f.content));
            let descriptor =
                content.and_then(|c| unlocked.document.body().descriptor(c).cloned());

            populated.push(PopulatedDownload {
                event,
                file,
                descriptor,
            });
        }
        Ok(populated)
    }

    /// The oldest expired allocations not yet purged
    pub async fn retrieve_oldest_expired(
        &self,
        tx: &mut dyn Transaction,
        now: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<Allocation>> {
        Ok(tx.oldest_expired(now, max).await?)
    }
}
