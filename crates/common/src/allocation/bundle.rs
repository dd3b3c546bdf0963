use bytes::Bytes;
use uuid::Uuid;

use super::model::{Allocation, AllocationFile, AllocationKind, FileDescriptor, UploadedFile};
use super::AllocationManager;
use crate::crypto::Secret;
use crate::session::Session;
use crate::store::Transaction;
use crate::{Error, Result};

/// The files of an allocation that is about to be created
#[derive(Debug, Clone, Default)]
pub struct PreparedBundle {
    pub descriptors: Vec<FileDescriptor>,
    /// The origin file each descriptor was copied from
    pub(crate) origins: Vec<Option<Uuid>>,
    /// The dispatch the files were copied from
    pub derived_from: Option<Uuid>,
}

impl AllocationManager {
    /// Encrypt uploaded bodies and stage them for the content store.
    ///
    /// Every file gets its own key, kept in the descriptor. A `max_downloads`
    /// given here applies to files that do not carry their own. The bodies
    /// are stored when `tx` commits.
    pub fn upload_bundle(
        &self,
        tx: &mut dyn Transaction,
        files: Vec<UploadedFile>,
        max_downloads: Option<u32>,
    ) -> Result<PreparedBundle> {
        let mut bundle = PreparedBundle::default();
        for file in files {
            let content = Uuid::new_v4();
            let key = Secret::generate();
            let encrypted = key.encrypt(&file.data)?;
            tx.stage_content(content, Bytes::from(encrypted));

            bundle.descriptors.push(FileDescriptor {
                content,
                name: file.name,
                mime_type: file.mime_type,
                length: file.data.len() as u64,
                max_downloads: file.max_downloads.or(max_downloads),
                key,
            });
            bundle.origins.push(None);
        }
        Ok(bundle)
    }

    /// Copy the active files of a dispatch for a derived allocation.
    ///
    /// Copies share the origin's content; nothing is re-encrypted. The
    /// dispatch has to be unlockable in `session`.
    pub async fn copy_dispatch_bundle(
        &self,
        session: &Session,
        tx: &mut dyn Transaction,
        dispatch: Uuid,
        max_downloads: Option<u32>,
    ) -> Result<PreparedBundle> {
        let origin = tx
            .allocation(dispatch)
            .await?
            .filter(|a| matches!(a.kind, AllocationKind::Dispatch { .. }) && !a.is_purged())
            .ok_or(Error::NotFound)?;
        let unlocked = self.unlock_allocation(session, tx, &origin).await?;

        let mut bundle = PreparedBundle {
            derived_from: Some(origin.id),
            ..Default::default()
        };
        for file in tx.files_for_allocation(origin.id).await? {
            if !file.is_active() {
                continue;
            }
            let Some(descriptor) = file
                .content
                .and_then(|content| unlocked.document.body().descriptor(content))
            else {
                tracing::warn!("dispatch {} file {} has no descriptor", origin.id, file.id);
                continue;
            };

            let mut descriptor = descriptor.clone();
            if max_downloads.is_some() {
                descriptor.max_downloads = max_downloads;
            }
            bundle.descriptors.push(descriptor);
            bundle.origins.push(Some(file.id));
        }
        Ok(bundle)
    }

    /// Persist one file record per descriptor.
    ///
    /// For a derived allocation every content id must still be held by an
    /// active file of the origin.
    pub(crate) async fn create_files(
        &self,
        tx: &mut dyn Transaction,
        allocation: &Allocation,
        bundle: &PreparedBundle,
    ) -> Result<Vec<AllocationFile>> {
        if let Some(origin) = allocation.derived_from {
            self.ensure_lineage(tx, origin, &bundle.descriptors).await?;
        }

        let mut files = Vec::with_capacity(bundle.descriptors.len());
        for (position, descriptor) in bundle.descriptors.iter().enumerate() {
            let derived_from = bundle.origins.get(position).copied().flatten();
            let file = AllocationFile::new(
                allocation.id,
                descriptor.content,
                position as u32,
                derived_from,
            );
            tx.create_file(&file).await?;
            files.push(file);
        }
        Ok(files)
    }

    async fn ensure_lineage(
        &self,
        tx: &mut dyn Transaction,
        origin: Uuid,
        descriptors: &[FileDescriptor],
    ) -> Result<()> {
        let held: Vec<Uuid> = tx
            .files_for_allocation(origin)
            .await?
            .into_iter()
            .filter(AllocationFile::is_active)
            .filter_map(|f| f.content)
            .collect();

        if descriptors.iter().all(|d| held.contains(&d.content)) {
            Ok(())
        } else {
            Err(Error::LineageMismatch(origin))
        }
    }
}
