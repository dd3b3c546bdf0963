use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::allocation::{
    Allocation, AllocationDocument, AllocationKind, AllocationManager, Details, UnlockedAllocation,
    UploadedFile,
};
use crate::document::{DocumentManager, SealScope};
use crate::session::Session;
use crate::store::{Event, EventKind, Transaction};
use crate::{Backend, Error, Result};

/// Member-to-member transfers sealed for a KeySafe
#[derive(Debug, Clone)]
pub struct DispatchService {
    backend: Backend,
    documents: DocumentManager,
    allocations: AllocationManager,
}

impl DispatchService {
    pub fn new(backend: Backend) -> Self {
        Self {
            documents: DocumentManager::new(backend.keys.clone()),
            allocations: AllocationManager::new(backend.clone()),
            backend,
        }
    }

    pub async fn create_dispatch(
        &self,
        session: &Session,
        tx: &mut dyn Transaction,
        keysafe: Uuid,
        details: Details,
        expires: Option<DateTime<Utc>>,
        files: Vec<UploadedFile>,
    ) -> Result<Allocation> {
        let keysafe = tx.keysafe(keysafe).await?.ok_or(Error::NotFound)?;
        let bundle = self.allocations.upload_bundle(tx, files, None)?;

        let mut allocation = Allocation::new(
            AllocationKind::Dispatch {
                keysafe: keysafe.id,
            },
            expires,
            None,
        );
        let document = AllocationDocument {
            details,
            bundle: bundle.descriptors.clone(),
        };
        let sealed = self
            .documents
            .seal(tx, &document, SealScope::KeySafe(&keysafe))
            .await?;
        allocation.document = Some(sealed.id);

        tx.create_allocation(&allocation).await?;
        self.allocations.create_files(tx, &allocation, &bundle).await?;
        self.backend
            .events
            .record(Event::new(allocation.id, EventKind::TransferCreated, session))
            .await?;

        tracing::info!(
            "created dispatch {} with {} files",
            allocation.id,
            bundle.descriptors.len()
        );
        Ok(allocation)
    }

    pub async fn retrieve_dispatch(
        &self,
        session: &Session,
        tx: &mut dyn Transaction,
        dispatch: Uuid,
    ) -> Result<UnlockedAllocation> {
        let allocation = tx
            .allocation(dispatch)
            .await?
            .filter(|a| matches!(a.kind, AllocationKind::Dispatch { .. }))
            .ok_or(Error::NotFound)?;
        self.allocations
            .unlock_allocation(session, tx, &allocation)
            .await
    }
}
