//! Inboxes: public drop boxes that collect deposits for a KeySafe

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::allocation::{
    Allocation, AllocationDocument, AllocationKind, AllocationManager, Details, FileSource,
    UnlockedAllocation,
};
use crate::document::{DocumentManager, SealScope};
use crate::session::Session;
use crate::store::{Event, EventKind, Transaction};
use crate::token::{TokenCategory, TokenService};
use crate::{Backend, Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbox {
    pub id: Uuid,
    pub name: String,
    pub introduction: Option<String>,
    /// Deposits are sealed for this KeySafe
    pub keysafe: Uuid,
    pub token: Option<String>,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct InboxService {
    backend: Backend,
    documents: DocumentManager,
    allocations: AllocationManager,
    tokens: TokenService,
}

impl InboxService {
    pub fn new(backend: Backend) -> Self {
        Self {
            documents: DocumentManager::new(backend.keys.clone()),
            allocations: AllocationManager::new(backend.clone()),
            tokens: TokenService::new(),
            backend,
        }
    }

    /// Create an inbox, optionally claiming a token path for it.
    pub async fn create_inbox(
        &self,
        tx: &mut dyn Transaction,
        name: &str,
        introduction: Option<String>,
        token: Option<&str>,
        keysafe: Uuid,
    ) -> Result<Inbox> {
        let keysafe = tx.keysafe(keysafe).await?.ok_or(Error::NotFound)?;
        let token = match token {
            Some(path) => Some(self.tokens.create(tx, path, TokenCategory::Inbox).await?.path),
            None => None,
        };

        let inbox = Inbox {
            id: Uuid::new_v4(),
            name: name.to_string(),
            introduction,
            keysafe: keysafe.id,
            token,
            created: Utc::now(),
        };
        tx.create_inbox(&inbox).await?;
        Ok(inbox)
    }

    pub async fn retrieve_inbox(&self, tx: &mut dyn Transaction, inbox: Uuid) -> Result<Inbox> {
        tx.inbox(inbox).await?.ok_or(Error::NotFound)
    }

    pub async fn retrieve_inbox_by_token(
        &self,
        tx: &mut dyn Transaction,
        path: &str,
    ) -> Result<Option<Inbox>> {
        Ok(tx.inbox_by_token(path).await?)
    }

    /// Drop files into an inbox.
    ///
    /// The depositor only needs to see the origin when copying from a
    /// dispatch; the deposit itself is sealed for the inbox's KeySafe.
    pub async fn create_deposit(
        &self,
        session: &Session,
        tx: &mut dyn Transaction,
        inbox: Uuid,
        details: Details,
        expires: Option<DateTime<Utc>>,
        source: FileSource,
    ) -> Result<Allocation> {
        let inbox = self.retrieve_inbox(tx, inbox).await?;
        let keysafe = tx.keysafe(inbox.keysafe).await?.ok_or(Error::NotFound)?;

        let bundle = match source {
            FileSource::Upload(files) => self.allocations.upload_bundle(tx, files, None)?,
            FileSource::Dispatch(dispatch) => {
                self.allocations
                    .copy_dispatch_bundle(session, tx, dispatch, None)
                    .await?
            }
        };

        let mut allocation = Allocation::new(
            AllocationKind::Deposit {
                inbox: inbox.id,
                keysafe: keysafe.id,
            },
            expires,
            bundle.derived_from,
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

        tracing::info!("deposit {} created in inbox {}", allocation.id, inbox.id);
        Ok(allocation)
    }

    /// A deposit of `inbox`, unsealed.
    pub async fn retrieve_deposit(
        &self,
        session: &Session,
        tx: &mut dyn Transaction,
        inbox: Uuid,
        deposit: Uuid,
    ) -> Result<UnlockedAllocation> {
        let allocation = tx.allocation(deposit).await?.ok_or(Error::NotFound)?;
        match allocation.kind {
            AllocationKind::Deposit { inbox: owner, .. } if owner == inbox => {}
            AllocationKind::Deposit { .. } => {
                return Err(Error::OwnershipMismatch {
                    entity: "deposit",
                    id: deposit,
                    owner: inbox,
                })
            }
            _ => return Err(Error::NotFound),
        }
        self.allocations
            .unlock_allocation(session, tx, &allocation)
            .await
    }

    /// The inbox's live deposits, oldest first; with `release` each one is
    /// also unsealed into the session.
    pub async fn retrieve_deposits(
        &self,
        session: &Session,
        tx: &mut dyn Transaction,
        inbox: Uuid,
        release: bool,
    ) -> Result<Vec<Allocation>> {
        let deposits = tx.deposits_for_inbox(inbox).await?;
        if release {
            let listed: Vec<Option<Allocation>> = deposits.iter().cloned().map(Some).collect();
            self.allocations
                .release_details(session, tx, &listed)
                .await?;
        }
        Ok(deposits)
    }
}
