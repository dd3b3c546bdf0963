//! Anonymous transfers
//!
//! A transfer is sealed under a short numeric code that the sender passes to
//! the recipient out of band. The code is never stored. Recipients reach the
//! transfer through its token path and unlock it by presenting the code;
//! every attempt, good or bad, is recorded so a lockout policy can be built
//! on the event log.

mod code;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::accessor::ContextKey;
use crate::allocation::{
    Allocation, AllocationDocument, AllocationKind, AllocationManager, Details, FileSource,
    UnlockedAllocation,
};
use crate::document::{DocumentManager, SealScope, UnsealKey};
use crate::session::Session;
use crate::store::{Event, EventKind, Transaction};
use crate::token::{Token, TokenCategory, TokenService};
use crate::{Backend, Error, Result};

pub use code::{normalize, TransferCode, CODE_GROUPS, CODE_GROUP_LENGTH};

#[derive(Debug, Clone)]
pub struct CreateTransfer {
    pub details: Details,
    pub expires: DateTime<Utc>,
    /// Applied to files that do not carry their own limit
    pub max_downloads: Option<u32>,
    pub max_unlock_attempts: Option<u32>,
    pub source: FileSource,
    /// Generated when absent
    pub code: Option<String>,
}

impl CreateTransfer {
    pub fn new(source: FileSource, expires: DateTime<Utc>) -> Self {
        Self {
            details: Details::default(),
            expires,
            max_downloads: None,
            max_unlock_attempts: None,
            source,
            code: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreatedTransfer {
    pub allocation: Allocation,
    pub token: Token,
    /// Hand this to the recipient; it cannot be recovered later
    pub code: TransferCode,
}

#[derive(Debug, Clone)]
pub struct AnonymousService {
    backend: Backend,
    documents: DocumentManager,
    allocations: AllocationManager,
    tokens: TokenService,
}

impl AnonymousService {
    pub fn new(backend: Backend) -> Self {
        Self {
            documents: DocumentManager::new(backend.keys.clone()),
            allocations: AllocationManager::new(backend.clone()),
            tokens: TokenService::new(),
            backend,
        }
    }

    pub async fn create_transfer(
        &self,
        session: &Session,
        tx: &mut dyn Transaction,
        request: CreateTransfer,
    ) -> Result<CreatedTransfer> {
        let code = match request.code {
            Some(pretty) => TransferCode::from_pretty(pretty),
            None => TransferCode::generate(),
        };
        if code.canonical().is_empty() {
            return Err(Error::InvalidCode);
        }

        let bundle = match request.source {
            FileSource::Upload(files) => {
                self.allocations
                    .upload_bundle(tx, files, request.max_downloads)?
            }
            FileSource::Dispatch(dispatch) => {
                self.allocations
                    .copy_dispatch_bundle(session, tx, dispatch, request.max_downloads)
                    .await?
            }
        };

        let token = self.tokens.generate(tx, TokenCategory::Anonymous).await?;
        let mut allocation = Allocation::new(
            AllocationKind::AnonymousTransfer {
                token: token.path.clone(),
                max_unlock_attempts: request.max_unlock_attempts,
            },
            Some(request.expires),
            bundle.derived_from,
        );

        let document = AllocationDocument {
            details: request.details,
            bundle: bundle.descriptors.clone(),
        };
        let sealed = self
            .documents
            .seal(tx, &document, SealScope::Code(code.canonical()))
            .await?;
        allocation.document = Some(sealed.id);

        tx.create_allocation(&allocation).await?;
        self.allocations.create_files(tx, &allocation, &bundle).await?;
        self.backend
            .events
            .record(Event::new(allocation.id, EventKind::TransferCreated, session))
            .await?;

        tracing::info!(
            "created anonymous transfer {} at /{}",
            allocation.id,
            token.path
        );
        Ok(CreatedTransfer {
            allocation,
            token,
            code,
        })
    }

    /// Open a transfer with its code and bind it into the session.
    ///
    /// The attempt is recorded whether or not it succeeds.
    pub async fn unlock(
        &self,
        session: &Session,
        tx: &mut dyn Transaction,
        token: &str,
        code: &str,
    ) -> Result<UnlockedAllocation> {
        let context = session.context()?;
        let code = normalize(code);

        let allocation = tx
            .allocation_by_token(token)
            .await?
            .ok_or(Error::NotFound)?;

        let opened = match allocation.document {
            Some(document) if !allocation.is_purged() => {
                self.documents
                    .unseal::<AllocationDocument>(tx, document, UnsealKey::Code(&code))
                    .await
            }
            _ => Err(Error::UnlockFailure),
        };

        self.backend
            .events
            .record(Event::new(
                allocation.id,
                EventKind::TransferUnlock {
                    success: opened.is_ok(),
                },
                session,
            ))
            .await?;

        let document = opened.inspect_err(|_| {
            tracing::warn!("failed unlock attempt on transfer {}", allocation.id);
        })?;

        let unlocked = UnlockedAllocation {
            allocation,
            document,
        };
        context.retain(token, unlocked.clone());
        context.retain(unlocked.allocation.id, unlocked.clone());
        tracing::debug!("unlocked transfer {}", unlocked.allocation.id);
        Ok(unlocked)
    }

    /// The transfer unlocked earlier in this session, re-read from the
    /// store. `None` if it was never unlocked here or has since been purged.
    pub async fn retrieve_transfer(
        &self,
        session: &Session,
        tx: &mut dyn Transaction,
        token: &str,
    ) -> Result<Option<UnlockedAllocation>> {
        let context = session.context()?;
        let key = ContextKey::from(token);
        let Some(mut unlocked) = context.retrieve::<UnlockedAllocation>(key.clone())? else {
            return Ok(None);
        };

        match tx
            .allocation(unlocked.allocation.id)
            .await?
            .filter(|a| !a.is_purged())
        {
            Some(allocation) => {
                unlocked.allocation = allocation;
                context.retain(key, unlocked.clone());
                context.retain(unlocked.allocation.id, unlocked.clone());
                Ok(Some(unlocked))
            }
            None => {
                context.remove(key);
                context.remove(unlocked.allocation.id);
                Ok(None)
            }
        }
    }

    /// Record acceptance of the transfer's agreement. Accepting twice is a
    /// no-op.
    pub async fn agreement_accepted(
        &self,
        session: &Session,
        tx: &mut dyn Transaction,
        token: &str,
    ) -> Result<()> {
        let allocation = tx
            .allocation_by_token(token)
            .await?
            .filter(|a| !a.is_purged())
            .ok_or(Error::NotFound)?;
        if self.is_accepted(allocation.id).await? {
            return Ok(());
        }
        self.backend
            .events
            .record(Event::new(
                allocation.id,
                EventKind::AgreementAccepted,
                session,
            ))
            .await?;
        Ok(())
    }

    pub async fn is_accepted(&self, allocation: Uuid) -> Result<bool> {
        Ok(self.backend.events.agreement(allocation).await?.is_some())
    }

    pub async fn unlock_attempts(&self, allocation: Uuid) -> Result<Vec<Event>> {
        Ok(self.backend.events.unlock_attempts(allocation).await?)
    }

    pub async fn failed_unlock_attempts(&self, allocation: Uuid) -> Result<usize> {
        Ok(self.backend.events.failed_unlock_attempts(allocation).await?)
    }
}
