/**
 * Per-session cache of unsealed documents
 *  and unlocked files.
 */
pub mod accessor;
/**
 * Allocation lifecycle: files, expiry,
 *  lineage and reference-counted deletion.
 */
pub mod allocation;
/**
 * Code-protected anonymous transfers.
 */
pub mod anonymous;
/**
 * Cryptographic types and operations.
 *  - Symmetric secrets for documents and file bodies
 *  - Wrapping secrets for principals and under codes
 */
pub mod crypto;
pub mod dispatch;
/**
 * Sealed, versioned metadata documents.
 */
pub mod document;
mod error;
pub mod inbox;
/**
 * Vaults, divisions and the key service
 *  that holds their principals.
 */
pub mod keysafe;
/**
 * Token path resolution and bundle
 *  archives.
 */
pub mod routing;
pub mod session;
/**
 * Storage seams and their in-memory
 *  implementations.
 */
pub mod store;
pub mod token;

use std::sync::Arc;

pub use error::{Error, Result};

use allocation::AllocationManager;
use anonymous::AnonymousService;
use dispatch::DispatchService;
use document::DocumentManager;
use inbox::InboxService;
use keysafe::{KeySafeService, KeyService, LocalKeyService};
use routing::TokenResolver;
use store::{
    ContentStore, EntityStore, EventRecorder, MemoryContentStore, MemoryEntityStore,
    MemoryEventRecorder, Transaction,
};
use token::TokenService;

/// The collaborators every service is built over
#[derive(Debug, Clone)]
pub struct Backend {
    pub entities: Arc<dyn EntityStore>,
    pub content: Arc<dyn ContentStore>,
    pub events: Arc<dyn EventRecorder>,
    pub keys: Arc<dyn KeyService>,
}

impl Backend {
    /// Everything in memory, with a local key service
    pub fn memory() -> Self {
        let content: Arc<dyn ContentStore> = Arc::new(MemoryContentStore::new());
        Self {
            entities: Arc::new(MemoryEntityStore::with_content(content.clone())),
            content,
            events: Arc::new(MemoryEventRecorder::new()),
            keys: Arc::new(LocalKeyService::new()),
        }
    }
}

/// All services over one backend
#[derive(Debug, Clone)]
pub struct Courier {
    backend: Backend,
    documents: DocumentManager,
    keysafes: KeySafeService,
    allocations: AllocationManager,
    dispatches: DispatchService,
    inboxes: InboxService,
    anonymous: AnonymousService,
    tokens: TokenService,
    resolver: TokenResolver,
}

impl Courier {
    pub fn new(backend: Backend) -> Self {
        Self {
            documents: DocumentManager::new(backend.keys.clone()),
            keysafes: KeySafeService::new(backend.keys.clone()),
            allocations: AllocationManager::new(backend.clone()),
            dispatches: DispatchService::new(backend.clone()),
            inboxes: InboxService::new(backend.clone()),
            anonymous: AnonymousService::new(backend.clone()),
            tokens: TokenService::new(),
            resolver: TokenResolver::new(backend.clone()),
            backend,
        }
    }

    pub fn memory() -> Self {
        Self::new(Backend::memory())
    }

    pub async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(self.backend.entities.begin().await?)
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn documents(&self) -> &DocumentManager {
        &self.documents
    }

    pub fn keysafes(&self) -> &KeySafeService {
        &self.keysafes
    }

    pub fn allocations(&self) -> &AllocationManager {
        &self.allocations
    }

    pub fn dispatches(&self) -> &DispatchService {
        &self.dispatches
    }

    pub fn inboxes(&self) -> &InboxService {
        &self.inboxes
    }

    pub fn anonymous(&self) -> &AnonymousService {
        &self.anonymous
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn resolver(&self) -> &TokenResolver {
        &self.resolver
    }
}

pub mod prelude {
    pub use crate::allocation::{
        Allocation, AllocationKind, AllocationState, Details, FileSource, UploadedFile,
    };
    pub use crate::anonymous::{CreateTransfer, CreatedTransfer};
    pub use crate::routing::{Delivery, Redirect, Resolution};
    pub use crate::session::Session;
    pub use crate::{Backend, Courier, Error, Result};
}
