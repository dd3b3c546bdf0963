use uuid::Uuid;

use crate::crypto::{KeyWrapError, SecretError};
use crate::keysafe::KeyServiceError;
use crate::store::{ContentStoreError, StoreError};

/// Failures surfaced by every core operation.
///
/// Unlock failures never say why: a wrong code, a wrong capability and a
/// purged document all look the same to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The code, password or capability could not open the document
    #[error("unable to unlock")]
    UnlockFailure,
    /// A newer version exists; re-read and retry
    #[error("stale version, re-fetch and retry")]
    StaleVersion,
    /// A cached value was requested as the wrong type
    #[error("expected cached value of type '{expected}', actual '{actual}'")]
    TypeConflict {
        expected: &'static str,
        actual: &'static str,
    },
    /// The session has no bound accessor
    #[error("no accessor context available for the current session")]
    NoContext,
    #[error("not found")]
    NotFound,
    /// The entity exists but is not owned by the given parent
    #[error("{entity} '{id}' does not belong to '{owner}'")]
    OwnershipMismatch {
        entity: &'static str,
        id: Uuid,
        owner: Uuid,
    },
    /// The KeySafe is not unlocked in this session
    #[error("key safe '{0}' is locked")]
    LockedResource(Uuid),
    /// The allocation or file has expired and is no longer served
    #[error("expired")]
    Expired,
    #[error("document serial mismatch, expected '{expected}', got '{actual}'")]
    SerialMismatch { expected: Uuid, actual: Uuid },
    #[error("invalid token path: {0}")]
    InvalidToken(String),
    #[error("token path already taken: {0}")]
    TokenUnavailable(String),
    #[error("transfer code has no usable characters")]
    InvalidCode,
    /// A derived allocation would hold content its origin does not
    #[error("lineage mismatch with origin '{0}'")]
    LineageMismatch(Uuid),
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("key service error: {0}")]
    KeyService(KeyServiceError),
    #[error("content store error: {0}")]
    Content(#[from] ContentStoreError),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("secret error: {0}")]
    Secret(#[from] SecretError),
    #[error("key wrap error: {0}")]
    KeyWrap(#[from] KeyWrapError),
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { .. } => Error::StaleVersion,
            StoreError::Missing { .. } => Error::NotFound,
            other => Error::Store(other),
        }
    }
}

impl From<KeyServiceError> for Error {
    fn from(err: KeyServiceError) -> Self {
        match err {
            KeyServiceError::AuthenticationFailed => Error::UnlockFailure,
            KeyServiceError::UnknownPrincipal(_) => Error::NotFound,
            other => Error::KeyService(other),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
