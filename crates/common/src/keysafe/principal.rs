use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{
    generate_static_secret, CodeWrap, KeyWrapError, PrincipalPublicKey, Secret, SecretShare,
    StaticSecret, SECRET_SIZE,
};

/// Identity of a key-holding principal inside a [`KeyService`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrincipalId(Uuid);

impl PrincipalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl Default for PrincipalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyServiceError {
    #[error("unknown principal '{0}'")]
    UnknownPrincipal(PrincipalId),
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("key service lock poisoned: {0}")]
    Internal(String),
    #[error("key wrap error: {0}")]
    KeyWrap(#[from] KeyWrapError),
}

/// Proof that a principal was authenticated in this process.
///
/// Holds the principal's private key; never serialized and never logged.
#[derive(Clone)]
pub struct UnlockCapability {
    principal: PrincipalId,
    private: StaticSecret,
}

impl fmt::Debug for UnlockCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnlockCapability")
            .field("principal", &self.principal)
            .finish_non_exhaustive()
    }
}

impl UnlockCapability {
    pub fn principal(&self) -> PrincipalId {
        self.principal
    }

    pub(crate) fn private_key(&self) -> &StaticSecret {
        &self.private
    }
}

/// Principal key management.
///
/// A principal is created from a secret (a password or another key) and can
/// only be authenticated with that same secret. Keys wrapped for a principal
/// can only be unwrapped with its [`UnlockCapability`].
pub trait KeyService: Send + Sync + fmt::Debug {
    fn create_principal(&self, secret: &[u8]) -> Result<PrincipalId, KeyServiceError>;

    fn authenticate(
        &self,
        principal: PrincipalId,
        secret: &[u8],
    ) -> Result<UnlockCapability, KeyServiceError>;

    fn wrap_key(&self, key: &Secret, principal: PrincipalId)
        -> Result<SecretShare, KeyServiceError>;

    fn unwrap_key(
        &self,
        wrapped: &SecretShare,
        capability: &UnlockCapability,
    ) -> Result<Secret, KeyServiceError>;
}

#[derive(Debug)]
struct PrincipalRecord {
    public: PrincipalPublicKey,
    /// The private key, wrapped under the principal's secret
    private: CodeWrap,
}

/// In-process key service: every principal is an X25519 keypair whose
/// private half is kept wrapped under the principal's secret.
#[derive(Debug, Clone, Default)]
pub struct LocalKeyService {
    principals: Arc<RwLock<HashMap<PrincipalId, PrincipalRecord>>>,
}

impl LocalKeyService {
    pub fn new() -> Self {
        Self::default()
    }

    fn public_key(&self, principal: PrincipalId) -> Result<PrincipalPublicKey, KeyServiceError> {
        let principals = self
            .principals
            .read()
            .map_err(|e| KeyServiceError::Internal(e.to_string()))?;
        principals
            .get(&principal)
            .map(|record| record.public)
            .ok_or(KeyServiceError::UnknownPrincipal(principal))
    }
}

impl KeyService for LocalKeyService {
    fn create_principal(&self, secret: &[u8]) -> Result<PrincipalId, KeyServiceError> {
        let private = generate_static_secret()?;
        let record = PrincipalRecord {
            public: PrincipalPublicKey::from(&private),
            private: CodeWrap::new(private.as_bytes(), secret)?,
        };

        let id = PrincipalId::new();
        self.principals
            .write()
            .map_err(|e| KeyServiceError::Internal(e.to_string()))?
            .insert(id, record);
        Ok(id)
    }

    fn authenticate(
        &self,
        principal: PrincipalId,
        secret: &[u8],
    ) -> Result<UnlockCapability, KeyServiceError> {
        let principals = self
            .principals
            .read()
            .map_err(|e| KeyServiceError::Internal(e.to_string()))?;
        let record = principals
            .get(&principal)
            .ok_or(KeyServiceError::UnknownPrincipal(principal))?;

        let bytes: [u8; SECRET_SIZE] = record
            .private
            .recover(secret)
            .map_err(|_| KeyServiceError::AuthenticationFailed)?
            .try_into()
            .map_err(|_| KeyServiceError::AuthenticationFailed)?;
        let private = StaticSecret::from(bytes);

        // sanity check the recovered key still matches the registered public half
        if PrincipalPublicKey::from(&private) != record.public {
            return Err(KeyServiceError::AuthenticationFailed);
        }

        Ok(UnlockCapability { principal, private })
    }

    fn wrap_key(
        &self,
        key: &Secret,
        principal: PrincipalId,
    ) -> Result<SecretShare, KeyServiceError> {
        let public = self.public_key(principal)?;
        Ok(SecretShare::new(key, &public)?)
    }

    fn unwrap_key(
        &self,
        wrapped: &SecretShare,
        capability: &UnlockCapability,
    ) -> Result<Secret, KeyServiceError> {
        wrapped
            .recover(capability.private_key())
            .map_err(|_| KeyServiceError::AuthenticationFailed)
    }
}
