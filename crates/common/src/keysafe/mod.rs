//! KeySafes: the principals sealed documents are encrypted for
//!
//! A vault belongs to one member and is unlocked with their password. A
//! division belongs to an organization; its key is shared with each member
//! vault, so any member who has unlocked their own vault can unlock the
//! division.

mod capability;
mod principal;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::crypto::{Secret, SecretShare};
use crate::session::Session;
use crate::store::Transaction;
use crate::{Error, Result};

pub use capability::CapabilityTable;
pub use principal::{KeyService, KeyServiceError, LocalKeyService, PrincipalId, UnlockCapability};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySafeKind {
    Vault,
    /// Division key shares, keyed by the member vault they were wrapped for
    Division { members: BTreeMap<Uuid, SecretShare> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySafe {
    pub id: Uuid,
    /// Member for a vault, organization for a division
    pub owner: Uuid,
    pub principal: PrincipalId,
    pub name: String,
    pub kind: KeySafeKind,
    pub created: DateTime<Utc>,
}

impl KeySafe {
    pub fn is_vault(&self) -> bool {
        matches!(self.kind, KeySafeKind::Vault)
    }
}

#[derive(Debug, Clone)]
pub struct KeySafeService {
    keys: Arc<dyn KeyService>,
}

impl KeySafeService {
    pub fn new(keys: Arc<dyn KeyService>) -> Self {
        Self { keys }
    }

    pub async fn create_vault(
        &self,
        tx: &mut dyn Transaction,
        member: Uuid,
        name: &str,
        password: &str,
    ) -> Result<KeySafe> {
        let principal = self.keys.create_principal(password.as_bytes())?;
        let vault = KeySafe {
            id: Uuid::new_v4(),
            owner: member,
            principal,
            name: name.to_string(),
            kind: KeySafeKind::Vault,
            created: Utc::now(),
        };
        tx.put_keysafe(&vault).await?;

        tracing::debug!("created vault {} for member {}", vault.id, member);
        Ok(vault)
    }

    /// Authenticate a vault and keep its capability in the session.
    pub async fn unlock_vault(
        &self,
        session: &Session,
        tx: &mut dyn Transaction,
        vault_id: Uuid,
        password: &str,
    ) -> Result<()> {
        let vault = tx
            .keysafe(vault_id)
            .await?
            .filter(KeySafe::is_vault)
            .ok_or(Error::NotFound)?;

        let capability = self
            .keys
            .authenticate(vault.principal, password.as_bytes())
            .map_err(|e| {
                tracing::warn!("failed to unlock vault {}: {}", vault_id, e);
                Error::UnlockFailure
            })?;
        session.capabilities().insert(vault.id, capability);
        Ok(())
    }

    /// Create a division whose key is shared with `founder_vault`.
    ///
    /// The founder vault must be unlocked in the session; the new division is
    /// left unlocked as well.
    pub async fn create_division(
        &self,
        session: &Session,
        tx: &mut dyn Transaction,
        organization: Uuid,
        name: &str,
        founder_vault: Uuid,
    ) -> Result<KeySafe> {
        let founder = tx
            .keysafe(founder_vault)
            .await?
            .filter(KeySafe::is_vault)
            .ok_or(Error::NotFound)?;
        if !session.capabilities().contains(founder.id) {
            return Err(Error::LockedResource(founder.id));
        }

        let division_secret = Secret::generate();
        let principal = self.keys.create_principal(division_secret.bytes())?;
        let share = self.keys.wrap_key(&division_secret, founder.principal)?;

        let division = KeySafe {
            id: Uuid::new_v4(),
            owner: organization,
            principal,
            name: name.to_string(),
            kind: KeySafeKind::Division {
                members: BTreeMap::from([(founder.id, share)]),
            },
            created: Utc::now(),
        };
        tx.put_keysafe(&division).await?;

        let capability = self
            .keys
            .authenticate(principal, division_secret.bytes())?;
        session.capabilities().insert(division.id, capability);

        tracing::info!(
            "created division {} for organization {}",
            division.id,
            organization
        );
        Ok(division)
    }

    /// Share a division with another member vault, through a vault that is
    /// already a member and unlocked in the session.
    pub async fn add_division_member(
        &self,
        session: &Session,
        tx: &mut dyn Transaction,
        division_id: Uuid,
        via_vault: Uuid,
        new_vault: Uuid,
    ) -> Result<KeySafe> {
        let mut division = tx.keysafe(division_id).await?.ok_or(Error::NotFound)?;
        let division_secret = self.division_secret(session, &division, via_vault)?;

        let vault = tx
            .keysafe(new_vault)
            .await?
            .filter(KeySafe::is_vault)
            .ok_or(Error::NotFound)?;
        let share = self.keys.wrap_key(&division_secret, vault.principal)?;

        if let KeySafeKind::Division { members } = &mut division.kind {
            members.insert(vault.id, share);
        }
        tx.put_keysafe(&division).await?;
        Ok(division)
    }

    /// Unlock a division through one of its member vaults.
    pub async fn unlock_division(
        &self,
        session: &Session,
        tx: &mut dyn Transaction,
        division_id: Uuid,
        vault_id: Uuid,
    ) -> Result<()> {
        let division = tx.keysafe(division_id).await?.ok_or(Error::NotFound)?;
        let division_secret = self.division_secret(session, &division, vault_id)?;

        let capability = self
            .keys
            .authenticate(division.principal, division_secret.bytes())
            .map_err(|e| {
                tracing::warn!("failed to unlock division {}: {}", division_id, e);
                Error::UnlockFailure
            })?;
        session.capabilities().insert(division.id, capability);
        Ok(())
    }

    /// Drop a KeySafe's capability from the session.
    pub fn lock(&self, session: &Session, keysafe: Uuid) -> bool {
        session.capabilities().remove(keysafe)
    }

    fn division_secret(
        &self,
        session: &Session,
        division: &KeySafe,
        vault_id: Uuid,
    ) -> Result<Secret> {
        let KeySafeKind::Division { members } = &division.kind else {
            return Err(Error::NotFound);
        };
        let share = members.get(&vault_id).ok_or(Error::OwnershipMismatch {
            entity: "vault",
            id: vault_id,
            owner: division.id,
        })?;
        let capability = session.capability(vault_id)?;

        self.keys
            .unwrap_key(share, &capability)
            .map_err(|_| Error::UnlockFailure)
    }
}
