//! Sealed, versioned metadata documents
//!
//! A document body is serialized to JSON and encrypted with a fresh
//! [`Secret`]. That secret is wrapped either for a KeySafe principal or
//! under a transfer code. Updates never overwrite: each one writes a new
//! version with the same serial, reusing the original secret and wrapping,
//! and an update based on anything but the latest version is rejected.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::crypto::{CodeWrap, Secret, SecretShare};
use crate::keysafe::{KeySafe, KeyService, UnlockCapability};
use crate::store::Transaction;
use crate::{Error, Result};

/// How a document's secret is stored alongside it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WrappedKey {
    Principal(SecretShare),
    Code(CodeWrap),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedDocument {
    pub id: Uuid,
    /// Shared by every version of the same document
    pub serial: Uuid,
    pub version: u32,
    pub keysafe: Option<Uuid>,
    /// `None` for plaintext documents
    pub key: Option<WrappedKey>,
    pub content: Vec<u8>,
    pub created: DateTime<Utc>,
}

/// What to seal a new document with
#[derive(Debug, Clone, Copy)]
pub enum SealScope<'a> {
    KeySafe(&'a KeySafe),
    Code(&'a str),
    Plain,
}

/// What to unseal a document with
#[derive(Debug, Clone, Copy)]
pub enum UnsealKey<'a> {
    Capability(&'a UnlockCapability),
    Code(&'a str),
    Plain,
}

/// A decrypted document.
///
/// Keeps the secret it was sealed with so an edited body can be written
/// back as the next version.
#[derive(Debug, Clone)]
pub struct OpenDocument<T> {
    id: Uuid,
    serial: Uuid,
    version: u32,
    body: T,
    secret: Option<Secret>,
}

impl<T> OpenDocument<T> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn serial(&self) -> Uuid {
        self.serial
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn body(&self) -> &T {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut T {
        &mut self.body
    }

    pub fn into_body(self) -> T {
        self.body
    }

    /// The same body, now standing for the stored version `sealed`
    pub(crate) fn advanced_to(&self, sealed: &EncryptedDocument) -> Self
    where
        T: Clone,
    {
        Self {
            id: sealed.id,
            serial: sealed.serial,
            version: sealed.version,
            body: self.body.clone(),
            secret: self.secret.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DocumentManager {
    keys: Arc<dyn KeyService>,
}

impl DocumentManager {
    pub fn new(keys: Arc<dyn KeyService>) -> Self {
        Self { keys }
    }

    /// Seal `body` as version 1 of a new document and persist it.
    pub async fn seal<T>(
        &self,
        tx: &mut dyn Transaction,
        body: &T,
        scope: SealScope<'_>,
    ) -> Result<EncryptedDocument>
    where
        T: Serialize + Sync,
    {
        let plaintext = serde_json::to_vec(body)?;

        let (keysafe, key, content) = match scope {
            SealScope::KeySafe(keysafe) => {
                let secret = Secret::generate();
                let share = self.keys.wrap_key(&secret, keysafe.principal)?;
                (
                    Some(keysafe.id),
                    Some(WrappedKey::Principal(share)),
                    secret.encrypt(&plaintext)?,
                )
            }
            SealScope::Code(code) => {
                let secret = Secret::generate();
                let wrapped = CodeWrap::wrap_secret(&secret, code)?;
                (
                    None,
                    Some(WrappedKey::Code(wrapped)),
                    secret.encrypt(&plaintext)?,
                )
            }
            SealScope::Plain => (None, None, plaintext),
        };

        let document = EncryptedDocument {
            id: Uuid::new_v4(),
            serial: Uuid::new_v4(),
            version: 1,
            keysafe,
            key,
            content,
            created: Utc::now(),
        };
        tx.insert_document(&document).await?;

        tracing::debug!("sealed document {} (serial {})", document.id, document.serial);
        Ok(document)
    }

    /// Load and decrypt a stored document.
    ///
    /// A missing document, a purged one and a wrong key all fail with
    /// [`Error::UnlockFailure`].
    pub async fn unseal<T>(
        &self,
        tx: &mut dyn Transaction,
        id: Uuid,
        key: UnsealKey<'_>,
    ) -> Result<OpenDocument<T>>
    where
        T: DeserializeOwned,
    {
        let document = tx.document(id).await?.ok_or(Error::UnlockFailure)?;
        self.open(&document, key)
    }

    /// Decrypt an already loaded document.
    pub fn open<T>(&self, document: &EncryptedDocument, key: UnsealKey<'_>) -> Result<OpenDocument<T>>
    where
        T: DeserializeOwned,
    {
        let secret = match (&document.key, key) {
            (None, UnsealKey::Plain) => None,
            (Some(WrappedKey::Principal(share)), UnsealKey::Capability(capability)) => Some(
                self.keys
                    .unwrap_key(share, capability)
                    .map_err(|_| Error::UnlockFailure)?,
            ),
            (Some(WrappedKey::Code(wrapped)), UnsealKey::Code(code)) => Some(
                wrapped
                    .recover_secret(code)
                    .map_err(|_| Error::UnlockFailure)?,
            ),
            _ => return Err(Error::UnlockFailure),
        };

        let plaintext = match &secret {
            Some(secret) => secret
                .decrypt(&document.content)
                .map_err(|_| Error::UnlockFailure)?,
            None => document.content.clone(),
        };

        Ok(OpenDocument {
            id: document.id,
            serial: document.serial,
            version: document.version,
            body: serde_json::from_slice(&plaintext)?,
            secret,
        })
    }

    /// Write `incoming` as the version after `current`.
    ///
    /// `current` must be the latest stored version of the same serial and
    /// `incoming` must have been opened from it.
    pub async fn update<T>(
        &self,
        tx: &mut dyn Transaction,
        incoming: &OpenDocument<T>,
        current: Uuid,
    ) -> Result<EncryptedDocument>
    where
        T: Serialize + Sync,
    {
        let current = tx.document(current).await?.ok_or(Error::NotFound)?;
        if incoming.serial != current.serial {
            return Err(Error::SerialMismatch {
                expected: current.serial,
                actual: incoming.serial,
            });
        }

        let latest = tx
            .latest_document(current.serial)
            .await?
            .ok_or(Error::NotFound)?;
        if incoming.version != current.version || current.version != latest.version {
            tracing::debug!(
                "rejecting update of document {} from version {}, latest is {}",
                current.serial,
                incoming.version,
                latest.version
            );
            return Err(Error::StaleVersion);
        }

        let plaintext = serde_json::to_vec(&incoming.body)?;
        let content = match (&current.key, &incoming.secret) {
            (None, _) => plaintext,
            (Some(_), Some(secret)) => secret.encrypt(&plaintext)?,
            (Some(_), None) => return Err(Error::UnlockFailure),
        };

        let document = EncryptedDocument {
            id: Uuid::new_v4(),
            serial: current.serial,
            version: current.version + 1,
            keysafe: current.keysafe,
            key: current.key.clone(),
            content,
            created: Utc::now(),
        };
        tx.insert_document(&document).await?;
        Ok(document)
    }

    pub async fn latest(
        &self,
        tx: &mut dyn Transaction,
        serial: Uuid,
    ) -> Result<Option<EncryptedDocument>> {
        Ok(tx.latest_document(serial).await?)
    }

    /// Remove every version of a document.
    pub async fn purge(&self, tx: &mut dyn Transaction, serial: Uuid) -> Result<usize> {
        let purged = tx.purge_documents(serial).await?;
        tracing::debug!("purged {} versions of document {}", purged, serial);
        Ok(purged)
    }
}
