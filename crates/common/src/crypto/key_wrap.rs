//! Wrapping secrets for principals and under transfer codes
//!
//! Two wrappings exist:
//!
//! - [`SecretShare`]: ECDH between a fresh ephemeral X25519 key and the
//!   recipient principal's public key, then AES-KW (RFC 3394) of the secret
//!   under the shared secret. Only the holder of the principal's private key
//!   can recover it.
//! - [`CodeWrap`]: AES-KW of the secret under a key stretched with Argon2id
//!   from a random salt and a code or password, then bound to its purpose
//!   with a BLAKE3 derivation context.
//!
//! # Wire Format
//!
//! ```text
//! SecretShare: [ ephemeral_pubkey: 32 bytes ][ wrapped_secret: 40 bytes ]
//! CodeWrap:    [ salt: 16 bytes ][ wrapped_secret: 40 bytes ]
//! ```

use aes_kw::KekAes256 as Kek;
use argon2::{Algorithm, Argon2, Params, Version};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use super::secret::{Secret, SecretError, SECRET_SIZE};

/// Size of an X25519 public key in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;
/// AES-KW integrity block added to every wrapped key
pub const KW_NONCE_SIZE: usize = 8;
/// Size of a wrapped [`Secret`]
pub const WRAPPED_SECRET_SIZE: usize = SECRET_SIZE + KW_NONCE_SIZE;
/// Size of the salt mixed into code-derived keys
pub const SALT_SIZE: usize = 16;

const CODE_KDF_CONTEXT: &str = "courier 2024-05-01 code wrap key";

/// Errors that can occur while wrapping or recovering a secret
#[derive(Debug, thiserror::Error)]
pub enum KeyWrapError {
    #[error("key wrap error: {0}")]
    Default(#[from] anyhow::Error),
    #[error("secret error: {0}")]
    Secret(#[from] SecretError),
}

/// Generate a new X25519 private key from the system RNG.
pub fn generate_static_secret() -> Result<StaticSecret, KeyWrapError> {
    let mut bytes = [0u8; SECRET_SIZE];
    getrandom::getrandom(&mut bytes)
        .map_err(|e| anyhow::anyhow!("failed to generate private key: {}", e))?;
    Ok(StaticSecret::from(bytes))
}

fn wrap(kek: [u8; SECRET_SIZE], secret: &[u8]) -> Result<Vec<u8>, KeyWrapError> {
    let wrapped = Kek::from(kek)
        .wrap_vec(secret)
        .map_err(|_| anyhow::anyhow!("AES-KW wrap error"))?;
    Ok(wrapped)
}

fn unwrap(kek: [u8; SECRET_SIZE], wrapped: &[u8]) -> Result<Vec<u8>, KeyWrapError> {
    let unwrapped = Kek::from(kek)
        .unwrap_vec(wrapped)
        .map_err(|_| anyhow::anyhow!("AES-KW unwrap error"))?;
    Ok(unwrapped)
}

/// Derive a key-encryption key from a salt and some low-entropy material
fn derive_kek(
    salt: &[u8; SALT_SIZE],
    material: &[u8],
) -> Result<[u8; SECRET_SIZE], KeyWrapError> {
    let params = Params::new(
        Params::DEFAULT_M_COST,
        Params::DEFAULT_T_COST,
        Params::DEFAULT_P_COST,
        Some(SECRET_SIZE),
    )
    .map_err(|e| anyhow::anyhow!("invalid argon2 parameters: {}", e))?;

    let mut stretched = [0u8; SECRET_SIZE];
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(material, salt, &mut stretched)
        .map_err(|e| anyhow::anyhow!("failed to derive code key: {}", e))?;
    Ok(blake3::derive_key(CODE_KDF_CONTEXT, &stretched))
}

/// A secret wrapped for one principal's X25519 public key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretShare {
    ephemeral: [u8; PUBLIC_KEY_SIZE],
    wrapped: [u8; WRAPPED_SECRET_SIZE],
}

impl SecretShare {
    /// Wrap `secret` so only the holder of `recipient`'s private key can recover it.
    pub fn new(secret: &Secret, recipient: &X25519PublicKey) -> Result<Self, KeyWrapError> {
        let ephemeral_private = generate_static_secret()?;
        let ephemeral_public = X25519PublicKey::from(&ephemeral_private);

        let shared_secret = ephemeral_private.diffie_hellman(recipient);
        let wrapped = wrap(*shared_secret.as_bytes(), secret.bytes())?;

        // sanity check we're getting `WRAPPED_SECRET_SIZE` bytes here
        let wrapped: [u8; WRAPPED_SECRET_SIZE] = wrapped
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected share size is incorrect"))?;

        Ok(Self {
            ephemeral: ephemeral_public.to_bytes(),
            wrapped,
        })
    }

    /// Recover the wrapped secret with the recipient's private key.
    ///
    /// An error means the share was made for another principal or was altered.
    pub fn recover(&self, recipient: &StaticSecret) -> Result<Secret, KeyWrapError> {
        let ephemeral_public = X25519PublicKey::from(self.ephemeral);
        let shared_secret = recipient.diffie_hellman(&ephemeral_public);
        let unwrapped = unwrap(*shared_secret.as_bytes(), &self.wrapped)?;
        Ok(Secret::from_slice(&unwrapped)?)
    }
}

/// A secret wrapped under a key derived from a code or password.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodeWrap {
    salt: [u8; SALT_SIZE],
    wrapped: Vec<u8>,
}

impl CodeWrap {
    /// Wrap key material (a multiple of 8 bytes, at least 16) under `code`.
    pub fn new(material: &[u8], code: &[u8]) -> Result<Self, KeyWrapError> {
        let mut salt = [0u8; SALT_SIZE];
        getrandom::getrandom(&mut salt)
            .map_err(|e| anyhow::anyhow!("failed to generate salt: {}", e))?;
        let wrapped = wrap(derive_kek(&salt, code)?, material)?;
        Ok(Self { salt, wrapped })
    }

    /// Wrap a [`Secret`] under a transfer code.
    pub fn wrap_secret(secret: &Secret, code: &str) -> Result<Self, KeyWrapError> {
        Self::new(secret.bytes(), code.as_bytes())
    }

    /// Recover the raw material; fails on the wrong code.
    pub fn recover(&self, code: &[u8]) -> Result<Vec<u8>, KeyWrapError> {
        unwrap(derive_kek(&self.salt, code)?, &self.wrapped)
    }

    pub fn recover_secret(&self, code: &str) -> Result<Secret, KeyWrapError> {
        Ok(Secret::from_slice(&self.recover(code.as_bytes())?)?)
    }
}
