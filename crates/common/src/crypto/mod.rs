//! Cryptographic building blocks for Courier
//!
//! - **Encryption**: ChaCha20-Poly1305 with one [`Secret`] per sealed document
//!   and per stored file body
//! - **Principal wrapping**: [`SecretShare`] wraps a document secret for a
//!   KeySafe principal using X25519 key agreement and AES-KW
//! - **Code wrapping**: [`CodeWrap`] wraps a secret under a key derived from a
//!   transfer code or password
//!
//! The primitives come from their crates; this module only composes them.

mod key_wrap;
mod secret;

pub use key_wrap::{
    generate_static_secret, CodeWrap, KeyWrapError, SecretShare, PUBLIC_KEY_SIZE, SALT_SIZE,
    WRAPPED_SECRET_SIZE,
};
pub use secret::{Secret, SecretError, BLAKE3_HASH_SIZE, NONCE_SIZE, SECRET_SIZE};
pub use x25519_dalek::{PublicKey as PrincipalPublicKey, StaticSecret};
