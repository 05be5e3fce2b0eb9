//! Cryptographic primitives for homevault.
//!
//! This module provides:
//! - AES-256-GCM encryption and decryption (`encryption`)
//! - Argon2id passkey-based key derivation (`kdf`)
//! - Vault key material and HKDF helpers (`keys`)
//! - The `WrapEngine` contract and its software implementation (`wrap`)

pub mod encryption;
pub mod kdf;
pub mod keys;
pub mod wrap;

pub use encryption::{decrypt, encrypt};
pub use kdf::{derive_wrapping_key, generate_salt, Argon2Params};
pub use keys::VaultKeys;
pub use wrap::{SoftwareWrapEngine, UnwrapError, UnwrapStatus, Unwrapped, WrapEngine};
