//! Vault module: on-disk key slots.
//!
//! This module provides:
//! - The binary `KeysetContainer` format with copy-aside backups (`format`)
//! - The in-memory `Vault` handle that wraps and unwraps one slot (`keyset`)

pub mod format;
pub mod keyset;

// Re-export the most commonly used items.
pub use format::{KeyPolicy, KeysetContainer, WrapFlags};
pub use keyset::Vault;
