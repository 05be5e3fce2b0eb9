//! In-memory handle on one key slot.
//!
//! A `Vault` pairs the on-disk `KeysetContainer` of a slot with the key
//! material recovered from it.  The engine owns it exclusively for the
//! duration of a mount; dropping it (or calling `wipe`) zeroizes the keys.

use std::path::Path;

use tracing::debug;

use crate::crypto::keys::VaultKeys;
use crate::crypto::wrap::{UnwrapError, UnwrapStatus, WrapEngine};
use crate::errors::{HomeVaultError, Result};

use super::format::{self, KeysetContainer, WrapFlags};

#[derive(Debug, Default)]
pub struct Vault {
    container: Option<KeysetContainer>,
    keys: Option<VaultKeys>,
    slot: Option<usize>,
}

impl Vault {
    /// An empty handle with neither container nor keys.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh random key material.  Nothing touches the disk until `save`.
    pub fn create_random() -> Self {
        Self {
            container: None,
            keys: Some(VaultKeys::generate()),
            slot: None,
        }
    }

    /// A handle on existing key material, to be wrapped into a new slot.
    pub fn from_keys(keys: VaultKeys) -> Self {
        Self {
            container: None,
            keys: Some(keys),
            slot: None,
        }
    }

    /// Read the container of `path`; keys stay locked until `decrypt`.
    pub fn load(path: &Path) -> Result<Self> {
        let container = format::read_container(path)?;
        Ok(Self {
            container: Some(container),
            keys: None,
            slot: None,
        })
    }

    /// Build a handle around an already loaded container.
    pub fn from_container(container: KeysetContainer) -> Self {
        Self {
            container: Some(container),
            keys: None,
            slot: None,
        }
    }

    /// Persist the current container to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let container = self.container.as_ref().ok_or_else(|| {
            HomeVaultError::WrapFailed("no keyset container to persist".into())
        })?;
        format::write_container(path, container)
    }

    /// Wrap the held keys under `passkey`.
    ///
    /// Slot metadata of a previously held container (label, timestamps,
    /// policy) carries over to the new one.
    pub fn encrypt(&mut self, engine: &dyn WrapEngine, passkey: &[u8], salt: &[u8]) -> Result<()> {
        let keys = self
            .keys
            .as_ref()
            .ok_or_else(|| HomeVaultError::WrapFailed("no key material to wrap".into()))?;
        let mut container = engine.wrap(keys, passkey, salt)?;
        if let Some(old) = self.container.as_ref() {
            container.inherit_metadata(old);
        }
        self.container = Some(container);
        Ok(())
    }

    /// Unwrap the held container with `passkey`.
    ///
    /// On failure any previously recovered keys are discarded.
    pub fn decrypt(
        &mut self,
        engine: &dyn WrapEngine,
        passkey: &[u8],
    ) -> std::result::Result<(WrapFlags, UnwrapStatus), UnwrapError> {
        self.keys = None;
        let container = self.container.as_ref().ok_or(UnwrapError::OtherFatal)?;
        match engine.unwrap(container, passkey) {
            Ok(unwrapped) => {
                self.keys = Some(unwrapped.keys);
                Ok((unwrapped.flags, unwrapped.status))
            }
            Err(e) => {
                debug!(slot = ?self.slot, error = ?e, "keyset did not unwrap");
                Err(e)
            }
        }
    }

    pub fn keys(&self) -> Option<&VaultKeys> {
        self.keys.as_ref()
    }

    pub fn container(&self) -> Option<&KeysetContainer> {
        self.container.as_ref()
    }

    pub fn container_mut(&mut self) -> Option<&mut KeysetContainer> {
        self.container.as_mut()
    }

    pub fn slot(&self) -> Option<usize> {
        self.slot
    }

    pub fn set_slot(&mut self, slot: usize) {
        self.slot = Some(slot);
    }

    /// Discard the recovered key material.
    pub fn wipe(&mut self) {
        self.keys = None;
    }
}
