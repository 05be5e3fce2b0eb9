//! The wrapping-engine contract and its software implementation.
//!
//! A `WrapEngine` turns `VaultKeys` plus a passkey into a
//! `KeysetContainer` and back.  The hardware-backed engine lives outside
//! this crate; the vault layer only depends on this trait, its closed
//! failure taxonomy, and the capability queries used to pick the desired
//! wrap method.
//!
//! `SoftwareWrapEngine` derives the wrapping key with Argon2id and seals
//! the serialized keys with AES-256-GCM.

use crate::crypto::encryption::{decrypt, encrypt};
use crate::crypto::kdf::{derive_wrapping_key, Argon2Params};
use crate::crypto::keys::VaultKeys;
use crate::errors::{HomeVaultError, MountError, Result};
use crate::vault::format::{KeysetContainer, WrapFlags};

/// Additional data bound into every software-wrapped payload.
const SOFTWARE_WRAP_AAD: &[u8] = b"homevault-keyset-v1";

/// Why an unwrap did not produce key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwrapError {
    /// Unrecoverable hardware failure for this container.
    HardwareFatal,
    /// Unrecoverable non-hardware failure (malformed payload, ...).
    OtherFatal,
    /// Transient; the whole mount is retried once.
    HardwareCommFailure,
    HardwareDefensiveLock,
    HardwareNeedsReboot,
    /// The passkey does not open this container.
    WrongSecret,
}

impl UnwrapError {
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::HardwareFatal | Self::OtherFatal)
    }
}

impl From<UnwrapError> for MountError {
    fn from(error: UnwrapError) -> Self {
        match error {
            UnwrapError::HardwareFatal | UnwrapError::OtherFatal => MountError::Fatal,
            UnwrapError::HardwareCommFailure => MountError::HardwareCommFailure,
            UnwrapError::HardwareDefensiveLock => MountError::HardwareDefensiveLock,
            UnwrapError::HardwareNeedsReboot => MountError::HardwareNeedsReboot,
            UnwrapError::WrongSecret => MountError::KeyFailure,
        }
    }
}

/// Non-error qualifier of a successful unwrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwrapStatus {
    Ok,
    /// Unwrapped, but the container lacks the hardware public-key hash and
    /// must be re-wrapped.
    MissingPublicKeyHash,
}

/// Successful unwrap result.
#[derive(Debug)]
pub struct Unwrapped {
    pub keys: VaultKeys,
    /// Wrap method flags the container actually used.
    pub flags: WrapFlags,
    pub status: UnwrapStatus,
}

/// Consumed interface of the secret-wrapping engine.
pub trait WrapEngine: Send + Sync {
    /// Wrap `keys` under `passkey` using the engine's preferred method.
    fn wrap(&self, keys: &VaultKeys, passkey: &[u8], salt: &[u8]) -> Result<KeysetContainer>;

    /// Recover the keys sealed in `container`.
    fn unwrap(
        &self,
        container: &KeysetContainer,
        passkey: &[u8],
    ) -> std::result::Result<Unwrapped, UnwrapError>;

    /// Hardware wrapping is physically present and ready.
    fn is_hardware_available(&self) -> bool;

    /// Hardware wrapping is allowed on this device.
    fn is_hardware_enabled(&self) -> bool;
}

/// Argon2id + AES-256-GCM wrapping, used when no hardware engine exists.
#[derive(Debug, Clone)]
pub struct SoftwareWrapEngine {
    params: Argon2Params,
}

impl SoftwareWrapEngine {
    pub fn new(params: Argon2Params) -> Self {
        Self { params }
    }
}

impl Default for SoftwareWrapEngine {
    fn default() -> Self {
        Self::new(Argon2Params::default())
    }
}

impl WrapEngine for SoftwareWrapEngine {
    fn wrap(&self, keys: &VaultKeys, passkey: &[u8], salt: &[u8]) -> Result<KeysetContainer> {
        let wrapping_key = zeroize::Zeroizing::new(
            derive_wrapping_key(passkey, salt, &self.params)
                .map_err(|e| HomeVaultError::WrapFailed(e.to_string()))?,
        );
        let plaintext = keys.to_bytes();
        let wrapped = encrypt(wrapping_key.as_slice(), &plaintext, SOFTWARE_WRAP_AAD)
            .map_err(|e| HomeVaultError::WrapFailed(e.to_string()))?;

        Ok(KeysetContainer::new(
            WrapFlags::SOFTWARE_KDF,
            salt.to_vec(),
            wrapped,
        ))
    }

    fn unwrap(
        &self,
        container: &KeysetContainer,
        passkey: &[u8],
    ) -> std::result::Result<Unwrapped, UnwrapError> {
        if !container.flags.contains(WrapFlags::SOFTWARE_KDF) {
            // Hardware-wrapped and no hardware here.
            return Err(UnwrapError::HardwareFatal);
        }
        if container.salt.is_empty() {
            return Err(UnwrapError::OtherFatal);
        }

        let wrapping_key = zeroize::Zeroizing::new(
            derive_wrapping_key(passkey, &container.salt, &self.params)
                .map_err(|_| UnwrapError::OtherFatal)?,
        );
        let plaintext = zeroize::Zeroizing::new(
            decrypt(
                wrapping_key.as_slice(),
                &container.wrapped_keyset,
                SOFTWARE_WRAP_AAD,
            )
            .map_err(|_| UnwrapError::WrongSecret)?,
        );
        let keys = VaultKeys::from_bytes(&plaintext).map_err(|_| UnwrapError::OtherFatal)?;

        Ok(Unwrapped {
            keys,
            flags: WrapFlags::SOFTWARE_KDF,
            status: UnwrapStatus::Ok,
        })
    }

    fn is_hardware_available(&self) -> bool {
        false
    }

    fn is_hardware_enabled(&self) -> bool {
        false
    }
}
