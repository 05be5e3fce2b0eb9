use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Outcome kind of a mount-layer operation.
///
/// `None` and `Recreated` accompany a successful mount; every other kind
/// accompanies a failure. A failed mount always leaves the engine idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MountError {
    None,
    /// Corrupt or unrecoverable state.
    Fatal,
    /// The supplied secret did not unwrap any keyset.
    KeyFailure,
    /// Transient hardware communication failure; retried once by the caller.
    HardwareCommFailure,
    /// The hardware is in dictionary-attack defense mode.
    HardwareDefensiveLock,
    /// The hardware needs a reboot before it can unwrap again.
    HardwareNeedsReboot,
    UserDoesNotExist,
    MountPointBusy,
    /// Mounted, but the vault was rebuilt from scratch.
    Recreated,
}

impl MountError {
    /// Hardware conditions that abort a slot scan immediately and are never
    /// answered by recreating the vault.
    pub fn is_hardware_condition(self) -> bool {
        matches!(
            self,
            Self::HardwareCommFailure | Self::HardwareDefensiveLock | Self::HardwareNeedsReboot
        )
    }
}

impl fmt::Display for MountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::None => "none",
            Self::Fatal => "fatal error",
            Self::KeyFailure => "key failure (wrong secret)",
            Self::HardwareCommFailure => "hardware communication failure",
            Self::HardwareDefensiveLock => "hardware is in defensive lock",
            Self::HardwareNeedsReboot => "hardware needs a reboot",
            Self::UserDoesNotExist => "user does not exist",
            Self::MountPointBusy => "mount point busy",
            Self::Recreated => "vault was recreated",
        };
        f.write_str(text)
    }
}

/// All errors that can occur in homevault.
#[derive(Debug, Error)]
pub enum HomeVaultError {
    // --- Crypto errors ---
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: wrong secret or corrupted data")]
    DecryptionFailed,

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Keyset wrapping failed: {0}")]
    WrapFailed(String),

    // --- Keyset errors ---
    #[error("Keyset not found at {0}")]
    KeysetNotFound(PathBuf),

    #[error("Corrupt keyset: {0}")]
    CorruptKeyset(String),

    #[error("No free keyset slot left for user {0}")]
    KeysetSlotsExhausted(String),

    #[error("No keyset labelled '{0}'")]
    KeysetLabelNotFound(String),

    #[error("A keyset labelled '{0}' already exists")]
    KeysetLabelExists(String),

    #[error("Refusing to remove the last keyset of user {0}")]
    LastKeyset(String),

    // --- Mount errors ---
    #[error("Mount failed: {0}")]
    Mount(MountError),

    #[error("Authorization failed: {0}")]
    AuthorizationFailed(MountError),

    #[error("User {0} is not mounted")]
    NotMounted(String),

    // --- Config errors ---
    #[error("Config file error: {0}")]
    ConfigError(String),

    // --- IO errors ---
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // --- Serialization errors ---
    #[error("Serialization error: {0}")]
    SerializationError(String),

    // --- CLI errors ---
    #[error("Command failed: {0}")]
    CommandFailed(String),

    // --- Worker errors ---
    #[error("The vault worker has stopped")]
    WorkerStopped,
}

impl From<MountError> for HomeVaultError {
    fn from(error: MountError) -> Self {
        Self::Mount(error)
    }
}

/// Convenience type alias for homevault results.
pub type Result<T> = std::result::Result<T, HomeVaultError>;
