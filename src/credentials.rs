//! User credentials and on-disk identity names.
//!
//! A user never appears by name under the shadow root: their directory is
//! named after the HMAC-SHA256 of the lower-cased account id, keyed by the
//! device-wide system salt.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::info;
use zeroize::Zeroizing;

use crate::crypto::kdf::random_bytes;
use crate::errors::{HomeVaultError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Account id of the guest session; always mounted ephemerally.
pub const GUEST_USERNAME: &str = "$guest";

/// Size of the system salt file.
pub const SYSTEM_SALT_LEN: usize = 16;

/// File name of the system salt under the shadow root.
pub const SYSTEM_SALT_FILE: &str = "salt";

/// Length of an obfuscated username (hex-encoded SHA-256).
const OBFUSCATED_LEN: usize = 64;

// ---------------------------------------------------------------------------
// SystemSalt
// ---------------------------------------------------------------------------

/// Device-wide salt that diversifies obfuscated usernames.
#[derive(Clone)]
pub struct SystemSalt {
    bytes: [u8; SYSTEM_SALT_LEN],
    mac: HmacSha256,
}

impl SystemSalt {
    /// Load `<shadow_root>/salt`, creating it with fresh random bytes when
    /// absent.
    pub fn load_or_create(shadow_root: &Path) -> Result<Self> {
        let path = shadow_root.join(SYSTEM_SALT_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(shadow_root)?;
                let bytes = random_bytes(SYSTEM_SALT_LEN);
                fs::write(&path, &bytes)?;
                info!(path = %path.display(), "created system salt");
                bytes
            }
            Err(e) => return Err(e.into()),
        };
        let bytes: [u8; SYSTEM_SALT_LEN] = bytes.as_slice().try_into().map_err(|_| {
            HomeVaultError::ConfigError(format!(
                "{} is {} bytes, expected {SYSTEM_SALT_LEN}",
                path.display(),
                bytes.len()
            ))
        })?;
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: [u8; SYSTEM_SALT_LEN]) -> Result<Self> {
        let mac = HmacSha256::new_from_slice(&bytes)
            .map_err(|e| HomeVaultError::KeyDerivationFailed(format!("invalid HMAC key: {e}")))?;
        Ok(Self { bytes, mac })
    }

    pub fn as_bytes(&self) -> &[u8; SYSTEM_SALT_LEN] {
        &self.bytes
    }

    /// Obfuscated directory name for `username`.
    pub fn obfuscate(&self, username: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(username.to_lowercase().as_bytes());
        mac.finalize()
            .into_bytes()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

impl fmt::Debug for SystemSalt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SystemSalt(..)")
    }
}

/// Whether `name` has the shape of an obfuscated username.
pub fn is_obfuscated_username(name: &str) -> bool {
    name.len() == OBFUSCATED_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// An account id plus the secret offered for it.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    passkey: Zeroizing<Vec<u8>>,
    key_label: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, passkey: &[u8]) -> Self {
        Self {
            username: username.into(),
            passkey: Zeroizing::new(passkey.to_vec()),
            key_label: None,
        }
    }

    pub fn guest() -> Self {
        Self::new(GUEST_USERNAME, b"")
    }

    /// Restrict decryption to the slot carrying `label`.
    pub fn with_key_label(mut self, label: impl Into<String>) -> Self {
        self.key_label = Some(label.into());
        self
    }

    /// Same account, different secret.
    pub fn with_passkey(&self, passkey: &[u8]) -> Self {
        Self {
            username: self.username.clone(),
            passkey: Zeroizing::new(passkey.to_vec()),
            key_label: self.key_label.clone(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn passkey(&self) -> &[u8] {
        &self.passkey
    }

    pub fn key_label(&self) -> Option<&str> {
        self.key_label.as_deref()
    }

    pub fn is_guest(&self) -> bool {
        self.username == GUEST_USERNAME
    }

    pub fn obfuscated_username(&self, salt: &SystemSalt) -> String {
        salt.obfuscate(&self.username)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("key_label", &self.key_label)
            .finish_non_exhaustive()
    }
}
