//! Device ownership and ephemeral-user policy.
//!
//! The vault core only needs three facts: who owns the device, whether
//! non-owners get throw-away (ephemeral) homes, and whether the device is
//! enterprise-owned.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::debug;

use crate::errors::{HomeVaultError, Result};

/// Point-in-time view of the device policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PolicySnapshot {
    /// Account id of the device owner, if one is known.
    #[serde(default)]
    pub owner: Option<String>,

    #[serde(default, rename = "ephemeral_users")]
    pub ephemeral_users_enabled: bool,

    #[serde(default)]
    pub enterprise_owned: bool,
}

pub trait DevicePolicy: Send + Sync {
    /// Re-read the policy from its source.
    fn reload(&self) -> Result<()>;

    fn snapshot(&self) -> PolicySnapshot;
}

/// Policy fixed at construction time, changeable through `set`.
#[derive(Debug, Default)]
pub struct StaticPolicy {
    inner: Mutex<PolicySnapshot>,
}

impl StaticPolicy {
    pub fn new(snapshot: PolicySnapshot) -> Self {
        Self {
            inner: Mutex::new(snapshot),
        }
    }

    pub fn set(&self, snapshot: PolicySnapshot) {
        *self.inner.lock() = snapshot;
    }
}

impl DevicePolicy for StaticPolicy {
    fn reload(&self) -> Result<()> {
        Ok(())
    }

    fn snapshot(&self) -> PolicySnapshot {
        self.inner.lock().clone()
    }
}

/// Policy read from a TOML file on every `reload`.
///
/// ```toml
/// owner = "alice@example.com"
/// ephemeral_users = false
/// enterprise_owned = false
/// ```
#[derive(Debug)]
pub struct FilePolicy {
    path: PathBuf,
    inner: Mutex<PolicySnapshot>,
}

impl FilePolicy {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            inner: Mutex::new(PolicySnapshot::default()),
        }
    }
}

impl DevicePolicy for FilePolicy {
    fn reload(&self) -> Result<()> {
        let snapshot = if self.path.exists() {
            let contents = std::fs::read_to_string(&self.path)?;
            toml::from_str(&contents).map_err(|e| {
                HomeVaultError::ConfigError(format!(
                    "Failed to parse {}: {e}",
                    self.path.display()
                ))
            })?
        } else {
            PolicySnapshot::default()
        };
        debug!(path = %self.path.display(), ?snapshot, "device policy reloaded");
        *self.inner.lock() = snapshot;
        Ok(())
    }

    fn snapshot(&self) -> PolicySnapshot {
        self.inner.lock().clone()
    }
}
