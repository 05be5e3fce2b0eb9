use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{HomeVaultError, Result};

/// Daemon configuration, loaded from `/etc/homevault/homevault.toml`.
///
/// Every field has a sensible default so homevault works out-of-the-box
/// without any config file at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Directory holding the system salt and one directory per identity.
    #[serde(default = "default_shadow_root")]
    pub shadow_root: PathBuf,

    /// tmpfs-backed homes of ephemeral users live under here.
    #[serde(default = "default_ephemeral_root")]
    pub ephemeral_root: PathBuf,

    /// Public per-user path is `<user_home_base>/<obfuscated>`.
    #[serde(default = "default_user_home_base")]
    pub user_home_base: PathBuf,

    /// Public per-user root path is `<root_home_base>/<obfuscated>`.
    #[serde(default = "default_root_home_base")]
    pub root_home_base: PathBuf,

    /// Transitional public path is `<shared_user_base>/u-<obfuscated>`.
    #[serde(default = "default_shared_user_base")]
    pub shared_user_base: PathBuf,

    /// Fixed path shared by all users, bound when `legacy_mount` is set.
    #[serde(default = "default_legacy_home")]
    pub legacy_home: PathBuf,

    #[serde(default = "default_true")]
    pub legacy_mount: bool,

    /// Filesystem type of the encrypted mount.
    #[serde(default = "default_mount_fs_type")]
    pub mount_fs_type: String,

    #[serde(default = "default_user_uid")]
    pub user_uid: u32,

    #[serde(default = "default_user_gid")]
    pub user_gid: u32,

    /// Group that may traverse the user's home.
    #[serde(default = "default_access_gid")]
    pub access_gid: u32,

    /// Group owning the migration sentinel directory.
    #[serde(default = "default_daemon_store_gid")]
    pub daemon_store_gid: u32,

    /// Prefer hardware wrapping when the engine offers it.
    #[serde(default = "default_true")]
    pub use_hardware: bool,

    /// Argon2 memory cost in KiB (default: 64 MB).
    #[serde(default = "default_argon2_memory_kib")]
    pub argon2_memory_kib: u32,

    /// Argon2 iteration count (default: 3).
    #[serde(default = "default_argon2_iterations")]
    pub argon2_iterations: u32,

    /// Argon2 parallelism degree (default: 4).
    #[serde(default = "default_argon2_parallelism")]
    pub argon2_parallelism: u32,

    /// Free space at which disk reclamation stops.
    #[serde(default = "default_min_free_space_bytes")]
    pub min_free_space_bytes: u64,

    /// Cache directory cleared first, relative to `vault/user`.
    #[serde(default = "default_cache_subdir")]
    pub cache_subdir: String,

    /// Temp-cache directory cleared second, relative to `vault/user`.
    #[serde(default = "default_temp_cache_subdir")]
    pub temp_cache_subdir: String,

    #[serde(default = "default_policy_file")]
    pub policy_file: PathBuf,
}

// ── Serde default helpers ────────────────────────────────────────────

fn default_shadow_root() -> PathBuf {
    PathBuf::from("/home/.shadow")
}

fn default_ephemeral_root() -> PathBuf {
    PathBuf::from("/run/homevault")
}

fn default_user_home_base() -> PathBuf {
    PathBuf::from("/home/user")
}

fn default_root_home_base() -> PathBuf {
    PathBuf::from("/home/root")
}

fn default_shared_user_base() -> PathBuf {
    PathBuf::from("/home/chronos")
}

fn default_legacy_home() -> PathBuf {
    PathBuf::from("/home/chronos/user")
}

fn default_true() -> bool {
    true
}

fn default_mount_fs_type() -> String {
    "ecryptfs".to_string()
}

fn default_user_uid() -> u32 {
    1000
}

fn default_user_gid() -> u32 {
    1000
}

fn default_access_gid() -> u32 {
    1001
}

fn default_daemon_store_gid() -> u32 {
    400
}

fn default_argon2_memory_kib() -> u32 {
    65_536 // 64 MB
}

fn default_argon2_iterations() -> u32 {
    3
}

fn default_argon2_parallelism() -> u32 {
    4
}

fn default_min_free_space_bytes() -> u64 {
    512 * 1024 * 1024
}

fn default_cache_subdir() -> String {
    "Cache".to_string()
}

fn default_temp_cache_subdir() -> String {
    "GCache/v1/tmp".to_string()
}

fn default_policy_file() -> PathBuf {
    PathBuf::from("/etc/homevault/policy.toml")
}

// ── Implementation ───────────────────────────────────────────────────

impl Default for Settings {
    fn default() -> Self {
        Self {
            shadow_root: default_shadow_root(),
            ephemeral_root: default_ephemeral_root(),
            user_home_base: default_user_home_base(),
            root_home_base: default_root_home_base(),
            shared_user_base: default_shared_user_base(),
            legacy_home: default_legacy_home(),
            legacy_mount: default_true(),
            mount_fs_type: default_mount_fs_type(),
            user_uid: default_user_uid(),
            user_gid: default_user_gid(),
            access_gid: default_access_gid(),
            daemon_store_gid: default_daemon_store_gid(),
            use_hardware: default_true(),
            argon2_memory_kib: default_argon2_memory_kib(),
            argon2_iterations: default_argon2_iterations(),
            argon2_parallelism: default_argon2_parallelism(),
            min_free_space_bytes: default_min_free_space_bytes(),
            cache_subdir: default_cache_subdir(),
            temp_cache_subdir: default_temp_cache_subdir(),
            policy_file: default_policy_file(),
        }
    }
}

impl Settings {
    /// Default location of the config file.
    pub const DEFAULT_PATH: &'static str = "/etc/homevault/homevault.toml";

    /// Load settings from `path`.
    ///
    /// If the file does not exist, sensible defaults are returned.
    /// If the file exists but cannot be parsed, an error is returned.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;

        let settings: Settings = toml::from_str(&contents).map_err(|e| {
            HomeVaultError::ConfigError(format!("Failed to parse {}: {e}", path.display()))
        })?;

        Ok(settings)
    }

    /// Public home of a user: `<user_home_base>/<obfuscated>`.
    pub fn user_home(&self, obfuscated: &str) -> PathBuf {
        self.user_home_base.join(obfuscated)
    }

    /// Public root home of a user: `<root_home_base>/<obfuscated>`.
    pub fn root_home(&self, obfuscated: &str) -> PathBuf {
        self.root_home_base.join(obfuscated)
    }

    /// Transitional public home: `<shared_user_base>/u-<obfuscated>`.
    pub fn transitional_home(&self, obfuscated: &str) -> PathBuf {
        self.shared_user_base.join(format!("u-{obfuscated}"))
    }

    /// Convert the Argon2 settings into crypto-layer params.
    pub fn argon2_params(&self) -> crate::crypto::kdf::Argon2Params {
        crate::crypto::kdf::Argon2Params {
            memory_kib: self.argon2_memory_kib,
            iterations: self.argon2_iterations,
            parallelism: self.argon2_parallelism,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
