//! Privileged operating-system operations.
//!
//! Everything that needs root or touches kernel state (mounts, ownership,
//! the keyring, process tables) goes through `Platform`, so the vault core
//! can run against a fake in tests.  Plain directory and file creation use
//! `std::fs` directly.

use std::path::{Path, PathBuf};

use crate::errors::Result;

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::LinuxPlatform;

/// Ownership and mode bits of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub is_dir: bool,
    pub uid: u32,
    pub gid: u32,
    /// Permission bits including setuid/setgid/sticky (`& 0o7777`).
    pub mode: u32,
}

/// A process keeping files open below some path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub cmdline: String,
    pub cwd: Option<PathBuf>,
    pub open_files: Vec<PathBuf>,
}

pub trait Platform: Send + Sync {
    /// Mount `source` on `target` as `fs_type` with comma separated `options`.
    fn mount(&self, source: &Path, target: &Path, fs_type: &str, options: &str) -> Result<()>;

    fn bind(&self, source: &Path, target: &Path) -> Result<()>;

    /// Unmount `target`; a lazy unmount detaches immediately and finishes
    /// once the last holder closes its files.
    fn unmount(&self, target: &Path, lazy: bool) -> Result<()>;

    fn is_directory_mounted(&self, target: &Path) -> bool;

    fn processes_with_open_files(&self, path: &Path) -> Vec<ProcessInfo>;

    /// Flush all pending filesystem writes.
    fn sync(&self);

    fn sync_directory(&self, path: &Path) -> Result<()>;

    /// Bytes available to unprivileged users on the filesystem of `path`.
    fn free_disk_space(&self, path: &Path) -> Result<u64>;

    fn set_ownership(&self, path: &Path, uid: u32, gid: u32) -> Result<()>;

    fn set_permissions(&self, path: &Path, mode: u32) -> Result<()>;

    fn stat(&self, path: &Path) -> Result<FileStat>;

    /// Insert a filesystem encryption key into the user keyring.
    fn add_encryption_key(&self, key: &[u8], salt: &[u8], signature: &str) -> Result<()>;

    fn clear_user_keyring(&self) -> Result<()>;
}
