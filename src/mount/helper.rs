//! The ordered filesystem mount sequence and its teardown.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::crypto::keys::VaultKeys;
use crate::errors::{HomeVaultError, Result};
use crate::homedirs::{MOUNT_DIR, ROOT_DIR, USER_DIR, VAULT_DIR};
use crate::platform::Platform;

use super::stack::{MountPoint, MountStack};

/// Sticky bit.
const S_ISVTX: u32 = 0o1000;

/// Mode of the migrated `root` directory: `rwxrwx--T`.
const ROOT_DIR_MODE: u32 = 0o1770;

/// Mode of the migrated `user` directory.
const USER_DIR_MODE: u32 = 0o750;

/// Well-known subdirectories of `user` that always exist, besides the two
/// configurable cache directories.
const TRACKED_SUBDIRECTORIES: &[&str] = &[
    "Downloads",
    "MyFiles",
    "MyFiles/Downloads",
    "GCache",
    "GCache/v1",
    "GCache/v2",
];

/// Source name of ephemeral tmpfs mounts.
const EPHEMERAL_SOURCE: &str = "homevault-ephemeral";

pub struct MountHelper {
    settings: Arc<Settings>,
    platform: Arc<dyn Platform>,
}

impl MountHelper {
    pub fn new(settings: Arc<Settings>, platform: Arc<dyn Platform>) -> Self {
        Self { settings, platform }
    }

    fn user_directory(&self, obfuscated: &str) -> PathBuf {
        self.settings.shadow_root.join(obfuscated)
    }

    /// Backing directory of an ephemeral home.
    pub fn ephemeral_path(&self, obfuscated: &str) -> PathBuf {
        self.settings
            .ephemeral_root
            .join(MOUNT_DIR)
            .join(obfuscated)
    }

    // ------------------------------------------------------------------
    // Layout migration
    // ------------------------------------------------------------------

    /// Whether `vault/root` carries the completion sentinel: a directory
    /// owned by root and the daemon-store group with the sticky bit set.
    fn is_migrated(&self, root: &Path) -> bool {
        match self.platform.stat(root) {
            Ok(stat) => {
                stat.is_dir
                    && stat.mode & S_ISVTX != 0
                    && stat.uid == 0
                    && stat.gid == self.settings.daemon_store_gid
            }
            Err(_) => false,
        }
    }

    /// Move a flat legacy tree into `user/` and create `root/`.
    ///
    /// A tree that already carries the sentinel is left untouched.
    pub fn migrate_to_user_home(&self, vault_path: &Path) -> Result<()> {
        let user = vault_path.join(USER_DIR);
        let root = vault_path.join(ROOT_DIR);
        if self.is_migrated(&root) {
            return Ok(());
        }

        info!(path = %vault_path.display(), "migrating vault to user/root layout");
        fs::create_dir_all(&user)?;
        for entry in fs::read_dir(vault_path)? {
            let entry = entry?;
            let name = entry.file_name();
            if name == USER_DIR || name == ROOT_DIR {
                continue;
            }
            fs::rename(entry.path(), user.join(&name))?;
        }
        self.platform
            .set_ownership(&user, self.settings.user_uid, self.settings.user_gid)?;
        self.platform.set_permissions(&user, USER_DIR_MODE)?;

        fs::create_dir_all(&root)?;
        self.platform
            .set_ownership(&root, 0, self.settings.daemon_store_gid)?;
        self.platform.set_permissions(&root, ROOT_DIR_MODE)?;
        Ok(())
    }

    /// Create the tracked subdirectories of `user`, repairing ownership.
    ///
    /// A directory that cannot be created is logged and skipped.
    pub fn create_tracked_subdirectories(&self, user_path: &Path) {
        let configured = [
            self.settings.cache_subdir.as_str(),
            self.settings.temp_cache_subdir.as_str(),
        ];
        for name in TRACKED_SUBDIRECTORIES.iter().copied().chain(configured) {
            let dir = user_path.join(name);
            let outcome = fs::create_dir_all(&dir)
                .map_err(HomeVaultError::from)
                .and_then(|()| {
                    self.platform
                        .set_ownership(&dir, self.settings.user_uid, self.settings.user_gid)
                });
            if let Err(e) = outcome {
                warn!(path = %dir.display(), error = %e, "cannot create tracked directory");
            }
        }
    }

    // ------------------------------------------------------------------
    // Mount sequences
    // ------------------------------------------------------------------

    /// Mount the vault of `obfuscated`, pushing every mount onto `stack`.
    ///
    /// On error the caller unwinds `stack`.
    pub fn perform_mount(&self, obfuscated: &str, keys: &VaultKeys, stack: &mut MountStack) -> Result<()> {
        let user_dir = self.user_directory(obfuscated);
        let vault_path = user_dir.join(VAULT_DIR);
        let mount_path = user_dir.join(MOUNT_DIR);

        self.migrate_to_user_home(&vault_path)?;
        self.create_tracked_subdirectories(&vault_path.join(USER_DIR));

        let fek_sig = keys.fek_signature()?;
        let fnek_sig = keys.fnek_signature()?;
        self.platform
            .add_encryption_key(keys.fek(), keys.fek_salt(), &fek_sig)?;
        self.platform
            .add_encryption_key(keys.fnek(), keys.fnek_salt(), &fnek_sig)?;

        let options = format!(
            "ecryptfs_cipher=aes,ecryptfs_key_bytes=32,ecryptfs_fnek_sig={fnek_sig},\
             ecryptfs_sig={fek_sig},ecryptfs_unlink_sigs"
        );
        fs::create_dir_all(&mount_path)?;
        self.platform.mount(
            &vault_path,
            &mount_path,
            &self.settings.mount_fs_type,
            &options,
        )?;
        stack.push(&vault_path, &mount_path);

        self.bind_public_paths(
            obfuscated,
            &mount_path.join(USER_DIR),
            &mount_path.join(ROOT_DIR),
            stack,
        )
    }

    /// Mount a tmpfs home for `obfuscated`.
    pub fn perform_ephemeral_mount(&self, obfuscated: &str, stack: &mut MountStack) -> Result<()> {
        let path = self.ephemeral_path(obfuscated);
        fs::create_dir_all(&path)?;
        self.platform
            .mount(Path::new(EPHEMERAL_SOURCE), &path, "tmpfs", "mode=0700")?;
        stack.push(Path::new(EPHEMERAL_SOURCE), &path);

        let user = path.join(USER_DIR);
        let root = path.join(ROOT_DIR);
        fs::create_dir_all(&user)?;
        fs::create_dir_all(&root)?;
        self.platform
            .set_ownership(&user, self.settings.user_uid, self.settings.user_gid)?;
        self.platform
            .set_ownership(&root, 0, self.settings.daemon_store_gid)?;
        self.platform.set_permissions(&root, ROOT_DIR_MODE)?;
        self.create_tracked_subdirectories(&user);

        self.bind_public_paths(obfuscated, &user, &root, stack)
    }

    /// Remove the backing directory of an ephemeral home.
    pub fn remove_ephemeral_path(&self, obfuscated: &str) {
        let path = self.ephemeral_path(obfuscated);
        if let Err(e) = fs::remove_dir_all(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "cannot remove ephemeral home");
            }
        }
    }

    fn bind_public_paths(
        &self,
        obfuscated: &str,
        user_source: &Path,
        root_source: &Path,
        stack: &mut MountStack,
    ) -> Result<()> {
        fs::create_dir_all(user_source)?;
        fs::create_dir_all(root_source)?;

        let binds = [
            (user_source, self.settings.user_home(obfuscated)),
            (user_source, self.settings.transitional_home(obfuscated)),
            (root_source, self.settings.root_home(obfuscated)),
        ];
        for (source, target) in binds {
            self.bind_and_push(source, &target, stack)?;
        }

        if self.settings.legacy_mount {
            let legacy = &self.settings.legacy_home;
            if self.platform.is_directory_mounted(legacy) {
                debug!(path = %legacy.display(), "legacy home already mounted, skipping");
            } else {
                self.bind_and_push(user_source, legacy, stack)?;
            }
        }
        Ok(())
    }

    fn bind_and_push(&self, source: &Path, target: &Path, stack: &mut MountStack) -> Result<()> {
        fs::create_dir_all(target)?;
        self.platform.bind(source, target)?;
        stack.push(source, target);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Unmount everything on `stack`, newest first. Returns whether every
    /// mount came off without falling back to a lazy unmount.
    pub fn unmount_all(&self, stack: &mut MountStack) -> bool {
        let mut clean = true;
        while let Some(point) = stack.pop() {
            if !self.force_unmount(&point) {
                clean = false;
            }
        }
        clean
    }

    /// Unmount `point`, falling back to a lazy unmount when it is busy.
    pub fn force_unmount(&self, point: &MountPoint) -> bool {
        let Err(first) = self.platform.unmount(&point.target, false) else {
            return true;
        };

        warn!(path = %point.target.display(), error = %first, "unmount failed, forcing");
        for process in self.platform.processes_with_open_files(&point.target) {
            error!(
                pid = process.pid,
                cmdline = %process.cmdline,
                cwd = ?process.cwd,
                open_files = ?process.open_files,
                "process holds files under mount point"
            );
        }
        self.platform.sync();

        if let Err(e) = self.platform.unmount(&point.target, true) {
            error!(path = %point.target.display(), error = %e, "lazy unmount failed");
        }
        if point.source.is_dir() {
            if let Err(e) = self.platform.sync_directory(&point.source) {
                debug!(path = %point.source.display(), error = %e, "cannot sync mount source");
            }
        }
        false
    }
}
