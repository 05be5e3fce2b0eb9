//! The collection of on-disk user vaults under the shadow root.
//!
//! `VaultCollection` knows the directory layout of every identity, finds
//! and unwraps key slots, adds/removes/moves slots, and reclaims disk
//! space according to the device policy.
//!
//! ```text
//! <shadow-root>/
//!   salt
//!   <obfuscated>/
//!     key.<0..99>   key.<n>.salt
//!     vault/{user,root}
//!     mount/{user,root}
//! ```

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::activity::ActivityCache;
use crate::config::Settings;
use crate::credentials::{is_obfuscated_username, Credentials, SystemSalt};
use crate::crypto::kdf::generate_salt;
use crate::crypto::wrap::{UnwrapStatus, WrapEngine};
use crate::errors::{HomeVaultError, MountError, Result};
use crate::mount::{MountArgs, MountEngine, MountOutcome};
use crate::platform::Platform;
use crate::policy::{DevicePolicy, PolicySnapshot};
use crate::vault::format::{self, KeysetContainer, WrapFlags};
use crate::vault::Vault;

/// Slot indices live in `[0, MAX_KEYSETS)`.
pub const MAX_KEYSETS: usize = 100;

const KEY_FILE_PREFIX: &str = "key.";
const LEGACY_SALT_SUFFIX: &str = "salt";

pub const VAULT_DIR: &str = "vault";
pub const MOUNT_DIR: &str = "mount";
pub const USER_DIR: &str = "user";
pub const ROOT_DIR: &str = "root";

/// A slot that unwrapped with the offered credentials.
#[derive(Debug)]
pub struct ValidKeyset {
    pub vault: Vault,
    pub index: usize,
    pub flags: WrapFlags,
    pub status: UnwrapStatus,
}

/// Label shown for a slot: its own, or `legacy-<n>` when it has none.
pub fn slot_label(container: &KeysetContainer, index: usize) -> String {
    container
        .label
        .clone()
        .unwrap_or_else(|| format!("legacy-{index}"))
}

#[derive(Clone)]
pub struct VaultCollection {
    settings: Arc<Settings>,
    platform: Arc<dyn Platform>,
    engine: Arc<dyn WrapEngine>,
    policy: Arc<dyn DevicePolicy>,
    salt: SystemSalt,
    activity: Arc<Mutex<ActivityCache>>,
}

impl VaultCollection {
    /// Build the collection, loading (or creating) the system salt.
    pub fn new(
        settings: Arc<Settings>,
        platform: Arc<dyn Platform>,
        engine: Arc<dyn WrapEngine>,
        policy: Arc<dyn DevicePolicy>,
    ) -> Result<Self> {
        let salt = SystemSalt::load_or_create(&settings.shadow_root)?;
        Ok(Self {
            settings,
            platform,
            engine,
            policy,
            salt,
            activity: Arc::new(Mutex::new(ActivityCache::new())),
        })
    }

    // ------------------------------------------------------------------
    // Accessors and layout
    // ------------------------------------------------------------------

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub fn engine(&self) -> &dyn WrapEngine {
        self.engine.as_ref()
    }

    pub fn system_salt(&self) -> &SystemSalt {
        &self.salt
    }

    pub fn shadow_root(&self) -> &Path {
        &self.settings.shadow_root
    }

    pub fn obfuscate(&self, username: &str) -> String {
        self.salt.obfuscate(username)
    }

    pub fn user_directory(&self, obfuscated: &str) -> PathBuf {
        self.shadow_root().join(obfuscated)
    }

    /// At-rest encrypted tree.
    pub fn vault_path(&self, obfuscated: &str) -> PathBuf {
        self.user_directory(obfuscated).join(VAULT_DIR)
    }

    /// Live mount target.
    pub fn mount_path(&self, obfuscated: &str) -> PathBuf {
        self.user_directory(obfuscated).join(MOUNT_DIR)
    }

    pub fn keyset_path(&self, obfuscated: &str, index: usize) -> PathBuf {
        self.user_directory(obfuscated)
            .join(format!("{KEY_FILE_PREFIX}{index}"))
    }

    pub fn legacy_salt_path(&self, obfuscated: &str, index: usize) -> PathBuf {
        self.user_directory(obfuscated)
            .join(format!("{KEY_FILE_PREFIX}{index}.{LEGACY_SALT_SUFFIX}"))
    }

    fn cache_dir(&self, obfuscated: &str) -> PathBuf {
        self.vault_path(obfuscated)
            .join(USER_DIR)
            .join(&self.settings.cache_subdir)
    }

    fn temp_cache_dir(&self, obfuscated: &str) -> PathBuf {
        self.vault_path(obfuscated)
            .join(USER_DIR)
            .join(&self.settings.temp_cache_subdir)
    }

    pub fn exists(&self, obfuscated: &str) -> bool {
        self.user_directory(obfuscated).is_dir()
    }

    /// Whether the vault of `obfuscated` is mounted right now.
    pub fn is_mounted(&self, obfuscated: &str) -> bool {
        self.platform
            .is_directory_mounted(&self.mount_path(obfuscated))
    }

    /// Every identity directory under the shadow root.
    pub fn identities(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(self.shadow_root()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut identities: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| is_obfuscated_username(name))
            .collect();
        identities.sort();
        Ok(identities)
    }

    fn unmounted_identities(&self) -> Result<Vec<String>> {
        Ok(self
            .identities()?
            .into_iter()
            .filter(|obfuscated| !self.is_mounted(obfuscated))
            .collect())
    }

    // ------------------------------------------------------------------
    // Key slots
    // ------------------------------------------------------------------

    /// Slot indices present for `obfuscated`, sorted numerically.
    pub fn get_vault_keysets(&self, obfuscated: &str) -> Result<Vec<usize>> {
        let mut indices: Vec<usize> = fs::read_dir(self.user_directory(obfuscated))?
            .flatten()
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter_map(|name| {
                let suffix = name.strip_prefix(KEY_FILE_PREFIX)?;
                let index: usize = suffix.parse().ok()?;
                // Rejects `key.01`, `key.+1` and friends.
                (index.to_string() == suffix && index < MAX_KEYSETS).then_some(index)
            })
            .collect();
        indices.sort_unstable();
        Ok(indices)
    }

    /// Load slot `index`, filling an empty embedded salt from the legacy
    /// `key.<n>.salt` file.
    pub fn load_vault_keyset(&self, obfuscated: &str, index: usize) -> Result<Vault> {
        let mut vault = Vault::load(&self.keyset_path(obfuscated, index))?;
        vault.set_slot(index);
        if let Some(container) = vault.container_mut() {
            if container.salt.is_empty() {
                let legacy = self.legacy_salt_path(obfuscated, index);
                match fs::read(&legacy) {
                    Ok(salt) => container.salt = salt,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(vault)
    }

    /// Try every slot in ascending order until one unwraps.
    ///
    /// Hardware conditions stop the scan at once. Otherwise the error of
    /// the last slot tried is returned.
    pub fn get_valid_keyset(
        &self,
        creds: &Credentials,
    ) -> std::result::Result<ValidKeyset, MountError> {
        let obfuscated = self.obfuscate(creds.username());
        let indices = self.get_vault_keysets(&obfuscated).map_err(|e| {
            error!(user = %obfuscated, error = %e, "cannot enumerate keysets");
            MountError::Fatal
        })?;
        if indices.is_empty() {
            error!(user = %obfuscated, "identity has no keysets");
            return Err(MountError::Fatal);
        }

        let mut last_error = None;
        for index in indices {
            let mut vault = match self.load_vault_keyset(&obfuscated, index) {
                Ok(vault) => vault,
                Err(e) => {
                    warn!(user = %obfuscated, slot = index, error = %e, "unreadable keyset");
                    last_error = Some(MountError::Fatal);
                    continue;
                }
            };

            if let Some(wanted) = creds.key_label() {
                let label = vault.container().map(|c| slot_label(c, index));
                if label.as_deref() != Some(wanted) {
                    continue;
                }
            }

            match vault.decrypt(self.engine.as_ref(), creds.passkey()) {
                Ok((flags, status)) => {
                    debug!(user = %obfuscated, slot = index, "keyset unwrapped");
                    return Ok(ValidKeyset {
                        vault,
                        index,
                        flags,
                        status,
                    });
                }
                Err(e) => {
                    let kind = MountError::from(e);
                    if kind.is_hardware_condition() {
                        warn!(user = %obfuscated, slot = index, error = %kind, "aborting keyset scan");
                        return Err(kind);
                    }
                    last_error = Some(kind);
                }
            }
        }

        Err(last_error.unwrap_or(MountError::KeyFailure))
    }

    pub fn are_credentials_valid(&self, creds: &Credentials) -> bool {
        self.get_valid_keyset(creds).is_ok()
    }

    /// Whether a keyset unwrapped with `flags`/`status` must be re-wrapped
    /// with the method the device currently prefers.
    pub fn should_rewrap(&self, flags: WrapFlags, status: UnwrapStatus) -> bool {
        if status == UnwrapStatus::MissingPublicKeyHash {
            return true;
        }
        let hardware_desired = self.settings.use_hardware
            && self.engine.is_hardware_available()
            && self.engine.is_hardware_enabled();
        if hardware_desired {
            !flags.contains(WrapFlags::HARDWARE)
        } else {
            !flags.is_software_only()
        }
    }

    /// Re-wrap the keys held by `vault` and persist them over its slot.
    ///
    /// The slot file and its legacy salt are copied aside first and only
    /// released once the new container is on disk; any failure puts the
    /// copies back.
    pub fn resave_keyset(&self, obfuscated: &str, vault: &mut Vault, passkey: &[u8]) -> Result<()> {
        let index = vault
            .slot()
            .ok_or_else(|| HomeVaultError::WrapFailed("keyset has no slot index".into()))?;
        let key_path = self.keyset_path(obfuscated, index);
        let salt_path = self.legacy_salt_path(obfuscated, index);
        let files = [key_path.clone(), salt_path.clone()];

        format::cache_old_files(&files)?;

        let outcome = vault
            .encrypt(self.engine.as_ref(), passkey, &generate_salt())
            .and_then(|()| vault.save(&key_path));

        match outcome {
            Ok(()) => {
                if salt_path.exists() {
                    if let Err(e) = fs::remove_file(&salt_path) {
                        warn!(path = %salt_path.display(), error = %e, "cannot remove legacy salt");
                    }
                }
                if let Err(e) = format::delete_cache_files(&files) {
                    warn!(user = %obfuscated, slot = index, error = %e, "stale keyset backups left behind");
                }
                info!(user = %obfuscated, slot = index, "keyset re-wrapped");
                Ok(())
            }
            Err(e) => {
                error!(user = %obfuscated, slot = index, error = %e, "re-wrap failed, restoring backup");
                if let Err(revert) = format::revert_cache_files(&files) {
                    error!(user = %obfuscated, slot = index, error = %revert, "cannot restore keyset backup");
                }
                Err(e)
            }
        }
    }

    /// Atomically claim the lowest free slot index.
    fn claim_free_slot(&self, obfuscated: &str) -> Result<(usize, fs::File)> {
        for index in 0..MAX_KEYSETS {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.keyset_path(obfuscated, index))
            {
                Ok(file) => return Ok((index, file)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(HomeVaultError::KeysetSlotsExhausted(obfuscated.to_string()))
    }

    fn write_new_slot(
        &self,
        file: &mut fs::File,
        vault: &mut Vault,
        passkey: &[u8],
        label: Option<&str>,
    ) -> Result<()> {
        vault.encrypt(self.engine.as_ref(), passkey, &generate_salt())?;
        let container = vault
            .container_mut()
            .ok_or_else(|| HomeVaultError::WrapFailed("no container after wrap".into()))?;
        container.label = label.map(str::to_owned);
        format::write_container_to(file, container)
    }

    /// Wrap the vault keys of `creds` under `new_passkey` into the lowest
    /// free slot. Returns the new slot index.
    pub fn add_keyset(
        &self,
        creds: &Credentials,
        new_passkey: &[u8],
        label: Option<&str>,
    ) -> Result<usize> {
        let obfuscated = self.obfuscate(creds.username());
        let valid = self
            .get_valid_keyset(creds)
            .map_err(HomeVaultError::AuthorizationFailed)?;

        if let Some(label) = label {
            for index in self.get_vault_keysets(&obfuscated)? {
                if let Ok(container) = format::read_container(&self.keyset_path(&obfuscated, index)) {
                    if slot_label(&container, index) == label {
                        return Err(HomeVaultError::KeysetLabelExists(label.to_string()));
                    }
                }
            }
        }

        let keys = valid
            .vault
            .keys()
            .cloned()
            .ok_or_else(|| HomeVaultError::WrapFailed("no key material after unwrap".into()))?;
        let mut vault = Vault::from_keys(keys);

        let (index, mut file) = self.claim_free_slot(&obfuscated)?;
        let path = self.keyset_path(&obfuscated, index);
        if let Err(e) = self.write_new_slot(&mut file, &mut vault, new_passkey, label) {
            drop(file);
            if let Err(rm) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %rm, "cannot remove half-written keyset");
            }
            return Err(e);
        }

        info!(user = %obfuscated, slot = index, "keyset added");
        Ok(index)
    }

    /// Remove the slot labelled `label` after authorizing with `creds`.
    pub fn remove_keyset(&self, creds: &Credentials, label: &str) -> Result<()> {
        let obfuscated = self.obfuscate(creds.username());
        self.get_valid_keyset(creds)
            .map_err(HomeVaultError::AuthorizationFailed)?;

        let indices = self.get_vault_keysets(&obfuscated)?;
        let target = indices
            .iter()
            .copied()
            .find(|index| {
                format::read_container(&self.keyset_path(&obfuscated, *index))
                    .map(|c| slot_label(&c, *index) == label)
                    .unwrap_or(false)
            })
            .ok_or_else(|| HomeVaultError::KeysetLabelNotFound(label.to_string()))?;

        if indices.len() <= 1 {
            return Err(HomeVaultError::LastKeyset(obfuscated));
        }

        self.force_remove_keyset(&obfuscated, target)?;
        info!(user = %obfuscated, slot = target, label, "keyset removed");
        Ok(())
    }

    /// Labels of every readable slot of `obfuscated`, in slot order.
    pub fn list_keyset_labels(&self, obfuscated: &str) -> Result<Vec<String>> {
        if !self.exists(obfuscated) {
            return Err(HomeVaultError::Mount(MountError::UserDoesNotExist));
        }
        let mut labels = Vec::new();
        for index in self.get_vault_keysets(obfuscated)? {
            match format::read_container(&self.keyset_path(obfuscated, index)) {
                Ok(container) => labels.push(slot_label(&container, index)),
                Err(e) => warn!(user = %obfuscated, slot = index, error = %e, "unreadable keyset"),
            }
        }
        Ok(labels)
    }

    /// Delete slot `index` with its legacy salt and backup, no questions asked.
    pub fn force_remove_keyset(&self, obfuscated: &str, index: usize) -> Result<()> {
        if index >= MAX_KEYSETS {
            return Err(HomeVaultError::KeysetNotFound(self.keyset_path(obfuscated, index)));
        }
        let path = self.keyset_path(obfuscated, index);
        for file in [
            format::backup_path(&path),
            self.legacy_salt_path(obfuscated, index),
            path,
        ] {
            match fs::remove_file(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Move slot `src` to the free index `dst`.
    pub fn move_keyset(&self, obfuscated: &str, src: usize, dst: usize) -> Result<()> {
        let src_path = self.keyset_path(obfuscated, src);
        let dst_path = self.keyset_path(obfuscated, dst);
        if src >= MAX_KEYSETS || dst >= MAX_KEYSETS || !src_path.exists() {
            return Err(HomeVaultError::KeysetNotFound(src_path));
        }

        // Claim the destination so nobody else can.
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&dst_path)?;
        if let Err(e) = fs::rename(&src_path, &dst_path) {
            if let Err(rm) = fs::remove_file(&dst_path) {
                warn!(path = %dst_path.display(), error = %rm, "cannot release claimed keyset slot");
            }
            return Err(e.into());
        }

        let src_salt = self.legacy_salt_path(obfuscated, src);
        if src_salt.exists() {
            fs::rename(&src_salt, self.legacy_salt_path(obfuscated, dst))?;
        }
        debug!(user = %obfuscated, src, dst, "keyset moved");
        Ok(())
    }

    /// Replace every key of an identity by a single slot wrapped under the
    /// new passkey, kept at the index the old passkey unlocked.
    ///
    /// Mounts with the old passkey first unless `mount` already holds this
    /// identity, in which case its session switches to the new credentials.
    pub fn migrate(
        &self,
        mount: &mut MountEngine,
        new_creds: &Credentials,
        old_passkey: &[u8],
    ) -> Result<()> {
        let old_creds = new_creds.with_passkey(old_passkey);
        let obfuscated = self.obfuscate(new_creds.username());

        let was_mounted = mount.is_mounted_for(&obfuscated);
        if !was_mounted {
            // Authorize against the keysets on disk. A mount alone could
            // rebuild an unreadable vault under any passkey.
            if !self.exists(&obfuscated) {
                return Err(HomeVaultError::AuthorizationFailed(MountError::UserDoesNotExist));
            }
            self.get_valid_keyset(&old_creds)
                .map_err(HomeVaultError::AuthorizationFailed)?;

            let outcome = mount
                .mount_cryptohome(&old_creds, &MountArgs::default())
                .map_err(HomeVaultError::AuthorizationFailed)?;
            if outcome == MountOutcome::Recreated {
                error!(user = %obfuscated, "vault was recreated while mounting for migration");
                if !mount.unmount_cryptohome() {
                    warn!(user = %obfuscated, "unmount after recreation was not clean");
                }
                return Err(HomeVaultError::Mount(MountError::Recreated));
            }
        }

        let result = self.migrate_mounted(mount, &obfuscated, new_creds, &old_creds);

        if !was_mounted && !mount.unmount_cryptohome() {
            warn!(user = %obfuscated, "unmount after migration was not clean");
        }
        result
    }

    fn migrate_mounted(
        &self,
        mount: &mut MountEngine,
        obfuscated: &str,
        new_creds: &Credentials,
        old_creds: &Credentials,
    ) -> Result<()> {
        let old_index = mount
            .current_key_index()
            .ok_or_else(|| HomeVaultError::NotMounted(obfuscated.to_string()))?;
        let old_label = format::read_container(&self.keyset_path(obfuscated, old_index))
            .ok()
            .and_then(|c| c.label);

        let new_index = self.add_keyset(old_creds, new_creds.passkey(), None)?;
        self.force_remove_keyset(obfuscated, old_index)?;

        let final_index = match self.move_keyset(obfuscated, new_index, old_index) {
            Ok(()) => old_index,
            Err(e) => {
                warn!(user = %obfuscated, slot = new_index, error = %e, "new keyset stays at its own index");
                new_index
            }
        };

        if let Some(label) = old_label {
            let path = self.keyset_path(obfuscated, final_index);
            let mut container = format::read_container(&path)?;
            container.label = Some(label);
            format::write_container(&path, &container)?;
        }

        for index in self.get_vault_keysets(obfuscated)? {
            if index != final_index {
                if let Err(e) = self.force_remove_keyset(obfuscated, index) {
                    warn!(user = %obfuscated, slot = index, error = %e, "cannot remove old keyset");
                }
            }
        }

        mount.set_user_credentials(new_creds, final_index)?;
        info!(user = %obfuscated, slot = final_index, "keys migrated");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Removal and policy
    // ------------------------------------------------------------------

    /// Delete an identity and its public home directories.
    pub fn remove(&self, obfuscated: &str) -> Result<()> {
        let dir = self.user_directory(obfuscated);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        for public in [
            self.settings.user_home(obfuscated),
            self.settings.root_home(obfuscated),
        ] {
            if public.exists() && !self.platform.is_directory_mounted(&public) {
                if let Err(e) = fs::remove_dir_all(&public) {
                    warn!(path = %public.display(), error = %e, "cannot remove public home");
                }
            }
        }

        let mut cache = self.activity.lock();
        if cache.initialized() {
            cache.remove_user(&dir);
        }
        info!(user = %obfuscated, "identity removed");
        Ok(())
    }

    /// Reload and return the device policy. A failed reload keeps the
    /// previous snapshot.
    pub fn policy_snapshot(&self) -> PolicySnapshot {
        if let Err(e) = self.policy.reload() {
            warn!(error = %e, "device policy reload failed");
        }
        self.policy.snapshot()
    }

    fn owner_of(&self, snapshot: &PolicySnapshot) -> Option<String> {
        snapshot.owner.as_deref().map(|owner| self.obfuscate(owner))
    }

    /// Obfuscated name of the device owner, if known.
    pub fn owner(&self) -> Option<String> {
        self.owner_of(&self.policy_snapshot())
    }

    pub fn is_owner(&self, obfuscated: &str) -> bool {
        self.owner().as_deref() == Some(obfuscated)
    }

    pub fn are_ephemeral_users_enabled(&self) -> bool {
        self.policy_snapshot().ephemeral_users_enabled
    }

    /// Delete every identity except the owner's and mounted ones.
    ///
    /// Does nothing on a consumer device whose owner is not known yet.
    pub fn remove_non_owner_cryptohomes(&self) -> Result<()> {
        let snapshot = self.policy_snapshot();
        let owner = self.owner_of(&snapshot);
        if owner.is_none() && !snapshot.enterprise_owned {
            debug!("no owner known, keeping every identity");
            return Ok(());
        }

        for obfuscated in self.identities()? {
            if owner.as_deref() == Some(obfuscated.as_str()) || self.is_mounted(&obfuscated) {
                continue;
            }
            if let Err(e) = self.remove(&obfuscated) {
                warn!(user = %obfuscated, error = %e, "cannot remove non-owner identity");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Disk space
    // ------------------------------------------------------------------

    pub fn free_space(&self) -> Result<u64> {
        self.platform.free_disk_space(self.shadow_root())
    }

    fn has_enough_space(&self) -> bool {
        match self.free_space() {
            Ok(free) => free >= self.settings.min_free_space_bytes,
            Err(e) => {
                warn!(error = %e, "cannot query free disk space");
                false
            }
        }
    }

    /// Reclaim disk space in stages, stopping once enough is free.
    ///
    /// Returns whether the free-space threshold was reached.
    pub fn free_disk_space(&self) -> Result<bool> {
        let snapshot = self.policy_snapshot();
        if snapshot.ephemeral_users_enabled {
            self.remove_non_owner_cryptohomes()?;
            return Ok(self.has_enough_space());
        }

        if self.has_enough_space() {
            return Ok(true);
        }

        let unmounted = self.unmounted_identities()?;

        for obfuscated in &unmounted {
            delete_directory_contents(&self.cache_dir(obfuscated));
        }
        if self.has_enough_space() {
            info!("freed enough space by clearing caches");
            return Ok(true);
        }

        for obfuscated in &unmounted {
            delete_directory_contents(&self.temp_cache_dir(obfuscated));
        }
        if self.has_enough_space() {
            info!("freed enough space by clearing temporary caches");
            return Ok(true);
        }

        self.ensure_activity_cache(&unmounted);

        let owner = self.owner_of(&snapshot);
        while !self.has_enough_space() {
            let next = self.activity.lock().remove_oldest_user();
            let Some(dir) = next else {
                break;
            };
            let Some(obfuscated) = dir.file_name().and_then(|n| n.to_str()).map(str::to_owned)
            else {
                continue;
            };
            if !snapshot.enterprise_owned && owner.as_deref() == Some(obfuscated.as_str()) {
                debug!(user = %obfuscated, "not evicting the owner");
                continue;
            }
            if self.is_mounted(&obfuscated) {
                debug!(user = %obfuscated, "not evicting a mounted identity");
                continue;
            }
            warn!(user = %obfuscated, "evicting least recently used identity");
            if let Err(e) = self.remove(&obfuscated) {
                error!(user = %obfuscated, error = %e, "eviction failed");
            }
        }

        Ok(self.has_enough_space())
    }

    fn ensure_activity_cache(&self, unmounted: &[String]) {
        let mut cache = self.activity.lock();
        if cache.initialized() {
            return;
        }
        cache.initialize();
        for obfuscated in unmounted {
            let dir = self.user_directory(obfuscated);
            match self.newest_timestamp(obfuscated) {
                Some(timestamp) => cache.add_existing_user(dir, timestamp),
                None => cache.add_existing_user_notime(dir),
            }
        }
        debug!(entries = cache.len(), "activity cache built");
    }

    /// Most recent activity timestamp across all slots of `obfuscated`.
    pub fn newest_timestamp(&self, obfuscated: &str) -> Option<i64> {
        self.get_vault_keysets(obfuscated)
            .ok()?
            .into_iter()
            .filter_map(|index| {
                format::read_container(&self.keyset_path(obfuscated, index))
                    .ok()?
                    .last_activity_timestamp
            })
            .max()
    }

    /// Tell the activity cache (once built) that `obfuscated` was active.
    pub fn update_activity(&self, obfuscated: &str, timestamp: i64) {
        let mut cache = self.activity.lock();
        if cache.initialized() {
            cache.update_existing_user(self.user_directory(obfuscated), timestamp);
        }
    }
}

/// Remove everything inside `dir` but keep `dir` itself.
fn delete_directory_contents(dir: &Path) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return,
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "cannot list directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let removed = match entry.file_type() {
            Ok(kind) if kind.is_dir() => fs::remove_dir_all(&path),
            _ => fs::remove_file(&path),
        };
        if let Err(e) = removed {
            warn!(path = %path.display(), error = %e, "cannot delete");
        }
    }
}
