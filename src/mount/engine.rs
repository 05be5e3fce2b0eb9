//! The mount state machine.
//!
//! One `MountEngine` serves a single session at a time:
//!
//! ```text
//! Idle -> Mounting -> Mounted -> Unmounting -> Idle
//!            |   ^
//!            v   |   (at most once per request)
//!       RecreatingVault
//! ```
//!
//! A failed mount always returns the engine to `Idle`.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::credentials::{Credentials, GUEST_USERNAME};
use crate::crypto::kdf::generate_salt;
use crate::errors::{HomeVaultError, MountError, Result};
use crate::homedirs::{VaultCollection, MOUNT_DIR, VAULT_DIR};
use crate::session::ReauthSession;
use crate::vault::format;
use crate::vault::Vault;

use super::helper::MountHelper;
use super::stack::MountStack;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MountState {
    Idle,
    Mounting,
    RecreatingVault,
    Mounted,
    Unmounting,
}

/// Readiness of the user's token store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Pkcs11State {
    Uninitialized,
    WaitingOnHardware,
    Initializing,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MountArgs {
    /// Create the vault when the identity has none.
    pub create_if_missing: bool,
    /// Demand a throw-away tmpfs home.
    pub ensure_ephemeral: bool,
}

/// How a successful mount came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOutcome {
    Mounted,
    /// Mounted on a vault rebuilt from scratch; the old data is gone.
    Recreated,
}

impl MountOutcome {
    pub fn error(self) -> MountError {
        match self {
            Self::Mounted => MountError::None,
            Self::Recreated => MountError::Recreated,
        }
    }
}

/// Where a mount attempt failed.
enum Failure {
    /// Finding or unwrapping a keyset; a `Fatal` here may recreate the vault.
    Unlock(MountError),
    /// The filesystem sequence; never recreates.
    Setup(MountError),
}

#[derive(Debug)]
struct MountSession {
    username: String,
    obfuscated_username: String,
    current_slot: Option<usize>,
    ephemeral: bool,
    stack: MountStack,
    reauth: Option<ReauthSession>,
}

/// Serializable view of the engine.
#[derive(Debug, Clone, Serialize)]
pub struct MountStatus {
    pub state: MountState,
    pub username: Option<String>,
    pub obfuscated_username: Option<String>,
    pub ephemeral: bool,
    /// Active slot, or -1.
    pub current_key_index: i64,
    pub pkcs11_state: Pkcs11State,
    pub mount_points: Vec<PathBuf>,
}

pub struct MountEngine {
    homedirs: VaultCollection,
    helper: MountHelper,
    state: MountState,
    pkcs11_state: Pkcs11State,
    session: Option<MountSession>,
}

impl MountEngine {
    pub fn new(homedirs: VaultCollection) -> Self {
        let helper = MountHelper::new(
            Arc::new(homedirs.settings().clone()),
            Arc::clone(homedirs.platform()),
        );
        Self {
            homedirs,
            helper,
            state: MountState::Idle,
            pkcs11_state: Pkcs11State::Uninitialized,
            session: None,
        }
    }

    pub fn state(&self) -> MountState {
        self.state
    }

    pub fn is_mounted(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_mounted_for(&self, obfuscated: &str) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.obfuscated_username == obfuscated)
    }

    pub fn is_ephemeral(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.ephemeral)
    }

    pub fn current_key_index(&self) -> Option<usize> {
        self.session.as_ref().and_then(|s| s.current_slot)
    }

    pub fn pkcs11_state(&self) -> Pkcs11State {
        self.pkcs11_state
    }

    pub fn set_pkcs11_state(&mut self, state: Pkcs11State) {
        self.pkcs11_state = state;
    }

    // ------------------------------------------------------------------
    // Mount
    // ------------------------------------------------------------------

    /// Unlock and mount the home of `creds`.
    pub fn mount_cryptohome(
        &mut self,
        creds: &Credentials,
        args: &MountArgs,
    ) -> std::result::Result<MountOutcome, MountError> {
        if self.session.is_some() || self.state != MountState::Idle {
            warn!(user = creds.username(), "mount requested while mounted");
            return Err(MountError::MountPointBusy);
        }

        if creds.is_guest() {
            let obfuscated = self.homedirs.obfuscate(GUEST_USERNAME);
            return self.mount_ephemeral(creds, &obfuscated);
        }

        let snapshot = self.homedirs.policy_snapshot();
        let obfuscated = self.homedirs.obfuscate(creds.username());
        let is_owner = snapshot
            .owner
            .as_deref()
            .is_some_and(|owner| self.homedirs.obfuscate(owner) == obfuscated);

        if args.ensure_ephemeral && is_owner {
            error!(user = %obfuscated, "ephemeral mount requested for the owner");
            return Err(MountError::Fatal);
        }
        if args.ensure_ephemeral || (snapshot.ephemeral_users_enabled && !is_owner) {
            if !args.create_if_missing {
                return Err(MountError::UserDoesNotExist);
            }
            return self.mount_ephemeral(creds, &obfuscated);
        }

        let mut args = *args;
        let mut phase = MountState::Mounting;
        loop {
            self.state = phase;
            match self.mount_persistent(creds, &obfuscated, &args) {
                Ok(()) => {
                    self.state = MountState::Mounted;
                    return Ok(if phase == MountState::RecreatingVault {
                        MountOutcome::Recreated
                    } else {
                        MountOutcome::Mounted
                    });
                }
                Err(Failure::Unlock(MountError::Fatal)) if phase == MountState::Mounting => {
                    warn!(user = %obfuscated, "keysets unusable, recreating vault");
                    if let Err(e) = self.homedirs.remove(&obfuscated) {
                        error!(user = %obfuscated, error = %e, "cannot remove broken vault");
                        self.state = MountState::Idle;
                        return Err(MountError::Fatal);
                    }
                    args.create_if_missing = true;
                    phase = MountState::RecreatingVault;
                }
                Err(Failure::Unlock(e)) | Err(Failure::Setup(e)) => {
                    self.state = MountState::Idle;
                    return Err(e);
                }
            }
        }
    }

    fn mount_persistent(
        &mut self,
        creds: &Credentials,
        obfuscated: &str,
        args: &MountArgs,
    ) -> std::result::Result<(), Failure> {
        if !self.homedirs.exists(obfuscated) {
            if !args.create_if_missing {
                return Err(Failure::Unlock(MountError::UserDoesNotExist));
            }
            self.create_cryptohome(creds, obfuscated).map_err(|e| {
                error!(user = %obfuscated, error = %e, "cannot create vault");
                Failure::Unlock(MountError::Fatal)
            })?;
        }

        let mut valid = self
            .homedirs
            .get_valid_keyset(creds)
            .map_err(Failure::Unlock)?;

        if self.homedirs.should_rewrap(valid.flags, valid.status) {
            if let Err(e) = self
                .homedirs
                .resave_keyset(obfuscated, &mut valid.vault, creds.passkey())
            {
                warn!(user = %obfuscated, slot = valid.index, error = %e, "keeping keyset with its old wrapping");
            }
        }

        let mut stack = MountStack::new();
        let mounted = match valid.vault.keys() {
            Some(keys) => self.helper.perform_mount(obfuscated, keys, &mut stack),
            None => Err(HomeVaultError::DecryptionFailed),
        };
        valid.vault.wipe();

        if let Err(e) = mounted {
            error!(user = %obfuscated, error = %e, "mount sequence failed, unwinding");
            self.helper.unmount_all(&mut stack);
            self.clear_keyring();
            return Err(Failure::Setup(MountError::Fatal));
        }

        self.start_session(creds, obfuscated, Some(valid.index), false, stack);
        self.update_current_user_activity_timestamp(0);
        info!(user = %obfuscated, slot = valid.index, "mounted");
        Ok(())
    }

    fn mount_ephemeral(
        &mut self,
        creds: &Credentials,
        obfuscated: &str,
    ) -> std::result::Result<MountOutcome, MountError> {
        self.state = MountState::Mounting;
        let mut stack = MountStack::new();
        if let Err(e) = self.helper.perform_ephemeral_mount(obfuscated, &mut stack) {
            error!(user = %obfuscated, error = %e, "ephemeral mount failed, unwinding");
            self.helper.unmount_all(&mut stack);
            self.helper.remove_ephemeral_path(obfuscated);
            self.state = MountState::Idle;
            return Err(MountError::Fatal);
        }

        self.start_session(creds, obfuscated, None, true, stack);
        self.state = MountState::Mounted;
        info!(user = %obfuscated, "mounted ephemeral home");
        Ok(MountOutcome::Mounted)
    }

    fn start_session(
        &mut self,
        creds: &Credentials,
        obfuscated: &str,
        slot: Option<usize>,
        ephemeral: bool,
        stack: MountStack,
    ) {
        let reauth = match ReauthSession::start(obfuscated, creds.passkey()) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(user = %obfuscated, error = %e, "no re-authentication session");
                None
            }
        };
        self.pkcs11_state = Pkcs11State::Uninitialized;
        self.session = Some(MountSession {
            username: creds.username().to_string(),
            obfuscated_username: obfuscated.to_string(),
            current_slot: slot,
            ephemeral,
            stack,
            reauth,
        });
    }

    /// Create a fresh vault with slot 0 wrapped under `creds`.
    fn create_cryptohome(&self, creds: &Credentials, obfuscated: &str) -> Result<()> {
        let dir = self.homedirs.user_directory(obfuscated);
        info!(user = %obfuscated, "creating vault");

        let created = (|| -> Result<()> {
            fs::create_dir_all(dir.join(VAULT_DIR))?;
            fs::create_dir_all(dir.join(MOUNT_DIR))?;
            let mut vault = Vault::create_random();
            vault.encrypt(self.homedirs.engine(), creds.passkey(), &generate_salt())?;
            if let (Some(label), Some(container)) = (creds.key_label(), vault.container_mut()) {
                container.label = Some(label.to_string());
            }
            vault.save(&self.homedirs.keyset_path(obfuscated, 0))
        })();

        if created.is_err() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                warn!(path = %dir.display(), error = %e, "cannot clean up half-created vault");
            }
        }
        created
    }

    // ------------------------------------------------------------------
    // Unmount
    // ------------------------------------------------------------------

    /// Tear down the current session. Returns whether every mount came off
    /// cleanly; the session is gone either way.
    pub fn unmount_cryptohome(&mut self) -> bool {
        let Some(mut session) = self.session.take() else {
            return false;
        };
        self.state = MountState::Unmounting;

        let clean = self.helper.unmount_all(&mut session.stack);
        if !session.ephemeral {
            self.clear_keyring();
        } else {
            self.helper
                .remove_ephemeral_path(&session.obfuscated_username);
        }

        if self.homedirs.are_ephemeral_users_enabled() {
            if let Err(e) = self.homedirs.remove_non_owner_cryptohomes() {
                warn!(error = %e, "cannot remove non-owner vaults");
            }
        } else if let (false, Some(slot)) = (session.ephemeral, session.current_slot) {
            self.touch_slot(&session.obfuscated_username, slot, 0);
        }

        self.pkcs11_state = Pkcs11State::Uninitialized;
        self.state = MountState::Idle;
        info!(user = %session.obfuscated_username, clean, "unmounted");
        clean
    }

    fn clear_keyring(&self) {
        if let Err(e) = self.homedirs.platform().clear_user_keyring() {
            warn!(error = %e, "cannot clear user keyring");
        }
    }

    // ------------------------------------------------------------------
    // Activity and credentials
    // ------------------------------------------------------------------

    /// Stamp the current slot with now minus `shift_secs`.
    ///
    /// Returns false when nothing persistent is mounted.
    pub fn update_current_user_activity_timestamp(&self, shift_secs: i64) -> bool {
        match self.session.as_ref() {
            Some(session) if !session.ephemeral => match session.current_slot {
                Some(slot) => self.touch_slot(&session.obfuscated_username, slot, shift_secs),
                None => false,
            },
            _ => false,
        }
    }

    fn touch_slot(&self, obfuscated: &str, slot: usize, shift_secs: i64) -> bool {
        let path = self.homedirs.keyset_path(obfuscated, slot);
        let mut container = match format::read_container(&path) {
            Ok(container) => container,
            Err(e) => {
                warn!(user = %obfuscated, slot, error = %e, "cannot load keyset for timestamp");
                return false;
            }
        };

        let now = Utc::now().timestamp();
        let timestamp = if shift_secs == 0 {
            container
                .last_activity_timestamp
                .map_or(now, |previous| previous.max(now))
        } else {
            now.saturating_sub(shift_secs)
        };
        container.last_activity_timestamp = Some(timestamp);

        if let Err(e) = format::write_container(&path, &container) {
            warn!(user = %obfuscated, slot, error = %e, "cannot persist activity timestamp");
            return false;
        }
        self.homedirs.update_activity(obfuscated, timestamp);
        true
    }

    /// Cheap check of `creds` against the live session.
    pub fn check_key(&self, creds: &Credentials) -> bool {
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        let obfuscated = self.homedirs.obfuscate(creds.username());
        session
            .reauth
            .as_ref()
            .is_some_and(|reauth| reauth.verify(&obfuscated, creds.passkey()))
    }

    /// Switch the live session to `creds`, now unlocked by `slot`.
    pub fn set_user_credentials(&mut self, creds: &Credentials, slot: usize) -> Result<()> {
        let obfuscated = self.homedirs.obfuscate(creds.username());
        let session = self
            .session
            .as_mut()
            .filter(|s| s.obfuscated_username == obfuscated)
            .ok_or_else(|| HomeVaultError::NotMounted(creds.username().to_string()))?;
        session.current_slot = Some(slot);
        session.reauth = Some(ReauthSession::start(&obfuscated, creds.passkey())?);
        Ok(())
    }

    pub fn status(&self) -> MountStatus {
        let session = self.session.as_ref();
        MountStatus {
            state: self.state,
            username: session.map(|s| s.username.clone()),
            obfuscated_username: session.map(|s| s.obfuscated_username.clone()),
            ephemeral: session.is_some_and(|s| s.ephemeral),
            current_key_index: session
                .and_then(|s| s.current_slot)
                .and_then(|slot| i64::try_from(slot).ok())
                .unwrap_or(-1),
            pkcs11_state: self.pkcs11_state,
            mount_points: session.map(|s| s.stack.targets()).unwrap_or_default(),
        }
    }
}

impl Drop for MountEngine {
    fn drop(&mut self) {
        if self.session.is_some() {
            self.unmount_cryptohome();
        }
    }
}
