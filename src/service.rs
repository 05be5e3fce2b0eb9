//! The operation surface offered to the transport layer.
//!
//! Every operation is one work item on the serialized vault worker, so
//! filesystem changes for different users never interleave.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::config::Settings;
use crate::credentials::Credentials;
use crate::crypto::wrap::WrapEngine;
use crate::errors::{HomeVaultError, MountError, Result};
use crate::homedirs::VaultCollection;
use crate::mount::{MountArgs, MountEngine, MountOutcome, MountStatus};
use crate::platform::Platform;
use crate::policy::DevicePolicy;
use crate::worker::Worker;

/// State owned by the vault worker thread.
pub struct VaultCore {
    pub mount: MountEngine,
    pub homedirs: VaultCollection,
}

impl VaultCore {
    /// Mount, retrying once on a transient hardware communication failure.
    pub fn mount_with_retry(
        &mut self,
        creds: &Credentials,
        args: &MountArgs,
    ) -> std::result::Result<MountOutcome, MountError> {
        match self.mount.mount_cryptohome(creds, args) {
            Err(MountError::HardwareCommFailure) => {
                warn!(user = creds.username(), "hardware communication failed, retrying mount");
                self.mount.mount_cryptohome(creds, args)
            }
            other => other,
        }
    }
}

/// Success flag plus error kind, as handed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MountReply {
    pub success: bool,
    pub error: MountError,
}

impl MountReply {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: MountError::None,
        }
    }

    pub fn failed(error: MountError) -> Self {
        Self {
            success: false,
            error,
        }
    }
}

impl From<std::result::Result<MountOutcome, MountError>> for MountReply {
    fn from(result: std::result::Result<MountOutcome, MountError>) -> Self {
        match result {
            Ok(outcome) => Self {
                success: true,
                error: outcome.error(),
            },
            Err(error) => Self::failed(error),
        }
    }
}

impl From<std::result::Result<(), MountError>> for MountReply {
    fn from(result: std::result::Result<(), MountError>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(error) => Self::failed(error),
        }
    }
}

/// Everything `GetStatus` reports.
#[derive(Debug, Clone, Serialize)]
pub struct VaultStatus {
    pub mount: MountStatus,
    pub hardware_available: bool,
    pub hardware_enabled: bool,
    pub free_disk_space: Option<u64>,
    pub has_owner: bool,
    pub ephemeral_users_enabled: bool,
    pub identities: usize,
}

pub struct VaultService {
    worker: Worker<VaultCore>,
}

impl VaultService {
    pub fn new(
        settings: Settings,
        platform: Arc<dyn Platform>,
        engine: Arc<dyn WrapEngine>,
        policy: Arc<dyn DevicePolicy>,
    ) -> Result<Self> {
        let homedirs = VaultCollection::new(Arc::new(settings), platform, engine, policy)?;
        let core = VaultCore {
            mount: MountEngine::new(homedirs.clone()),
            homedirs,
        };
        Ok(Self {
            worker: Worker::spawn("homevault-worker", core)?,
        })
    }

    /// Build a service on the real platform, the software wrapping engine
    /// and the policy file named in `settings`.
    #[cfg(target_os = "linux")]
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let platform = Arc::new(crate::platform::LinuxPlatform::new());
        let engine = Arc::new(crate::crypto::SoftwareWrapEngine::new(settings.argon2_params()));
        let policy = Arc::new(crate::policy::FilePolicy::new(&settings.policy_file));
        Self::new(settings, platform, engine, policy)
    }

    /// Queue arbitrary work on the vault worker.
    pub fn submit<R, F>(&self, work: F) -> Result<oneshot::Receiver<R>>
    where
        F: FnOnce(&mut VaultCore) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.worker.submit(work)
    }

    pub fn mount_ex(&self, creds: Credentials, args: MountArgs) -> Result<MountReply> {
        self.worker
            .run(move |core| MountReply::from(core.mount_with_retry(&creds, &args)))
    }

    pub fn unmount_ex(&self) -> Result<bool> {
        self.worker.run(|core| core.mount.unmount_cryptohome())
    }

    pub fn is_mounted(&self) -> Result<bool> {
        self.worker.run(|core| core.mount.is_mounted())
    }

    /// Check `creds`, against the live session when it belongs to the
    /// same user, otherwise against the on-disk keysets.
    pub fn check_key_ex(&self, creds: Credentials) -> Result<MountReply> {
        self.worker.run(move |core| {
            let obfuscated = core.homedirs.obfuscate(creds.username());
            if core.mount.is_mounted_for(&obfuscated) && core.mount.check_key(&creds) {
                return MountReply::ok();
            }
            if !core.homedirs.exists(&obfuscated) {
                return MountReply::failed(MountError::UserDoesNotExist);
            }
            MountReply::from(core.homedirs.get_valid_keyset(&creds).map(|_| ()))
        })
    }

    /// Add a slot for `new_passkey`; returns its index.
    pub fn add_key_ex(
        &self,
        creds: Credentials,
        new_passkey: Vec<u8>,
        label: Option<String>,
    ) -> Result<usize> {
        let new_passkey = zeroize::Zeroizing::new(new_passkey);
        self.worker.run(move |core| {
            core.homedirs
                .add_keyset(&creds, &new_passkey, label.as_deref())
        })?
    }

    pub fn remove_key_ex(&self, creds: Credentials, label: String) -> Result<()> {
        self.worker
            .run(move |core| core.homedirs.remove_keyset(&creds, &label))?
    }

    pub fn list_keys_ex(&self, username: String) -> Result<Vec<String>> {
        self.worker.run(move |core| {
            let obfuscated = core.homedirs.obfuscate(&username);
            core.homedirs.list_keyset_labels(&obfuscated)
        })?
    }

    /// Replace every key of `new_creds`' identity by one wrapped under its
    /// passkey, authorized by `old_passkey`.
    pub fn migrate_key_ex(&self, new_creds: Credentials, old_passkey: Vec<u8>) -> Result<()> {
        let old_passkey = zeroize::Zeroizing::new(old_passkey);
        self.worker.run(move |core| {
            let VaultCore { mount, homedirs } = core;
            homedirs.migrate(mount, &new_creds, &old_passkey)
        })?
    }

    pub fn get_status(&self) -> Result<VaultStatus> {
        self.worker.run(|core| {
            let snapshot = core.homedirs.policy_snapshot();
            let engine = core.homedirs.engine();
            VaultStatus {
                mount: core.mount.status(),
                hardware_available: engine.is_hardware_available(),
                hardware_enabled: engine.is_hardware_enabled(),
                free_disk_space: core.homedirs.free_space().ok(),
                has_owner: snapshot.owner.is_some(),
                ephemeral_users_enabled: snapshot.ephemeral_users_enabled,
                identities: core.homedirs.identities().map(|ids| ids.len()).unwrap_or(0),
            }
        })
    }

    pub fn free_disk_space(&self) -> Result<bool> {
        self.worker.run(|core| {
            let enough = core.homedirs.free_disk_space()?;
            info!(enough, "disk space reclamation finished");
            Ok::<bool, HomeVaultError>(enough)
        })?
    }

    pub fn update_current_user_activity_timestamp(&self, shift_secs: i64) -> Result<bool> {
        self.worker
            .run(move |core| core.mount.update_current_user_activity_timestamp(shift_secs))
    }
}
