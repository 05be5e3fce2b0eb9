//! Shared fixtures for the integration tests: an in-memory platform, a
//! scriptable wrapping engine and settings rooted in a temp dir.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use homevault::config::Settings;
use homevault::crypto::kdf::{Argon2Params, MIN_MEMORY_KIB};
use homevault::crypto::{SoftwareWrapEngine, UnwrapError, UnwrapStatus, Unwrapped, VaultKeys, WrapEngine};
use homevault::errors::{HomeVaultError, Result};
use homevault::homedirs::VaultCollection;
use homevault::platform::{FileStat, Platform, ProcessInfo};
use homevault::policy::{DevicePolicy, PolicySnapshot, StaticPolicy};
use homevault::service::VaultService;
use homevault::vault::{KeysetContainer, WrapFlags};
use parking_lot::Mutex;
use tempfile::TempDir;

pub const PASSWORD: &[u8] = b"correct horse";

// ---------------------------------------------------------------------------
// FakePlatform
// ---------------------------------------------------------------------------

type FreeSpaceFn = Box<dyn Fn(&Path) -> u64 + Send + Sync>;

/// Records every privileged call instead of performing it.
pub struct FakePlatform {
    pub mounts: Mutex<Vec<(PathBuf, PathBuf, String)>>,
    pub binds: Mutex<Vec<(PathBuf, PathBuf)>>,
    pub unmounts: Mutex<Vec<(PathBuf, bool)>>,
    pub keys_added: Mutex<Vec<String>>,
    pub keyring_clears: AtomicUsize,
    pub syncs: AtomicUsize,
    mounted: Mutex<BTreeSet<PathBuf>>,
    busy: Mutex<BTreeSet<PathBuf>>,
    owners: Mutex<HashMap<PathBuf, (u32, u32)>>,
    modes: Mutex<HashMap<PathBuf, u32>>,
    fail_mount: AtomicBool,
    free_space: Mutex<FreeSpaceFn>,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self {
            mounts: Mutex::default(),
            binds: Mutex::default(),
            unmounts: Mutex::default(),
            keys_added: Mutex::default(),
            keyring_clears: AtomicUsize::new(0),
            syncs: AtomicUsize::new(0),
            mounted: Mutex::default(),
            busy: Mutex::default(),
            owners: Mutex::default(),
            modes: Mutex::default(),
            fail_mount: AtomicBool::new(false),
            free_space: Mutex::new(Box::new(|_| u64::MAX)),
        }
    }
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pretend `path` is a mount point already.
    pub fn mark_mounted(&self, path: &Path) {
        self.mounted.lock().insert(path.to_path_buf());
    }

    /// Make a plain unmount of `path` fail, as if files were held open.
    pub fn mark_busy(&self, path: &Path) {
        self.busy.lock().insert(path.to_path_buf());
    }

    pub fn fail_mounts(&self, fail: bool) {
        self.fail_mount.store(fail, Ordering::SeqCst);
    }

    pub fn set_free_space<F>(&self, f: F)
    where
        F: Fn(&Path) -> u64 + Send + Sync + 'static,
    {
        *self.free_space.lock() = Box::new(f);
    }

    pub fn mounted_targets(&self) -> Vec<PathBuf> {
        self.mounted.lock().iter().cloned().collect()
    }

    pub fn bind_targets(&self) -> Vec<PathBuf> {
        self.binds.lock().iter().map(|(_, t)| t.clone()).collect()
    }
}

impl Platform for FakePlatform {
    fn mount(&self, source: &Path, target: &Path, fs_type: &str, _options: &str) -> Result<()> {
        if self.fail_mount.load(Ordering::SeqCst) {
            return Err(HomeVaultError::CommandFailed("mount refused".into()));
        }
        self.mounts
            .lock()
            .push((source.to_path_buf(), target.to_path_buf(), fs_type.to_string()));
        self.mounted.lock().insert(target.to_path_buf());
        Ok(())
    }

    fn bind(&self, source: &Path, target: &Path) -> Result<()> {
        self.binds
            .lock()
            .push((source.to_path_buf(), target.to_path_buf()));
        self.mounted.lock().insert(target.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path, lazy: bool) -> Result<()> {
        self.unmounts.lock().push((target.to_path_buf(), lazy));
        if !lazy && self.busy.lock().contains(target) {
            return Err(HomeVaultError::CommandFailed("device busy".into()));
        }
        self.mounted.lock().remove(target);
        Ok(())
    }

    fn is_directory_mounted(&self, target: &Path) -> bool {
        self.mounted.lock().contains(target)
    }

    fn processes_with_open_files(&self, _path: &Path) -> Vec<ProcessInfo> {
        vec![ProcessInfo {
            pid: 4242,
            cmdline: "holder".into(),
            cwd: None,
            open_files: Vec::new(),
        }]
    }

    fn sync(&self) {
        self.syncs.fetch_add(1, Ordering::SeqCst);
    }

    fn sync_directory(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    fn free_disk_space(&self, path: &Path) -> Result<u64> {
        let free_space = self.free_space.lock();
        Ok((**free_space)(path))
    }

    fn set_ownership(&self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        self.owners.lock().insert(path.to_path_buf(), (uid, gid));
        Ok(())
    }

    fn set_permissions(&self, path: &Path, mode: u32) -> Result<()> {
        self.modes.lock().insert(path.to_path_buf(), mode);
        Ok(())
    }

    fn stat(&self, path: &Path) -> Result<FileStat> {
        let meta = fs::metadata(path)?;
        let (uid, gid) = self.owners.lock().get(path).copied().unwrap_or((0, 0));
        let mode = self.modes.lock().get(path).copied().unwrap_or(0o755);
        Ok(FileStat {
            is_dir: meta.is_dir(),
            uid,
            gid,
            mode,
        })
    }

    fn add_encryption_key(&self, _key: &[u8], _salt: &[u8], signature: &str) -> Result<()> {
        self.keys_added.lock().push(signature.to_string());
        Ok(())
    }

    fn clear_user_keyring(&self) -> Result<()> {
        self.keyring_clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TestEngine
// ---------------------------------------------------------------------------

/// Software wrapping that can pose as hardware and fail on demand.
pub struct TestEngine {
    software: SoftwareWrapEngine,
    hardware: AtomicBool,
    with_public_key_hash: AtomicBool,
    fail_wraps: AtomicBool,
    unwrap_errors: Mutex<VecDeque<UnwrapError>>,
    pub unwrap_calls: AtomicUsize,
}

impl TestEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            software: SoftwareWrapEngine::new(fast_params()),
            hardware: AtomicBool::new(false),
            with_public_key_hash: AtomicBool::new(true),
            fail_wraps: AtomicBool::new(false),
            unwrap_errors: Mutex::new(VecDeque::new()),
            unwrap_calls: AtomicUsize::new(0),
        })
    }

    /// Wrap with (and report) hardware; `with_hash` controls whether new
    /// containers record the public-key hash.
    pub fn set_hardware(&self, enabled: bool, with_hash: bool) {
        self.hardware.store(enabled, Ordering::SeqCst);
        self.with_public_key_hash.store(with_hash, Ordering::SeqCst);
    }

    /// Make every wrap fail until switched back.
    pub fn fail_wraps(&self, fail: bool) {
        self.fail_wraps.store(fail, Ordering::SeqCst);
    }

    /// Fail the next unwraps with `errors`, in order.
    pub fn queue_unwrap_errors(&self, errors: &[UnwrapError]) {
        self.unwrap_errors.lock().extend(errors.iter().copied());
    }

    pub fn calls(&self) -> usize {
        self.unwrap_calls.load(Ordering::SeqCst)
    }

    pub fn reset_calls(&self) {
        self.unwrap_calls.store(0, Ordering::SeqCst);
    }
}

impl WrapEngine for TestEngine {
    fn wrap(&self, keys: &VaultKeys, passkey: &[u8], salt: &[u8]) -> Result<KeysetContainer> {
        if self.fail_wraps.load(Ordering::SeqCst) {
            return Err(HomeVaultError::WrapFailed("engine refused to wrap".into()));
        }
        let mut container = self.software.wrap(keys, passkey, salt)?;
        if self.hardware.load(Ordering::SeqCst) {
            container.flags = WrapFlags::HARDWARE;
            if self.with_public_key_hash.load(Ordering::SeqCst) {
                container.tpm_public_key_hash = Some(vec![0xAB; 32]);
            }
        }
        Ok(container)
    }

    fn unwrap(
        &self,
        container: &KeysetContainer,
        passkey: &[u8],
    ) -> std::result::Result<Unwrapped, UnwrapError> {
        self.unwrap_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.unwrap_errors.lock().pop_front() {
            return Err(error);
        }

        if !container.flags.contains(WrapFlags::HARDWARE) {
            return self.software.unwrap(container, passkey);
        }

        let mut as_software = container.clone();
        as_software.flags = WrapFlags::SOFTWARE_KDF;
        let mut unwrapped = self.software.unwrap(&as_software, passkey)?;
        unwrapped.flags = container.flags;
        if container.tpm_public_key_hash.is_none() {
            unwrapped.status = UnwrapStatus::MissingPublicKeyHash;
        }
        Ok(unwrapped)
    }

    fn is_hardware_available(&self) -> bool {
        self.hardware.load(Ordering::SeqCst)
    }

    fn is_hardware_enabled(&self) -> bool {
        self.hardware.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Settings and assembled fixtures
// ---------------------------------------------------------------------------

pub fn fast_params() -> Argon2Params {
    Argon2Params {
        memory_kib: MIN_MEMORY_KIB,
        iterations: 1,
        parallelism: 1,
    }
}

/// Settings with every path inside `dir`.
pub fn test_settings(dir: &Path) -> Settings {
    let params = fast_params();
    Settings {
        shadow_root: dir.join("shadow"),
        ephemeral_root: dir.join("run"),
        user_home_base: dir.join("home/user"),
        root_home_base: dir.join("home/root"),
        shared_user_base: dir.join("home/chronos"),
        legacy_home: dir.join("home/chronos/user"),
        argon2_memory_kib: params.memory_kib,
        argon2_iterations: params.iterations,
        argon2_parallelism: params.parallelism,
        min_free_space_bytes: 1_000,
        policy_file: dir.join("policy.toml"),
        ..Settings::default()
    }
}

/// Everything a test needs to poke at the vault layer directly.
pub struct Fixture {
    pub dir: TempDir,
    pub platform: Arc<FakePlatform>,
    pub engine: Arc<TestEngine>,
    pub policy: Arc<StaticPolicy>,
    pub homedirs: VaultCollection,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_settings(|_| {})
    }

    pub fn with_settings(tweak: impl FnOnce(&mut Settings)) -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let mut settings = test_settings(dir.path());
        tweak(&mut settings);

        let platform = FakePlatform::new();
        let engine = TestEngine::new();
        let policy = Arc::new(StaticPolicy::new(PolicySnapshot::default()));
        let homedirs = VaultCollection::new(
            Arc::new(settings),
            platform.clone(),
            engine.clone(),
            policy.clone(),
        )
        .expect("build vault collection");

        Self {
            dir,
            platform,
            engine,
            policy,
            homedirs,
        }
    }

    pub fn obfuscate(&self, user: &str) -> String {
        self.homedirs.obfuscate(user)
    }

    pub fn set_owner(&self, owner: Option<&str>) {
        let mut snapshot = self.policy.snapshot();
        snapshot.owner = owner.map(str::to_string);
        self.policy.set(snapshot);
    }

    pub fn set_ephemeral_users(&self, enabled: bool) {
        let mut snapshot = self.policy.snapshot();
        snapshot.ephemeral_users_enabled = enabled;
        self.policy.set(snapshot);
    }

    pub fn set_enterprise_owned(&self, enabled: bool) {
        let mut snapshot = self.policy.snapshot();
        snapshot.enterprise_owned = enabled;
        self.policy.set(snapshot);
    }
}

/// A service on the fake platform, plus handles to its fakes.
pub struct ServiceFixture {
    pub dir: TempDir,
    pub platform: Arc<FakePlatform>,
    pub engine: Arc<TestEngine>,
    pub policy: Arc<StaticPolicy>,
    pub service: VaultService,
}

impl ServiceFixture {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let settings = test_settings(dir.path());
        let platform = FakePlatform::new();
        let engine = TestEngine::new();
        let policy = Arc::new(StaticPolicy::new(PolicySnapshot::default()));
        let service = VaultService::new(settings, platform.clone(), engine.clone(), policy.clone())
            .expect("start service");
        Self {
            dir,
            platform,
            engine,
            policy,
            service,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Create `user` with one slot wrapped under `passkey`, leaving nothing
/// mounted. Returns the obfuscated name.
pub fn create_user(homedirs: &VaultCollection, user: &str, passkey: &[u8]) -> String {
    let mut engine = homevault::mount::MountEngine::new(homedirs.clone());
    let args = homevault::mount::MountArgs {
        create_if_missing: true,
        ensure_ephemeral: false,
    };
    engine
        .mount_cryptohome(&homevault::credentials::Credentials::new(user, passkey), &args)
        .expect("create user");
    assert!(engine.unmount_cryptohome());
    homedirs.obfuscate(user)
}

/// Overwrite the activity timestamp stored in slot `index`.
pub fn set_timestamp(homedirs: &VaultCollection, obfuscated: &str, index: usize, ts: i64) {
    let path = homedirs.keyset_path(obfuscated, index);
    let mut container = homevault::vault::format::read_container(&path).expect("read keyset");
    container.last_activity_timestamp = Some(ts);
    homevault::vault::format::write_container(&path, &container).expect("write keyset");
}

pub fn read_slot(homedirs: &VaultCollection, obfuscated: &str, index: usize) -> KeysetContainer {
    homevault::vault::format::read_container(&homedirs.keyset_path(obfuscated, index))
        .expect("read keyset")
}
