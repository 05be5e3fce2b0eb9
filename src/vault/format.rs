//! Binary keyset container format.
//!
//! A `key.<n>` file has this layout:
//!
//! ```text
//! [HVKS: 4 bytes][version: 1 byte][wrap_flags: 4 bytes LE][record]*[SHA-256: 32 bytes]
//! record = [tag: 1 byte][len: 4 bytes LE][len bytes]
//! ```
//!
//! - **Magic** (`HVKS`): identifies the file as a keyset container.
//! - **Wrap flags**: bit-field of `WrapFlags`.
//! - **Records**: one per present field.  An absent optional field has no
//!   record; a present-but-empty one has a zero-length record, so the two
//!   stay distinguishable.  Unknown tags are skipped.
//! - **SHA-256**: digest of every preceding byte, used to detect torn or
//!   corrupted writes.
//!
//! Re-persisting a keyset follows a copy-aside protocol: the affected files
//! are copied to `<file>.bak`, the new container is written, and the
//! backups are deleted only afterwards.  `read_container` falls back to the
//! backup when the primary is corrupt.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::errors::{HomeVaultError, Result};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic bytes at the start of every keyset container.
const MAGIC: &[u8; 4] = b"HVKS";

/// Current binary format version.
pub const CURRENT_VERSION: u8 = 1;

/// Fixed-size prefix: 4 (magic) + 1 (version) + 4 (flags).
const PREFIX_LEN: usize = 9;

/// Size of the trailing digest.
const DIGEST_LEN: usize = 32;

/// Per-record header: 1 (tag) + 4 (length).
const RECORD_HEADER_LEN: usize = 5;

/// Suffix of copy-aside backups.
pub const BACKUP_SUFFIX: &str = "bak";

const TAG_SALT: u8 = 1;
const TAG_WRAPPED_KEYSET: u8 = 2;
const TAG_TPM_KEY: u8 = 3;
const TAG_EXTENDED_TPM_KEY: u8 = 4;
const TAG_TPM_PUBLIC_KEY_HASH: u8 = 5;
const TAG_LABEL: u8 = 6;
const TAG_REVISION: u8 = 7;
const TAG_KEY_POLICY: u8 = 8;
const TAG_AUTHORIZATION_SIGNATURE: u8 = 9;
const TAG_LAST_ACTIVITY: u8 = 10;

// ---------------------------------------------------------------------------
// WrapFlags
// ---------------------------------------------------------------------------

/// How a keyset's payload is wrapped.
///
/// Exactly one of `HARDWARE` / `SOFTWARE_KDF` is expected; `PCR_BOUND`
/// only refines `HARDWARE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WrapFlags(u32);

impl WrapFlags {
    pub const NONE: Self = Self(0);
    pub const HARDWARE: Self = Self(1 << 0);
    pub const SOFTWARE_KDF: Self = Self(1 << 1);
    pub const PCR_BOUND: Self = Self(1 << 2);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    /// Wrapped by hardware and nothing else.
    pub const fn is_hardware_only(self) -> bool {
        self.contains(Self::HARDWARE) && !self.contains(Self::SOFTWARE_KDF)
    }

    /// Wrapped by the software KDF and nothing else.
    pub const fn is_software_only(self) -> bool {
        self.contains(Self::SOFTWARE_KDF) && !self.contains(Self::HARDWARE)
    }
}

impl std::ops::BitOr for WrapFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ---------------------------------------------------------------------------
// KeysetContainer
// ---------------------------------------------------------------------------

/// Policy attached to a key slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyPolicy {
    /// The slot is protected by a low-entropy credential (e.g. a PIN).
    pub low_entropy_credential: bool,
}

/// One wrapped keyset as stored in `key.<n>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeysetContainer {
    pub flags: WrapFlags,
    pub salt: Vec<u8>,
    pub wrapped_keyset: Vec<u8>,
    pub tpm_key: Option<Vec<u8>>,
    pub extended_tpm_key: Option<Vec<u8>>,
    pub tpm_public_key_hash: Option<Vec<u8>>,
    pub label: Option<String>,
    pub revision: Option<u64>,
    pub key_policy: Option<KeyPolicy>,
    pub authorization_signature: Option<Vec<u8>>,
    /// Unix seconds of the last mount/unmount that touched this slot.
    pub last_activity_timestamp: Option<i64>,
}

impl KeysetContainer {
    pub fn new(flags: WrapFlags, salt: Vec<u8>, wrapped_keyset: Vec<u8>) -> Self {
        Self {
            flags,
            salt,
            wrapped_keyset,
            tpm_key: None,
            extended_tpm_key: None,
            tpm_public_key_hash: None,
            label: None,
            revision: None,
            key_policy: None,
            authorization_signature: None,
            last_activity_timestamp: None,
        }
    }

    /// Copy the slot metadata (label, policy, timestamps, ...) of `other`
    /// onto a freshly wrapped container.
    pub fn inherit_metadata(&mut self, other: &KeysetContainer) {
        self.label = other.label.clone();
        self.revision = other.revision;
        self.key_policy = other.key_policy;
        self.authorization_signature = other.authorization_signature.clone();
        self.last_activity_timestamp = other.last_activity_timestamp;
    }

    /// Encode into the on-disk byte layout.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(PREFIX_LEN + 256 + DIGEST_LEN);
        buf.extend_from_slice(MAGIC);
        buf.push(CURRENT_VERSION);
        buf.extend_from_slice(&self.flags.bits().to_le_bytes());

        put_record(&mut buf, TAG_SALT, &self.salt)?;
        put_record(&mut buf, TAG_WRAPPED_KEYSET, &self.wrapped_keyset)?;
        if let Some(ref v) = self.tpm_key {
            put_record(&mut buf, TAG_TPM_KEY, v)?;
        }
        if let Some(ref v) = self.extended_tpm_key {
            put_record(&mut buf, TAG_EXTENDED_TPM_KEY, v)?;
        }
        if let Some(ref v) = self.tpm_public_key_hash {
            put_record(&mut buf, TAG_TPM_PUBLIC_KEY_HASH, v)?;
        }
        if let Some(ref label) = self.label {
            put_record(&mut buf, TAG_LABEL, label.as_bytes())?;
        }
        if let Some(revision) = self.revision {
            put_record(&mut buf, TAG_REVISION, &revision.to_le_bytes())?;
        }
        if let Some(policy) = self.key_policy {
            put_record(&mut buf, TAG_KEY_POLICY, &[u8::from(policy.low_entropy_credential)])?;
        }
        if let Some(ref v) = self.authorization_signature {
            put_record(&mut buf, TAG_AUTHORIZATION_SIGNATURE, v)?;
        }
        if let Some(ts) = self.last_activity_timestamp {
            put_record(&mut buf, TAG_LAST_ACTIVITY, &ts.to_le_bytes())?;
        }

        let digest = Sha256::digest(&buf);
        buf.extend_from_slice(&digest);
        Ok(buf)
    }

    /// Decode the on-disk byte layout.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < PREFIX_LEN + DIGEST_LEN {
            return Err(corrupt("file too small to be a keyset"));
        }
        if &data[0..4] != MAGIC {
            return Err(corrupt("missing HVKS magic bytes"));
        }
        let version = data[4];
        if version != CURRENT_VERSION {
            return Err(corrupt(&format!(
                "unsupported version {version}, expected {CURRENT_VERSION}"
            )));
        }

        let body_end = data.len() - DIGEST_LEN;
        let digest = Sha256::digest(&data[..body_end]);
        if digest.as_slice() != &data[body_end..] {
            return Err(corrupt("checksum mismatch"));
        }

        let flags = WrapFlags::from_bits(u32::from_le_bytes(
            data[5..9].try_into().map_err(|_| corrupt("bad flags"))?,
        ));

        let mut salt = None;
        let mut wrapped_keyset = None;
        let mut container = KeysetContainer::new(flags, Vec::new(), Vec::new());
        let mut seen = [false; 256];

        let mut cursor = PREFIX_LEN;
        while cursor < body_end {
            if cursor + RECORD_HEADER_LEN > body_end {
                return Err(corrupt("truncated record header"));
            }
            let tag = data[cursor];
            let len = u32::from_le_bytes(
                data[cursor + 1..cursor + RECORD_HEADER_LEN]
                    .try_into()
                    .map_err(|_| corrupt("bad record length"))?,
            );
            let len = usize::try_from(len).map_err(|_| corrupt("record length overflow"))?;
            let start = cursor + RECORD_HEADER_LEN;
            let end = start
                .checked_add(len)
                .filter(|end| *end <= body_end)
                .ok_or_else(|| corrupt("record exceeds file size"))?;
            let value = &data[start..end];
            cursor = end;

            if seen[usize::from(tag)] {
                return Err(corrupt(&format!("duplicate record tag {tag}")));
            }
            seen[usize::from(tag)] = true;

            match tag {
                TAG_SALT => salt = Some(value.to_vec()),
                TAG_WRAPPED_KEYSET => wrapped_keyset = Some(value.to_vec()),
                TAG_TPM_KEY => container.tpm_key = Some(value.to_vec()),
                TAG_EXTENDED_TPM_KEY => container.extended_tpm_key = Some(value.to_vec()),
                TAG_TPM_PUBLIC_KEY_HASH => container.tpm_public_key_hash = Some(value.to_vec()),
                TAG_LABEL => {
                    let label = String::from_utf8(value.to_vec())
                        .map_err(|_| corrupt("label is not valid UTF-8"))?;
                    container.label = Some(label);
                }
                TAG_REVISION => {
                    let bytes: [u8; 8] = value.try_into().map_err(|_| corrupt("bad revision"))?;
                    container.revision = Some(u64::from_le_bytes(bytes));
                }
                TAG_KEY_POLICY => {
                    let [bits] = value else {
                        return Err(corrupt("bad key policy"));
                    };
                    container.key_policy = Some(KeyPolicy {
                        low_entropy_credential: bits & 1 == 1,
                    });
                }
                TAG_AUTHORIZATION_SIGNATURE => {
                    container.authorization_signature = Some(value.to_vec());
                }
                TAG_LAST_ACTIVITY => {
                    let bytes: [u8; 8] = value.try_into().map_err(|_| corrupt("bad timestamp"))?;
                    container.last_activity_timestamp = Some(i64::from_le_bytes(bytes));
                }
                _ => {}
            }
        }

        container.salt = salt.ok_or_else(|| corrupt("missing salt record"))?;
        container.wrapped_keyset =
            wrapped_keyset.ok_or_else(|| corrupt("missing wrapped keyset record"))?;
        Ok(container)
    }
}

fn put_record(buf: &mut Vec<u8>, tag: u8, value: &[u8]) -> Result<()> {
    let len = u32::try_from(value.len()).map_err(|_| {
        HomeVaultError::SerializationError(format!(
            "record {tag} length {} exceeds u32::MAX",
            value.len()
        ))
    })?;
    buf.push(tag);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(value);
    Ok(())
}

fn corrupt(reason: &str) -> HomeVaultError {
    HomeVaultError::CorruptKeyset(reason.to_string())
}

// ---------------------------------------------------------------------------
// File I/O
// ---------------------------------------------------------------------------

/// `<path>.bak`
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Read a keyset container from disk.
///
/// Fails with `KeysetNotFound` when neither the file nor its backup
/// exist, and with `CorruptKeyset` when the file cannot be decoded and no
/// usable backup is present.
pub fn read_container(path: &Path) -> Result<KeysetContainer> {
    let backup = backup_path(path);

    let primary = match fs::read(path) {
        Ok(bytes) => KeysetContainer::from_bytes(&bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(HomeVaultError::KeysetNotFound(path.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    };

    match primary {
        Ok(container) => Ok(container),
        Err(err) if backup.exists() => {
            let container = KeysetContainer::from_bytes(&fs::read(&backup)?).map_err(|_| err)?;
            warn!(path = %path.display(), "keyset unreadable, using copy-aside backup");
            Ok(container)
        }
        Err(err) => Err(err),
    }
}

/// Write a keyset container to `path`, replacing any existing file.
///
/// The bytes go to a temp file in the same directory which is then renamed
/// over `path`, so a reader sees either the old or the new container.
pub fn write_container(path: &Path, container: &KeysetContainer) -> Result<()> {
    let bytes = container.to_bytes()?;
    let tmp_path = temp_path(path);

    let written = fs::File::create(&tmp_path).and_then(|mut file| {
        file.write_all(&bytes)?;
        file.sync_all()
    });
    if let Err(e) = written.and_then(|()| fs::rename(&tmp_path, path)) {
        if let Err(rm) = fs::remove_file(&tmp_path) {
            if rm.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %tmp_path.display(), error = %rm, "cannot remove temp keyset");
            }
        }
        return Err(e.into());
    }
    Ok(())
}

/// `<dir>/.<name>.tmp` next to `path`.
fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

/// Write a keyset container into an already opened (freshly created) file.
pub fn write_container_to(file: &mut fs::File, container: &KeysetContainer) -> Result<()> {
    let bytes = container.to_bytes()?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Copy every existing file in `files` aside to `<file>.bak`.
///
/// A backup that still decodes as a keyset is kept when the file it backs
/// up does not: it is the last good copy of that slot.
pub fn cache_old_files(files: &[PathBuf]) -> Result<()> {
    for file in files {
        let backup = backup_path(file);
        if backup.exists() {
            if is_only_good_copy(&backup, file) {
                warn!(path = %file.display(), "keeping the readable backup of a corrupt keyset");
                continue;
            }
            fs::remove_file(&backup)?;
        }
        if file.exists() {
            fs::copy(file, &backup)?;
        }
    }
    Ok(())
}

fn decodes(path: &Path) -> bool {
    fs::read(path)
        .map(|bytes| KeysetContainer::from_bytes(&bytes).is_ok())
        .unwrap_or(false)
}

fn is_only_good_copy(backup: &Path, file: &Path) -> bool {
    decodes(backup) && !decodes(file)
}

/// Put every `<file>.bak` back in place of `file`.
pub fn revert_cache_files(files: &[PathBuf]) -> Result<()> {
    for file in files {
        let backup = backup_path(file);
        if backup.exists() {
            fs::rename(&backup, file)?;
        }
    }
    Ok(())
}

/// Delete every `<file>.bak`.
pub fn delete_cache_files(files: &[PathBuf]) -> Result<()> {
    for file in files {
        let backup = backup_path(file);
        if backup.exists() {
            fs::remove_file(&backup)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
