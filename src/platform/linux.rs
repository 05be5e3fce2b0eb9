use std::ffi::{CString, OsStr};
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{FileStat, Platform, ProcessInfo};
use crate::errors::{HomeVaultError, Result};

const KEY_SPEC_USER_KEYRING: libc::c_long = -4;
const KEYCTL_CLEAR: libc::c_long = 7;

/// `Platform` backed by Linux syscalls and `/proc`.
#[derive(Debug, Clone, Default)]
pub struct LinuxPlatform;

impl LinuxPlatform {
    pub fn new() -> Self {
        Self
    }
}

fn c_path(path: &Path) -> Result<CString> {
    c_str(path.as_os_str().as_bytes())
}

fn c_str(bytes: &[u8]) -> Result<CString> {
    CString::new(bytes).map_err(|_| {
        HomeVaultError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "interior NUL byte",
        ))
    })
}

fn check(ret: libc::c_int) -> Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error().into())
    }
}

/// Decode the octal escapes (`\040` for space, ...) of `/proc` mount tables.
fn unescape_mount_path(field: &str) -> PathBuf {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(v) = u8::try_from(value) {
                    out.push(v);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    PathBuf::from(OsStr::from_bytes(&out))
}

impl Platform for LinuxPlatform {
    fn mount(&self, source: &Path, target: &Path, fs_type: &str, options: &str) -> Result<()> {
        let source = c_path(source)?;
        let target = c_path(target)?;
        let fs_type = c_str(fs_type.as_bytes())?;
        let options = c_str(options.as_bytes())?;
        // SAFETY: all pointers are valid NUL-terminated strings for the call.
        check(unsafe {
            libc::mount(
                source.as_ptr(),
                target.as_ptr(),
                fs_type.as_ptr(),
                0,
                options.as_ptr().cast(),
            )
        })
    }

    fn bind(&self, source: &Path, target: &Path) -> Result<()> {
        let source = c_path(source)?;
        let target = c_path(target)?;
        // SAFETY: valid NUL-terminated paths; fstype and data may be null for MS_BIND.
        check(unsafe {
            libc::mount(
                source.as_ptr(),
                target.as_ptr(),
                std::ptr::null(),
                libc::MS_BIND,
                std::ptr::null(),
            )
        })
    }

    fn unmount(&self, target: &Path, lazy: bool) -> Result<()> {
        let target = c_path(target)?;
        let flags = if lazy { libc::MNT_DETACH } else { 0 };
        // SAFETY: valid NUL-terminated path.
        check(unsafe { libc::umount2(target.as_ptr(), flags) })
    }

    fn is_directory_mounted(&self, target: &Path) -> bool {
        let Ok(table) = fs::read_to_string("/proc/self/mountinfo") else {
            return false;
        };
        table
            .lines()
            .filter_map(|line| line.split(' ').nth(4))
            .any(|mount_point| unescape_mount_path(mount_point) == target)
    }

    fn processes_with_open_files(&self, path: &Path) -> Vec<ProcessInfo> {
        let Ok(entries) = fs::read_dir("/proc") else {
            return Vec::new();
        };
        let mut found = Vec::new();
        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            let proc_dir = entry.path();

            let cwd = fs::read_link(proc_dir.join("cwd")).ok();
            let open_files: Vec<PathBuf> = fs::read_dir(proc_dir.join("fd"))
                .map(|fds| {
                    fds.flatten()
                        .filter_map(|fd| fs::read_link(fd.path()).ok())
                        .filter(|target| target.starts_with(path))
                        .collect()
                })
                .unwrap_or_default();

            let cwd_inside = cwd.as_ref().is_some_and(|c| c.starts_with(path));
            if open_files.is_empty() && !cwd_inside {
                continue;
            }

            let cmdline = fs::read(proc_dir.join("cmdline"))
                .map(|raw| {
                    raw.split(|b| *b == 0)
                        .filter(|arg| !arg.is_empty())
                        .map(|arg| String::from_utf8_lossy(arg).into_owned())
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .unwrap_or_default();

            found.push(ProcessInfo {
                pid,
                cmdline,
                cwd,
                open_files,
            });
        }
        found
    }

    fn sync(&self) {
        // SAFETY: sync(2) takes no arguments and cannot fail.
        unsafe { libc::sync() }
    }

    fn sync_directory(&self, path: &Path) -> Result<()> {
        fs::File::open(path)?.sync_all()?;
        Ok(())
    }

    fn free_disk_space(&self, path: &Path) -> Result<u64> {
        let c = c_path(path)?;
        // SAFETY: statvfs is plain-old-data; zeroed is a valid initial value.
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: valid path and a properly sized out-parameter.
        check(unsafe { libc::statvfs(c.as_ptr(), &mut stat) })?;
        #[allow(clippy::unnecessary_cast)]
        Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
    }

    fn set_ownership(&self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        std::os::unix::fs::chown(path, Some(uid), Some(gid))?;
        Ok(())
    }

    fn set_permissions(&self, path: &Path, mode: u32) -> Result<()> {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    fn stat(&self, path: &Path) -> Result<FileStat> {
        let meta = fs::metadata(path)?;
        Ok(FileStat {
            is_dir: meta.is_dir(),
            uid: meta.uid(),
            gid: meta.gid(),
            mode: meta.mode() & 0o7777,
        })
    }

    fn add_encryption_key(&self, key: &[u8], salt: &[u8], signature: &str) -> Result<()> {
        let key_type = c_str(b"user")?;
        let description = c_str(signature.as_bytes())?;
        let mut payload = zeroize::Zeroizing::new(Vec::with_capacity(key.len() + salt.len()));
        payload.extend_from_slice(key);
        payload.extend_from_slice(salt);
        // SAFETY: type/description are NUL-terminated, payload pointer and
        // length describe a live buffer.
        let serial = unsafe {
            libc::syscall(
                libc::SYS_add_key,
                key_type.as_ptr(),
                description.as_ptr(),
                payload.as_ptr(),
                payload.len(),
                KEY_SPEC_USER_KEYRING,
            )
        };
        if serial < 0 {
            return Err(io::Error::last_os_error().into());
        }
        debug!(signature, "inserted key into user keyring");
        Ok(())
    }

    fn clear_user_keyring(&self) -> Result<()> {
        // SAFETY: KEYCTL_CLEAR takes a single keyring id.
        let ret = unsafe { libc::syscall(libc::SYS_keyctl, KEYCTL_CLEAR, KEY_SPEC_USER_KEYRING) };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}
