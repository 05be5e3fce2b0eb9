//! CLI module: Clap argument parser, output helpers, and command implementations.

pub mod commands;
pub mod output;

use std::path::PathBuf;

use clap::Parser;

use zeroize::Zeroizing;

use crate::config::Settings;
use crate::errors::{HomeVaultError, Result};
use crate::service::VaultService;

/// Minimum length of a newly chosen password.
const MIN_PASSWORD_LEN: usize = 8;

/// homevault: encrypted per-user home directory vault manager.
#[derive(Parser)]
#[command(
    name = "homevault",
    about = "Encrypted per-user home directory vault manager",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the config file
    #[arg(long, default_value = Settings::DEFAULT_PATH, global = true)]
    pub config: PathBuf,

    /// Print machine-readable JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,
}

/// All available subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Mount a user's home, wait for Enter, then unmount it
    Mount {
        /// Account id
        user: String,
        /// Create the vault if the user has none
        #[arg(long)]
        create: bool,
        /// Mount a throw-away tmpfs home instead
        #[arg(long)]
        ephemeral: bool,
        /// Only try the key slot with this label
        #[arg(long)]
        key_label: Option<String>,
    },

    /// Check a password against a user's keys
    CheckKey {
        /// Account id
        user: String,
        /// Only try the key slot with this label
        #[arg(long)]
        key_label: Option<String>,
    },

    /// Add a key slot for a new password
    AddKey {
        /// Account id
        user: String,
        /// Label of the new slot
        #[arg(long)]
        label: Option<String>,
    },

    /// Remove the key slot with the given label
    RemoveKey {
        /// Account id
        user: String,
        /// Label of the slot to remove
        label: String,
    },

    /// List the key slot labels of a user
    ListKeys {
        /// Account id
        user: String,
    },

    /// Replace all of a user's keys with a single new password
    MigrateKey {
        /// Account id
        user: String,
    },

    /// Reclaim disk space from unmounted users
    FreeSpace,

    /// Show mount, hardware and disk status
    Status,
}

// ---------------------------------------------------------------------------
// Shared helpers used by multiple commands
// ---------------------------------------------------------------------------

/// Load the settings named on the command line and start the service.
#[cfg(target_os = "linux")]
pub fn open_service(cli: &Cli) -> Result<VaultService> {
    let settings = Settings::load(&cli.config)?;
    VaultService::from_settings(settings)
}

#[cfg(not(target_os = "linux"))]
pub fn open_service(_cli: &Cli) -> Result<VaultService> {
    Err(HomeVaultError::CommandFailed(
        "homevault only runs on Linux".into(),
    ))
}

/// Get the user's current password, trying in order:
/// 1. `HOMEVAULT_PASSWORD` env var (scripted use)
/// 2. Interactive prompt
///
/// Returns `Zeroizing<String>` so the password is wiped from memory on drop.
pub fn prompt_password(user: &str) -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var("HOMEVAULT_PASSWORD") {
        if !pw.is_empty() {
            return Ok(Zeroizing::new(pw));
        }
    }

    let pw = dialoguer::Password::new()
        .with_prompt(format!("Password for {user}"))
        .interact()
        .map_err(|e| HomeVaultError::CommandFailed(format!("password prompt: {e}")))?;
    Ok(Zeroizing::new(pw))
}

/// Prompt for a new password with confirmation.
///
/// Respects `HOMEVAULT_NEW_PASSWORD` for scripted use and enforces a
/// minimum password length.
pub fn prompt_new_password() -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var("HOMEVAULT_NEW_PASSWORD") {
        if !pw.is_empty() {
            if pw.len() < MIN_PASSWORD_LEN {
                return Err(HomeVaultError::CommandFailed(format!(
                    "password must be at least {MIN_PASSWORD_LEN} characters"
                )));
            }
            return Ok(Zeroizing::new(pw));
        }
    }

    loop {
        let password = dialoguer::Password::new()
            .with_prompt("Choose new password")
            .with_confirmation("Confirm new password", "Passwords do not match, try again")
            .interact()
            .map_err(|e| HomeVaultError::CommandFailed(format!("password prompt: {e}")))?;

        if password.len() < MIN_PASSWORD_LEN {
            output::warning(&format!(
                "Password must be at least {MIN_PASSWORD_LEN} characters. Try again."
            ));
            continue;
        }

        return Ok(Zeroizing::new(password));
    }
}

/// Validate an account id before it reaches the vault layer.
///
/// Must be non-empty, at most 256 characters, and free of control
/// characters and path separators.
pub fn validate_username(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(HomeVaultError::ConfigError(
            "account id cannot be empty".into(),
        ));
    }

    if name.len() > 256 {
        return Err(HomeVaultError::ConfigError(
            "account id cannot exceed 256 characters".into(),
        ));
    }

    if name.chars().any(|c| c.is_control() || c == '/') {
        return Err(HomeVaultError::ConfigError(format!(
            "account id '{}' contains invalid characters",
            name.escape_debug()
        )));
    }

    Ok(())
}
