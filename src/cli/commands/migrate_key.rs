//! `homevault migrate-key`: replace every key slot with one new password.
//!
//! The old password authorizes the change.  Afterwards only the new
//! password opens the vault, at the slot index the old one used.

use crate::cli::output;
use crate::cli::{open_service, prompt_new_password, prompt_password, validate_username, Cli};
use crate::credentials::Credentials;
use crate::errors::Result;

/// Execute the `migrate-key` command.
pub fn execute(cli: &Cli, user: &str) -> Result<()> {
    validate_username(user)?;
    let service = open_service(cli)?;

    output::info("Enter the current password.");
    let old_password = prompt_password(user)?;
    let new_password = prompt_new_password()?;

    let new_creds = Credentials::new(user, new_password.as_bytes());
    service.migrate_key_ex(new_creds, old_password.as_bytes().to_vec())?;

    output::success(&format!("Migrated {user} to the new password."));
    output::tip("Every other password for this user has been removed.");
    Ok(())
}
