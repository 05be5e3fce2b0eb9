//! `homevault remove-key`: delete a labelled key slot.

use crate::cli::output;
use crate::cli::{open_service, prompt_password, validate_username, Cli};
use crate::credentials::Credentials;
use crate::errors::Result;

/// Execute the `remove-key` command.
///
/// The password must open some other slot of the same user.
pub fn execute(cli: &Cli, user: &str, label: &str) -> Result<()> {
    validate_username(user)?;
    let service = open_service(cli)?;

    let password = prompt_password(user)?;
    let creds = Credentials::new(user, password.as_bytes());
    service.remove_key_ex(creds, label.to_string())?;

    output::success(&format!("Removed key '{label}' from {user}."));
    Ok(())
}
