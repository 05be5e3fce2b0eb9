//! `homevault add-key`: wrap the user's keys under an additional password.

use crate::cli::output;
use crate::cli::{open_service, prompt_new_password, prompt_password, validate_username, Cli};
use crate::credentials::Credentials;
use crate::errors::Result;

/// Execute the `add-key` command.
pub fn execute(cli: &Cli, user: &str, label: Option<&str>) -> Result<()> {
    validate_username(user)?;
    let service = open_service(cli)?;

    output::info("Enter an existing password.");
    let current = prompt_password(user)?;
    let creds = Credentials::new(user, current.as_bytes());

    let new_password = prompt_new_password()?;
    let index = service.add_key_ex(
        creds,
        new_password.as_bytes().to_vec(),
        label.map(str::to_string),
    )?;

    output::success(&format!("Added key slot {index} for {user}."));
    Ok(())
}
