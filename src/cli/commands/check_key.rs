//! `homevault check-key`: test a password without mounting.

use crate::cli::output;
use crate::cli::{open_service, prompt_password, validate_username, Cli};
use crate::credentials::Credentials;
use crate::errors::{HomeVaultError, Result};

/// Execute the `check-key` command.
pub fn execute(cli: &Cli, user: &str, key_label: Option<&str>) -> Result<()> {
    validate_username(user)?;
    let service = open_service(cli)?;

    let password = prompt_password(user)?;
    let mut creds = Credentials::new(user, password.as_bytes());
    if let Some(label) = key_label {
        creds = creds.with_key_label(label);
    }

    let reply = service.check_key_ex(creds)?;
    if cli.json {
        output::json(&reply)?;
    } else {
        output::reply("Key check", &reply);
    }

    if reply.success {
        Ok(())
    } else {
        Err(HomeVaultError::AuthorizationFailed(reply.error))
    }
}
