//! `homevault mount`: mount a home, hold it until Enter, then unmount.

use std::io::BufRead;

use crate::cli::output;
use crate::cli::{open_service, prompt_password, validate_username, Cli};
use crate::credentials::Credentials;
use crate::errors::{HomeVaultError, Result};
use crate::mount::MountArgs;

/// Execute the `mount` command.
pub fn execute(
    cli: &Cli,
    user: &str,
    create: bool,
    ephemeral: bool,
    key_label: Option<&str>,
) -> Result<()> {
    validate_username(user)?;
    let service = open_service(cli)?;

    let creds = if user == crate::credentials::GUEST_USERNAME {
        Credentials::guest()
    } else {
        let password = prompt_password(user)?;
        let creds = Credentials::new(user, password.as_bytes());
        match key_label {
            Some(label) => creds.with_key_label(label),
            None => creds,
        }
    };

    let args = MountArgs {
        create_if_missing: create,
        ensure_ephemeral: ephemeral,
    };
    let reply = service.mount_ex(creds, args)?;

    if cli.json {
        output::json(&reply)?;
    } else {
        output::reply("Mount", &reply);
    }
    if !reply.success {
        return Err(HomeVaultError::Mount(reply.error));
    }

    if !cli.json {
        output::tip("Press Enter to unmount.");
    }
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;

    if service.unmount_ex()? {
        output::success("Unmounted.");
    } else {
        output::warning("Unmount was not clean; some mounts were detached lazily.");
    }

    Ok(())
}
