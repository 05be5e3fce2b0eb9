//! `homevault list-keys`: show the labels of every readable key slot.

use crate::cli::output;
use crate::cli::{open_service, validate_username, Cli};
use crate::errors::Result;

/// Execute the `list-keys` command.
pub fn execute(cli: &Cli, user: &str) -> Result<()> {
    validate_username(user)?;
    let service = open_service(cli)?;

    let labels = service.list_keys_ex(user.to_string())?;

    if cli.json {
        return output::json(&labels);
    }

    output::info(&format!("{user}: {} key slot(s)", labels.len()));
    output::print_keys_table(user, &labels);
    Ok(())
}
