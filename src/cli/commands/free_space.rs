//! `homevault free-space`: run the staged disk space reclamation once.

use crate::cli::output;
use crate::cli::{open_service, Cli};
use crate::errors::Result;

/// Execute the `free-space` command.
pub fn execute(cli: &Cli) -> Result<()> {
    let service = open_service(cli)?;
    let enough = service.free_disk_space()?;

    if cli.json {
        return output::json(&serde_json::json!({ "enough_space": enough }));
    }

    if enough {
        output::success("Enough free disk space.");
    } else {
        output::warning("Still short of disk space after cleanup.");
    }
    Ok(())
}
