//! `homevault status`: show mount state, hardware support and disk usage.

use crate::cli::output;
use crate::cli::{open_service, Cli};
use crate::errors::Result;

/// Execute the `status` command.
pub fn execute(cli: &Cli) -> Result<()> {
    let service = open_service(cli)?;
    let status = service.get_status()?;

    if cli.json {
        return output::json(&status);
    }

    output::print_status_table(&status);
    Ok(())
}
