//! Colored terminal output helpers.
//!
//! All user-facing output goes through these functions so we get
//! consistent styling across every command.

use comfy_table::{ContentArrangement, Table};
use console::style;

use crate::mount::MountState;
use crate::service::{MountReply, VaultStatus};

/// Print a green success message: "check_mark {msg}"
pub fn success(msg: &str) {
    println!("{} {}", style("\u{2713}").green().bold(), msg);
}

/// Print a red error message: "x_mark {msg}"
pub fn error(msg: &str) {
    eprintln!("{} {}", style("\u{2717}").red().bold(), msg);
}

/// Print a yellow warning: "warning_sign {msg}"
pub fn warning(msg: &str) {
    eprintln!("{} {}", style("\u{26a0}").yellow().bold(), msg);
}

/// Print a blue info message: "info_sign {msg}"
pub fn info(msg: &str) {
    println!("{} {}", style("\u{2139}").blue().bold(), msg);
}

/// Print a dim tip/hint: "arrow {msg}"
pub fn tip(msg: &str) {
    println!("{} {}", style("\u{2192}").dim(), style(msg).dim());
}

/// Print a value as pretty JSON.
pub fn json<T: serde::Serialize>(value: &T) -> crate::errors::Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| crate::errors::HomeVaultError::SerializationError(e.to_string()))?;
    println!("{text}");
    Ok(())
}

/// Print a mount-layer reply in words.
pub fn reply(action: &str, reply: &MountReply) {
    match (reply.success, reply.error) {
        (true, crate::errors::MountError::Recreated) => {
            warning(&format!("{action} succeeded, but the vault was recreated and old data is gone"));
        }
        (true, _) => success(&format!("{action} succeeded")),
        (false, kind) => error(&format!("{action} failed: {kind}")),
    }
}

/// Print a table of key slot labels.
pub fn print_keys_table(user: &str, labels: &[String]) {
    if labels.is_empty() {
        info(&format!("{user} has no readable key slots."));
        return;
    }

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["#", "Label"]);

    for (position, label) in labels.iter().enumerate() {
        table.add_row(vec![position.to_string(), label.clone()]);
    }

    println!("{table}");
}

/// Print the service status as a two-column table.
pub fn print_status_table(status: &VaultStatus) {
    let mount = &status.mount;
    let state = match mount.state {
        MountState::Mounted => style("mounted").green().to_string(),
        MountState::Idle => style("idle").dim().to_string(),
        other => format!("{other:?}").to_lowercase(),
    };
    let free = status
        .free_disk_space
        .map(|bytes| format!("{} MiB", bytes / (1024 * 1024)))
        .unwrap_or_else(|| "unknown".into());

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Field", "Value"]);
    table.add_row(vec!["State".to_string(), state]);
    table.add_row(vec![
        "User".to_string(),
        mount.username.clone().unwrap_or_else(|| "-".into()),
    ]);
    table.add_row(vec!["Ephemeral".to_string(), mount.ephemeral.to_string()]);
    table.add_row(vec![
        "Key slot".to_string(),
        mount.current_key_index.to_string(),
    ]);
    table.add_row(vec![
        "Token store".to_string(),
        format!("{:?}", mount.pkcs11_state),
    ]);
    table.add_row(vec![
        "Hardware".to_string(),
        format!(
            "available={} enabled={}",
            status.hardware_available, status.hardware_enabled
        ),
    ]);
    table.add_row(vec!["Free space".to_string(), free]);
    table.add_row(vec!["Owner known".to_string(), status.has_owner.to_string()]);
    table.add_row(vec![
        "Ephemeral users".to_string(),
        status.ephemeral_users_enabled.to_string(),
    ]);
    table.add_row(vec!["Identities".to_string(), status.identities.to_string()]);

    println!("{table}");
}
