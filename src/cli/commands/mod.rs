//! One module per `homevault` subcommand.

pub mod add_key;
pub mod check_key;
pub mod free_space;
pub mod list_keys;
pub mod migrate_key;
pub mod mount;
pub mod remove_key;
pub mod status;
