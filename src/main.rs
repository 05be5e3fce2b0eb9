use clap::Parser;
use homevault::cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    // Diagnostics go to stderr so `--json` output stays clean.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("homevault=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Mount {
            ref user,
            create,
            ephemeral,
            ref key_label,
        } => homevault::cli::commands::mount::execute(
            &cli,
            user,
            create,
            ephemeral,
            key_label.as_deref(),
        ),
        Commands::CheckKey {
            ref user,
            ref key_label,
        } => homevault::cli::commands::check_key::execute(&cli, user, key_label.as_deref()),
        Commands::AddKey {
            ref user,
            ref label,
        } => homevault::cli::commands::add_key::execute(&cli, user, label.as_deref()),
        Commands::RemoveKey {
            ref user,
            ref label,
        } => homevault::cli::commands::remove_key::execute(&cli, user, label),
        Commands::ListKeys { ref user } => homevault::cli::commands::list_keys::execute(&cli, user),
        Commands::MigrateKey { ref user } => {
            homevault::cli::commands::migrate_key::execute(&cli, user)
        }
        Commands::FreeSpace => homevault::cli::commands::free_space::execute(&cli),
        Commands::Status => homevault::cli::commands::status::execute(&cli),
    };

    if let Err(e) = result {
        homevault::cli::output::error(&e.to_string());
        std::process::exit(1);
    }
}
