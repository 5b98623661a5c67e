use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use deckhand_core::DeckhandConfig;
use deckhand_core::config::DEFAULT_CONFIG_FILE;

mod commands;

#[derive(Parser)]
#[command(
    name = "deckhand",
    about = "Backups, restores and zero-downtime updates for a compose stack",
    version,
    propagate_version = true
)]
struct Cli {
    /// Configuration file. Defaults apply when it does not exist.
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a backup set: database dump, app state, media and config.
    Backup,
    /// List backup sets, newest first.
    List,
    /// Delete backup files older than the retention period.
    Prune {
        /// Retention in days (default: backup.retention_days).
        #[arg(long)]
        days: Option<u32>,
    },
    /// Restore a backup set. Stops application services.
    Restore {
        /// Backup id, as shown by `deckhand list`.
        id: String,
        /// Replace the media directory with the archived one.
        #[arg(long)]
        restore_media: bool,
        /// Overlay the archived configuration files.
        #[arg(long)]
        restore_config: bool,
        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },
    /// Zero-downtime rolling update of the web tier.
    Update {
        #[arg(long)]
        no_backup: bool,
        #[arg(long)]
        no_migrations: bool,
        /// Do not start linked services when scaling.
        #[arg(long)]
        no_deps: bool,
        #[arg(long)]
        no_build: bool,
    },
    /// First-time bring-up of the whole stack.
    Deploy,
    /// Show service state and endpoint health.
    Status,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,deckhand=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = DeckhandConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    tracing::debug!(config = %cli.config.display(), project = %config.project.dir.display(), "configuration loaded");

    let code = match cli.command {
        Commands::Backup => commands::backup::create(&config).await?,
        Commands::List => commands::backup::list(&config)?,
        Commands::Prune { days } => commands::backup::prune(&config, days)?,
        Commands::Restore {
            id,
            restore_media,
            restore_config,
            yes,
        } => {
            let options = deckhand_backup::RestoreOptions {
                restore_media,
                restore_config,
            };
            commands::restore::restore(&config, &id, options, yes).await?
        }
        Commands::Update {
            no_backup,
            no_migrations,
            no_deps,
            no_build,
        } => {
            let options = deckhand_rollout::UpdateOptions {
                skip_backup: no_backup,
                skip_migrations: no_migrations,
                no_deps,
                skip_build: no_build,
            };
            commands::update::update(&config, options).await
        }
        Commands::Deploy => commands::update::deploy(&config).await,
        Commands::Status => commands::status::status(&config).await?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
