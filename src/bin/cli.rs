//! Harvester CLI
//!
//! Local execution entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use harvester::{
    error::{AppError, Result},
    loader::{StopHandle, StopSignal},
    models::{Config, RunMode},
    pipeline::{self, Sources},
    storage::{LocalStore, TableStore},
};

/// Harvester - incremental community post ingestion
#[derive(Parser, Debug)]
#[command(
    name = "harvester",
    version,
    about = "Multi-source incremental ingestion for forum communities"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "harvester.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the enabled loaders
    Fetch {
        /// One pass per loader and community, then exit
        #[arg(long, conflicts_with = "continuous")]
        once: bool,

        /// Keep every loader running until interrupted
        #[arg(long)]
        continuous: bool,

        /// Communities to fetch instead of the configured ones
        #[arg(value_name = "COMMUNITY")]
        communities: Vec<String>,
    },

    /// Validate the configuration file
    Validate,

    /// Show stored collections and their watermarks
    Info,

    /// Export canonical tables and write the package descriptor
    Export {
        /// Communities to export instead of the configured ones
        #[arg(value_name = "COMMUNITY")]
        communities: Vec<String>,
    },
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

/// Stop the supervisor on Ctrl-C or SIGTERM.
fn spawn_signal_listener(stop: StopHandle) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    log::warn!("SIGTERM handler unavailable: {e}");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        log::warn!("shutdown requested");
        stop.stop();
    });
}

fn pick(overrides: Vec<String>, config: &Config) -> Vec<String> {
    if overrides.is_empty() {
        config.communities.clone()
    } else {
        overrides
    }
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = Config::load(&cli.config).map_err(|e| {
        log::error!("Cannot load {}: {}", cli.config.display(), e);
        e
    })?;
    log::info!("Loaded configuration from {}", cli.config.display());

    let store = Arc::new(LocalStore::new(&config.store.root));

    match cli.command {
        Command::Fetch {
            once,
            continuous,
            communities,
        } => {
            if once {
                config.supervisor.mode = RunMode::Once;
            } else if continuous {
                config.supervisor.mode = RunMode::Continuous;
            }
            config.validate()?;

            let communities = pick(communities, &config);
            let sources = Sources::connect(&config)?;
            let (stop, shutdown) = StopSignal::channel();
            spawn_signal_listener(stop);

            match pipeline::run_fetch(&config, &communities, store, &sources, &shutdown).await {
                Ok(_) => {}
                Err(AppError::Interrupted) => log::info!("Stopped on request"),
                Err(e) => return Err(e),
            }
        }

        Command::Validate => {
            log::info!("Validating configuration...");

            if let Err(e) = config.validate() {
                log::error!("Config validation failed: {}", e);
                return Err(e);
            }
            log::info!(
                "✓ Config OK ({} communities, loaders: {})",
                config.communities.len(),
                config
                    .enabled_loaders()
                    .iter()
                    .map(|k| k.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        Command::Info => {
            log::info!("Store directory: {}", store.root().display());

            let keys = store.list_collections().await?;
            if keys.is_empty() {
                log::info!("No collections found yet.");
            }
            for key in keys {
                let info = store.collection_info(&key).await?;
                let table = match &info.table {
                    Some(t) => format!("v{} with {} rows, written {}", t.version, t.rows, t.written_at),
                    None => "no table".to_string(),
                };
                let last_run = info
                    .metadata
                    .get("last_run")
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "-".to_string());
                log::info!("{key}: {table}, last_run {last_run}");
            }
        }

        Command::Export { communities } => {
            config.validate()?;
            let communities = pick(communities, &config);
            let summary = pipeline::run_export(&config, &communities, store.as_ref()).await?;
            log::info!(
                "Exported {} rows in {} resources to {}",
                summary.rows,
                summary.resources,
                summary.package.display()
            );
        }
    }

    log::info!("Done!");

    Ok(())
}
