use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rota_core::{ActionPolicies, RotaConfig};
use rota_scheduler::{Materializer, Reaper, SqliteStore, Store};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// rotad - recurring job scheduler daemon
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, env = "ROTA_CONFIG", global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or upgrade the database schema, then exit
    Migrate,

    /// Run the materializer and reaper loops until interrupted
    Scheduler {
        /// Skip the materializer loop (run the reaper only)
        #[arg(long)]
        no_materializer: bool,

        /// Skip the reaper loop (run the materializer only)
        #[arg(long)]
        no_reaper: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rotad=info,rota_scheduler=info,rota_worker=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = RotaConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(code = e.code(), "Config load failed ({}), using defaults", e);
        RotaConfig::default()
    });

    match cli.command {
        Commands::Migrate => {
            open_store(&config)?;
            info!("database migrations complete");
            Ok(())
        }
        Commands::Scheduler {
            no_materializer,
            no_reaper,
        } => run_scheduler(&config, !no_materializer, !no_reaper).await,
    }
}

async fn run_scheduler(config: &RotaConfig, materialize: bool, reap: bool) -> anyhow::Result<()> {
    if !materialize && !reap {
        anyhow::bail!("nothing to run: both the materializer and the reaper are disabled");
    }

    let policies = Arc::new(ActionPolicies::from_config(&config.actions));
    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    // Each loop gets its own connection.
    if materialize {
        let materializer = Materializer::new(
            open_store(config)?,
            Duration::from_secs(config.scheduler.materializer_interval_secs),
        );
        tasks.push(tokio::spawn(materializer.run(cancel.clone())));
    }
    if reap {
        let reaper = Reaper::new(
            open_store(config)?,
            Arc::clone(&policies),
            Duration::from_secs(config.scheduler.reaper_interval_secs),
        );
        tasks.push(tokio::spawn(reaper.run(cancel.clone())));
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutdown signal received");
    cancel.cancel();

    for task in tasks {
        task.await.context("scheduler loop panicked")?;
    }
    info!("rotad stopped");
    Ok(())
}

fn open_store(config: &RotaConfig) -> anyhow::Result<Arc<dyn Store>> {
    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let store = SqliteStore::open(db_path)
        .with_context(|| format!("failed to open database at {db_path}"))?;
    Ok(Arc::new(store))
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
