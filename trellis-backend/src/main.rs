//! # Trellis Backend
//!
//! Runs the worker pools of a Trellis deployment against the shared job
//! queue, plus the maintenance commands an operator needs around it.
//!
//! - `run` (default): release stale claims, start one worker pool per job
//!   type and stop gracefully on Ctrl-C
//! - `release`: clear every claim after an unclean shutdown
//! - `migrate`: apply the Postgres schema
//! - `status`: print queued and claimed jobs per job type

mod stats;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trellis_config::{ConfigLoad, ConfigLoader, TrellisConfig};
use trellis_core::{
    Orchestrator,
    clock::SystemClock,
    dataset::result_file::FsResultStore,
    modules::{ModuleRegistry, WorkerDescriptor},
    orchestration::job::EnqueueRequest,
    store::{MemoryStore, PostgresStore, Store},
};

use crate::stats::{QUEUE_STATS_INTERVAL_SECS, QUEUE_STATS_JOBTYPE, QueueStatsWorker};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "trellis-backend")]
#[command(about = "Worker backend for the Trellis dataset and job queue")]
struct Cli {
    /// Configuration file (defaults to TRELLIS_CONFIG, then trellis.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Environment file to load before reading variables
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the worker pools and run until interrupted
    Run,
    /// Clear every job claim and exit
    Release,
    /// Apply database migrations and exit
    Migrate,
    /// Print queue occupancy per job type and exit
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_runtime_config(&cli)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Release => release(config).await,
        Command::Migrate => migrate(config).await,
        Command::Status => status(config).await,
    }
}

fn load_runtime_config(cli: &Cli) -> anyhow::Result<TrellisConfig> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = &cli.env_file {
        loader = loader.with_env_file(path);
    }
    let ConfigLoad { config, warnings } = loader.load().context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,trellis_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "configuration file in effect");
    }
    warnings.log();

    Ok(config)
}

async fn open_store(config: &TrellisConfig) -> anyhow::Result<Arc<dyn Store>> {
    match &config.database.url {
        Some(url) => {
            let store = PostgresStore::connect(url)
                .await
                .context("failed to connect to PostgreSQL")?;
            store
                .migrate()
                .await
                .context("failed to apply database migrations")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("no database configured, using the in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn registry() -> anyhow::Result<ModuleRegistry> {
    let registry = ModuleRegistry::builder()
        .worker(WorkerDescriptor::new(QUEUE_STATS_JOBTYPE, Arc::new(QueueStatsWorker)))
        .build()
        .context("invalid module registry")?;
    Ok(registry)
}

async fn orchestrator(config: &TrellisConfig) -> anyhow::Result<Orchestrator> {
    config
        .ensure_directories()
        .with_context(|| format!("failed to create {}", config.result_dir().display()))?;

    let store = open_store(config).await?;
    Ok(Orchestrator::new(
        store,
        Arc::new(FsResultStore::new(config.result_dir().clone())),
        Arc::new(SystemClock),
        Arc::new(registry()?),
        config.orchestrator.clone(),
    ))
}

async fn run(config: TrellisConfig) -> anyhow::Result<()> {
    let orchestrator = orchestrator(&config).await?;
    orchestrator
        .queue()
        .add_job(
            EnqueueRequest::new(QUEUE_STATS_JOBTYPE, "localhost")
                .interval(QUEUE_STATS_INTERVAL_SECS),
        )
        .await
        .context("failed to schedule queue statistics")?;

    let manager = orchestrator.worker_manager();
    manager.start().await.context("failed to start workers")?;
    info!(
        result_dir = %config.result_dir().display(),
        poll_interval_ms = config.orchestrator.queue.poll_interval_ms,
        "trellis backend running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    manager.shutdown().await?;
    Ok(())
}

async fn release(config: TrellisConfig) -> anyhow::Result<()> {
    let orchestrator = orchestrator(&config).await?;
    let released = orchestrator.queue().release_all().await?;
    info!(released, "released job claims");
    Ok(())
}

async fn migrate(config: TrellisConfig) -> anyhow::Result<()> {
    let Some(url) = &config.database.url else {
        bail!("migrate requires DATABASE_URL or [database].url");
    };
    let store = PostgresStore::connect(url)
        .await
        .context("failed to connect to PostgreSQL")?;
    store
        .migrate()
        .await
        .context("failed to apply database migrations")?;
    info!("database migrations applied");
    Ok(())
}

async fn status(config: TrellisConfig) -> anyhow::Result<()> {
    let orchestrator = orchestrator(&config).await?;
    let snapshot = orchestrator.queue().snapshot().await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
