//! EdgeSync CLI - Command line interface for the edge sync engine.
//!
//! This tool probes the cloud, polls for rule updates, inspects and feeds
//! the persisted delivery queue, and runs the engine in the foreground.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use edgesync_common::{Error, QueueItemType, SyncConfig};
use edgesync_sync::{
    ConnectivityMonitor, EdgeSyncEngine, EnqueueOptions, FileRuleCache, HttpCloudClient,
    PollOutcome, RuleUpdater, StateDirLock,
};

#[derive(Parser)]
#[command(name = "edgesync")]
#[command(about = "EdgeSync - Offline-first sync for edge agents")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// JSON configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the rule cache and queue snapshot.
    #[arg(short, long, global = true)]
    state_dir: Option<PathBuf>,

    /// Cloud base URL, overriding the configuration file.
    #[arg(long, global = true)]
    cloud_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe the cloud health endpoint once.
    Probe,

    /// Poll once for a rule update.
    Poll,

    /// Show rules, staleness and queue state.
    Status,

    /// Add an item to the persisted delivery queue.
    Enqueue {
        /// Item type: "assurance_event", "human_feedback", or "outcome".
        #[arg(short = 't', long = "type")]
        item_type: String,

        /// JSON payload.
        #[arg(short, long)]
        payload: String,

        /// Priority; derived from the payload when omitted.
        #[arg(long)]
        priority: Option<u32>,

        /// Item id; generated when omitted.
        #[arg(long)]
        id: Option<String>,
    },

    /// Run the engine until Ctrl-C, printing events.
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(cli.config.as_deref(), cli.cloud_url)?;
    let state_dir = resolve_state_dir(cli.state_dir)?;

    match cli.command {
        Commands::Probe => cmd_probe(config).await,

        Commands::Poll => cmd_poll(config, &state_dir).await,

        Commands::Status => cmd_status(config, &state_dir).await,

        Commands::Enqueue {
            item_type,
            payload,
            priority,
            id,
        } => cmd_enqueue(config, &state_dir, &item_type, &payload, priority, id).await,

        Commands::Run => cmd_run(config, &state_dir).await,
    }
}

fn load_config(path: Option<&Path>, cloud_url: Option<String>) -> Result<SyncConfig> {
    let mut config = match path {
        Some(path) => SyncConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SyncConfig::default(),
    };
    if let Some(url) = cloud_url {
        config.cloud_base_url = url;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn resolve_state_dir(state_dir: Option<PathBuf>) -> Result<PathBuf> {
    match state_dir {
        Some(dir) => Ok(dir),
        None => dirs::data_local_dir()
            .map(|dir| dir.join("edgesync"))
            .context("No state directory given and no local data directory found"),
    }
}

/// Explain a locked state directory in terms of the running engine.
fn state_error(err: Error) -> anyhow::Error {
    match err {
        Error::StateLocked(dir) => anyhow::anyhow!(
            "State directory {} is held by a running `edgesync run`; stop it first",
            dir
        ),
        other => other.into(),
    }
}

fn open_engine(config: SyncConfig, state_dir: &Path) -> Result<EdgeSyncEngine> {
    EdgeSyncEngine::open(config, state_dir).map_err(state_error)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Probe the cloud once.
async fn cmd_probe(config: SyncConfig) -> Result<()> {
    let config = Arc::new(config);
    let client = Arc::new(HttpCloudClient::new(&config)?);
    let monitor = ConnectivityMonitor::new(config.clone(), client, Default::default());

    info!("Probing {}", config.cloud_base_url);
    let state = monitor.check_connectivity().await;
    print_json(&state)?;
    if !state.is_online() {
        anyhow::bail!("Cloud is {}", state.status);
    }
    Ok(())
}

/// Poll once against the cached rules.
async fn cmd_poll(config: SyncConfig, state_dir: &Path) -> Result<()> {
    let _lock = StateDirLock::acquire(state_dir).map_err(state_error)?;
    let config = Arc::new(config);
    let client = Arc::new(HttpCloudClient::new(&config)?);
    let cache = Arc::new(FileRuleCache::new(
        state_dir.join(edgesync_sync::engine::RULES_FILE),
    ));
    let updater = Arc::new(RuleUpdater::new(config, client, cache, Default::default()));

    if let Some(version) = updater
        .load_from_cache()
        .await
        .context("Failed to read rule cache")?
    {
        info!("Current rules: {}", version);
    }

    match updater.poll_for_updates().await {
        PollOutcome::Updated(version) => println!("Updated to {}", version),
        PollOutcome::NoChange => println!("No change"),
        PollOutcome::Rejected(reason) => anyhow::bail!("Update rejected: {}", reason),
        PollOutcome::Failed(reason) => anyhow::bail!("Poll failed: {}", reason),
    }
    Ok(())
}

/// Show persisted state without contacting the cloud.
async fn cmd_status(config: SyncConfig, state_dir: &Path) -> Result<()> {
    let engine = open_engine(config, state_dir)?;
    engine
        .load_state()
        .await
        .context("Failed to load persisted state")?;
    print_json(&engine.status().await)
}

/// Append an item to the persisted queue.
async fn cmd_enqueue(
    config: SyncConfig,
    state_dir: &Path,
    item_type: &str,
    payload: &str,
    priority: Option<u32>,
    id: Option<String>,
) -> Result<()> {
    let item_type: QueueItemType = item_type.parse()?;
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("Payload is not valid JSON")?;

    let engine = open_engine(config, state_dir)?;
    engine
        .load_state()
        .await
        .context("Failed to load persisted state")?;

    let options = EnqueueOptions { priority, id };
    let id = engine.enqueue(item_type, payload, options).await?;
    println!("{}", id);
    Ok(())
}

/// Run the engine in the foreground.
async fn cmd_run(config: SyncConfig, state_dir: &Path) -> Result<()> {
    let engine = open_engine(config, state_dir)?;
    let mut events = engine.events().receiver();

    engine.start(None).await.context("Failed to start engine")?;
    info!("Running; press Ctrl-C to stop");

    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Cannot print event: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    engine.shutdown().await?;
    printer.abort();
    Ok(())
}
