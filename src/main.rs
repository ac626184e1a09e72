use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::sync::watch;
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use chronos_sync::storage::{LocalStore, OutboxStore};
use chronos_sync::{
    ConnectivityMonitor, HttpRemoteStore, Outbox, RemoteStore, RetryPolicy, SledStore, SyncConfig,
    SyncEngine,
};

fn init_logging() {
    let _ = LogTracer::init();

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339());

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

#[derive(Parser)]
#[command(name = "chronos-sync")]
#[command(about = "Offline-first sync agent: local cache, remote reconciliation and outbox")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the sync engine until interrupted
    Run {
        /// JSON configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Override the configured data directory
        #[arg(short, long)]
        data_dir: Option<String>,

        /// Override the configured remote base URL
        #[arg(short, long)]
        remote: Option<String>,
    },

    /// Inspect or repair the outbox of a stopped agent
    Outbox {
        #[command(subcommand)]
        cmd: OutboxCmd,
    },

    /// Print dirty records per collection and the outbox backlog
    Status {
        /// Directory holding the local store
        #[arg(short, long, default_value = "data")]
        data_dir: String,
    },
}

#[derive(Subcommand)]
enum OutboxCmd {
    /// List undelivered items in delivery order
    Pending {
        #[arg(short, long, default_value = "data")]
        data_dir: String,
    },
    /// Drop an item whatever its state
    Purge {
        id: u64,
        #[arg(short, long, default_value = "data")]
        data_dir: String,
    },
    /// Reset the attempt counter of an item
    Requeue {
        id: u64,
        #[arg(short, long, default_value = "data")]
        data_dir: String,
    },
}

fn open_store(data_dir: &str) -> Result<Arc<SledStore>> {
    let store = SledStore::open(data_dir)
        .with_context(|| format!("opening local store at '{data_dir}' (is an agent running?)"))?;
    Ok(Arc::new(store))
}

async fn run(config: SyncConfig) -> Result<()> {
    if config.collections.is_empty() {
        bail!("no collections configured");
    }

    let store = open_store(&config.data_dir)?;

    let mut http = HttpRemoteStore::new(&config.remote_url, config.request_timeout())
        .context("building HTTP client")?;
    if let Some(token) = config.auth_token.clone() {
        http = http.with_auth_token(token);
    }
    let remote: Arc<dyn RemoteStore> = Arc::new(http);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = ConnectivityMonitor::new(Arc::clone(&remote), config.connectivity_probe_interval());
    let signal = monitor.signal();
    let monitor_task = tokio::spawn(monitor.run(shutdown_rx));

    let outbox = Outbox::new(
        store.clone(),
        Arc::clone(&remote),
        RetryPolicy::new(config.outbox_max_attempts, config.outbox_base_delay()),
    )
    .with_dead_letter_after(config.outbox_dead_letter_after);

    let engine = Arc::new(
        SyncEngine::new(store.clone(), remote, config.clone())
            .with_outbox(Arc::new(outbox))
            .with_connectivity(signal),
    );

    info!(
        "Starting sync agent: remote={}, data_dir={}, collections={:?}",
        config.remote_url, config.data_dir, config.collections
    );
    engine.start().await;

    let mut status = engine.status();
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("waiting for Ctrl-C")?;
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                match &current.last_error {
                    Some(err) if !current.is_syncing => warn!("{}: {err}", current.summary()),
                    _ => info!("{} (pending outbox: {})", current.summary(), current.pending_outbox),
                }
            }
        }
    }

    info!("Shutting down");
    engine.stop().await;
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(config.shutdown_timeout(), monitor_task).await.is_err() {
        warn!("Connectivity monitor did not stop in time");
    }
    store.flush().await.context("flushing local store")?;
    Ok(())
}

async fn status(data_dir: &str) -> Result<()> {
    let store = open_store(data_dir)?;

    let mut collections = store.collections();
    collections.sort();
    for collection in collections {
        let records = LocalStore::list(&*store, &collection).await?;
        let dirty = records.iter().filter(|r| r.is_dirty).count();
        let deleted = records.iter().filter(|r| r.is_deleted).count();
        println!("{collection}: {} record(s), {dirty} dirty, {deleted} tombstone(s)", records.len());
    }
    println!("outbox: {} pending", store.pending_count().await?);
    Ok(())
}

async fn outbox(cmd: OutboxCmd) -> Result<()> {
    match cmd {
        OutboxCmd::Pending { data_dir } => {
            let store = open_store(&data_dir)?;
            for item in store.pending().await? {
                println!(
                    "{}\t{}\tcreated={}\tattempts={}\t{} byte(s)",
                    item.id,
                    item.topic,
                    item.created_at_ms,
                    item.attempts,
                    item.payload.len()
                );
            }
        }
        OutboxCmd::Purge { id, data_dir } => {
            let store = open_store(&data_dir)?;
            if !OutboxStore::remove(&*store, id).await? {
                bail!("outbox item {id} not found");
            }
            store.flush().await?;
            println!("Purged outbox item {id}");
        }
        OutboxCmd::Requeue { id, data_dir } => {
            let store = open_store(&data_dir)?;
            store.reset_attempts(id).await?;
            store.flush().await?;
            println!("Requeued outbox item {id}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            remote,
        } => {
            let mut cfg = SyncConfig::from_file(&config)
                .with_context(|| format!("reading config {}", config.display()))?;
            if let Some(dir) = data_dir {
                cfg.data_dir = dir;
            }
            if let Some(url) = remote {
                cfg.remote_url = url;
            }
            run(cfg).await
        }
        Command::Outbox { cmd } => outbox(cmd).await,
        Command::Status { data_dir } => status(&data_dir).await,
    }
}
