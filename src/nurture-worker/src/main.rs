//! Nurture worker — runs lead-nurturing sequences for the fitness CRM.
//!
//! Loads configuration, wires the lead and assignment stores, recovers live
//! assignments, then fires due steps and runs the no-response sweep until
//! interrupted.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use nurture_core::config::{AppConfig, StorageBackend};
use nurture_engine::seed;
use nurture_engine::types::{Sequence, TriggerEvent};
use nurture_engine::{
    AssignmentStore, InMemoryAssignmentStore, InMemoryLeadStore, InMemoryUserDirectory,
    NurtureEngine,
};
use nurture_store::RedisAssignmentStore;

#[derive(Parser, Debug)]
#[command(name = "nurture-worker")]
#[command(about = "Lead-nurturing automation worker")]
#[command(version)]
struct Cli {
    /// Optional TOML configuration file
    #[arg(long, env = "NURTURE_CONFIG")]
    config: Option<PathBuf>,

    /// Node identifier (overrides config)
    #[arg(long, env = "NURTURE__NODE_ID")]
    node_id: Option<String>,

    /// Poll interval in milliseconds (overrides config)
    #[arg(long, env = "NURTURE__ENGINE__POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,

    /// Redis URL; also switches the assignment store to Redis
    #[arg(long, env = "NURTURE__REDIS__URL")]
    redis_url: Option<String>,

    /// Prometheus exporter port (overrides config)
    #[arg(long, env = "NURTURE__METRICS__PORT")]
    metrics_port: Option<u16>,

    /// JSON file with the sequences to register at startup
    #[arg(long)]
    sequences: Option<PathBuf>,

    /// Register demo sequences, leads and users
    #[arg(long, default_value_t = false)]
    seed_demo: bool,
}

fn start_metrics(config: &AppConfig) -> anyhow::Result<()> {
    let addr = SocketAddr::new(config.metrics.host.parse()?, config.metrics.port);
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    info!(port = config.metrics.port, "Metrics exporter started");
    Ok(())
}

fn load_sequences(path: &Path) -> anyhow::Result<Vec<Sequence>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading sequences from {}", path.display()))?;
    let sequences: Vec<Sequence> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing sequences in {}", path.display()))?;
    Ok(sequences)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nurture_worker=info,nurture_engine=info,nurture_store=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Nurture worker starting up");

    let mut config = AppConfig::load_from(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(ms) = cli.poll_interval_ms {
        config.engine.poll_interval_ms = ms;
    }
    if let Some(url) = cli.redis_url {
        config.redis.url = url;
        config.storage.backend = StorageBackend::Redis;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.port = port;
    }

    info!(
        node_id = %config.node_id,
        backend = ?config.storage.backend,
        poll_interval_ms = config.engine.poll_interval_ms,
        metrics_port = config.metrics.port,
        "Configuration loaded"
    );

    if let Err(e) = start_metrics(&config) {
        error!(error = %e, "Failed to start metrics exporter");
    }

    let assignments: Arc<dyn AssignmentStore> = match config.storage.backend {
        StorageBackend::Memory => {
            warn!("Using in-memory assignment store; schedules will not survive a restart");
            Arc::new(InMemoryAssignmentStore::new())
        }
        StorageBackend::Redis => Arc::new(
            RedisAssignmentStore::new(&config.redis)
                .await
                .context("Redis connection required for the redis storage backend")?,
        ),
    };

    let leads = Arc::new(InMemoryLeadStore::new());
    let users = Arc::new(InMemoryUserDirectory::new());
    let engine = NurtureEngine::builder(leads.clone(), assignments)
        .with_config(config.engine.clone())
        .with_user_directory(users.clone())
        .build();

    if let Some(path) = cli.sequences.as_deref() {
        for sequence in load_sequences(path)? {
            engine.register_sequence(sequence)?;
        }
    }

    if cli.seed_demo {
        engine.seed_demo_sequences()?;
        for user in seed::demo_users() {
            users.insert(user);
        }
        for lead in seed::demo_leads(chrono::Utc::now()) {
            leads.upsert(lead);
        }
    }

    info!(sequences = engine.list_sequences(None).len(), "Sequences registered");

    engine.recover().await?;

    if cli.seed_demo {
        for lead in seed::demo_leads(chrono::Utc::now()) {
            for event in [TriggerEvent::LeadCreated, TriggerEvent::ScoreThreshold] {
                if let Err(e) = engine.check_triggers(&lead, event).await {
                    warn!(lead_id = %lead.id, error = %e, "Demo trigger check failed");
                }
            }
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = {
        let engine = engine.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { engine.run(rx).await })
    };

    let sweeper = if config.engine.sweep_interval_secs > 0 {
        let engine = engine.clone();
        let rx = shutdown_rx.clone();
        Some(tokio::spawn(async move { engine.run_sweeper(rx).await }))
    } else {
        info!("No-response sweep disabled");
        None
    };

    info!(node_id = %config.node_id, "Nurture worker is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    worker.await?;
    if let Some(sweeper) = sweeper {
        sweeper.await?;
    }

    info!("Nurture worker stopped");
    Ok(())
}
