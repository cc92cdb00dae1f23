use anyhow::{Context, Result};
use clap::Parser;
use galleon_common::config::{ConfigLoader, ResilienceConfig};
use galleon_common::utils::TimeUtils;
use galleon_common::GALLEON_PROTOCOL_VERSION;
use galleon_resilience::{ClusterSpec, Collaborators, InMemoryCluster, LoggingAlarmSink, ResilienceEngine};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "galleon-resilience")]
#[command(about = "Keeps file replica counts within their pool group bounds")]
struct Cli {
    /// Configuration file path (.toml, .yaml or .json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Cluster description served by the in-memory collaborators
    #[arg(long)]
    cluster: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info", value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_level: String,

    /// Enable debug logging (overrides --log-level)
    #[arg(short, long)]
    debug: bool,

    /// Run one full scan pass right after start-up
    #[arg(long)]
    scan_on_start: bool,

    /// How often to log the operation counters
    #[arg(long, default_value = "5m", value_parser = TimeUtils::parse_duration)]
    stats_interval: Duration,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = if cli.debug {
        tracing::Level::DEBUG
    } else {
        cli.log_level.parse().unwrap_or(tracing::Level::INFO)
    };
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting GalleonFS Resilience");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Protocol version: {}", GALLEON_PROTOCOL_VERSION);

    // Load configuration
    let config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            ConfigLoader::load_from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?
        }
        None => ResilienceConfig::load()?,
    };

    let spec = match &cli.cluster {
        Some(path) => {
            info!("Loading cluster description from {}", path.display());
            ClusterSpec::load(path).with_context(|| format!("failed to load {}", path.display()))?
        }
        None => {
            warn!("No cluster description given, starting with an empty cluster");
            ClusterSpec::default()
        }
    };
    let cluster = Arc::new(InMemoryCluster::from_spec(spec)?);
    info!(
        pools = cluster.pool_count(),
        groups = cluster.group_count(),
        files = cluster.file_count(),
        "in-memory cluster ready"
    );

    let collaborators = Collaborators {
        alarms: Arc::new(LoggingAlarmSink),
        ..Collaborators::from_single(cluster.clone())
    };
    let engine = Arc::new(ResilienceEngine::new(config, collaborators)?);
    engine.spawn_listener(cluster.subscribe());
    engine.start();

    if cli.scan_on_start {
        let started = engine.scan_all().await?;
        info!(started, "start-up scan dispatched");
    }

    let admin = engine.admin();
    let mut stats = tokio::time::interval(cli.stats_interval);
    stats.tick().await;

    loop {
        tokio::select! {
            _ = stats.tick() => {
                info!("operation counters\n{}", admin.counters());
            }
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "failed to listen for shutdown signal");
                }
                info!("Received shutdown signal");
                break;
            }
        }
    }

    engine.shutdown().await;
    info!("final counters\n{}", admin.counters());
    Ok(())
}
