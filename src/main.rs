//! Rewards Engine Daemon
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults
//! rewards-engine
//!
//! # Start with custom config
//! rewards-engine --config /path/to/config.toml
//!
//! # Start with custom HTTP port and storage directory
//! rewards-engine --http-port 8096 --storage-dir /data/rewards
//! ```
//!
//! On Unix, `SIGHUP` re-reads the config file and swaps in its rules,
//! badges and streak triggers without a restart.

use clap::Parser;
use rewards_engine::services::spawn_logging_listener;
use rewards_engine::{Config, EventBus, HttpServer, RewardsEngine, SqliteRepository};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rewards-engine")]
#[command(about = "Trigger-driven rewards engine - points, streaks, badges and tiers")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "REWARDS_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "REWARDS_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// HTTP API port
    #[arg(long, env = "REWARDS_HTTP_PORT")]
    http_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("rewards_engine=info".parse()?))
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    config.validate()?;

    info!(
        storage_dir = %config.storage_dir.display(),
        http_port = config.http_port,
        db_connections = config.db_connections,
        "Starting rewards-engine"
    );

    // Ensure storage directory exists
    tokio::fs::create_dir_all(&config.storage_dir).await?;

    // Save default config if it doesn't exist
    let config_path = args.config.clone().unwrap_or_else(|| config.config_path());
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let repo = Arc::new(SqliteRepository::open(&config.storage_dir, config.db_connections)?);
    let events = Arc::new(EventBus::new());
    let listener = spawn_logging_listener(Arc::clone(&events));

    let engine = Arc::new(RewardsEngine::new(
        repo,
        config.catalog()?,
        config.tier_table()?,
        config.engine.clone(),
        events,
    )?);

    let http_addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    let http_server = Arc::new(HttpServer::new(Arc::clone(&engine), http_addr));

    info!("HTTP API available at http://{}", http_addr);
    info!("Endpoints:");
    info!("  POST /trigger                  - Process a trigger");
    info!("  GET  /users/{{id}}/summary       - Points, level, tier, badges");
    info!("  GET  /users/{{id}}/transactions  - Ledger history");
    info!("  GET  /users/{{id}}/badges        - Badge awards");
    info!("  GET  /users/{{id}}/verify        - Ledger consistency check");
    info!("  POST /users/{{id}}/reconcile     - Rebuild aggregate from ledger");
    info!("  GET  /badges                   - Badge catalog");
    info!("  GET  /leaderboard              - Top users by points");
    info!("  GET  /reconciliation           - Users awaiting reconciliation");
    info!("  GET  /health                   - Health check");

    #[cfg(unix)]
    let reload = tokio::spawn(reload_on_hangup(Arc::clone(&engine), config_path));

    info!("Press Ctrl+C to stop.");

    // Handle shutdown signal
    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    tokio::select! {
        result = http_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown => {}
    }

    #[cfg(unix)]
    reload.abort();
    listener.abort();

    let pending = engine.pending_reconciliations();
    if !pending.is_empty() {
        info!(users = pending.len(), "Users still awaiting reconciliation at shutdown");
    }

    Ok(())
}

/// Reload the catalog from the config file on every SIGHUP
#[cfg(unix)]
async fn reload_on_hangup(engine: Arc<RewardsEngine>, config_path: PathBuf) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Could not install SIGHUP handler, catalog reload disabled");
            return;
        }
    };

    while hangup.recv().await.is_some() {
        info!(path = %config_path.display(), "SIGHUP received, reloading catalog");
        let config = match Config::load(&config_path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "Failed to read config, keeping current catalog");
                continue;
            }
        };
        if let Err(e) = engine.reload_catalog(config.rules, &config.streak_triggers, config.badges) {
            error!(error = %e, "Rejected new catalog, keeping current one");
        }
    }
}
