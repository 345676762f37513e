//! # Tether - fleet control plane
//!
//! Node agents (Reeve) join a single coordinator through a sealed
//! handshake, relay their endpoints and keys to it, and receive the
//! fleet's endpoints, keys and catalog back on every tick.
//!
//! ## Architecture
//! ```text
//! Reeve ──/register──▶ Registry   (handshake, flock key)
//! Reeve ──signed────▶ Steward ──▶ Ingest ──tick──▶ SQLite
//!   ▲                                         │
//!   └───────────── signed pushes ◀── Fanout ◀─┘
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod agent;
mod config;
mod coordinator;
mod flock;
mod handshake;
mod routes;
mod rpc;
mod services;
mod signing;

#[cfg(test)]
mod scenarios;

use config::{AppConfig, Overrides};
use flock::FlockKey;
use services::ServiceContext;

/// Tether - fleet membership and credential propagation
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/tether.toml", env = "TETHER_CONFIG")]
    config: String,

    /// Services to run, comma separated (overrides config)
    #[arg(long, value_delimiter = ',')]
    services: Option<Vec<String>>,

    /// Agent listen address (overrides config)
    #[arg(short, long, env = "LISTEN_ADDR")]
    listen: Option<String>,

    /// Steward listen address (overrides config)
    #[arg(long)]
    coordinator_listen: Option<String>,

    /// Registry address, listened on by the coordinator and joined by the agent
    #[arg(long)]
    registry_listen: Option<String>,

    /// Data directory (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Horde this node belongs to (overrides config)
    #[arg(long)]
    horde: Option<String>,

    /// Flock key text (overrides config)
    #[arg(long, env = "TETHER_FLOCK_KEY", hide_env_values = true)]
    flock_key: Option<String>,

    /// Print a fresh flock key and exit
    #[arg(long, default_value = "false")]
    new_flock_key: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            services: self.services.clone(),
            data_dir: self.data_dir.clone(),
            agent_listen: self.listen.clone(),
            registry_addr: self.registry_listen.clone(),
            steward_addr: self.coordinator_listen.clone(),
            horde: self.horde.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    if args.new_flock_key {
        println!("{}", FlockKey::generate().to_text());
        return Ok(());
    }

    init_logging(&args.log_level, args.json_logs)?;
    info!("🔗 Starting Tether v{}", env!("CARGO_PKG_VERSION"));

    let mut config = AppConfig::load(&args.config, &args.overrides())?;
    if let Some(flock_key) = &args.flock_key {
        config.flock_key = Some(flock_key.clone());
    }
    info!(services = ?config.services, data_dir = %config.data_dir.display(), "📋 Configuration loaded from {}", args.config);

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data directory {}", config.data_dir.display()))?;
    let ctx = ServiceContext {
        placement: config.placement()?,
        flock: config.flock()?,
        config,
    };

    let running = match services::start_all(&ctx, &ctx.config.services).await {
        Ok(running) => running,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Startup failed");
            return Err(e);
        }
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to install Ctrl+C handler")?;
    info!("🛑 Shutdown signal received");

    services::stop_all(running).await;
    info!("👋 Tether shutdown complete");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}
