//! `opsfabric` - remote job execution fabric.
//!
//! One binary, two roles: `opsfabric agent` runs the endpoint agent on a
//! managed host, `opsfabric server` runs the stateless mediator that
//! multiplexes control-plane requests to agent sessions.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use opsfabric_core::config::{Config, ConfigManager};

mod agent;
mod cli;
mod server;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::default_path().context("resolve default config path")?,
    };
    let manager = ConfigManager::new(config_path).context("load configuration")?;
    let snapshot = manager.get().await;

    // Log level follows the config and reloads with it.
    let (filter, reload_handle) =
        tracing_subscriber::reload::Layer::new(env_filter(&snapshot.logging.level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    manager
        .subscribe(move |cfg: &Config| {
            let _ = reload_handle.reload(env_filter(&cfg.logging.level));
        })
        .await;

    let _watcher = manager.start_watcher();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git = env!("GIT_HASH"),
        "opsfabric starting"
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            cancel.cancel();
        });
    }

    match cli.command {
        Commands::Agent => {
            let (agent, inbound, logs) = agent::Agent::new(Arc::clone(&manager), cancel).await;
            agent.run(inbound, logs).await.context("agent run")?;
        }
        Commands::Server { host, port } => {
            let mut cfg = manager.get().await;
            if let Some(host) = host {
                cfg.server.host = host;
            }
            if let Some(port) = port {
                cfg.server.port = port;
            }
            server::run(cfg, cancel).await.context("server run")?;
        }
    }
    Ok(())
}

fn env_filter(level: &str) -> EnvFilter {
    // RUST_LOG wins over the config file when set.
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if level.is_empty() { "info" } else { level }))
}
