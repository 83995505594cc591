//! `UniScan` PC agent
//!
//! Connects to the gateway, executes delivered barcodes through the input
//! driver and acknowledges each one.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use uniscan_agent::queue::QueueSettings;
use uniscan_agent::{AgentClient, AgentConfig, ExecutionQueue, LogDriver, identity};
use uniscan_core::tracing_init::{default_filter, init_tracing};

#[derive(Parser, Debug)]
#[command(name = "uniscan-agent")]
#[command(version, about = "UniScan PC agent")]
struct Args {
    /// Agent config file (defaults to `<config dir>/uniscan/agent.json`).
    #[arg(long, env = "UNISCAN_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Gateway WebSocket URL (overrides the config file).
    #[arg(long, env = "UNISCAN_SERVER_URL")]
    server_url: Option<String>,

    /// Agent group (overrides the config file).
    #[arg(long)]
    group: Option<String>,

    /// Device name (overrides the config file).
    #[arg(long)]
    device_name: Option<String>,

    /// Log level for UniScan crates when `RUST_LOG` is unset.
    #[arg(long, env = "UNISCAN_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&default_filter("uniscan_agent", &args.log_level), args.log_json);

    let config_path = args.config.unwrap_or_else(AgentConfig::default_path);
    let mut config = AgentConfig::load(&config_path);
    if config.ensure_machine_id(identity::machine_id)
        && let Err(e) = config.save(&config_path)
    {
        warn!(path = %config_path.display(), error = %e, "Failed to persist machine id");
    }
    if let Some(url) = args.server_url {
        config.server_url = url;
    }
    if let Some(group) = args.group {
        config.group = group;
    }
    if let Some(name) = args.device_name {
        config.device_name = name;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        server_url = %config.server_url,
        pc_id = %config.pc_id(),
        "Starting uniscan-agent"
    );

    let settings = QueueSettings {
        target: config.target().cloned(),
        ..QueueSettings::default()
    };
    let (queue, acks, worker) = ExecutionQueue::spawn(Arc::new(LogDriver), settings);
    let mut client = AgentClient::new(config, queue, acks);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let client_task = tokio::spawn(async move {
        client.run(shutdown_rx).await;
    });

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = client_task.await;
    worker.abort();

    info!("Agent stopped");
    Ok(())
}
