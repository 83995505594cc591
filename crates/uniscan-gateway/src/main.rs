//! `UniScan` Gateway
//!
//! Realtime WebSocket gateway between scanners and PC agents.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use uniscan_core::config::{default_database_path, load_config};
use uniscan_core::tracing_init::{default_filter, init_tracing};
use uniscan_gateway::notifier::HttpNotifier;
use uniscan_gateway::server::http::router;
use uniscan_gateway::{Gateway, GatewaySettings};
use uniscan_store::DeliveryStore;

#[derive(Parser, Debug)]
#[command(name = "uniscan-gateway")]
#[command(version, about = "UniScan realtime gateway")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "UNISCAN_GATEWAY_ADDR", default_value = "127.0.0.1:45444")]
    addr: SocketAddr,

    /// Path to the shared SQLite database.
    #[arg(long, env = "UNISCAN_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Settings file (defaults to the global settings.json).
    #[arg(long, env = "UNISCAN_CONFIG")]
    config: Option<PathBuf>,

    /// Shared secret for internal endpoints.
    #[arg(long, env = "UNISCAN_INTERNAL_TOKEN")]
    internal_token: Option<String>,

    /// Dispatcher base URL for new-work hints (e.g. `http://127.0.0.1:45446`).
    #[arg(long, env = "UNISCAN_DISPATCHER_URL")]
    dispatcher_url: Option<String>,

    /// Suffix key sent with deliveries (overrides the settings file).
    #[arg(long)]
    suffix_key: Option<String>,

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
    init_tracing(&default_filter("uniscan_gateway", &args.log_level), args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %args.addr,
        "Starting uniscan-gateway"
    );

    let mut config = load_config(args.config.as_deref())?;
    if let Some(key) = args.suffix_key {
        config.gateway.suffix_key = key;
    }

    let db_path = args.db_path.unwrap_or_else(default_database_path);
    info!(path = %db_path.display(), "Opening delivery store");
    let store = DeliveryStore::open(&db_path).await?;

    if args.internal_token.is_none() {
        warn!("No internal token configured, /internal/dispatch is unauthenticated");
    }

    let settings = GatewaySettings {
        gateway: config.gateway,
        dispatch: config.dispatch,
        internal_token: args.internal_token.clone(),
    };
    let mut gateway = Gateway::new(store, settings);
    if let Some(url) = &args.dispatcher_url {
        info!(dispatcher_url = %url, "Scheduler hints enabled");
        gateway = gateway.with_notifier(Arc::new(HttpNotifier::new(
            url,
            args.internal_token.clone(),
        )?));
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let watchdog_gateway = gateway.clone();
    let watchdog = tokio::spawn(async move {
        watchdog_gateway.run_ack_watchdog(shutdown_rx).await;
    });

    let listener = tokio::net::TcpListener::bind(args.addr).await?;

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    info!(addr = %args.addr, "Gateway ready");

    tokio::select! {
        result = axum::serve(listener, router(gateway)) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = watchdog.await;

    info!("Gateway stopped");
    Ok(())
}
