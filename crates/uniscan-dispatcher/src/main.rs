//! `UniScan` Dispatcher
//!
//! Lease-based dispatch scheduler. Run as many instances as needed against
//! the same database.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use uniscan_core::config::{default_database_path, load_config};
use uniscan_core::tracing_init::{default_filter, init_tracing};
use uniscan_dispatcher::config::generate_instance_id;
use uniscan_dispatcher::http::router;
use uniscan_dispatcher::{HttpDispatchTarget, Scheduler, SchedulerConfig};
use uniscan_store::DeliveryStore;

#[derive(Parser, Debug)]
#[command(name = "uniscan-dispatcher")]
#[command(version, about = "UniScan dispatch scheduler")]
struct Args {
    /// Address for the enqueue and health endpoints.
    #[arg(long, env = "UNISCAN_DISPATCHER_ADDR", default_value = "127.0.0.1:45446")]
    addr: SocketAddr,

    /// Gateway base URL.
    #[arg(long, env = "UNISCAN_GATEWAY_URL", default_value = "http://127.0.0.1:45444")]
    gateway_url: String,

    /// Path to the shared SQLite database.
    #[arg(long, env = "UNISCAN_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Settings file (defaults to the global settings.json).
    #[arg(long, env = "UNISCAN_CONFIG")]
    config: Option<PathBuf>,

    /// Shared secret for internal endpoints.
    #[arg(long, env = "UNISCAN_INTERNAL_TOKEN")]
    internal_token: Option<String>,

    /// Lease owner id (generated when omitted).
    #[arg(long, env = "UNISCAN_INSTANCE_ID")]
    instance_id: Option<String>,

    /// Worker pool size (overrides the settings file).
    #[arg(long)]
    concurrency: Option<usize>,

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
    init_tracing(&default_filter("uniscan_dispatcher", &args.log_level), args.log_json);

    let mut config = load_config(args.config.as_deref())?;
    if let Some(n) = args.concurrency {
        config.dispatch.concurrency = n;
    }
    config.dispatch.validate()?;

    let instance_id = args.instance_id.unwrap_or_else(generate_instance_id);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %args.addr,
        instance_id = %instance_id,
        gateway_url = %args.gateway_url,
        "Starting uniscan-dispatcher"
    );

    let db_path = args.db_path.unwrap_or_else(default_database_path);
    info!(path = %db_path.display(), "Opening delivery store");
    let store = DeliveryStore::open(&db_path).await?;

    if args.internal_token.is_none() {
        warn!("No internal token configured, gateway calls are unauthenticated");
    }

    // A dispatch must resolve well within its lease.
    let timeout = (config.dispatch.lease() / 2).max(Duration::from_secs(1));
    let target = HttpDispatchTarget::new(&args.gateway_url, args.internal_token.clone(), timeout)?;
    let scheduler = Scheduler::new(
        store,
        Arc::new(target),
        SchedulerConfig {
            instance_id,
            policy: config.dispatch,
        },
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let loop_scheduler = scheduler.clone();
    let lease_loop = tokio::spawn(async move {
        loop_scheduler.run(shutdown_rx).await;
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

    info!(addr = %args.addr, "Dispatcher ready");

    tokio::select! {
        result = axum::serve(listener, router(scheduler, args.internal_token)) => {
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
    let _ = lease_loop.await;

    info!("Dispatcher stopped");
    Ok(())
}
