//! WishCraft webhook intake server
//!
//! Serves `/webhooks` plus health and operator routes, and drives the retry
//! job queue in the background.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing::{debug, error, info};

use wishcraft_webhooks::config::WishcraftConfig;
use wishcraft_webhooks::handlers::{router, AppState};
use wishcraft_webhooks::store::{MemoryStore, Store};

/// Housekeeping cadence for idempotency keys and rate-limit windows
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// WishCraft webhook intake server
#[derive(Parser, Debug)]
#[command(name = "wishcraft-webhooks")]
#[command(author = "WishCraft Team <team@wishcraft.app>")]
#[command(version)]
#[command(about = "Webhook intake for the WishCraft gift registry")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "3001")]
    port: u16,

    /// Host to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Do not poll the job queue; retries then only run via POST /admin/jobs/run
    #[arg(long)]
    no_job_loop: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = if args.verbose { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let config = WishcraftConfig::from_env().context("failed to load configuration")?;
    debug!(?config, "Configuration loaded");

    let state = Arc::new(AppState::from_config(&config, MemoryStore::shared()));

    if args.no_job_loop {
        info!("Job loop disabled");
    } else {
        tokio::spawn(job_loop(state.clone(), config.job_poll_interval));
    }
    tokio::spawn(cleanup_loop(state.clone()));

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", args.host, args.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!("WishCraft webhook server listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Server stopped");
    Ok(())
}

async fn job_loop<S: Store>(state: Arc<AppState<S>>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        match state.pipeline().executor().process_due_jobs(Utc::now()).await {
            Ok(summary) if summary.claimed > 0 => info!(?summary, "Processed due jobs"),
            Ok(_) => {}
            Err(e) => error!("Job run failed: {}", e),
        }
    }
}

async fn cleanup_loop<S: Store>(state: Arc<AppState<S>>) {
    let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
    loop {
        ticker.tick().await;
        state.pipeline().limiter().cleanup().await;
        let purged = state.pipeline().idempotency().purge_expired().await;
        if purged > 0 {
            debug!(purged, "Purged expired idempotency keys");
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
