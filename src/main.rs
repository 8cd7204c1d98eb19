//! Occupancy poller - polls a facility occupancy API and serves a live dashboard
//!
//! Module structure:
//! - `domain/` - Core types (Reading)
//! - `io/` - External interfaces (upstream API, SQLite store, dashboard HTTP)
//! - `services/` - Polling scheduler, business hours, retention, live fan-out
//! - `infra/` - Infrastructure (Config, Metrics, Clock)

use anyhow::Context;
use clap::Parser;
use occupancy_poller::infra::{Config, Metrics, SystemClock};
use occupancy_poller::io::{HttpFetcher, SqliteStore};
use occupancy_poller::services::{BusinessHours, PollingScheduler, SchedulerTiming};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Occupancy poller - live and historical room occupancy
#[derive(Parser, Debug)]
#[command(name = "occupancy-poller", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

/// Resolve on Ctrl-C or SIGTERM
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "sigterm_handler_unavailable");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default: INFO, use RUST_LOG=debug for per-reading visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), git_hash = env!("GIT_HASH"), "occupancy-poller starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        site_name = %config.site_name(),
        upstream_url = %config.upstream_url(),
        opens_at = %config.opens_at(),
        closes_at = %config.closes_at(),
        fetch_period_secs = %config.fetch_period_secs(),
        error_delay_secs = %config.error_delay_secs(),
        flush_interval_secs = %config.flush_interval_secs(),
        storage_path = %config.storage_path(),
        dashboard_port = %config.dashboard_port(),
        "config_loaded"
    );

    let hours = BusinessHours::new(config.opens_at(), config.closes_at())?;
    let clock = Arc::new(SystemClock);
    let store = SqliteStore::open(config.storage_path())
        .with_context(|| format!("failed to open store at {}", config.storage_path()))?;
    let fetcher = HttpFetcher::new(&config, clock.clone()).context("failed to build upstream client")?;
    let metrics = Arc::new(Metrics::new());

    let scheduler = Arc::new(PollingScheduler::new(
        fetcher,
        store,
        hours,
        SchedulerTiming::from_config(&config),
        clock,
        metrics,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    scheduler.start()?;

    // Dashboard HTTP server (if port > 0)
    let dashboard_port = config.dashboard_port();
    if dashboard_port > 0 {
        let bind_address = config.dashboard_bind_address().to_string();
        let dashboard_scheduler = scheduler.clone();
        let site_id = config.site_id().to_string();
        let dashboard_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = occupancy_poller::io::dashboard::start_dashboard_server(
                &bind_address,
                dashboard_port,
                dashboard_scheduler,
                site_id,
                dashboard_shutdown,
            )
            .await
            {
                tracing::error!(error = %e, "dashboard server error");
            }
        });
    }

    // Periodic metrics summary
    let metrics_interval = config.metrics_interval_secs();
    let mut metrics_shutdown = shutdown_rx.clone();
    let reporter = scheduler.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            tokio::select! {
                _ = interval.tick() => reporter.report_metrics().log(),
                _ = metrics_shutdown.changed() => {
                    if *metrics_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    wait_for_signal().await;
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);
    scheduler.shutdown().await;

    info!("occupancy-poller shutdown complete");
    Ok(())
}
