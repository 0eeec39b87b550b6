//! relay-node: runs one event bus node until it is told to stop.
//!
//! Configuration comes from the environment (see `relay_core::config`), with
//! `.env` loaded first. The node logs a health snapshot every probe interval
//! and shuts the bus down once on SIGINT or SIGTERM. If the bus gives up
//! reconnecting it shuts itself down and the process exits with an error.

use std::time::Duration;

use anyhow::Context;
use relay_bus::EventBus;
use relay_core::{logging::redact_url, BusConfig};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r,
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter (default: "relay_node=info,relay_bus=info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "relay_node=info,relay_bus=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let path = std::path::Path::new(path);
        let file_dir = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("relay-node.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );
    guard
}

fn log_health(bus: &EventBus) {
    let health = bus.health();
    let summary = serde_json::to_string(&health).unwrap_or_default();
    if health.is_healthy() {
        info!(
            state = %health.state,
            reconnects = health.reconnects,
            backlog = health.dispatch_backlog,
            pool_in_use = health.pool.in_use,
            health = %summary,
            "Bus health"
        );
    } else {
        warn!(
            state = %health.state,
            probe_ok = ?health.probe_ok,
            silence_ms = ?health.silence_ms,
            reconnects = health.reconnects,
            health = %summary,
            "Bus unhealthy"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = init_logging();

    let config = BusConfig::from_env();
    config.validate().context("invalid relay configuration")?;
    let report_every = config.health.interval.max(Duration::from_secs(1));
    info!(
        backend = %redact_url(&config.backend_url),
        namespace = %config.namespace,
        pool_max_size = config.pool.max_size,
        dispatch_concurrency = config.dispatch.concurrency,
        "Starting relay node"
    );

    let bus = EventBus::connect(config)
        .await
        .context("failed to start event bus")?;
    info!(origin = %bus.origin(), "Relay node running");

    let mut report = interval(report_every);
    report.set_missed_tick_behavior(MissedTickBehavior::Delay);
    report.tick().await;

    let signal = wait_for_shutdown_signal();
    tokio::pin!(signal);

    loop {
        tokio::select! {
            result = &mut signal => {
                if let Err(e) = result {
                    error!(error = %e, "Signal handler failed, shutting down");
                } else {
                    info!("Shutdown signal received");
                }
                bus.shutdown().await;
                info!("Relay node stopped");
                return Ok(());
            }
            _ = report.tick() => {
                if bus.is_shut_down() {
                    // The bus stopped itself after exhausting reconnects.
                    bus.shutdown().await;
                    anyhow::bail!("event bus shut down after losing the backend");
                }
                log_health(&bus);
            }
        }
    }
}
