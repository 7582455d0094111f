//! Mice Presence Demo Binary
//!
//! Runs several simulated clients against one shared in-memory store, each
//! with its own presence manager, and serves introspection over HTTP.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin mice-presence
//! ```
//!
//! # Environment Variables
//!
//! - `MICE_CLIENTS`: Simulated clients (default: 4)
//! - `MICE_HEALTH_PORT`: Health and introspection HTTP port (default: 8083)
//! - `MICE_WRITE_INTERVAL_MS`: Position write throttle (default: 30)
//! - `MICE_JOIN_DEBOUNCE_MS`: Join debounce (default: 150)
//! - `MICE_STATUS_POLL_MS`: Connectivity poll interval (default: 150)
//! - `MICE_SWEEP_MIN_SECS`: Shortest sweep delay, longest is double (default: 60)
//! - `MICE_ABANDONED_SECS`: Abandonment threshold (default: sweep minimum)
//! - `MICE_SNAPSHOT_LIMIT`: Records per snapshot, 0 = all (default: 10)
//! - `MICE_EAGER_LEAVE`: Remove own record when going offline (default: false)
//! - `MICE_CANVAS_WIDTH` / `MICE_CANVAS_HEIGHT`: Canvas size (default: 800x600)
//! - `MICE_MOVE_INTERVAL_MS`: Simulated pointer event interval (default: 16)
//! - `MICE_TOGGLE_CHANCE`: Per-event chance to toggle online state (default: 0.0005)
//! - `OTEL_ENABLED`: Export spans over OTLP (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use mice_presence::infrastructure::simulation::{PointerDriver, log_events};
use mice_presence::infrastructure::telemetry;
use mice_presence::{
    DemoConfig, HealthServer, HealthServerState, MemoryBackend, PresenceConfig, PresenceManager,
    PrometheusMetrics, SystemClock, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    // Initialize telemetry (tracing + optional OpenTelemetry)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting mice presence demo");

    let _metrics_handle = init_metrics();

    let config = DemoConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();
    let clock = Arc::new(SystemClock);
    let backend = MemoryBackend::new(clock.clone());
    let presence_config = PresenceConfig::from_settings(&config.presence);

    let mut managers = Vec::with_capacity(config.simulation.clients);
    for _ in 0..config.simulation.clients {
        let manager = Arc::new(
            PresenceManager::new(
                presence_config.clone(),
                Arc::new(backend.connect()),
                clock.clone(),
                shutdown_token.clone(),
            )
            .with_metrics(Arc::new(PrometheusMetrics)),
        );
        let id = manager.start().await.context("failed to start presence")?;
        tracing::info!(client = %id, "Client started");

        tokio::spawn(log_events(manager.handle(), shutdown_token.clone()));

        let driver = PointerDriver::new(
            Arc::clone(&manager),
            config.simulation.clone(),
            shutdown_token.clone(),
        );
        tokio::spawn(driver.run());

        managers.push(manager);
    }

    // Spawn health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        managers.iter().map(|manager| manager.handle()).collect(),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!(clients = managers.len(), "Mice presence demo ready");

    await_shutdown(shutdown_token).await;

    let stop_all = futures::future::join_all(managers.iter().map(|manager| manager.shutdown()));
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, stop_all).await.is_err() {
        tracing::warn!("Timed out stopping presence managers");
    }

    tracing::info!("Mice presence demo stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &DemoConfig) {
    tracing::info!(
        clients = config.simulation.clients,
        health_port = config.server.health_port,
        sweep_min_secs = config.presence.sweep_min.as_secs(),
        abandoned_secs = config.presence.abandonment_threshold.as_secs(),
        snapshot_limit = config.presence.snapshot_limit,
        eager_leave = config.presence.eager_leave,
        "Configuration loaded"
    );
    tracing::debug!(
        write_interval_ms = config.presence.write_interval.as_millis(),
        join_debounce_ms = config.presence.join_debounce.as_millis(),
        status_poll_ms = config.presence.status_poll_interval.as_millis(),
        "Presence timings"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
