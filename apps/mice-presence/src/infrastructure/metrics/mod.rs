//! Prometheus Metrics Module
//!
//! Exposes presence metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Writes**: Store mutations issued by presence managers, by kind
//! - **Sweeps**: Abandonment sweeps run and peers evicted
//! - **Peers**: Size of each client's observed peer set
//! - **Connectivity**: Per-client connection state
//!
//! Recording without an installed recorder is a no-op, so library users and
//! tests never need to call `init_metrics`.
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::application::ports::{PresenceMetrics, WriteKind};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "mice_presence_writes_total",
        "Store mutations issued by presence managers"
    );
    describe_counter!(
        "mice_presence_write_errors_total",
        "Store mutations that the store rejected"
    );
    describe_counter!(
        "mice_presence_moves_coalesced_total",
        "Pointer moves folded into an already scheduled write"
    );

    describe_counter!("mice_presence_sweeps_total", "Abandonment sweeps run");
    describe_counter!(
        "mice_presence_evictions_total",
        "Peer records evicted as abandoned"
    );
    describe_histogram!(
        "mice_presence_sweep_seconds",
        "Time spent in one abandonment sweep"
    );

    describe_gauge!(
        "mice_presence_peers",
        "Number of peers in a client's observed peer set"
    );
    describe_gauge!(
        "mice_presence_connected",
        "Whether a client's store connection is up (1) or down (0)"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Prometheus-backed presence metrics.
///
/// Recording without an installed recorder is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusMetrics;

impl PresenceMetrics for PrometheusMetrics {
    fn record_write(&self, kind: WriteKind) {
        counter!("mice_presence_writes_total", "kind" => kind.as_str()).increment(1);
    }

    fn record_write_error(&self, kind: WriteKind) {
        counter!("mice_presence_write_errors_total", "kind" => kind.as_str()).increment(1);
    }

    fn record_move_coalesced(&self) {
        counter!("mice_presence_moves_coalesced_total").increment(1);
    }

    fn record_sweep(&self, evicted: usize, duration: Duration) {
        counter!("mice_presence_sweeps_total").increment(1);
        counter!("mice_presence_evictions_total").increment(evicted as u64);
        histogram!("mice_presence_sweep_seconds").record(duration.as_secs_f64());
    }

    #[allow(clippy::cast_precision_loss)]
    fn set_peers(&self, client: &str, count: usize) {
        gauge!("mice_presence_peers", "client" => client.to_string()).set(count as f64);
    }

    fn set_connected(&self, client: &str, connected: bool) {
        gauge!("mice_presence_connected", "client" => client.to_string())
            .set(if connected { 1.0 } else { 0.0 });
    }
}

// =============================================================================
// Tests
// =============================================================================
