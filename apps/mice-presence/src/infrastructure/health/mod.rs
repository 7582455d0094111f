//! Health Check and Introspection Endpoint
//!
//! HTTP endpoint for health checks, presence introspection, and Prometheus metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status with per-client presence
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /readyz` - Readiness probe (at least one client connected)
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /peers` - Peer set observed by a client (`?client=<id>`, default: first)
//! - `POST /debug/evict/{count}` - Evict up to `count` peers other than the observer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{PresenceError, PresenceHandle};
use crate::domain::peer::{PeerId, PeerRecord};
use crate::domain::presence::PresenceStatus;
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Presence of each local client.
    pub clients: Vec<ClientInfo>,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every client is online and connected.
    Healthy,
    /// Some clients are offline or disconnected.
    Degraded,
    /// No client is connected.
    Unhealthy,
}

/// One local client's presence.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    /// Local record id, absent after a reset.
    pub id: Option<PeerId>,
    /// Lifecycle status.
    pub status: PresenceStatus,
    /// Last polled connectivity.
    pub connected: bool,
    /// Peers in the client's latest snapshot, self included.
    pub peers: usize,
}

/// A peer as rendered by a client.
#[derive(Debug, Clone, Serialize)]
pub struct PeerView {
    /// Record id.
    pub id: PeerId,
    /// Horizontal position.
    pub x: f64,
    /// Vertical position.
    pub y: f64,
    /// Stored symbol, or the fallback glyph for the id.
    pub symbol: String,
    /// Last write time.
    pub last_update: DateTime<Utc>,
    /// Milliseconds since the last write.
    pub idle_ms: i64,
    /// Whether this is the observing client's own record.
    pub is_self: bool,
}

impl PeerView {
    fn from_record(record: &PeerRecord, observer: Option<&PeerId>, now: DateTime<Utc>) -> Self {
        Self {
            id: record.id.clone(),
            x: record.x,
            y: record.y,
            symbol: record.display_symbol(),
            last_update: record.last_update,
            idle_ms: record.idle_for(now).num_milliseconds(),
            is_self: observer == Some(&record.id),
        }
    }
}

/// Peer listing response.
#[derive(Debug, Clone, Serialize)]
pub struct PeersResponse {
    /// Observing client.
    pub observer: Option<PeerId>,
    /// Peers in the observer's latest snapshot.
    pub peers: Vec<PeerView>,
}

/// Debug eviction response.
#[derive(Debug, Clone, Serialize)]
pub struct EvictResponse {
    /// Ids removed from the collection.
    pub evicted: Vec<PeerId>,
}

/// `GET /peers` query.
#[derive(Debug, Default, Deserialize)]
pub struct PeersQuery {
    /// Observing client id; defaults to the first client.
    pub client: Option<String>,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    clients: Vec<PresenceHandle>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, clients: Vec<PresenceHandle>) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            clients,
        }
    }

    fn observer(&self, client: Option<&str>) -> Option<&PresenceHandle> {
        match client {
            None => self.clients.first(),
            Some(id) => self
                .clients
                .iter()
                .find(|handle| handle.local_id().is_some_and(|local| local.as_str() == id)),
        }
    }
}

/// Build the HTTP router.
#[must_use]
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/peers", get(peers_handler))
        .route("/debug/evict/{count}", post(evict_handler))
        .with_state(state)
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.clients.iter().any(PresenceHandle::is_connected) {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

async fn peers_handler(
    State(state): State<Arc<HealthServerState>>,
    Query(query): Query<PeersQuery>,
) -> Response {
    let Some(observer) = state.observer(query.client.as_deref()) else {
        return (StatusCode::NOT_FOUND, "unknown client").into_response();
    };

    let now = Utc::now();
    let local = observer.local_id();
    let peers = observer
        .peers()
        .iter()
        .map(|record| PeerView::from_record(record, local.as_ref(), now))
        .collect();

    Json(PeersResponse {
        observer: local,
        peers,
    })
    .into_response()
}

async fn evict_handler(
    State(state): State<Arc<HealthServerState>>,
    Path(count): Path<usize>,
) -> Response {
    let Some(observer) = state.observer(None) else {
        return (StatusCode::NOT_FOUND, "no clients").into_response();
    };

    match observer.evict_others(count).await {
        Ok(evicted) => Json(EvictResponse { evicted }).into_response(),
        Err(e @ (PresenceError::Offline | PresenceError::NoIdentity)) => {
            (StatusCode::CONFLICT, e.to_string()).into_response()
        }
        Err(e) => {
            tracing::warn!(error = %e, "Debug eviction failed");
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let clients: Vec<ClientInfo> = state
        .clients
        .iter()
        .map(|handle| ClientInfo {
            id: handle.local_id(),
            status: handle.status(),
            connected: handle.is_connected(),
            peers: handle.peers().len(),
        })
        .collect();

    HealthResponse {
        status: determine_health_status(&clients),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        clients,
    }
}

fn determine_health_status(clients: &[ClientInfo]) -> HealthStatus {
    let connected = clients.iter().filter(|client| client.connected).count();
    let online = clients
        .iter()
        .filter(|client| client.connected && client.status == PresenceStatus::Online)
        .count();

    match connected {
        0 => HealthStatus::Unhealthy,
        _ if online == clients.len() => HealthStatus::Healthy,
        _ => HealthStatus::Degraded,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
