//! Health Endpoint Integration Tests
//!
//! Drives the HTTP router directly with `tower::ServiceExt::oneshot`.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use mice_presence::infrastructure::health::router;
use mice_presence::{
    HealthServerState, LocalIdentity, MICE_COLLECTION, ManualClock, MemoryBackend, PeerId,
    PresenceConfig, PresenceManager,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

async fn started_clients(backend: &MemoryBackend, ids: &[&str]) -> Vec<PresenceManager> {
    let clock = ManualClock::default();
    let mut managers = Vec::new();
    for id in ids {
        let manager = PresenceManager::with_identity(
            PresenceConfig::default(),
            Arc::new(backend.connect()),
            Arc::new(clock.clone()),
            CancellationToken::new(),
            LocalIdentity::new(PeerId::new(*id)),
        );
        manager.start().await.unwrap();
        managers.push(manager);
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    managers
}

fn state_for(managers: &[PresenceManager]) -> Arc<HealthServerState> {
    Arc::new(HealthServerState::new(
        "test-0.0.1".to_string(),
        managers.iter().map(PresenceManager::handle).collect(),
    ))
}

async fn send(state: Arc<HealthServerState>, method: Method, uri: &str) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let response = router(state).oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn send_json(state: Arc<HealthServerState>, method: Method, uri: &str) -> (StatusCode, Value) {
    let (status, body) = send(state, method, uri).await;
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test(start_paused = true)]
async fn liveness_always_ok() {
    let (status, body) = send(state_for(&[]), Method::GET, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");
}

#[tokio::test(start_paused = true)]
async fn readiness_needs_a_connected_client() {
    let (status, _) = send(state_for(&[]), Method::GET, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let backend = MemoryBackend::new(Arc::new(ManualClock::default()));
    let managers = started_clients(&backend, &["A"]).await;
    let (status, body) = send(state_for(&managers), Method::GET, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"READY");
}

#[tokio::test(start_paused = true)]
async fn health_reports_each_client() {
    let backend = MemoryBackend::new(Arc::new(ManualClock::default()));
    let managers = started_clients(&backend, &["A", "B"]).await;

    let (status, json) = send_json(state_for(&managers), Method::GET, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["version"], "test-0.0.1");
    assert_eq!(json["clients"].as_array().unwrap().len(), 2);
    assert_eq!(json["clients"][0]["id"], "A");
    assert_eq!(json["clients"][0]["status"], "online");
    assert_eq!(json["clients"][0]["peers"], 2);
}

#[tokio::test(start_paused = true)]
async fn health_degrades_when_a_client_goes_offline() {
    let backend = MemoryBackend::new(Arc::new(ManualClock::default()));
    let managers = started_clients(&backend, &["A", "B"]).await;
    managers[1].go_offline().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let (status, json) = send_json(state_for(&managers), Method::GET, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["clients"][1]["connected"], false);
}

#[tokio::test(start_paused = true)]
async fn peers_lists_observer_snapshot() {
    let backend = MemoryBackend::new(Arc::new(ManualClock::default()));
    let managers = started_clients(&backend, &["A", "B"]).await;
    let state = state_for(&managers);

    let (status, json) = send_json(Arc::clone(&state), Method::GET, "/peers").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["observer"], "A");

    let peers = json["peers"].as_array().unwrap();
    assert_eq!(peers.len(), 2);
    let own = peers.iter().find(|peer| peer["id"] == "A").unwrap();
    assert_eq!(own["is_self"], true);
    assert!(!own["symbol"].as_str().unwrap().is_empty());

    let (status, json) = send_json(state, Method::GET, "/peers?client=B").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["observer"], "B");
}

#[tokio::test(start_paused = true)]
async fn peers_for_unknown_client_is_not_found() {
    let backend = MemoryBackend::new(Arc::new(ManualClock::default()));
    let managers = started_clients(&backend, &["A"]).await;

    let (status, _) = send(state_for(&managers), Method::GET, "/peers?client=Z").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(start_paused = true)]
async fn debug_evict_removes_other_peers() {
    let backend = MemoryBackend::new(Arc::new(ManualClock::default()));
    let managers = started_clients(&backend, &["A", "B", "C"]).await;

    let (status, json) =
        send_json(state_for(&managers), Method::POST, "/debug/evict/1").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["evicted"].as_array().unwrap().len(), 1);
    assert_ne!(json["evicted"][0], "A");

    let members = backend.members(MICE_COLLECTION);
    assert_eq!(members.len(), 2);
    assert!(members.contains(&PeerId::new("A")));
}

#[tokio::test(start_paused = true)]
async fn debug_evict_while_offline_conflicts() {
    let backend = MemoryBackend::new(Arc::new(ManualClock::default()));
    let managers = started_clients(&backend, &["A", "B"]).await;
    managers[0].go_offline().await.unwrap();

    let (status, _) = send(state_for(&managers), Method::POST, "/debug/evict/1").await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test(start_paused = true)]
async fn metrics_unavailable_without_recorder() {
    let (status, _) = send(state_for(&[]), Method::GET, "/metrics").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
