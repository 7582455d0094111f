//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Peer store adapters.
pub mod store;

/// Configuration loading.
pub mod config;

/// Health check and introspection HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Simulated pointer drivers for the demo binary.
pub mod simulation;

/// Tracing subscriber and OpenTelemetry integration.
pub mod telemetry;
