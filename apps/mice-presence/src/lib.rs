#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Mice Presence - Shared Canvas Liveness
//!
//! Client-side presence protocol for "mice on a shared canvas". Every client
//! owns one record in a shared, replicated collection, announces itself,
//! pushes throttled position updates, and evicts peer records it believes
//! are abandoned. Replication, merging and transport belong to the store
//! behind the `PeerStore` port.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core presence types and rules
//!   - `peer`: Peer ids, records, partial updates, the glyph alphabet
//!   - `presence`: Lifecycle state machine and abandonment policy
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Peer store, clock and metrics interfaces
//!   - `services`: Presence manager, sweep schedule
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `store`: In-memory peer store shared by local clients
//!   - `config`: Environment configuration
//!   - `metrics`: Prometheus adapter for the metrics port
//!   - `health`: Health, introspection and metrics HTTP endpoint
//!   - `simulation`: Simulated pointers for the demo binary
//!
//! # Data Flow
//!
//! ```text
//!  pointer ──► move_to ──► throttle (30ms) ──► set(x, y)  ──┐
//!                     └──► debounce (150ms) ──► add(id) ────┤
//!                                                          ▼
//!  sweep (60-120s) ──► remove(stale ids) ──────────►  PeerStore
//!                                                          │
//!  PeerSet ◄──────────────── subscribe(snapshots) ◄────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core presence types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::peer::{
    Glyph, LocalIdentity, MICE_COLLECTION, PeerFields, PeerId, PeerRecord, PeerSet,
};
pub use domain::presence::{AbandonmentPolicy, PresenceStatus, TransitionError};

// Ports
pub use application::ports::{
    Clock, ManualClock, NoopMetrics, PeerStore, PresenceMetrics, SnapshotStream, StoreError,
    SubscriptionQuery, SystemClock, WriteKind,
};

// Services
pub use application::services::{
    PresenceConfig, PresenceError, PresenceEvent, PresenceHandle, PresenceManager, SweepSchedule,
};

// Store adapter
pub use infrastructure::store::{MemoryBackend, MemoryConnection};

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, DemoConfig, PresenceSettings, ServerSettings, SimulationSettings,
};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::{PrometheusMetrics, init_metrics};

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
