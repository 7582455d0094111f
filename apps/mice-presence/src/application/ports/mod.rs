//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `PeerStore`: The replicated store holding the shared collection
//! - `Clock`: Wall-clock source for abandonment checks
//! - `PresenceMetrics`: Sink for presence counters and gauges

mod clock_port;
mod metrics_port;
mod peer_store_port;

#[cfg(test)]
pub use peer_store_port::MockPeerStore;
pub use clock_port::{Clock, ManualClock, SystemClock};
pub use metrics_port::{NoopMetrics, PresenceMetrics, WriteKind};
pub use peer_store_port::{PeerStore, SnapshotStream, StoreError, SubscriptionQuery};
