//! Presence Metrics Port
//!
//! Sink for the counters and gauges the presence manager reports. The
//! Prometheus adapter lives in `infrastructure::metrics`.

use std::time::Duration;

/// Store mutation kinds, used as a metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Collection membership add.
    Join,
    /// Position update.
    Position,
    /// Symbol assignment.
    Symbol,
    /// Collection membership removal.
    Remove,
}

impl WriteKind {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Position => "position",
            Self::Symbol => "symbol",
            Self::Remove => "remove",
        }
    }
}

/// Metrics sink for presence activity.
pub trait PresenceMetrics: Send + Sync {
    /// A store mutation succeeded.
    fn record_write(&self, kind: WriteKind);

    /// The store rejected a mutation.
    fn record_write_error(&self, kind: WriteKind);

    /// A pointer move was folded into an already scheduled write.
    fn record_move_coalesced(&self);

    /// An abandonment sweep finished.
    fn record_sweep(&self, evicted: usize, duration: Duration);

    /// A client's observed peer count changed.
    fn set_peers(&self, client: &str, count: usize);

    /// A client's connectivity flipped.
    fn set_connected(&self, client: &str, connected: bool);
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl PresenceMetrics for NoopMetrics {
    fn record_write(&self, _kind: WriteKind) {}
    fn record_write_error(&self, _kind: WriteKind) {}
    fn record_move_coalesced(&self) {}
    fn record_sweep(&self, _evicted: usize, _duration: Duration) {}
    fn set_peers(&self, _client: &str, _count: usize) {}
    fn set_connected(&self, _client: &str, _connected: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_kind_labels() {
        assert_eq!(WriteKind::Join.as_str(), "join");
        assert_eq!(WriteKind::Position.as_str(), "position");
        assert_eq!(WriteKind::Symbol.as_str(), "symbol");
        assert_eq!(WriteKind::Remove.as_str(), "remove");
    }
}
