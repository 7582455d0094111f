//! Presence Lifecycle and Abandonment Policy
//!
//! Pure domain rules for the presence protocol:
//!
//! - `PresenceStatus`: the per-identity lifecycle
//!   (`Offline` → `Joining` → `Online` → `Offline`)
//! - `AbandonmentPolicy`: which peer records are old enough to evict
//!
//! Nothing here touches the store or the clock directly; callers pass `now`.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::domain::peer::{PeerId, PeerRecord, PeerSet};

// =============================================================================
// Lifecycle
// =============================================================================

/// Lifecycle of the local identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// Not announcing; no writes leave this client.
    #[default]
    Offline,
    /// Connected and registering the local record.
    Joining,
    /// Registered; position and symbol changes are pushed.
    Online,
}

impl PresenceStatus {
    /// Get the status name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Joining => "joining",
            Self::Online => "online",
        }
    }

    /// Check if record mutations may be pushed.
    #[must_use]
    pub const fn accepts_writes(&self) -> bool {
        matches!(self, Self::Online)
    }

    /// Check if the client is connected in any capacity.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        !matches!(self, Self::Offline)
    }

    /// Check whether moving to `to` is a legal transition.
    #[must_use]
    pub const fn can_transition(&self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Offline, Self::Joining)
                | (Self::Joining, Self::Online | Self::Offline)
                | (Self::Online, Self::Offline)
        )
    }

    /// Move to `to`, rejecting illegal transitions.
    ///
    /// # Errors
    ///
    /// Returns `TransitionError` if the lifecycle does not allow the move.
    pub const fn transition(self, to: Self) -> Result<Self, TransitionError> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(TransitionError { from: self, to })
        }
    }
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Illegal lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot move presence from {from} to {to}")]
pub struct TransitionError {
    /// Status before the attempted move.
    pub from: PresenceStatus,
    /// Requested status.
    pub to: PresenceStatus,
}

// =============================================================================
// Abandonment
// =============================================================================

/// Decides which peer records are abandoned.
///
/// A record is abandoned once `now - last_update` strictly exceeds the
/// threshold. Records stamped in the future (clock skew) are never abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbandonmentPolicy {
    threshold: TimeDelta,
}

impl AbandonmentPolicy {
    /// Create a policy with the given idle threshold.
    #[must_use]
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold: TimeDelta::from_std(threshold).unwrap_or(TimeDelta::MAX),
        }
    }

    /// The idle threshold.
    #[must_use]
    pub const fn threshold(&self) -> TimeDelta {
        self.threshold
    }

    /// Check a single record.
    #[must_use]
    pub fn is_abandoned(&self, record: &PeerRecord, now: DateTime<Utc>) -> bool {
        record.idle_for(now) > self.threshold
    }

    /// Ids of abandoned peers, never including `self_id`.
    #[must_use]
    pub fn abandoned(&self, peers: &PeerSet, self_id: &PeerId, now: DateTime<Utc>) -> Vec<PeerId> {
        peers
            .others(self_id)
            .filter(|record| self.is_abandoned(record, now))
            .map(|record| record.id.clone())
            .collect()
    }
}
