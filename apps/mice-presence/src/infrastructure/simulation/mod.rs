//! Simulated Clients
//!
//! Drives presence managers the way a user would in the demo binary: a
//! pointer that wanders across the canvas, and the occasional trip offline
//! and back. Also renders each client's events to the log.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::application::services::{PresenceEvent, PresenceHandle, PresenceManager};
use crate::domain::presence::PresenceStatus;
use crate::infrastructure::config::SimulationSettings;

/// Largest per-event change of pointer velocity, in pixels.
const MAX_ACCELERATION: f64 = 1.5;

/// Largest pointer speed, in pixels per event.
const MAX_SPEED: f64 = 12.0;

// =============================================================================
// Pointer
// =============================================================================

/// A pointer performing a bounded random walk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pointer {
    /// Horizontal position.
    pub x: f64,
    /// Vertical position.
    pub y: f64,
    vx: f64,
    vy: f64,
}

impl Pointer {
    /// Pointer at rest at `(x, y)`.
    #[must_use]
    pub const fn at(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            vx: 0.0,
            vy: 0.0,
        }
    }

    /// Pointer at rest somewhere on the canvas.
    pub fn random(rng: &mut impl Rng, width: f64, height: f64) -> Self {
        Self::at(rng.random_range(0.0..=width), rng.random_range(0.0..=height))
    }

    /// Advance one event, bouncing off the canvas edges.
    pub fn step(&mut self, rng: &mut impl Rng, width: f64, height: f64) {
        self.vx = (self.vx + rng.random_range(-MAX_ACCELERATION..=MAX_ACCELERATION))
            .clamp(-MAX_SPEED, MAX_SPEED);
        self.vy = (self.vy + rng.random_range(-MAX_ACCELERATION..=MAX_ACCELERATION))
            .clamp(-MAX_SPEED, MAX_SPEED);

        (self.x, self.vx) = bounce(self.x + self.vx, self.vx, width);
        (self.y, self.vy) = bounce(self.y + self.vy, self.vy, height);
    }
}

fn bounce(position: f64, velocity: f64, limit: f64) -> (f64, f64) {
    if position < 0.0 {
        ((-position).min(limit), -velocity)
    } else if position > limit {
        ((2.0 * limit - position).max(0.0), -velocity)
    } else {
        (position, velocity)
    }
}

// =============================================================================
// Pointer Driver
// =============================================================================

/// Feeds pointer movement into one presence manager until cancelled.
pub struct PointerDriver {
    manager: Arc<PresenceManager>,
    settings: SimulationSettings,
    cancel: CancellationToken,
}

impl PointerDriver {
    /// Create a driver for `manager`.
    #[must_use]
    pub const fn new(
        manager: Arc<PresenceManager>,
        settings: SimulationSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            manager,
            settings,
            cancel,
        }
    }

    /// Run until cancelled.
    pub async fn run(self) {
        let mut rng = StdRng::from_rng(&mut rand::rng());
        let (width, height) = (self.settings.canvas_width, self.settings.canvas_height);
        let mut pointer = Pointer::random(&mut rng, width, height);

        let mut interval = tokio::time::interval(self.settings.move_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Pointer driver cancelled");
                    break;
                }
                _ = interval.tick() => {}
            }

            if rng.random_bool(self.settings.toggle_chance) {
                self.toggle().await;
            }

            pointer.step(&mut rng, width, height);
            if let Err(e) = self.manager.move_to(pointer.x, pointer.y) {
                tracing::debug!(error = %e, "Pointer move ignored");
            }
        }
    }

    async fn toggle(&self) {
        let handle = self.manager.handle();
        let result = match handle.status() {
            PresenceStatus::Online => self.manager.go_offline().await,
            PresenceStatus::Offline => self.manager.go_online().await,
            PresenceStatus::Joining => return,
        };
        if let Err(e) = result {
            tracing::warn!(client = ?handle.local_id(), error = %e, "Simulated toggle failed");
        }
    }
}

// =============================================================================
// Event Log
// =============================================================================

/// Log a client's presence events until cancelled.
pub async fn log_events(handle: PresenceHandle, cancel: CancellationToken) {
    let mut events = handle.subscribe();
    let client = handle
        .local_id()
        .map_or_else(|| "unstarted".to_string(), |id| id.to_string());

    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(PresenceEvent::StatusChanged(status)) => {
                tracing::info!(client = %client, status = %status, "Presence status changed");
            }
            Ok(PresenceEvent::ConnectivityChanged { connected }) => {
                tracing::info!(client = %client, connected, "Connectivity changed");
            }
            Ok(PresenceEvent::PeersChanged { count }) => {
                let symbols: String = handle
                    .peers()
                    .iter()
                    .map(crate::domain::peer::PeerRecord::display_symbol)
                    .collect();
                tracing::debug!(client = %client, count, symbols = %symbols, "Peers");
            }
            Ok(PresenceEvent::Evicted(ids)) => {
                tracing::info!(client = %client, evicted = ?ids, "Evicted peers");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(client = %client, skipped, "Event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
