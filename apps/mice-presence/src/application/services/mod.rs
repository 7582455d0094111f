//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `PresenceManager`: Keeps one local identity alive in the shared collection
//! - `SweepSchedule`: Randomized delays between abandonment sweeps

mod presence;
mod sweep;

pub use presence::{
    PresenceConfig, PresenceError, PresenceEvent, PresenceHandle, PresenceManager,
};
pub use sweep::SweepSchedule;
