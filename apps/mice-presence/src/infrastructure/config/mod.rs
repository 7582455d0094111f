//! Configuration Module
//!
//! Configuration loading for the presence demo.

mod settings;

pub use settings::{ConfigError, DemoConfig, PresenceSettings, ServerSettings, SimulationSettings};
