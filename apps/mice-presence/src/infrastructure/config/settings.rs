//! Presence Configuration Settings
//!
//! Configuration types for the presence demo, loaded from environment variables.

use std::time::Duration;

/// Presence protocol timings.
#[derive(Debug, Clone)]
pub struct PresenceSettings {
    /// Minimum spacing between position writes.
    pub write_interval: Duration,
    /// Quiet period before a movement-triggered join check runs.
    pub join_debounce: Duration,
    /// Connectivity poll interval.
    pub status_poll_interval: Duration,
    /// Shortest delay between abandonment sweeps (the longest is double).
    pub sweep_min: Duration,
    /// Idle time after which a peer record may be evicted.
    pub abandonment_threshold: Duration,
    /// Maximum records listed per snapshot (0 = unlimited).
    pub snapshot_limit: usize,
    /// Remove the own record when going offline instead of waiting for peers.
    pub eager_leave: bool,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            write_interval: Duration::from_millis(30),
            join_debounce: Duration::from_millis(150),
            status_poll_interval: Duration::from_millis(150),
            sweep_min: Duration::from_secs(60),
            abandonment_threshold: Duration::from_secs(60),
            snapshot_limit: 10,
            eager_leave: false,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health and introspection HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Simulated client settings for the demo binary.
#[derive(Debug, Clone)]
pub struct SimulationSettings {
    /// Number of simulated clients sharing the store.
    pub clients: usize,
    /// Canvas width in pixels.
    pub canvas_width: f64,
    /// Canvas height in pixels.
    pub canvas_height: f64,
    /// Interval between simulated pointer events.
    pub move_interval: Duration,
    /// Chance per pointer event that a client toggles its online state.
    pub toggle_chance: f64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            clients: 4,
            canvas_width: 800.0,
            canvas_height: 600.0,
            move_interval: Duration::from_millis(16),
            toggle_chance: 0.0005,
        }
    }
}

/// Complete demo configuration.
#[derive(Debug, Clone, Default)]
pub struct DemoConfig {
    /// Presence protocol timings.
    pub presence: PresenceSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// Simulated client settings.
    pub simulation: SimulationSettings,
}

impl DemoConfig {
    /// Create configuration from environment variables.
    ///
    /// Unset or unparsable variables fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting configuration is unusable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let presence_defaults = PresenceSettings::default();
        let sweep_min = parse_env_duration_secs("MICE_SWEEP_MIN_SECS", presence_defaults.sweep_min);

        let presence = PresenceSettings {
            write_interval: parse_env_duration_millis(
                "MICE_WRITE_INTERVAL_MS",
                presence_defaults.write_interval,
            ),
            join_debounce: parse_env_duration_millis(
                "MICE_JOIN_DEBOUNCE_MS",
                presence_defaults.join_debounce,
            ),
            status_poll_interval: parse_env_duration_millis(
                "MICE_STATUS_POLL_MS",
                presence_defaults.status_poll_interval,
            ),
            sweep_min,
            // The threshold tracks the sweep minimum unless set explicitly.
            abandonment_threshold: parse_env_duration_secs("MICE_ABANDONED_SECS", sweep_min),
            snapshot_limit: parse_env_usize("MICE_SNAPSHOT_LIMIT", presence_defaults.snapshot_limit),
            eager_leave: parse_env_bool("MICE_EAGER_LEAVE", presence_defaults.eager_leave),
        };

        let server = ServerSettings {
            health_port: parse_env_u16("MICE_HEALTH_PORT", ServerSettings::default().health_port),
        };

        let simulation_defaults = SimulationSettings::default();
        let simulation = SimulationSettings {
            clients: parse_env_usize("MICE_CLIENTS", simulation_defaults.clients),
            canvas_width: parse_env_f64("MICE_CANVAS_WIDTH", simulation_defaults.canvas_width),
            canvas_height: parse_env_f64("MICE_CANVAS_HEIGHT", simulation_defaults.canvas_height),
            move_interval: parse_env_duration_millis(
                "MICE_MOVE_INTERVAL_MS",
                simulation_defaults.move_interval,
            ),
            toggle_chance: parse_env_f64("MICE_TOGGLE_CHANCE", simulation_defaults.toggle_chance),
        };

        let config = Self {
            presence,
            server,
            simulation,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check invariants between settings.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.presence.sweep_min.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "MICE_SWEEP_MIN_SECS".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.presence.write_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "MICE_WRITE_INTERVAL_MS".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.presence.status_poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "MICE_STATUS_POLL_MS".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.simulation.clients == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MICE_CLIENTS".to_string(),
                reason: "at least one client is required".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.simulation.toggle_chance) {
            return Err(ConfigError::InvalidValue {
                key: "MICE_TOGGLE_CHANCE".to_string(),
                reason: "must be between 0 and 1".to_string(),
            });
        }
        if self.simulation.canvas_width <= 0.0 || self.simulation.canvas_height <= 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "MICE_CANVAS_WIDTH/MICE_CANVAS_HEIGHT".to_string(),
                reason: "canvas must have a positive size".to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A setting has a value the demo cannot run with.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Offending environment variable.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },
}

fn parse_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| match v.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
