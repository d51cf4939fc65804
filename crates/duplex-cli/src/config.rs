//! Configuration file for the DUPLEX CLI.
//!
//! ```toml
//! [logging]
//! level = "info"
//! debug_log_dir = "/tmp/duplex"
//!
//! [session]
//! probe_timeout_ms = 2000
//! retry_budget_ms = 10000
//!
//! [simulation]
//! alternatives = 2
//! turn_servers = 1
//! network = "CellularLte"
//! data_saving = "Cellular"
//! duration_secs = 5
//! ```

use duplex_core::{DataSavingMode, NetworkType, ServerConfig, SessionConfig, global};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// DUPLEX CLI configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Session timing overrides, same keys as the server config blob
    pub session: ServerConfig,
    /// Loopback simulation parameters
    pub simulation: SimulationConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Directory that receives one debug log file per simulated session
    pub debug_log_dir: Option<PathBuf>,
}

/// Simulation configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Relay descriptors offered next to the direct primary
    pub alternatives: usize,
    /// TURN servers in the relay list
    pub turn_servers: usize,
    /// Whether direct paths may be used
    pub allow_p2p: bool,
    /// Network both parties start on
    pub network: NetworkType,
    /// Data-saving preference of both parties
    pub data_saving: DataSavingMode,
    /// Relay layer both parties advertise
    pub max_layer: i32,
    /// How long the call runs before both sides stop
    pub duration_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            debug_log_dir: None,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            alternatives: 1,
            turn_servers: 0,
            allow_p2p: true,
            network: NetworkType::Wifi,
            data_saving: DataSavingMode::Never,
            max_layer: global::MAX_LAYER,
            duration_secs: 3,
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load from `path` when given, defaults otherwise
    ///
    /// # Errors
    ///
    /// Returns an error if a given file cannot be read or parsed.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Session timings with the `[session]` overrides applied
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::default().with_overrides(&self.session)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        self.session_config()
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid [session] timings: {e}"))?;

        let max_layer = global::max_layer();
        if !(1..=max_layer).contains(&self.simulation.max_layer) {
            anyhow::bail!("Simulation max_layer must be between 1 and {max_layer}");
        }
        if self.simulation.duration_secs == 0 {
            anyhow::bail!("Simulation duration must be at least one second");
        }
        if self.simulation.alternatives > 32 || self.simulation.turn_servers > 32 {
            anyhow::bail!("At most 32 alternatives and 32 TURN servers are simulated");
        }

        Ok(())
    }
}
