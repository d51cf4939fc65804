//! Session configuration
//!
//! Every timing constant the engine uses lives here. Defaults can be
//! overridden process-wide through the server config blob (see
//! [`crate::global::apply_server_config`]) or per session by building a
//! `SessionConfig` directly.

use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

/// Timing and policy parameters for one call session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Time allowed for one path attempt (open + key handshake)
    pub probe_timeout: Duration,

    /// Challenge retransmit period while a path is being verified
    pub challenge_interval: Duration,

    /// Ping period on the active path
    pub keepalive_interval: Duration,

    /// Silence on the active path that counts as path loss
    pub liveness_timeout: Duration,

    /// Longest time the session may stay in `Reconnecting`
    pub retry_budget: Duration,

    /// Backoff between failover rounds
    pub retry: RetryConfig,

    /// Reconnects after which the call is worth rating
    pub need_rate_reconnects: u32,

    /// Time spent reconnecting after which the call is worth rating
    pub need_rate_reconnecting: Duration,

    /// Lines kept in the session debug log
    pub debug_log_lines: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5),
            challenge_interval: Duration::from_millis(250),
            keepalive_interval: Duration::from_secs(1),
            liveness_timeout: Duration::from_secs(8),
            retry_budget: Duration::from_secs(20),
            retry: RetryConfig::default(),
            need_rate_reconnects: 1,
            need_rate_reconnecting: Duration::from_secs(3),
            debug_log_lines: 512,
        }
    }
}

impl SessionConfig {
    /// Apply the overrides present in a server config.
    #[must_use]
    pub fn with_overrides(mut self, overrides: &ServerConfig) -> Self {
        let ms = Duration::from_millis;
        if let Some(v) = overrides.probe_timeout_ms {
            self.probe_timeout = ms(v);
        }
        if let Some(v) = overrides.challenge_interval_ms {
            self.challenge_interval = ms(v);
        }
        if let Some(v) = overrides.keepalive_interval_ms {
            self.keepalive_interval = ms(v);
        }
        if let Some(v) = overrides.liveness_timeout_ms {
            self.liveness_timeout = ms(v);
        }
        if let Some(v) = overrides.retry_budget_ms {
            self.retry_budget = ms(v);
        }
        if let Some(v) = overrides.need_rate_reconnects {
            self.need_rate_reconnects = v;
        }
        if let Some(v) = overrides.need_rate_reconnecting_ms {
            self.need_rate_reconnecting = ms(v);
        }
        self
    }

    /// Check internal consistency.
    ///
    /// # Errors
    ///
    /// Returns a description of the first inconsistency found.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.probe_timeout.is_zero() {
            return Err("probe_timeout must be positive");
        }
        if self.challenge_interval.is_zero() || self.keepalive_interval.is_zero() {
            return Err("challenge and keepalive intervals must be positive");
        }
        if self.liveness_timeout <= self.keepalive_interval {
            return Err("liveness_timeout must exceed keepalive_interval");
        }
        if self.retry_budget.is_zero() {
            return Err("retry_budget must be positive");
        }
        if self.debug_log_lines == 0 {
            return Err("debug_log_lines must be positive");
        }
        Ok(())
    }
}

/// Retry configuration with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial backoff duration
    pub initial_backoff: Duration,

    /// Maximum backoff duration
    pub max_backoff: Duration,

    /// Backoff multiplier
    pub multiplier: f64,

    /// Add random jitter so both peers do not retry in lockstep
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(4),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration before failover round `round` (0-based)
    #[must_use]
    pub fn backoff_duration(&self, round: u32) -> Duration {
        let exponent = i32::try_from(round).unwrap_or(i32::MAX);
        let base = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_backoff.as_millis() as f64);

        let duration = if self.jitter {
            // Add up to 25% jitter
            let jitter_factor = rand::thread_rng().gen_range(0.0..0.25);
            capped * (1.0 + jitter_factor)
        } else {
            capped
        };

        Duration::from_millis(duration as u64)
    }
}

/// Overrides carried by the process-wide server config blob.
///
/// Every field is optional; unknown keys in the blob are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Override for [`SessionConfig::probe_timeout`]
    pub probe_timeout_ms: Option<u64>,
    /// Override for [`SessionConfig::challenge_interval`]
    pub challenge_interval_ms: Option<u64>,
    /// Override for [`SessionConfig::keepalive_interval`]
    pub keepalive_interval_ms: Option<u64>,
    /// Override for [`SessionConfig::liveness_timeout`]
    pub liveness_timeout_ms: Option<u64>,
    /// Override for [`SessionConfig::retry_budget`]
    pub retry_budget_ms: Option<u64>,
    /// Override for [`SessionConfig::need_rate_reconnects`]
    pub need_rate_reconnects: Option<u32>,
    /// Override for [`SessionConfig::need_rate_reconnecting`]
    pub need_rate_reconnecting_ms: Option<u64>,
}

impl ServerConfig {
    /// Parse a JSON server config blob.
    ///
    /// # Errors
    ///
    /// Returns the parser error for malformed JSON or mistyped values.
    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}
