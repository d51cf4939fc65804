//! Signal quality and the connectivity history behind `need_rate`.

use crate::config::SessionConfig;
use crate::path::PathKind;
use std::time::Duration;
use tokio::time::Instant;

/// Highest signal bar count
pub const MAX_SIGNAL_BARS: i32 = 4;

/// Signal bars (1-4) for a connected path.
///
/// Relayed paths lose one bar, never dropping below one.
#[must_use]
pub fn signal_bars(rtt: Option<Duration>, kind: PathKind) -> i32 {
    let bars = match rtt.map(|rtt| rtt.as_millis()) {
        None => 3,
        Some(ms) if ms < 150 => MAX_SIGNAL_BARS,
        Some(ms) if ms < 300 => 3,
        Some(ms) if ms < 600 => 2,
        Some(_) => 1,
    };
    if kind.is_relayed() {
        (bars - 1).max(1)
    } else {
        bars
    }
}

/// What happened to connectivity over the session's lifetime.
#[derive(Debug, Clone, Default)]
pub struct ConnectivityHistory {
    connected_once: bool,
    reconnects: u32,
    reconnecting_since: Option<Instant>,
    reconnecting_total: Duration,
    min_connected_bars: Option<i32>,
}

impl ConnectivityHistory {
    /// Empty history
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A path became usable
    pub fn on_connected(&mut self, now: Instant) {
        if let Some(since) = self.reconnecting_since.take() {
            self.reconnecting_total += now.saturating_duration_since(since);
            self.reconnects += 1;
        }
        self.connected_once = true;
    }

    /// Failover started. Failover during initial setup is not a reconnect.
    pub fn on_reconnecting(&mut self, now: Instant) {
        if self.connected_once && self.reconnecting_since.is_none() {
            self.reconnecting_since = Some(now);
        }
    }

    /// Stop the reconnecting clock without counting a reconnect
    pub fn on_ended(&mut self, now: Instant) {
        if let Some(since) = self.reconnecting_since.take() {
            self.reconnecting_total += now.saturating_duration_since(since);
        }
    }

    /// Signal bars reported while connected
    pub fn on_bars(&mut self, bars: i32) {
        self.min_connected_bars = Some(self.min_connected_bars.map_or(bars, |m| m.min(bars)));
    }

    /// Whether the session ever connected
    #[must_use]
    pub fn connected_once(&self) -> bool {
        self.connected_once
    }

    /// Completed reconnects
    #[must_use]
    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    /// Total time spent reconnecting, including an ongoing stretch
    #[must_use]
    pub fn reconnecting_time(&self, now: Instant) -> Duration {
        self.reconnecting_total
            + self
                .reconnecting_since
                .map_or(Duration::ZERO, |since| now.saturating_duration_since(since))
    }

    /// Whether the call merits asking the user for a rating.
    #[must_use]
    pub fn need_rate(&self, config: &SessionConfig, now: Instant) -> bool {
        if !self.connected_once {
            return false;
        }
        self.reconnects >= config.need_rate_reconnects
            || self.reconnecting_time(now) >= config.need_rate_reconnecting
            || self.min_connected_bars.is_some_and(|bars| bars <= 1)
    }
}
