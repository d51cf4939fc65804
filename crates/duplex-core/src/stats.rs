//! Per-session traffic accounting.
//!
//! Four counters (sent/received × wifi/mobile) shared between the session
//! and every concurrent path task. Counters only ever grow; once the
//! session stops they are frozen and the frozen snapshot is what every
//! later reader sees.

use crate::network::NetworkType;
use serde::Serialize;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of the session's byte counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Bytes sent while on Wi-Fi
    pub bytes_sent_wifi: u64,
    /// Bytes received while on Wi-Fi
    pub bytes_received_wifi: u64,
    /// Bytes sent while on a mobile network
    pub bytes_sent_mobile: u64,
    /// Bytes received while on a mobile network
    pub bytes_received_mobile: u64,
}

impl SessionStats {
    /// Total bytes in both directions across both network classes
    #[must_use]
    pub fn total(&self) -> u64 {
        self.bytes_sent_wifi
            + self.bytes_received_wifi
            + self.bytes_sent_mobile
            + self.bytes_received_mobile
    }

    /// True if every counter is at least the corresponding one in `earlier`
    #[must_use]
    pub fn dominates(&self, earlier: &SessionStats) -> bool {
        self.bytes_sent_wifi >= earlier.bytes_sent_wifi
            && self.bytes_received_wifi >= earlier.bytes_received_wifi
            && self.bytes_sent_mobile >= earlier.bytes_sent_mobile
            && self.bytes_received_mobile >= earlier.bytes_received_mobile
    }
}

/// Concurrent byte counter shared by the session and its path tasks.
#[derive(Debug, Default)]
pub struct StatsAccumulator {
    sent_wifi: AtomicU64,
    received_wifi: AtomicU64,
    sent_mobile: AtomicU64,
    received_mobile: AtomicU64,
    frozen: OnceLock<SessionStats>,
}

impl StatsAccumulator {
    /// Create an accumulator with all counters at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record bytes sent on `network`. Ignored once frozen.
    pub fn record_sent(&self, bytes: u64, network: NetworkType) {
        if self.is_frozen() {
            return;
        }
        let counter = if network.is_cellular() {
            &self.sent_mobile
        } else {
            &self.sent_wifi
        };
        counter.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record bytes received on `network`. Ignored once frozen.
    pub fn record_received(&self, bytes: u64, network: NetworkType) {
        if self.is_frozen() {
            return;
        }
        let counter = if network.is_cellular() {
            &self.received_mobile
        } else {
            &self.received_wifi
        };
        counter.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Current values; the frozen snapshot after [`freeze`](Self::freeze)
    #[must_use]
    pub fn snapshot(&self) -> SessionStats {
        if let Some(frozen) = self.frozen.get() {
            return *frozen;
        }
        self.live()
    }

    /// Freeze the counters and return the final values.
    ///
    /// Idempotent: later calls return the snapshot taken by the first one.
    pub fn freeze(&self) -> SessionStats {
        *self.frozen.get_or_init(|| self.live())
    }

    /// Whether [`freeze`](Self::freeze) has been called
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen.get().is_some()
    }

    fn live(&self) -> SessionStats {
        SessionStats {
            bytes_sent_wifi: self.sent_wifi.load(Ordering::Relaxed),
            bytes_received_wifi: self.received_wifi.load(Ordering::Relaxed),
            bytes_sent_mobile: self.sent_mobile.load(Ordering::Relaxed),
            bytes_received_mobile: self.received_mobile.load(Ordering::Relaxed),
        }
    }
}
