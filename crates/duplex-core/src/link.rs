//! Frames exchanged on a media path and path validation.
//!
//! Every datagram on a path is a sealed [`LinkFrame`]:
//!
//! ```text
//! datagram = nonce(24) || XChaCha20-Poly1305(bincode(LinkFrame))
//! ```
//!
//! A path is validated by a challenge/response exchange: a `Response`
//! echoing one of our challenges can only be produced by a peer holding the
//! call key, so it proves bidirectional traffic under the shared key.

use duplex_crypto::{CryptoError, KeySchedule};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Frame carried in one path datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkFrame {
    /// Path challenge; the peer must echo it in a `Response`
    Challenge([u8; 8]),
    /// Echo of a received challenge
    Response([u8; 8]),
    /// Keepalive carrying a sequence number
    Ping(u64),
    /// Echo of a keepalive
    Pong(u64),
}

/// Seals and opens link frames with the session's link keys.
#[derive(Clone)]
pub struct LinkCodec {
    schedule: Arc<KeySchedule>,
}

impl LinkCodec {
    /// Create a codec over the given key schedule
    #[must_use]
    pub fn new(schedule: Arc<KeySchedule>) -> Self {
        Self { schedule }
    }

    /// Seal a frame for sending.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or sealing fails.
    pub fn seal(&self, frame: &LinkFrame) -> Result<Vec<u8>, CryptoError> {
        let plaintext = bincode::serialize(frame)?;
        self.schedule.link_send().seal(&plaintext)
    }

    /// Open a received datagram.
    ///
    /// # Errors
    ///
    /// Returns an error if the datagram does not authenticate under the
    /// peer's link key or does not decode.
    pub fn open(&self, datagram: &[u8]) -> Result<LinkFrame, CryptoError> {
        let plaintext = self.schedule.link_recv().open(datagram)?;
        Ok(bincode::deserialize(&plaintext)?)
    }
}

/// Tracks challenges issued on one path attempt.
pub struct PathValidator {
    /// Pending challenges: challenge data -> sent at
    pending: HashMap<[u8; 8], Instant>,
    /// Challenge lifetime
    timeout: Duration,
}

impl PathValidator {
    /// Create a validator whose challenges expire after `timeout`
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            timeout,
        }
    }

    /// Generate a fresh challenge to send to the peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the system RNG fails.
    pub fn initiate_challenge(&mut self) -> Result<[u8; 8], CryptoError> {
        let challenge = duplex_crypto::random::random_8()?;
        self.pending.insert(challenge, Instant::now());
        Ok(challenge)
    }

    /// Handle a response; returns the measured RTT if it answers one of our
    /// pending challenges.
    pub fn handle_response(&mut self, response: &[u8; 8]) -> Option<Duration> {
        self.pending
            .remove(response)
            .map(|sent_at| sent_at.elapsed())
    }

    /// Drop challenges that outlived the timeout
    pub fn cleanup_expired(&mut self) {
        let timeout = self.timeout;
        self.pending.retain(|_, sent_at| sent_at.elapsed() < timeout);
    }

    /// Number of outstanding challenges
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Smoothed RTT estimate from keepalive round trips.
#[derive(Debug)]
pub struct RttEstimator {
    next_seq: u64,
    in_flight: HashMap<u64, Instant>,
    smoothed: Option<Duration>,
}

/// Keepalives older than this many sequence numbers are forgotten.
const MAX_IN_FLIGHT: u64 = 16;

impl RttEstimator {
    /// Start from an initial sample, typically the validation RTT
    #[must_use]
    pub fn new(initial: Option<Duration>) -> Self {
        Self {
            next_seq: 1,
            in_flight: HashMap::new(),
            smoothed: initial,
        }
    }

    /// Register an outgoing ping and return its sequence number.
    pub fn on_ping_sent(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.in_flight.insert(seq, Instant::now());
        self.in_flight
            .retain(|s, _| seq.saturating_sub(*s) < MAX_IN_FLIGHT);
        seq
    }

    /// Feed a pong; returns the updated smoothed RTT for a known sequence.
    pub fn on_pong(&mut self, seq: u64) -> Option<Duration> {
        let sample = self.in_flight.remove(&seq)?.elapsed();
        let smoothed = match self.smoothed {
            // srtt = 7/8 srtt + 1/8 sample
            Some(prev) => (prev * 7 + sample) / 8,
            None => sample,
        };
        self.smoothed = Some(smoothed);
        Some(smoothed)
    }

    /// Current smoothed RTT
    #[must_use]
    pub fn smoothed(&self) -> Option<Duration> {
        self.smoothed
    }
}
