//! Out-of-band signaling between the two endpoints.
//!
//! Payloads travel through a side channel the caller owns. That channel may
//! reorder and duplicate, so every message is wrapped in a sequenced
//! envelope and sealed under the signaling keys:
//!
//! ```text
//! payload = nonce(24) || XChaCha20-Poly1305(bincode(Envelope { seq, message }))
//! ```
//!
//! Inbound handling:
//! - capabilities naming a version we do not speak are rejected on arrival,
//!   buffered or not
//! - duplicates (same `seq`) are dropped
//! - each topic is last-writer-wins: a message older than the last one
//!   applied on its topic is discarded
//! - until the session first connects, messages are buffered and released
//!   in sequence order by [`SignalingChannel::mark_ready`]

use crate::global;
use duplex_crypto::{CryptoError, KeySchedule};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Signaling codec errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Payload did not authenticate under the peer's signaling key
    #[error("payload failed authentication")]
    Unauthenticated,

    /// Payload authenticated but does not decode
    #[error("undecodable payload: {0}")]
    Malformed(String),

    /// Outbound payload could not be sealed
    #[error("sealing failed: {0}")]
    Seal(CryptoError),

    /// Peer advertised a protocol version this build does not speak
    #[error("peer speaks unsupported version {0}")]
    UnsupportedVersion(String),
}

/// Out-of-order sequence numbers remembered above the contiguous floor.
const SEEN_WINDOW: usize = 256;

/// Inbound sequence numbers already accepted: everything at or below
/// `floor`, plus the out-of-order ones above it. Senders start at 1.
#[derive(Debug, Default)]
struct SeenWindow {
    floor: u64,
    above: BTreeSet<u64>,
}

impl SeenWindow {
    /// Record `seq`. False for a duplicate, or for a straggler that fell
    /// below the window.
    fn insert(&mut self, seq: u64) -> bool {
        if seq <= self.floor || !self.above.insert(seq) {
            return false;
        }
        self.compact();
        while self.above.len() > SEEN_WINDOW {
            if let Some(lowest) = self.above.pop_first() {
                self.floor = lowest;
            }
            self.compact();
        }
        true
    }

    fn compact(&mut self) {
        while self.above.remove(&(self.floor + 1)) {
            self.floor += 1;
        }
    }
}

/// Control message exchanged between the endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalingMessage {
    /// What the sender speaks; sent once at session start
    Capabilities {
        /// Protocol version the sender was constructed with
        version: String,
        /// Highest relay layer the sender accepts
        max_layer: i32,
        /// Whether the sender can do video at all
        supports_video: bool,
    },
    /// Sender wants to start video
    VideoRequest,
    /// Sender accepts the receiver's video request
    VideoAccept,
    /// Sender's outgoing video stream started or stopped
    VideoStream {
        /// Stream is flowing
        active: bool,
    },
}

/// Last-writer-wins topic of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Topic {
    Capabilities,
    VideoNegotiation,
    VideoStream,
}

impl SignalingMessage {
    fn topic(&self) -> Topic {
        match self {
            SignalingMessage::Capabilities { .. } => Topic::Capabilities,
            SignalingMessage::VideoRequest | SignalingMessage::VideoAccept => {
                Topic::VideoNegotiation
            }
            SignalingMessage::VideoStream { .. } => Topic::VideoStream,
        }
    }
}

/// Sequenced wrapper carried inside every payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Per-sender sequence number, starting at 1
    pub seq: u64,
    /// The message
    pub message: SignalingMessage,
}

/// Seals and opens signaling payloads with one endpoint's key schedule.
#[derive(Clone)]
pub struct SignalingCodec {
    schedule: Arc<KeySchedule>,
}

impl SignalingCodec {
    /// Create a codec over the given key schedule
    #[must_use]
    pub fn new(schedule: Arc<KeySchedule>) -> Self {
        Self { schedule }
    }

    /// Seal an envelope into a payload for the peer.
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::Seal`] if encoding or sealing fails.
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, SignalingError> {
        let plaintext = bincode::serialize(envelope)
            .map_err(|e| SignalingError::Seal(CryptoError::from(e)))?;
        self.schedule
            .signaling_send()
            .seal(&plaintext)
            .map_err(SignalingError::Seal)
    }

    /// Open a payload produced by the peer.
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::Unauthenticated`] or
    /// [`SignalingError::Malformed`].
    pub fn decode(&self, payload: &[u8]) -> Result<Envelope, SignalingError> {
        let plaintext = self
            .schedule
            .signaling_recv()
            .open(payload)
            .map_err(|_| SignalingError::Unauthenticated)?;
        bincode::deserialize(&plaintext).map_err(|e| SignalingError::Malformed(e.to_string()))
    }
}

/// Outbound signaling sink supplied by the caller.
///
/// Fire-and-forget: the core never retries a send.
pub trait SignalingSink: Send + Sync + 'static {
    /// Deliver one payload to the peer
    fn send(&self, payload: Vec<u8>);
}

impl<F> SignalingSink for F
where
    F: Fn(Vec<u8>) + Send + Sync + 'static,
{
    fn send(&self, payload: Vec<u8>) {
        self(payload);
    }
}

/// Sequencing, dedupe and buffering state of one session's signaling.
pub struct SignalingChannel {
    codec: SignalingCodec,
    next_seq: u64,
    seen: SeenWindow,
    applied: HashMap<Topic, u64>,
    buffered: Vec<Envelope>,
    ready: bool,
}

impl SignalingChannel {
    /// Create a channel; inbound messages are buffered until
    /// [`mark_ready`](Self::mark_ready)
    #[must_use]
    pub fn new(codec: SignalingCodec) -> Self {
        Self {
            codec,
            next_seq: 1,
            seen: SeenWindow::default(),
            applied: HashMap::new(),
            buffered: Vec::new(),
            ready: false,
        }
    }

    /// Wrap and seal an outbound message.
    ///
    /// # Errors
    ///
    /// Returns an error if sealing fails.
    pub fn encode(&mut self, message: SignalingMessage) -> Result<Vec<u8>, SignalingError> {
        let envelope = Envelope {
            seq: self.next_seq,
            message,
        };
        let payload = self.codec.encode(&envelope)?;
        self.next_seq += 1;
        Ok(payload)
    }

    /// Accept an inbound payload.
    ///
    /// Returns the messages to apply now: empty for duplicates, stale
    /// messages, and anything buffered before the channel is ready.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not authenticate or decode, or
    /// carries capabilities with an unsupported version.
    pub fn receive(&mut self, payload: &[u8]) -> Result<Vec<SignalingMessage>, SignalingError> {
        let envelope = self.codec.decode(payload)?;

        if let SignalingMessage::Capabilities { version, .. } = &envelope.message {
            if !global::is_supported_version(version) {
                return Err(SignalingError::UnsupportedVersion(version.clone()));
            }
        }

        if !self.seen.insert(envelope.seq) {
            tracing::trace!("Dropping duplicate signaling seq {}", envelope.seq);
            return Ok(Vec::new());
        }

        if !self.ready {
            tracing::trace!("Buffering signaling seq {} until connected", envelope.seq);
            self.buffered.push(envelope);
            return Ok(Vec::new());
        }

        Ok(self.apply(envelope).into_iter().collect())
    }

    /// Release buffered messages in sequence order. Idempotent.
    pub fn mark_ready(&mut self) -> Vec<SignalingMessage> {
        if self.ready {
            return Vec::new();
        }
        self.ready = true;

        let mut buffered = std::mem::take(&mut self.buffered);
        buffered.sort_by_key(|envelope| envelope.seq);
        buffered
            .into_iter()
            .filter_map(|envelope| self.apply(envelope))
            .collect()
    }

    /// Whether inbound messages are applied immediately
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Number of messages waiting for the first connection
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    fn apply(&mut self, envelope: Envelope) -> Option<SignalingMessage> {
        let topic = envelope.message.topic();
        match self.applied.get(&topic) {
            Some(&last) if last > envelope.seq => {
                tracing::trace!(
                    "Discarding stale signaling seq {} (topic last applied {})",
                    envelope.seq,
                    last
                );
                None
            }
            _ => {
                self.applied.insert(topic, envelope.seq);
                Some(envelope.message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplex_crypto::{CALL_KEY_SIZE, CallKey, Direction};

    fn schedules() -> (Arc<KeySchedule>, Arc<KeySchedule>) {
        let key = CallKey::new([3; CALL_KEY_SIZE]);
        (
            Arc::new(KeySchedule::derive(&key, Direction::Outgoing)),
            Arc::new(KeySchedule::derive(&key, Direction::Incoming)),
        )
    }

    fn peer_payload(codec: &SignalingCodec, seq: u64, message: SignalingMessage) -> Vec<u8> {
        codec.encode(&Envelope { seq, message }).unwrap()
    }

    #[test]
    fn test_outbound_sequencing() {
        let (ours, theirs) = schedules();
        let mut channel = SignalingChannel::new(SignalingCodec::new(ours));
        let peer = SignalingCodec::new(theirs);

        let first = channel.encode(SignalingMessage::VideoRequest).unwrap();
        let second = channel.encode(SignalingMessage::VideoAccept).unwrap();

        assert_eq!(peer.decode(&first).unwrap().seq, 1);
        assert_eq!(peer.decode(&second).unwrap().seq, 2);
    }

    #[test]
    fn test_buffered_until_ready() {
        let (ours, theirs) = schedules();
        let mut channel = SignalingChannel::new(SignalingCodec::new(ours));
        let peer = SignalingCodec::new(theirs);

        let stream = peer_payload(&peer, 2, SignalingMessage::VideoStream { active: true });
        let request = peer_payload(&peer, 1, SignalingMessage::VideoRequest);

        assert!(channel.receive(&stream).unwrap().is_empty());
        assert!(channel.receive(&request).unwrap().is_empty());
        assert_eq!(channel.buffered_len(), 2);

        assert_eq!(
            channel.mark_ready(),
            vec![
                SignalingMessage::VideoRequest,
                SignalingMessage::VideoStream { active: true }
            ]
        );
        assert!(channel.mark_ready().is_empty());
        assert!(channel.is_ready());
    }

    #[test]
    fn test_duplicates_and_stale_dropped() {
        let (ours, theirs) = schedules();
        let mut channel = SignalingChannel::new(SignalingCodec::new(ours));
        let peer = SignalingCodec::new(theirs);
        channel.mark_ready();

        let on = peer_payload(&peer, 3, SignalingMessage::VideoStream { active: true });
        let off = peer_payload(&peer, 2, SignalingMessage::VideoStream { active: false });

        assert_eq!(channel.receive(&on).unwrap().len(), 1);
        assert!(channel.receive(&on).unwrap().is_empty());
        // Older message on the same topic arrives late
        assert!(channel.receive(&off).unwrap().is_empty());

        // Other topics are independent
        let request = peer_payload(&peer, 1, SignalingMessage::VideoRequest);
        assert_eq!(channel.receive(&request).unwrap(), vec![SignalingMessage::VideoRequest]);
    }

    #[test]
    fn test_unsupported_version_rejected_while_buffering() {
        let (ours, theirs) = schedules();
        let mut channel = SignalingChannel::new(SignalingCodec::new(ours));
        let peer = SignalingCodec::new(theirs);

        let capabilities = |version: &str| SignalingMessage::Capabilities {
            version: version.into(),
            max_layer: 92,
            supports_video: true,
        };

        let supported = peer_payload(&peer, 1, capabilities("3.0.0"));
        let unknown = peer_payload(&peer, 2, capabilities("9.9.9"));

        assert!(channel.receive(&supported).unwrap().is_empty());
        assert_eq!(
            channel.receive(&unknown),
            Err(SignalingError::UnsupportedVersion("9.9.9".into()))
        );
        assert!(!channel.is_ready());
        assert_eq!(channel.buffered_len(), 1);
    }

    #[test]
    fn test_seen_window_stays_bounded() {
        let (ours, theirs) = schedules();
        let mut channel = SignalingChannel::new(SignalingCodec::new(ours));
        let peer = SignalingCodec::new(theirs);
        channel.mark_ready();

        let stream = |seq: u64| {
            peer_payload(&peer, seq, SignalingMessage::VideoStream { active: seq % 2 == 0 })
        };

        // In-order delivery keeps nothing above the floor
        for seq in 1..=300 {
            assert_eq!(channel.receive(&stream(seq)).unwrap().len(), 1);
        }
        assert_eq!(channel.seen.floor, 300);
        assert!(channel.seen.above.is_empty());
        assert!(channel.receive(&stream(150)).unwrap().is_empty());

        // A gap that never fills is eventually given up on
        for seq in 302..=1_000 {
            channel.receive(&stream(seq)).unwrap();
            assert!(channel.seen.above.len() <= SEEN_WINDOW);
        }
        assert!(channel.seen.floor >= 1_000 - SEEN_WINDOW as u64);
        assert!(channel.receive(&stream(301)).unwrap().is_empty());
        assert!(channel.receive(&stream(999)).unwrap().is_empty());
    }

    #[test]
    fn test_unauthenticated_rejected() {
        let (ours, _) = schedules();
        let mut channel = SignalingChannel::new(SignalingCodec::new(Arc::clone(&ours)));

        // Our own outbound payload is sealed under the other direction's key
        let own = SignalingCodec::new(ours)
            .encode(&Envelope {
                seq: 1,
                message: SignalingMessage::VideoRequest,
            })
            .unwrap();

        assert_eq!(channel.receive(&own), Err(SignalingError::Unauthenticated));
        assert_eq!(channel.receive(b"garbage"), Err(SignalingError::Unauthenticated));
    }

    #[test]
    fn test_closure_sink() {
        let sent = Arc::new(std::sync::Mutex::new(Vec::new()));
        let captured = Arc::clone(&sent);
        let sink = move |payload: Vec<u8>| captured.lock().unwrap().push(payload);
        SignalingSink::send(&sink, vec![1, 2]);
        assert_eq!(sent.lock().unwrap().len(), 1);
    }
}
