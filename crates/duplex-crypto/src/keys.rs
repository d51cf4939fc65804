//! The shared call key and everything derived from it.

use crate::CryptoError;
use crate::aead::{AeadKey, PacketSealer};
use crate::hash::Kdf;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the shared call key in bytes.
pub const CALL_KEY_SIZE: usize = 256;

const LINK_OUT_CONTEXT: &str = "duplex 2024 link outgoing-to-incoming";
const LINK_IN_CONTEXT: &str = "duplex 2024 link incoming-to-outgoing";
const SIGNALING_OUT_CONTEXT: &str = "duplex 2024 signaling outgoing-to-incoming";
const SIGNALING_IN_CONTEXT: &str = "duplex 2024 signaling incoming-to-outgoing";
const DERIVED_STATE_CONTEXT: &str = "duplex 2024 derived-state";
const FINGERPRINT_CONTEXT: &str = "duplex 2024 key fingerprint";

const LINK_LABEL: &[u8] = b"duplex/link";
const SIGNALING_LABEL: &[u8] = b"duplex/signaling";
const DERIVED_LABEL: &[u8] = b"duplex/derived-state";

/// Which side of the call this endpoint is.
///
/// Both peers hold the same call key; the direction decides which half of
/// each key pair is used for sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// This endpoint placed the call
    Outgoing,
    /// This endpoint answered the call
    Incoming,
}

impl Direction {
    /// Build from the caller-facing `is_outgoing` flag.
    #[must_use]
    pub fn from_is_outgoing(is_outgoing: bool) -> Self {
        if is_outgoing {
            Self::Outgoing
        } else {
            Self::Incoming
        }
    }

    /// The peer's direction.
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Outgoing => Self::Incoming,
            Self::Incoming => Self::Outgoing,
        }
    }
}

/// Shared secret agreed for the call. Never mutates; zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CallKey(Box<[u8; CALL_KEY_SIZE]>);

impl CallKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub fn new(bytes: [u8; CALL_KEY_SIZE]) -> Self {
        Self(Box::new(bytes))
    }

    /// Create from a slice.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] unless the slice is exactly
    /// [`CALL_KEY_SIZE`] bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; CALL_KEY_SIZE] =
            slice
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: CALL_KEY_SIZE,
                    actual: slice.len(),
                })?;
        Ok(Self::new(bytes))
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; CALL_KEY_SIZE] {
        &self.0
    }

    /// Short public identifier of this key, safe to log and compare.
    #[must_use]
    pub fn fingerprint(&self) -> [u8; 8] {
        Kdf::new(FINGERPRINT_CONTEXT).derive_8(self.as_bytes())
    }
}

impl std::fmt::Debug for CallKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CallKey({:02x?})", self.fingerprint())
    }
}

/// Key material supplied to a session: the call key plus whatever derived
/// state the previous session with the same peer handed back.
#[derive(Clone, Debug)]
pub struct KeyMaterial {
    /// Shared call key
    pub key: CallKey,
    /// Opaque continuation blob, empty when there was no previous session
    pub derived_state: Vec<u8>,
}

impl KeyMaterial {
    /// Key material without prior derived state.
    #[must_use]
    pub fn new(key: CallKey) -> Self {
        Self {
            key,
            derived_state: Vec::new(),
        }
    }

    /// Attach derived state from a previous session.
    #[must_use]
    pub fn with_derived_state(mut self, derived_state: Vec<u8>) -> Self {
        self.derived_state = derived_state;
        self
    }
}

/// All sealers one endpoint needs, derived once from the call key.
#[derive(Clone, Debug)]
pub struct KeySchedule {
    direction: Direction,
    link_send: PacketSealer,
    link_recv: PacketSealer,
    signaling_send: PacketSealer,
    signaling_recv: PacketSealer,
    derived_state: PacketSealer,
    fingerprint: [u8; 8],
}

impl KeySchedule {
    /// Derive the schedule for `direction`.
    #[must_use]
    pub fn derive(key: &CallKey, direction: Direction) -> Self {
        let ikm = key.as_bytes();
        let sealer = |context: &'static str, label: &'static [u8]| {
            PacketSealer::new(AeadKey::new(Kdf::new(context).derive_key(ikm)), label)
        };

        let link_out = sealer(LINK_OUT_CONTEXT, LINK_LABEL);
        let link_in = sealer(LINK_IN_CONTEXT, LINK_LABEL);
        let signaling_out = sealer(SIGNALING_OUT_CONTEXT, SIGNALING_LABEL);
        let signaling_in = sealer(SIGNALING_IN_CONTEXT, SIGNALING_LABEL);

        let (link_send, link_recv, signaling_send, signaling_recv) = match direction {
            Direction::Outgoing => (link_out, link_in, signaling_out, signaling_in),
            Direction::Incoming => (link_in, link_out, signaling_in, signaling_out),
        };

        Self {
            direction,
            link_send,
            link_recv,
            signaling_send,
            signaling_recv,
            derived_state: sealer(DERIVED_STATE_CONTEXT, DERIVED_LABEL),
            fingerprint: key.fingerprint(),
        }
    }

    /// Direction this schedule was derived for.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Sealer for datagrams this endpoint sends on a path.
    #[must_use]
    pub fn link_send(&self) -> &PacketSealer {
        &self.link_send
    }

    /// Opener for datagrams the peer sends on a path.
    #[must_use]
    pub fn link_recv(&self) -> &PacketSealer {
        &self.link_recv
    }

    /// Sealer for outbound signaling payloads.
    #[must_use]
    pub fn signaling_send(&self) -> &PacketSealer {
        &self.signaling_send
    }

    /// Opener for inbound signaling payloads.
    #[must_use]
    pub fn signaling_recv(&self) -> &PacketSealer {
        &self.signaling_recv
    }

    /// Sealer for the derived-state blob (same on both sides).
    #[must_use]
    pub fn derived_state(&self) -> &PacketSealer {
        &self.derived_state
    }

    /// Fingerprint of the call key.
    #[must_use]
    pub fn fingerprint(&self) -> [u8; 8] {
        self.fingerprint
    }
}
