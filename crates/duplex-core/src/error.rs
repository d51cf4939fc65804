//! Error types for the call session core.
//!
//! Errors are categorized along the failure taxonomy the session uses to
//! decide what happens next:
//!
//! - **Transient**: a path attempt or an active path failed; the path
//!   selector fails over and the caller never sees the error
//! - **Permanent**: key or protocol failures; the session moves to
//!   `Failed` at once and nothing is retried
//!
//! Construction is the only place a `CallError` is returned to the caller.
//! After that, failures surface exclusively as state notifications.

use crate::transport::TransportError;
use duplex_crypto::CryptoError;
use std::borrow::Cow;
use thiserror::Error;

/// Errors produced inside the call session core
#[derive(Debug, Error, Clone)]
pub enum CallError {
    // ============ Construction Errors ============
    /// Protocol version not in the supported set
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// No tokio runtime available to drive the session
    #[error("no async runtime available: {0}")]
    NoRuntime(Cow<'static, str>),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    // ============ Connectivity Errors ============
    /// A path attempt failed in the transport
    #[error("path {id} unavailable: {reason}")]
    PathUnavailable {
        /// Candidate id
        id: i64,
        /// Transport reason
        reason: TransportError,
    },

    /// Key handshake on a path did not complete in time
    #[error("path {0} handshake timed out")]
    HandshakeTimeout(i64),

    /// Active path went silent past the liveness timeout
    #[error("path {0} liveness timeout")]
    LivenessTimeout(i64),

    /// Active path was closed by the transport or the peer
    #[error("path {0} closed")]
    PathClosed(i64),

    /// Every candidate failed for the whole retry budget
    #[error("all candidates exhausted after {attempts} attempts")]
    CandidatesExhausted {
        /// Attempts made across all rounds
        attempts: u32,
    },

    // ============ Key / Protocol Errors ============
    /// Cryptographic failure (key mismatch, derived-state damage)
    #[error("key error: {0}")]
    Key(CryptoError),

    /// Malformed or unauthenticated signaling payload
    #[error("malformed signaling: {0}")]
    MalformedSignaling(Cow<'static, str>),

    /// Peer speaks an incompatible protocol
    #[error("protocol error: {0}")]
    Protocol(Cow<'static, str>),

    // ============ Operational Errors ============
    /// Internal channel closed
    #[error("channel error: {0}")]
    Channel(Cow<'static, str>),

    /// Server configuration blob could not be parsed
    #[error("server config error: {0}")]
    ServerConfig(String),
}

impl CallError {
    /// Returns true if the path selector recovers from this locally
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CallError::PathUnavailable { .. }
                | CallError::HandshakeTimeout(_)
                | CallError::LivenessTimeout(_)
                | CallError::PathClosed(_)
        )
    }

    /// Returns true if this error ends the session without retry
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            CallError::Key(_)
                | CallError::MalformedSignaling(_)
                | CallError::Protocol(_)
                | CallError::CandidatesExhausted { .. }
        )
    }

    /// Create a protocol error with static context (zero allocation)
    #[must_use]
    pub const fn protocol(context: &'static str) -> Self {
        CallError::Protocol(Cow::Borrowed(context))
    }

    /// Create a malformed-signaling error with static context (zero allocation)
    #[must_use]
    pub const fn malformed_signaling(context: &'static str) -> Self {
        CallError::MalformedSignaling(Cow::Borrowed(context))
    }

    /// Create an invalid-config error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        CallError::InvalidConfig(Cow::Borrowed(context))
    }
}

impl From<CryptoError> for CallError {
    fn from(err: CryptoError) -> Self {
        CallError::Key(err)
    }
}

/// Result type for session core operations
pub type Result<T> = std::result::Result<T, CallError>;
