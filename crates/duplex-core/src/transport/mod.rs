//! Transport collaborator interface.
//!
//! The session never touches sockets. It asks a [`PathTransport`] to open a
//! [`MediaLink`] towards one candidate and then exchanges sealed datagrams
//! over it. Real deployments plug in UDP/TCP/TURN implementations; the
//! in-process [`memory::MemoryNetwork`] backs the tests and the CLI
//! simulation.

use crate::descriptor::{Credentials, EndpointKey, ProxyConfig, RelayServer};
use crate::network::NetworkType;
use crate::path::PathKind;
use async_trait::async_trait;
use std::sync::Arc;

pub mod memory;

pub use memory::MemoryNetwork;

/// Transport layer errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Endpoint cannot be reached
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// Endpoint refused the attempt (bad credentials, unknown tag)
    #[error("refused: {0}")]
    Refused(String),

    /// Link is closed
    #[error("link closed")]
    Closed,

    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Everything the transport needs to open one path.
#[derive(Debug, Clone)]
pub struct PathTarget {
    /// Candidate id the attempt belongs to
    pub candidate_id: i64,
    /// What kind of path this is
    pub kind: PathKind,
    /// Address, port and call tag for this attempt
    pub endpoint: EndpointKey,
    /// Endpoint credentials
    pub credentials: Option<Credentials>,
    /// Upstream proxy every path is tunneled through
    pub proxy: Option<ProxyConfig>,
    /// Non-TURN servers usable for reflexive address discovery
    pub stun_hints: Arc<[RelayServer]>,
    /// Network the device is on at attempt time
    pub network_type: NetworkType,
}

/// Opens media paths.
#[async_trait]
pub trait PathTransport: Send + Sync + 'static {
    /// Open a link towards `target`.
    ///
    /// Resolves once the endpoint is reachable and the link can carry
    /// datagrams. The session bounds the call with its probe timeout and
    /// drops the future if it runs over.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the endpoint cannot be reached.
    async fn open(&self, target: &PathTarget) -> TransportResult<Arc<dyn MediaLink>>;
}

/// An open, datagram-oriented media path.
#[async_trait]
pub trait MediaLink: Send + Sync + 'static {
    /// Send one datagram.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Closed` once either side closed the link.
    async fn send(&self, datagram: Vec<u8>) -> TransportResult<()>;

    /// Receive the next datagram.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Closed` once either side closed the link;
    /// that is the explicit failure signal the session reacts to.
    async fn recv(&self) -> TransportResult<Vec<u8>>;

    /// Close the link. Idempotent.
    fn close(&self);
}
