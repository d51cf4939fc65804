//! Candidate endpoints: connection descriptors, relay servers and the proxy.
//!
//! All of these are immutable once constructed and shared read-only between
//! the session and its path attempts.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Username/password pair for endpoints that require authentication.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credentials {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

impl Credentials {
    /// Create a credential pair
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Build from the optional pair the caller hands over; both halves must
    /// be present for credentials to exist.
    #[must_use]
    pub fn from_parts(username: Option<String>, password: Option<String>) -> Option<Self> {
        match (username, password) {
            (Some(username), Some(password)) => Some(Self { username, password }),
            _ => None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Role a connection descriptor plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathRole {
    /// Peer endpoint reached directly
    Direct,
    /// Reflector that forwards traffic between the two peers
    Relay,
}

/// One candidate network endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    id: i64,
    ipv4: String,
    ipv6: String,
    port: u16,
    peer_tag: Vec<u8>,
    role: PathRole,
    credentials: Option<Credentials>,
}

impl ConnectionDescriptor {
    /// Descriptor for a directly reachable peer endpoint.
    #[must_use]
    pub fn direct(
        id: i64,
        ipv4: impl Into<String>,
        ipv6: impl Into<String>,
        port: u16,
        peer_tag: Vec<u8>,
    ) -> Self {
        Self {
            id,
            ipv4: ipv4.into(),
            ipv6: ipv6.into(),
            port,
            peer_tag,
            role: PathRole::Direct,
            credentials: None,
        }
    }

    /// Descriptor for a relay (reflector) endpoint.
    #[must_use]
    pub fn relay(
        id: i64,
        ipv4: impl Into<String>,
        ipv6: impl Into<String>,
        port: u16,
        peer_tag: Vec<u8>,
    ) -> Self {
        Self {
            role: PathRole::Relay,
            ..Self::direct(id, ipv4, ipv6, port, peer_tag)
        }
    }

    /// Attach credentials.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Unique candidate id
    #[must_use]
    pub fn id(&self) -> i64 {
        self.id
    }

    /// IPv4 address, empty when absent
    #[must_use]
    pub fn ipv4(&self) -> &str {
        &self.ipv4
    }

    /// IPv6 address, empty when absent
    #[must_use]
    pub fn ipv6(&self) -> &str {
        &self.ipv6
    }

    /// UDP/TCP port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Tag identifying this call at the endpoint
    #[must_use]
    pub fn peer_tag(&self) -> &[u8] {
        &self.peer_tag
    }

    /// Role of the endpoint
    #[must_use]
    pub fn role(&self) -> PathRole {
        self.role
    }

    /// True for relay descriptors
    #[must_use]
    pub fn is_relay(&self) -> bool {
        self.role == PathRole::Relay
    }

    /// Credentials, if the endpoint requires them
    #[must_use]
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Addresses worth trying, IPv4 first. Empty strings are skipped.
    #[must_use]
    pub fn addresses(&self) -> Vec<&str> {
        [self.ipv4.as_str(), self.ipv6.as_str()]
            .into_iter()
            .filter(|addr| !addr.is_empty())
            .collect()
    }
}

/// A STUN/TURN server from the relay list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayServer {
    /// Host name or address
    pub host: String,
    /// Port
    pub port: u16,
    /// Credentials
    pub credentials: Option<Credentials>,
    /// TURN servers relay media; others only help discover reflexive addresses
    pub is_turn: bool,
}

impl RelayServer {
    /// A TURN server that can carry media.
    #[must_use]
    pub fn turn(host: impl Into<String>, port: u16, credentials: Option<Credentials>) -> Self {
        Self {
            host: host.into(),
            port,
            credentials,
            is_turn: true,
        }
    }

    /// A STUN server used only for address discovery.
    #[must_use]
    pub fn stun(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
            is_turn: false,
        }
    }

    /// `host:port`
    #[must_use]
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The single upstream tunneling hop for every path of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy host
    pub host: String,
    /// Proxy port
    pub port: u16,
    /// Optional credentials
    pub credentials: Option<Credentials>,
}

impl ProxyConfig {
    /// Create a proxy configuration
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, credentials: Option<Credentials>) -> Self {
        Self {
            host: host.into(),
            port,
            credentials,
        }
    }
}

/// Rendezvous identity of a candidate: both peers attempting the same
/// endpoint key meet on the same path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    /// Address used for the attempt
    pub address: String,
    /// Port
    pub port: u16,
    /// Call tag (empty for TURN servers)
    pub tag: Vec<u8>,
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.contains(':') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}
