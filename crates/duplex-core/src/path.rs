//! Candidate ordering and failover.
//!
//! The selector flattens the construction inputs into one ordered
//! candidate list and hands candidates out round by round:
//!
//! 1. the primary descriptor
//! 2. direct alternatives, in supplied order
//! 3. relay alternatives, in supplied order
//! 4. TURN servers from the relay list
//!
//! With peer-to-peer disallowed, direct descriptors are left out entirely.
//! While data saving is active, TURN servers are held back for the first
//! round. Within a round a candidate is handed out at most once. After the
//! active path is lost, the next round offers it last.

use crate::descriptor::{ConnectionDescriptor, Credentials, EndpointKey, PathRole, RelayServer};
use crate::network::{DataSavingMode, NetworkType};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

/// Kind of media path a candidate offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PathKind {
    /// Direct peer-to-peer
    Direct,
    /// Reflector descriptor
    Relay,
    /// TURN server from the relay list
    Turn,
}

impl PathKind {
    /// True for every path that goes through a third party
    #[must_use]
    pub fn is_relayed(self) -> bool {
        !matches!(self, PathKind::Direct)
    }
}

impl fmt::Display for PathKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PathKind::Direct => "direct",
            PathKind::Relay => "relay",
            PathKind::Turn => "turn",
        };
        f.write_str(name)
    }
}

/// One entry of the candidate list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Descriptor id; TURN servers get negative ids by list position
    pub id: i64,
    /// Path kind
    pub kind: PathKind,
    /// Rendezvous keys, one per address family, IPv4 first
    pub endpoints: Vec<EndpointKey>,
    /// Credentials presented to the endpoint
    pub credentials: Option<Credentials>,
}

impl Candidate {
    /// Candidate for a connection descriptor
    #[must_use]
    pub fn from_descriptor(descriptor: &ConnectionDescriptor) -> Self {
        let kind = match descriptor.role() {
            PathRole::Direct => PathKind::Direct,
            PathRole::Relay => PathKind::Relay,
        };
        let endpoints = descriptor
            .addresses()
            .into_iter()
            .map(|address| EndpointKey {
                address: address.to_string(),
                port: descriptor.port(),
                tag: descriptor.peer_tag().to_vec(),
            })
            .collect();

        Self {
            id: descriptor.id(),
            kind,
            endpoints,
            credentials: descriptor.credentials().cloned(),
        }
    }

    /// Candidate for the TURN server at `index` in the relay list
    #[must_use]
    pub fn from_turn_server(index: usize, server: &RelayServer) -> Self {
        let id = -(i64::try_from(index).unwrap_or(i64::MAX - 1) + 1);
        Self {
            id,
            kind: PathKind::Turn,
            endpoints: vec![EndpointKey {
                address: server.host.clone(),
                port: server.port,
                tag: Vec::new(),
            }],
            credentials: server.credentials.clone(),
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.id, self.kind)?;
        if let Some(endpoint) = self.endpoints.first() {
            write!(f, " {}", endpoint)?;
        }
        Ok(())
    }
}

/// Orders candidates and tracks failover rounds.
#[derive(Debug)]
pub struct PathSelector {
    candidates: Vec<Candidate>,
    data_saving: DataSavingMode,
    network: NetworkType,
    round: u32,
    tried: HashSet<i64>,
    demoted: Option<i64>,
    attempts: u32,
    active: Option<i64>,
}

impl PathSelector {
    /// Build the candidate list from the construction inputs.
    #[must_use]
    pub fn new(
        primary: &ConnectionDescriptor,
        alternatives: &[ConnectionDescriptor],
        relay_servers: &[RelayServer],
        allow_p2p: bool,
        data_saving: DataSavingMode,
        network: NetworkType,
    ) -> Self {
        let admitted = |d: &&ConnectionDescriptor| allow_p2p || d.is_relay();

        let mut candidates: Vec<Candidate> = std::iter::once(primary)
            .chain(alternatives.iter().filter(|d| !d.is_relay()))
            .chain(alternatives.iter().filter(|d| d.is_relay()))
            .filter(admitted)
            .filter(|d| !d.addresses().is_empty())
            .map(Candidate::from_descriptor)
            .collect();

        // Duplicate ids keep their first (highest priority) position
        let mut seen = HashSet::new();
        candidates.retain(|c| seen.insert(c.id));

        candidates.extend(
            relay_servers
                .iter()
                .enumerate()
                .filter(|(_, server)| server.is_turn)
                .map(|(index, server)| Candidate::from_turn_server(index, server)),
        );

        tracing::debug!(
            "Path candidates: [{}]",
            candidates
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );

        Self {
            candidates,
            data_saving,
            network,
            round: 0,
            tried: HashSet::new(),
            demoted: None,
            attempts: 0,
            active: None,
        }
    }

    /// Ordered candidate list
    #[must_use]
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// True if there is nothing to attempt at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Current failover round (0-based)
    #[must_use]
    pub fn round(&self) -> u32 {
        self.round
    }

    /// Attempts handed out across all rounds
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Id of the candidate carrying traffic, if any
    #[must_use]
    pub fn active(&self) -> Option<i64> {
        self.active
    }

    /// Look up a candidate by id
    #[must_use]
    pub fn candidate(&self, id: i64) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.id == id)
    }

    fn is_admitted(&self, candidate: &Candidate) -> bool {
        let withhold_turn = self.round == 0 && self.data_saving.is_active(self.network);
        !(withhold_turn && candidate.kind == PathKind::Turn)
    }

    /// Hand out the next candidate of the current round.
    ///
    /// Returns `None` once every admitted candidate has been tried in this
    /// round; call [`begin_round`](Self::begin_round) to start over.
    /// A demoted candidate is handed out only when nothing else is left.
    pub fn next_candidate(&mut self) -> Option<Candidate> {
        let next = self
            .candidates
            .iter()
            .filter(|c| !self.tried.contains(&c.id) && self.is_admitted(c))
            .min_by_key(|c| self.demoted == Some(c.id))?
            .clone();

        self.tried.insert(next.id);
        self.attempts += 1;
        tracing::debug!("Round {}: attempting candidate {}", self.round, next);
        Some(next)
    }

    /// Record that `id` now carries traffic.
    pub fn mark_active(&mut self, id: i64) {
        self.active = Some(id);
    }

    /// The active path was lost: start a new round that offers it last.
    pub fn path_lost(&mut self) {
        let lost = self.active.take();
        self.begin_round();
        self.demoted = lost;
    }

    /// Start a new failover round from the top of the list.
    pub fn begin_round(&mut self) {
        self.round += 1;
        self.tried.clear();
        self.demoted = None;
    }

    /// Update the network hint; affects data-saving admission of TURN servers.
    pub fn set_network_type(&mut self, network: NetworkType) {
        self.network = network;
    }
}
