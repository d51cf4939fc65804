//! Two-party test fixture for integration testing
//!
//! Wires a caller and a callee session over one [`MemoryNetwork`]:
//! - each side's signaling sink feeds the other side's `add_signaling_data`
//! - every state and signal-bar notification is recorded with a timestamp
//! - outbound signaling can be held back and released later
//!
//! # Example
//!
//! ```no_run
//! use duplex_integration_tests::fixtures::{PartyOptions, TwoPartyFixture, call_key};
//!
//! # async fn demo() {
//! let key = call_key(1);
//! let fixture = TwoPartyFixture::build(
//!     PartyOptions::caller(&key),
//!     PartyOptions::callee(&key),
//! )
//! .unwrap();
//! assert!(fixture.wait_connected().await);
//! # }
//! ```

use crate::test_helpers::wait_until;
use duplex_core::{
    CallError, CallObserver, CallSession, CallSessionParams, CallState, ConnectionDescriptor,
    MemoryNetwork, RemoteVideoState, RetryConfig, SerialQueue, SessionConfig, SessionEnv,
    SignalingSink, VideoState,
};
use duplex_crypto::{CALL_KEY_SIZE, CallKey, KeyMaterial};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// IPv4 address of the default primary descriptor
pub const PRIMARY_V4: &str = "10.0.0.1";

/// Port of the default primary descriptor
pub const PRIMARY_PORT: u16 = 5000;

const PEER_TAG: [u8; 4] = [0xca, 0x11, 0x00, 0x01];

/// Session timings scaled down so a test runs in about a second
pub fn fast_config() -> SessionConfig {
    let ms = Duration::from_millis;
    SessionConfig {
        probe_timeout: ms(400),
        challenge_interval: ms(20),
        keepalive_interval: ms(50),
        liveness_timeout: ms(300),
        retry_budget: ms(1500),
        retry: RetryConfig {
            initial_backoff: ms(20),
            max_backoff: ms(100),
            multiplier: 2.0,
            jitter: false,
        },
        ..Default::default()
    }
}

/// Key material derived from a one-byte seed
pub fn call_key(seed: u8) -> KeyMaterial {
    KeyMaterial::new(CallKey::new([seed; CALL_KEY_SIZE]))
}

/// The default direct primary both parties share
pub fn primary() -> ConnectionDescriptor {
    ConnectionDescriptor::direct(1, PRIMARY_V4, "", PRIMARY_PORT, PEER_TAG.to_vec())
}

/// A relay descriptor at `198.51.100.<host>:443`
pub fn relay(id: i64, host: u8) -> ConnectionDescriptor {
    ConnectionDescriptor::relay(id, format!("198.51.100.{host}"), "", 443, PEER_TAG.to_vec())
}

/// One recorded state notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateRecord {
    /// Time since the recorder was created
    pub at: Duration,
    /// Call state
    pub state: CallState,
    /// Local video state
    pub video: VideoState,
    /// Remote video state
    pub remote: RemoteVideoState,
}

/// Observer that records every notification.
pub struct Recorder {
    started: Instant,
    states: Mutex<Vec<StateRecord>>,
    bars: Mutex<Vec<i32>>,
}

impl Recorder {
    /// Create an empty recorder
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            states: Mutex::new(Vec::new()),
            bars: Mutex::new(Vec::new()),
        })
    }

    /// Every state notification so far
    pub fn records(&self) -> Vec<StateRecord> {
        self.states.lock().unwrap().clone()
    }

    /// Call states in notification order
    pub fn states(&self) -> Vec<CallState> {
        self.records().iter().map(|r| r.state).collect()
    }

    /// Call states with consecutive repeats collapsed
    pub fn transitions(&self) -> Vec<CallState> {
        let mut states = self.states();
        states.dedup();
        states
    }

    /// Most recent notification
    pub fn last(&self) -> Option<StateRecord> {
        self.records().last().copied()
    }

    /// First notification carrying `state`
    pub fn first_with(&self, state: CallState) -> Option<StateRecord> {
        self.records().into_iter().find(|r| r.state == state)
    }

    /// Whether `state` was ever notified
    pub fn saw(&self, state: CallState) -> bool {
        self.first_with(state).is_some()
    }

    /// Signal bar notifications so far
    pub fn bars(&self) -> Vec<i32> {
        self.bars.lock().unwrap().clone()
    }
}

impl CallObserver for Recorder {
    fn state_changed(&self, state: CallState, video: VideoState, remote: RemoteVideoState) {
        let record = StateRecord {
            at: self.started.elapsed(),
            state,
            video,
            remote,
        };
        tracing::debug!("observed {:?}", record);
        self.states.lock().unwrap().push(record);
    }

    fn signal_bars_changed(&self, bars: i32) {
        self.bars.lock().unwrap().push(bars);
    }
}

/// What a party's signaling sink does with outbound payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Hand every payload to the peer at once
    Forward,
    /// Keep payloads until [`Outbox::release`] is called
    Hold,
}

/// Signaling sink of one party.
pub struct Outbox {
    hold: AtomicBool,
    held: Mutex<Vec<Vec<u8>>>,
    sent: Mutex<Vec<Vec<u8>>>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl Outbox {
    fn new(delivery: Delivery, tx: mpsc::UnboundedSender<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            hold: AtomicBool::new(delivery == Delivery::Hold),
            held: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            tx,
        })
    }

    /// Every payload the session produced, held or not
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    /// Deliver everything held so far and forward from now on.
    /// Returns the number of payloads released.
    pub fn release(&self) -> usize {
        self.hold.store(false, Ordering::SeqCst);
        let held = std::mem::take(&mut *self.held.lock().unwrap());
        let count = held.len();
        for payload in held {
            let _ = self.tx.send(payload);
        }
        count
    }
}

impl SignalingSink for Outbox {
    fn send(&self, payload: Vec<u8>) {
        self.sent.lock().unwrap().push(payload.clone());
        if self.hold.load(Ordering::SeqCst) {
            self.held.lock().unwrap().push(payload);
        } else {
            let _ = self.tx.send(payload);
        }
    }
}

/// Construction inputs of one party.
pub struct PartyOptions {
    /// Session parameters
    pub params: CallSessionParams,
    /// Signaling behavior
    pub delivery: Delivery,
}

impl PartyOptions {
    /// Outgoing party on the default primary with fast timings
    pub fn caller(key: &KeyMaterial) -> Self {
        Self::new(key, true)
    }

    /// Incoming party on the default primary with fast timings
    pub fn callee(key: &KeyMaterial) -> Self {
        Self::new(key, false)
    }

    fn new(key: &KeyMaterial, is_outgoing: bool) -> Self {
        Self {
            params: CallSessionParams::new("3.0.0", primary(), key.clone(), is_outgoing)
                .with_config(fast_config()),
            delivery: Delivery::Forward,
        }
    }

    /// Adjust the session parameters
    pub fn with(mut self, f: impl FnOnce(CallSessionParams) -> CallSessionParams) -> Self {
        self.params = f(self.params);
        self
    }

    /// Hold outbound signaling until released
    pub fn holding_signaling(mut self) -> Self {
        self.delivery = Delivery::Hold;
        self
    }
}

/// One side of the call.
pub struct Party {
    /// The session handle
    pub session: Arc<CallSession>,
    /// Notifications the session delivered
    pub observer: Arc<Recorder>,
    /// Outbound signaling
    pub outbox: Arc<Outbox>,
}

impl Party {
    /// Wait until `state` has been notified
    pub async fn wait_for(&self, state: CallState, timeout: Duration) -> bool {
        let observer = Arc::clone(&self.observer);
        wait_until(timeout, move || observer.saw(state)).await
    }

    /// Wait until the latest notification satisfies `predicate`
    pub async fn wait_for_last(
        &self,
        timeout: Duration,
        predicate: impl Fn(&StateRecord) -> bool,
    ) -> bool {
        let observer = Arc::clone(&self.observer);
        wait_until(timeout, move || observer.last().is_some_and(|r| predicate(&r))).await
    }
}

/// A caller and a callee wired to each other.
pub struct TwoPartyFixture {
    /// Shared in-memory network
    pub network: MemoryNetwork,
    /// Outgoing side
    pub caller: Party,
    /// Incoming side
    pub callee: Party,
}

impl TwoPartyFixture {
    /// Build both parties on a fresh network.
    ///
    /// # Errors
    ///
    /// Returns the construction error of either session.
    pub fn build(caller: PartyOptions, callee: PartyOptions) -> Result<Self, CallError> {
        Self::build_on(MemoryNetwork::new(), caller, callee)
    }

    /// Build both parties on `network`, which may already have
    /// unreachable or blackholed endpoints.
    ///
    /// # Errors
    ///
    /// Returns the construction error of either session.
    pub fn build_on(
        network: MemoryNetwork,
        caller: PartyOptions,
        callee: PartyOptions,
    ) -> Result<Self, CallError> {
        let (to_callee_tx, to_callee_rx) = mpsc::unbounded_channel();
        let (to_caller_tx, to_caller_rx) = mpsc::unbounded_channel();

        let caller = Self::party(&network, caller, to_callee_tx)?;
        let callee = Self::party(&network, callee, to_caller_tx)?;

        Self::pump(to_callee_rx, Arc::clone(&callee.session));
        Self::pump(to_caller_rx, Arc::clone(&caller.session));

        Ok(Self {
            network,
            caller,
            callee,
        })
    }

    fn party(
        network: &MemoryNetwork,
        options: PartyOptions,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<Party, CallError> {
        let observer = Recorder::new();
        let outbox = Outbox::new(options.delivery, tx);
        let session = CallSession::new(
            options.params,
            SessionEnv {
                queue: SerialQueue::spawn(),
                observer: Arc::clone(&observer) as Arc<dyn CallObserver>,
                signaling: Arc::clone(&outbox) as Arc<dyn SignalingSink>,
                transport: Arc::new(network.clone()),
                runtime: None,
            },
        )?;

        Ok(Party {
            session: Arc::new(session),
            observer,
            outbox,
        })
    }

    fn pump(mut rx: mpsc::UnboundedReceiver<Vec<u8>>, to: Arc<CallSession>) {
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                to.add_signaling_data(payload);
            }
        });
    }

    /// Wait until both sides have been notified `Connected`
    pub async fn wait_connected(&self) -> bool {
        let timeout = Duration::from_secs(3);
        self.caller.wait_for(CallState::Connected, timeout).await
            && self.callee.wait_for(CallState::Connected, timeout).await
    }
}
