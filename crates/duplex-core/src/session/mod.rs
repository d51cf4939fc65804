//! Call session: the caller-facing handle over the session engine.
//!
//! Every mutator is non-blocking: it enqueues a command for the engine task
//! and returns. Queries read a snapshot the engine keeps current. All
//! notifications and completions run on the caller's [`CallQueue`].

mod attempt;
mod engine;

pub use engine::StopCompletion;

use crate::config::SessionConfig;
use crate::descriptor::{ConnectionDescriptor, ProxyConfig, RelayServer};
use crate::error::{CallError, Result};
use crate::global;
use crate::link::LinkCodec;
use crate::network::{DataSavingMode, NetworkType};
use crate::path::{PathKind, PathSelector};
use crate::quality::ConnectivityHistory;
use crate::queue::CallQueue;
use crate::signaling::{SignalingChannel, SignalingCodec, SignalingSink};
use crate::state::CallState;
use crate::stats::{SessionStats, StatsAccumulator};
use crate::transport::PathTransport;
use crate::video::{RemoteVideoState, VideoCapturer, VideoState, VideoView, VideoViewFactory};
use attempt::PathContext;
use duplex_crypto::{Direction, KeyMaterial, KeySchedule};
use engine::{Command, Engine, EngineParts};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, oneshot, watch};

/// Receives session notifications on the caller's queue.
pub trait CallObserver: Send + Sync + 'static {
    /// The `(state, local video, remote video)` triple changed
    fn state_changed(&self, state: CallState, video: VideoState, remote_video: RemoteVideoState);

    /// Signal quality changed (0-4)
    fn signal_bars_changed(&self, bars: i32);
}

/// Final result of a session, handed to the `stop` completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationReport {
    /// The session debug log
    pub debug_log: Option<String>,
    /// Frozen byte counters
    pub stats: SessionStats,
}

/// Construction inputs of a session.
pub struct CallSessionParams {
    /// Protocol version, one of [`global::versions`]`(true)`
    pub version: String,
    /// Endpoint attempted first
    pub primary: ConnectionDescriptor,
    /// Further endpoints, in priority order within their role
    pub alternatives: Vec<ConnectionDescriptor>,
    /// Upstream proxy for every path
    pub proxy: Option<ProxyConfig>,
    /// STUN/TURN server list
    pub relay_servers: Vec<RelayServer>,
    /// Network at construction time
    pub network_type: NetworkType,
    /// Data-saving preference
    pub data_saving: DataSavingMode,
    /// Call key and derived state of the previous session
    pub key_material: KeyMaterial,
    /// We placed the call
    pub is_outgoing: bool,
    /// Highest relay layer we accept
    pub max_layer: i32,
    /// Whether direct peer-to-peer paths may be used
    pub allow_p2p: bool,
    /// Where `stop` writes the debug log
    pub log_path: Option<PathBuf>,
    /// Capturer for a call that starts with video
    pub video_capturer: Option<Arc<dyn VideoCapturer>>,
    /// Source of incoming video views
    pub video_view_factory: Option<Arc<dyn VideoViewFactory>>,
    /// Timing overrides; the process-wide configuration when `None`
    pub config: Option<SessionConfig>,
}

impl CallSessionParams {
    /// Parameters with defaults for everything optional.
    #[must_use]
    pub fn new(
        version: impl Into<String>,
        primary: ConnectionDescriptor,
        key_material: KeyMaterial,
        is_outgoing: bool,
    ) -> Self {
        Self {
            version: version.into(),
            primary,
            alternatives: Vec::new(),
            proxy: None,
            relay_servers: Vec::new(),
            network_type: NetworkType::default(),
            data_saving: DataSavingMode::default(),
            key_material,
            is_outgoing,
            max_layer: global::MAX_LAYER,
            allow_p2p: true,
            log_path: None,
            video_capturer: None,
            video_view_factory: None,
            config: None,
        }
    }

    /// Set alternative descriptors
    #[must_use]
    pub fn with_alternatives(mut self, alternatives: Vec<ConnectionDescriptor>) -> Self {
        self.alternatives = alternatives;
        self
    }

    /// Set the proxy
    #[must_use]
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Set the STUN/TURN server list
    #[must_use]
    pub fn with_relay_servers(mut self, servers: Vec<RelayServer>) -> Self {
        self.relay_servers = servers;
        self
    }

    /// Set network hints
    #[must_use]
    pub fn with_network(mut self, network_type: NetworkType, data_saving: DataSavingMode) -> Self {
        self.network_type = network_type;
        self.data_saving = data_saving;
        self
    }

    /// Set the relay layer upper bound
    #[must_use]
    pub fn with_max_layer(mut self, max_layer: i32) -> Self {
        self.max_layer = max_layer;
        self
    }

    /// Allow or forbid direct paths
    #[must_use]
    pub fn with_p2p(mut self, allow_p2p: bool) -> Self {
        self.allow_p2p = allow_p2p;
        self
    }

    /// Set the debug log file; an empty path disables writing
    #[must_use]
    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.log_path = (!path.as_os_str().is_empty()).then_some(path);
        self
    }

    /// Start the call with video
    #[must_use]
    pub fn with_video_capturer(mut self, capturer: Arc<dyn VideoCapturer>) -> Self {
        self.video_capturer = Some(capturer);
        self
    }

    /// Set the incoming video view factory
    #[must_use]
    pub fn with_video_view_factory(mut self, factory: Arc<dyn VideoViewFactory>) -> Self {
        self.video_view_factory = Some(factory);
        self
    }

    /// Override timings for this session only
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = Some(config);
        self
    }
}

/// Collaborators a session drives.
pub struct SessionEnv {
    /// Serialized context for notifications and completions
    pub queue: Arc<dyn CallQueue>,
    /// State and signal-quality observer
    pub observer: Arc<dyn CallObserver>,
    /// Outbound signaling sink
    pub signaling: Arc<dyn SignalingSink>,
    /// Path transport
    pub transport: Arc<dyn PathTransport>,
    /// Runtime to drive the session on; the current one when `None`
    pub runtime: Option<tokio::runtime::Handle>,
}

/// Read-side view of the engine state.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct SessionSnapshot {
    pub state: CallState,
    pub video_state: VideoState,
    pub remote_video_state: RemoteVideoState,
    pub active_path: Option<i64>,
    pub path_kind: Option<PathKind>,
    pub rtt_ms: Option<u64>,
    pub signal_bars: i32,
    pub reconnects: u32,
    pub negotiated_layer: i32,
    pub version: String,
    pub muted: bool,
    pub network_type: NetworkType,
    pub terminated: bool,
}

pub(crate) struct Shared {
    pub snapshot: SessionSnapshot,
    pub history: ConnectivityHistory,
    pub derived_state: Vec<u8>,
    pub config: SessionConfig,
}

/// Handle to a running call session.
///
/// Dropping the last handle terminates the session without a report.
pub struct CallSession {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<RwLock<Shared>>,
    stats: Arc<StatsAccumulator>,
    version: String,
}

impl CallSession {
    /// Construct and start a session. Never blocks.
    ///
    /// # Errors
    ///
    /// - [`CallError::UnsupportedVersion`] for a version outside
    ///   [`global::versions`]`(true)`
    /// - [`CallError::NoRuntime`] without a tokio runtime
    /// - [`CallError::InvalidConfig`] for inconsistent timings or a
    ///   non-positive `max_layer`
    pub fn new(params: CallSessionParams, env: SessionEnv) -> Result<Self> {
        if !global::is_supported_version(&params.version) {
            return Err(CallError::UnsupportedVersion(params.version));
        }
        if params.max_layer < 1 {
            return Err(CallError::invalid_config("max_layer must be positive"));
        }

        let runtime = match env.runtime {
            Some(handle) => handle,
            None => tokio::runtime::Handle::try_current()
                .map_err(|e| CallError::NoRuntime(e.to_string().into()))?,
        };

        let config = params.config.unwrap_or_else(global::session_config);
        config.validate().map_err(CallError::invalid_config)?;

        let direction = Direction::from_is_outgoing(params.is_outgoing);
        let schedule = Arc::new(KeySchedule::derive(&params.key_material.key, direction));

        let selector = PathSelector::new(
            &params.primary,
            &params.alternatives,
            &params.relay_servers,
            params.allow_p2p,
            params.data_saving,
            params.network_type,
        );
        let stun_hints: Arc<[RelayServer]> = params
            .relay_servers
            .iter()
            .filter(|server| !server.is_turn)
            .cloned()
            .collect();

        let stats = Arc::new(StatsAccumulator::new());
        let (network_tx, network_rx) = watch::channel(params.network_type);

        let ctx = Arc::new(PathContext {
            transport: env.transport,
            codec: LinkCodec::new(Arc::clone(&schedule)),
            stats: Arc::clone(&stats),
            network: network_rx,
            proxy: params.proxy,
            stun_hints,
            config: config.clone(),
        });

        let shared = Arc::new(RwLock::new(Shared {
            snapshot: SessionSnapshot {
                state: CallState::Initializing,
                video_state: VideoState::Possible,
                remote_video_state: RemoteVideoState::Inactive,
                active_path: None,
                path_kind: None,
                rtt_ms: None,
                signal_bars: 0,
                reconnects: 0,
                negotiated_layer: params.max_layer.min(global::max_layer()),
                version: params.version.clone(),
                muted: false,
                network_type: params.network_type,
                terminated: false,
            },
            history: ConnectivityHistory::new(),
            derived_state: params.key_material.derived_state.clone(),
            config,
        }));

        let parts = EngineParts {
            ctx,
            signaling: SignalingChannel::new(SignalingCodec::new(Arc::clone(&schedule))),
            schedule,
            version: params.version.clone(),
            max_layer: params.max_layer,
            log_path: params.log_path,
            derived_state: params.key_material.derived_state,
            selector,
            initial_capturer: params.video_capturer,
            view_factory: params.video_view_factory,
            queue: env.queue,
            observer: env.observer,
            sink: env.signaling,
            shared: Arc::clone(&shared),
            network_tx,
            is_outgoing: params.is_outgoing,
        };

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let engine = Engine::new(parts, events_tx);
        runtime.spawn(engine.run(command_rx, events_rx));

        tracing::info!(
            "Call session started ({}, version {})",
            if params.is_outgoing { "outgoing" } else { "incoming" },
            params.version
        );

        Ok(Self {
            commands,
            shared,
            stats,
            version: params.version,
        })
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("Session engine gone, command dropped");
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Shared) -> T) -> T {
        let guard = self.shared.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    /// Abandon in-flight path work. Idempotent; `stop` stays valid.
    pub fn begin_termination(&self) {
        self.send(Command::BeginTermination);
    }

    /// Terminate and receive the final report on the caller's queue.
    ///
    /// Valid from any state. Calling it again reports the same frozen
    /// report.
    pub fn stop(&self, completion: impl FnOnce(TerminationReport) + Send + 'static) {
        self.send(Command::Stop(Box::new(completion)));
    }

    /// [`stop`](Self::stop), awaiting the report.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Channel`] if the engine is gone.
    pub async fn stop_async(&self) -> Result<TerminationReport> {
        let (tx, rx) = oneshot::channel();
        self.stop(move |report| {
            let _ = tx.send(report);
        });
        rx.await
            .map_err(|_| CallError::Channel("session engine stopped".into()))
    }

    /// Mute or unmute the microphone
    pub fn set_is_muted(&self, muted: bool) {
        self.send(Command::SetMuted(muted));
    }

    /// Report a network change
    pub fn set_network_type(&self, network: NetworkType) {
        self.send(Command::SetNetworkType(network));
    }

    /// Ask the peer for video
    pub fn request_video(&self, capturer: Option<Arc<dyn VideoCapturer>>) {
        self.send(Command::RequestVideo(capturer));
    }

    /// Accept the peer's video request
    pub fn accept_video(&self, capturer: Option<Arc<dyn VideoCapturer>>) {
        self.send(Command::AcceptVideo(capturer));
    }

    /// Produce a view for the peer's video; `None` without a view factory
    pub fn make_incoming_video_view(
        &self,
        completion: impl FnOnce(Option<Arc<dyn VideoView>>) + Send + 'static,
    ) {
        self.send(Command::MakeIncomingVideoView(Box::new(completion)));
    }

    /// Switch cameras; failures are logged, never fatal
    pub fn switch_camera(&self) {
        self.send(Command::SwitchCamera);
    }

    /// Pause or resume local video
    pub fn set_video_enabled(&self, enabled: bool) {
        self.send(Command::SetVideoEnabled(enabled));
    }

    /// Feed a payload received from the peer's signaling sink
    pub fn add_signaling_data(&self, data: Vec<u8>) {
        self.send(Command::AddSignalingData(data));
    }

    /// Whether the call merits asking the user for a rating
    #[must_use]
    pub fn need_rate(&self) -> bool {
        self.read(|shared| {
            shared
                .history
                .need_rate(&shared.config, tokio::time::Instant::now())
        })
    }

    /// JSON object describing the session
    #[must_use]
    pub fn debug_info(&self) -> Option<String> {
        self.read(|shared| serde_json::to_string(&shared.snapshot).ok())
    }

    /// Protocol version the session was constructed with
    #[must_use]
    pub fn version(&self) -> Option<String> {
        Some(self.version.clone())
    }

    /// Derived state to persist for the next session with this peer.
    ///
    /// The blob supplied at construction until the session first
    /// connects; an advanced blob afterwards.
    #[must_use]
    pub fn get_derived_state(&self) -> Vec<u8> {
        self.read(|shared| shared.derived_state.clone())
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> CallState {
        self.read(|shared| shared.snapshot.state)
    }

    /// Live byte counters; the frozen values after `stop`
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SerialQueue;
    use crate::transport::MemoryNetwork;
    use duplex_crypto::{CALL_KEY_SIZE, CallKey};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        states: Mutex<Vec<(CallState, VideoState, RemoteVideoState)>>,
        bars: Mutex<Vec<i32>>,
    }

    impl CallObserver for Recorder {
        fn state_changed(&self, state: CallState, video: VideoState, remote: RemoteVideoState) {
            self.states.lock().unwrap().push((state, video, remote));
        }

        fn signal_bars_changed(&self, bars: i32) {
            self.bars.lock().unwrap().push(bars);
        }
    }

    fn key_material() -> KeyMaterial {
        KeyMaterial::new(CallKey::new([5; CALL_KEY_SIZE]))
    }

    fn env(observer: Arc<Recorder>) -> SessionEnv {
        SessionEnv {
            queue: SerialQueue::spawn(),
            observer,
            signaling: Arc::new(|_payload: Vec<u8>| {}),
            transport: Arc::new(MemoryNetwork::new()),
            runtime: None,
        }
    }

    fn params() -> CallSessionParams {
        CallSessionParams::new(
            "3.0.0",
            ConnectionDescriptor::direct(1, "10.0.0.1", "", 500, vec![1]),
            key_material(),
            true,
        )
    }

    #[tokio::test]
    async fn test_construction_errors() {
        let mut bad_version = params();
        bad_version.version = "0.0.1".into();
        assert!(matches!(
            CallSession::new(bad_version, env(Arc::default())),
            Err(CallError::UnsupportedVersion(_))
        ));

        let bad_layer = params().with_max_layer(0);
        assert!(matches!(
            CallSession::new(bad_layer, env(Arc::default())),
            Err(CallError::InvalidConfig(_))
        ));

        let bad_config = params().with_config(SessionConfig {
            retry_budget: Duration::ZERO,
            ..Default::default()
        });
        assert!(matches!(
            CallSession::new(bad_config, env(Arc::default())),
            Err(CallError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_no_runtime() {
        let result = CallSession::new(params(), {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            // The queue needs a runtime; the session itself is given none
            let queue = SerialQueue::spawn_on(rt.handle());
            SessionEnv {
                queue,
                observer: Arc::new(Recorder::default()),
                signaling: Arc::new(|_payload: Vec<u8>| {}),
                transport: Arc::new(MemoryNetwork::new()),
                runtime: None,
            }
        });
        assert!(matches!(result, Err(CallError::NoRuntime(_))));
    }

    #[tokio::test]
    async fn test_reference_version_accepted_and_queries() {
        let mut p = params().with_log_path("");
        p.version = "2.7.7".into();
        assert!(p.log_path.is_none());

        let session = CallSession::new(p, env(Arc::default())).unwrap();
        assert_eq!(session.version().as_deref(), Some("2.7.7"));
        assert!(!session.need_rate());
        assert!(session.get_derived_state().is_empty());

        let info: serde_json::Value =
            serde_json::from_str(&session.debug_info().unwrap()).unwrap();
        assert_eq!(info["version"], "2.7.7");
        assert_eq!(info["negotiated_layer"], 92);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_connect_reports_twice() {
        let observer = Arc::new(Recorder::default());
        let session = CallSession::new(params(), env(Arc::clone(&observer))).unwrap();

        let first = session.stop_async().await.unwrap();
        let second = session.stop_async().await.unwrap();
        assert_eq!(first, second);
        assert!(first.debug_log.unwrap().contains("Termination requested"));
        assert_eq!(session.stats(), first.stats);

        // Initializing was published; nothing after termination
        let states = observer.states.lock().unwrap().clone();
        assert_eq!(
            states.first(),
            Some(&(CallState::Initializing, VideoState::Possible, RemoteVideoState::Inactive))
        );
        assert!(states.iter().all(|(s, _, _)| *s != CallState::Failed));
    }

    #[tokio::test]
    async fn test_empty_candidates_fail() {
        let observer = Arc::new(Recorder::default());
        let p = params().with_p2p(false);
        let session = CallSession::new(p, env(Arc::clone(&observer))).unwrap();

        // Drain the queue by stopping
        let _ = session.stop_async().await.unwrap();
        let states = observer.states.lock().unwrap().clone();
        assert_eq!(states.first().map(|s| s.0), Some(CallState::Initializing));
        assert_eq!(states.last().map(|s| s.0), Some(CallState::Failed));
        assert_eq!(session.state(), CallState::Failed);
    }
}
