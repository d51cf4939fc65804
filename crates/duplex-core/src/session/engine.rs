//! The session engine: one task owning every piece of mutable session state.
//!
//! The public [`CallSession`](super::CallSession) handle only sends
//! [`Command`]s; path tasks only send [`EngineEvent`]s. The engine applies
//! both in arrival order, so every externally visible effect is produced in
//! a single order and dispatched onto the caller's queue in that order.

use super::attempt::{self, EngineEvent, PathContext, VerifiedPath};
use super::{CallObserver, SessionSnapshot, Shared, TerminationReport};
use crate::config::SessionConfig;
use crate::debug_log::DebugLog;
use crate::error::CallError;
use crate::global;
use crate::network::NetworkType;
use crate::path::{Candidate, PathKind, PathSelector};
use crate::quality::{ConnectivityHistory, signal_bars};
use crate::queue::CallQueue;
use crate::signaling::{SignalingChannel, SignalingError, SignalingMessage, SignalingSink};
use crate::state::{CallState, CallStateMachine};
use crate::transport::MediaLink;
use crate::video::{
    RemoteVideoState, VideoCapturer, VideoNegotiator, VideoState, VideoView, VideoViewFactory,
    ViewCompletion,
};
use duplex_crypto::{DerivedRecord, DerivedState, KeySchedule};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Completion receiving the termination report.
pub type StopCompletion = Box<dyn FnOnce(TerminationReport) + Send>;

/// Requests from the public handle.
pub(crate) enum Command {
    AddSignalingData(Vec<u8>),
    SetMuted(bool),
    SetNetworkType(NetworkType),
    RequestVideo(Option<Arc<dyn VideoCapturer>>),
    AcceptVideo(Option<Arc<dyn VideoCapturer>>),
    MakeIncomingVideoView(ViewCompletion),
    SwitchCamera,
    SetVideoEnabled(bool),
    BeginTermination,
    Stop(StopCompletion),
}

struct ActivePath {
    candidate: Candidate,
    link: Arc<dyn MediaLink>,
    task: JoinHandle<()>,
    rtt: Duration,
}

/// Construction-time inputs of the engine.
pub(crate) struct EngineParts {
    pub ctx: Arc<PathContext>,
    pub schedule: Arc<KeySchedule>,
    pub version: String,
    pub max_layer: i32,
    pub log_path: Option<PathBuf>,
    pub derived_state: Vec<u8>,
    pub selector: PathSelector,
    pub signaling: SignalingChannel,
    pub initial_capturer: Option<Arc<dyn VideoCapturer>>,
    pub view_factory: Option<Arc<dyn VideoViewFactory>>,
    pub queue: Arc<dyn CallQueue>,
    pub observer: Arc<dyn CallObserver>,
    pub sink: Arc<dyn SignalingSink>,
    pub shared: Arc<RwLock<Shared>>,
    pub network_tx: watch::Sender<NetworkType>,
    pub is_outgoing: bool,
}

pub(crate) struct Engine {
    ctx: Arc<PathContext>,
    config: SessionConfig,
    schedule: Arc<KeySchedule>,
    version: String,
    max_layer: i32,
    log_path: Option<PathBuf>,
    initial_derived: Vec<u8>,
    prior_record: Option<DerivedRecord>,
    selector: PathSelector,
    signaling: SignalingChannel,
    video: VideoNegotiator,
    initial_capturer: Option<Arc<dyn VideoCapturer>>,
    view_factory: Option<Arc<dyn VideoViewFactory>>,
    machine: CallStateMachine,
    history: ConnectivityHistory,
    log: DebugLog,
    queue: Arc<dyn CallQueue>,
    observer: Arc<dyn CallObserver>,
    sink: Arc<dyn SignalingSink>,
    shared: Arc<RwLock<Shared>>,
    network_tx: watch::Sender<NetworkType>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    is_outgoing: bool,

    epoch: u64,
    attempt: Option<JoinHandle<()>>,
    active: Option<ActivePath>,
    next_round_at: Option<Instant>,
    budget_deadline: Option<Instant>,
    published: Option<(CallState, VideoState, RemoteVideoState)>,
    bars: Option<i32>,
    negotiated_layer: i32,
    muted: bool,
    last_path_id: Option<i64>,
    derived_out: Option<Vec<u8>>,
    terminating: bool,
    report: Option<TerminationReport>,
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Engine {
    pub(crate) fn new(parts: EngineParts, events_tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        let config = parts.ctx.config.clone();
        Self {
            log: DebugLog::new(config.debug_log_lines),
            config,
            ctx: parts.ctx,
            schedule: parts.schedule,
            version: parts.version,
            max_layer: parts.max_layer,
            log_path: parts.log_path,
            initial_derived: parts.derived_state,
            prior_record: None,
            selector: parts.selector,
            signaling: parts.signaling,
            video: VideoNegotiator::new(),
            initial_capturer: parts.initial_capturer,
            view_factory: parts.view_factory,
            machine: CallStateMachine::new(),
            history: ConnectivityHistory::new(),
            queue: parts.queue,
            observer: parts.observer,
            sink: parts.sink,
            shared: parts.shared,
            network_tx: parts.network_tx,
            events_tx,
            is_outgoing: parts.is_outgoing,
            epoch: 0,
            attempt: None,
            active: None,
            next_round_at: None,
            budget_deadline: None,
            published: None,
            bars: None,
            negotiated_layer: parts.max_layer.min(global::max_layer()),
            muted: false,
            last_path_id: None,
            derived_out: None,
            terminating: false,
            report: None,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<EngineEvent>,
    ) {
        self.start();

        loop {
            let next_round_at = self.next_round_at;
            let budget_deadline = self.budget_deadline;

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
                () = sleep_opt(budget_deadline) => {
                    self.budget_deadline = None;
                    let attempts = self.selector.attempts();
                    self.fail(CallError::CandidatesExhausted { attempts });
                }
                () = sleep_opt(next_round_at) => {
                    self.next_round_at = None;
                    self.selector.begin_round();
                    self.advance();
                }
            }
        }

        self.begin_termination();
        tracing::debug!("Session engine exiting");
    }

    // ============ Lifecycle ============

    fn start(&mut self) {
        self.log.push(format_args!(
            "Session start: version {}, {}, {} candidate(s), max layer {}, key {}",
            self.version,
            if self.is_outgoing { "outgoing" } else { "incoming" },
            self.selector.candidates().len(),
            self.max_layer,
            hex::encode(self.schedule.fingerprint())
        ));

        let video_out = match self.initial_capturer.take() {
            Some(capturer) => self.video.request_video(Some(capturer)),
            None => Vec::new(),
        };
        self.publish();

        match DerivedState::open(&self.schedule, &self.initial_derived) {
            Ok(record) => {
                if let Some(record) = &record {
                    self.log.push(format_args!(
                        "Derived state generation {} accepted",
                        record.generation
                    ));
                }
                self.prior_record = record;
            }
            Err(e) => {
                self.fail(CallError::Key(e));
                return;
            }
        }

        self.send_signaling(SignalingMessage::Capabilities {
            version: self.version.clone(),
            max_layer: self.max_layer,
            supports_video: true,
        });
        for message in video_out {
            self.send_signaling(message);
        }

        if self.selector.is_empty() {
            self.fail(CallError::CandidatesExhausted { attempts: 0 });
            return;
        }
        self.advance();
    }

    fn is_inactive(&self) -> bool {
        self.terminating || self.machine.state().is_terminal()
    }

    fn fail(&mut self, error: CallError) {
        if self.is_inactive() {
            return;
        }
        tracing::warn!("Call failed: {}", error);
        self.log.push(format_args!("Failed: {}", error));

        self.abort_paths();
        self.history.on_ended(Instant::now());
        self.machine.transition_to(CallState::Failed);
        self.publish();
        self.update_bars();
    }

    fn abort_paths(&mut self) {
        if let Some(task) = self.attempt.take() {
            task.abort();
        }
        if let Some(active) = self.active.take() {
            active.task.abort();
            active.link.close();
        }
        self.next_round_at = None;
        self.budget_deadline = None;
    }

    fn begin_termination(&mut self) {
        if self.terminating {
            return;
        }
        self.log.push("Termination requested");
        self.abort_paths();
        self.history.on_ended(Instant::now());
        self.terminating = true;
        self.sync_shared();
    }

    async fn finish(&mut self) -> TerminationReport {
        self.begin_termination();

        let stats = self.ctx.stats.freeze();
        self.refresh_derived();
        self.log.push(format_args!(
            "Stopped: sent {}/{} received {}/{} (wifi/mobile)",
            stats.bytes_sent_wifi,
            stats.bytes_sent_mobile,
            stats.bytes_received_wifi,
            stats.bytes_received_mobile
        ));

        let debug_log = self.log.render();
        if let Some(path) = &self.log_path {
            if let Err(e) = tokio::fs::write(path, &debug_log).await {
                tracing::warn!("Failed to write debug log to {}: {}", path.display(), e);
            }
        }

        self.sync_shared();
        TerminationReport {
            debug_log: Some(debug_log),
            stats,
        }
    }

    // ============ Path selection ============

    fn advance(&mut self) {
        if self.is_inactive() || self.attempt.is_some() || self.active.is_some() {
            return;
        }

        match self.selector.next_candidate() {
            Some(candidate) => self.spawn_attempt(candidate),
            None => {
                if self.machine.state() == CallState::Initializing {
                    self.enter_reconnecting();
                }
                let delay = self.config.retry.backoff_duration(self.selector.round());
                self.log.push(format_args!(
                    "Round {} exhausted, next round in {} ms",
                    self.selector.round(),
                    delay.as_millis()
                ));
                self.next_round_at = Some(Instant::now() + delay);
            }
        }
    }

    fn spawn_attempt(&mut self, candidate: Candidate) {
        self.epoch += 1;
        let epoch = self.epoch;
        self.log.push(format_args!("Attempting {}", candidate));

        let ctx = Arc::clone(&self.ctx);
        let events = self.events_tx.clone();
        self.attempt = Some(tokio::spawn(async move {
            let result = attempt::attempt(ctx, &candidate).await;
            let _ = events.send(EngineEvent::AttemptDone {
                epoch,
                candidate,
                result,
            });
        }));
    }

    fn enter_reconnecting(&mut self) {
        if !self.machine.transition_to(CallState::Reconnecting) {
            return;
        }
        let now = Instant::now();
        self.history.on_reconnecting(now);
        self.budget_deadline = Some(now + self.config.retry_budget);
        self.log.push("Reconnecting");
        self.publish();
        self.update_bars();
    }

    fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::AttemptDone {
                epoch,
                candidate,
                result,
            } => {
                if epoch != self.epoch || self.is_inactive() {
                    if let Ok(path) = result {
                        path.link.close();
                    }
                    return;
                }
                self.attempt = None;

                match result {
                    Ok(path) => self.on_verified(candidate, path),
                    Err(e) if e.is_permanent() => self.fail(e),
                    Err(e) => {
                        self.log.push(format_args!("Candidate {} failed: {}", candidate.id, e));
                        if self.machine.state() == CallState::Initializing {
                            self.enter_reconnecting();
                        }
                        self.advance();
                    }
                }
            }
            EngineEvent::PathLost { epoch, error } => {
                if epoch != self.epoch || self.is_inactive() {
                    return;
                }
                let Some(active) = self.active.take() else {
                    return;
                };
                active.link.close();
                self.log.push(format_args!("Path {} lost: {}", active.candidate.id, error));
                self.selector.path_lost();

                if error.is_permanent() {
                    self.fail(error);
                    return;
                }
                self.enter_reconnecting();
                self.advance();
            }
            EngineEvent::Rtt { epoch, rtt } => {
                if epoch != self.epoch {
                    return;
                }
                if let Some(active) = self.active.as_mut() {
                    active.rtt = rtt;
                    self.update_bars();
                    self.sync_shared();
                }
            }
        }
    }

    fn on_verified(&mut self, candidate: Candidate, path: VerifiedPath) {
        self.log.push(format_args!(
            "Connected via {} at {}, rtt {} ms",
            candidate,
            path.endpoint,
            path.rtt.as_millis()
        ));

        self.selector.mark_active(candidate.id);
        self.last_path_id = Some(candidate.id);
        self.next_round_at = None;
        self.budget_deadline = None;

        self.epoch += 1;
        let task = tokio::spawn(attempt::run_active(
            Arc::clone(&self.ctx),
            candidate.id,
            Arc::clone(&path.link),
            path.rtt,
            self.epoch,
            self.events_tx.clone(),
        ));
        self.active = Some(ActivePath {
            candidate,
            link: path.link,
            task,
            rtt: path.rtt,
        });

        let first = !self.history.connected_once();
        self.history.on_connected(Instant::now());
        self.machine.transition_to(CallState::Connected);
        self.publish();
        self.update_bars();

        if first {
            self.refresh_derived();
            let buffered = self.signaling.mark_ready();
            if !buffered.is_empty() {
                self.log.push(format_args!(
                    "Applying {} buffered signaling message(s)",
                    buffered.len()
                ));
            }
            for message in buffered {
                self.apply_signaling(message);
            }
        }
        self.sync_shared();
    }

    // ============ Signaling ============

    fn send_signaling(&mut self, message: SignalingMessage) {
        match self.signaling.encode(message) {
            Ok(payload) => {
                let sink = Arc::clone(&self.sink);
                self.queue.dispatch(Box::new(move || sink.send(payload)));
            }
            Err(e) => {
                tracing::warn!("Dropping outbound signaling: {}", e);
                self.log.push(format_args!("Signaling send failed: {}", e));
            }
        }
    }

    fn receive_signaling(&mut self, payload: &[u8]) {
        match self.signaling.receive(payload) {
            Ok(messages) => {
                for message in messages {
                    self.apply_signaling(message);
                }
            }
            Err(e @ SignalingError::UnsupportedVersion(_)) => {
                self.fail(CallError::Protocol(e.to_string().into()));
            }
            Err(e) => self.fail(CallError::MalformedSignaling(e.to_string().into())),
        }
    }

    fn apply_signaling(&mut self, message: SignalingMessage) {
        if self.is_inactive() {
            return;
        }
        self.log.push(format_args!("Signaling in: {:?}", message));

        if let SignalingMessage::Capabilities { max_layer, .. } = &message {
            self.negotiated_layer = global::max_layer().min(self.max_layer).min(*max_layer);
            self.log.push(format_args!("Negotiated layer {}", self.negotiated_layer));
        }

        for reply in self.video.on_message(&message) {
            self.send_signaling(reply);
        }
        self.publish();
        self.sync_shared();
    }

    // ============ Commands ============

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Stop(completion) => {
                let report = match &self.report {
                    Some(report) => report.clone(),
                    None => {
                        let report = self.finish().await;
                        self.report = Some(report.clone());
                        report
                    }
                };
                self.queue.dispatch(Box::new(move || completion(report)));
            }
            Command::BeginTermination => self.begin_termination(),
            Command::MakeIncomingVideoView(completion) => {
                let view: Option<Arc<dyn VideoView>> = if self.terminating {
                    None
                } else {
                    self.view_factory
                        .as_ref()
                        .and_then(|factory| factory.make_incoming_view())
                };
                self.queue.dispatch(Box::new(move || completion(view)));
            }
            _ if self.is_inactive() => {
                tracing::trace!("Ignoring command on inactive session");
            }
            Command::AddSignalingData(payload) => self.receive_signaling(&payload),
            Command::SetMuted(muted) => {
                if self.muted != muted {
                    self.muted = muted;
                    self.log.push(format_args!("Muted: {}", muted));
                    self.sync_shared();
                }
            }
            Command::SetNetworkType(network) => {
                if *self.network_tx.borrow() != network {
                    self.network_tx.send_replace(network);
                    self.selector.set_network_type(network);
                    self.log.push(format_args!("Network type: {:?}", network));
                    self.sync_shared();
                }
            }
            Command::RequestVideo(capturer) => {
                for message in self.video.request_video(capturer) {
                    self.send_signaling(message);
                }
                self.publish();
            }
            Command::AcceptVideo(capturer) => {
                for message in self.video.accept_video(capturer) {
                    self.send_signaling(message);
                }
                self.publish();
            }
            Command::SwitchCamera => {
                if let Err(e) = self.video.switch_camera() {
                    tracing::warn!("Camera switch failed: {}", e);
                    self.log.push(format_args!("Camera switch failed: {}", e));
                }
            }
            Command::SetVideoEnabled(enabled) => {
                for message in self.video.set_video_enabled(enabled) {
                    self.send_signaling(message);
                }
                self.publish();
            }
        }
    }

    // ============ Notifications ============

    fn publish(&mut self) {
        let triple = (self.machine.state(), self.video.local(), self.video.remote());
        if self.terminating || self.published == Some(triple) {
            self.sync_shared();
            return;
        }
        self.published = Some(triple);
        self.sync_shared();

        let observer = Arc::clone(&self.observer);
        let (state, video, remote) = triple;
        self.queue
            .dispatch(Box::new(move || observer.state_changed(state, video, remote)));
    }

    fn current_bars(&self) -> i32 {
        match (self.machine.state(), &self.active) {
            (CallState::Connected, Some(active)) => {
                signal_bars(Some(active.rtt), active.candidate.kind)
            }
            _ => 0,
        }
    }

    fn update_bars(&mut self) {
        if self.terminating {
            return;
        }
        let bars = self.current_bars();
        if self.machine.state() == CallState::Connected {
            self.history.on_bars(bars);
        }
        if self.bars == Some(bars) {
            return;
        }
        self.bars = Some(bars);

        let observer = Arc::clone(&self.observer);
        self.queue
            .dispatch(Box::new(move || observer.signal_bars_changed(bars)));
    }

    // ============ Derived state and snapshot ============

    fn refresh_derived(&mut self) {
        if !self.history.connected_once() {
            return;
        }
        let base = self
            .prior_record
            .clone()
            .unwrap_or_else(|| DerivedRecord::first(&self.schedule));
        let record = base.advance(self.last_path_id, self.history.reconnects());

        match DerivedState::seal(&self.schedule, &record) {
            Ok(blob) => self.derived_out = Some(blob),
            Err(e) => tracing::warn!("Failed to seal derived state: {}", e),
        }
    }

    fn sync_shared(&self) {
        let active_kind: Option<PathKind> = self.active.as_ref().map(|a| a.candidate.kind);
        let snapshot = SessionSnapshot {
            state: self.machine.state(),
            video_state: self.video.local(),
            remote_video_state: self.video.remote(),
            active_path: self.active.as_ref().map(|a| a.candidate.id),
            path_kind: active_kind,
            rtt_ms: self.active.as_ref().map(|a| a.rtt.as_millis() as u64),
            signal_bars: self.bars.unwrap_or(0),
            reconnects: self.history.reconnects(),
            negotiated_layer: self.negotiated_layer,
            version: self.version.clone(),
            muted: self.muted,
            network_type: *self.network_tx.borrow(),
            terminated: self.terminating,
        };
        let derived = self
            .derived_out
            .clone()
            .unwrap_or_else(|| self.initial_derived.clone());

        let mut shared = self.shared.write().unwrap_or_else(|e| e.into_inner());
        shared.snapshot = snapshot;
        shared.history = self.history.clone();
        shared.derived_state = derived;
    }
}
