//! Two-party loopback call over the in-memory transport.
//!
//! A caller and a callee session share one [`MemoryNetwork`]; each side's
//! signaling sink feeds the other side's `add_signaling_data`.

use crate::capture::{SimulatedCapturer, StaticViewFactory};
use crate::config::Config;
use crate::format::{format_duration, format_stats};
use duplex_core::{
    CallObserver, CallSession, CallSessionParams, CallState, ConnectionDescriptor,
    Credentials, MemoryNetwork, RelayServer, RemoteVideoState, SerialQueue, SessionConfig,
    SessionEnv, VideoCapturer, VideoState, global,
};
use duplex_crypto::{CALL_KEY_SIZE, CallKey, KeyMaterial, random};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const PRIMARY_V4: &str = "10.0.0.1";
const PRIMARY_V6: &str = "fd00::1";
const PRIMARY_PORT: u16 = 5000;

/// Command-line switches of `duplex simulate`
#[derive(Debug, Clone, Default)]
pub struct SimulationOptions {
    /// Make the direct primary unreachable so the call fails over
    pub unreachable_primary: bool,
    /// Start the call with video and have the callee accept it
    pub video: bool,
    /// Echo every session debug line to stderr
    pub print_session_log: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Caller,
    Callee,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Caller => write!(f, "caller"),
            Side::Callee => write!(f, "callee"),
        }
    }
}

enum SimEvent {
    State {
        side: Side,
        state: CallState,
        video: VideoState,
        remote: RemoteVideoState,
    },
    Bars {
        side: Side,
        bars: i32,
    },
}

struct ForwardingObserver {
    side: Side,
    tx: mpsc::UnboundedSender<SimEvent>,
}

impl CallObserver for ForwardingObserver {
    fn state_changed(&self, state: CallState, video: VideoState, remote: RemoteVideoState) {
        let _ = self.tx.send(SimEvent::State {
            side: self.side,
            state,
            video,
            remote,
        });
    }

    fn signal_bars_changed(&self, bars: i32) {
        let _ = self.tx.send(SimEvent::Bars {
            side: self.side,
            bars,
        });
    }
}

fn descriptors(config: &Config, tag: &[u8]) -> (ConnectionDescriptor, Vec<ConnectionDescriptor>) {
    let primary =
        ConnectionDescriptor::direct(1, PRIMARY_V4, PRIMARY_V6, PRIMARY_PORT, tag.to_vec());
    let alternatives = (0..config.simulation.alternatives)
        .map(|i| {
            ConnectionDescriptor::relay(
                100 + i as i64,
                format!("198.51.100.{}", i + 1),
                "",
                443,
                tag.to_vec(),
            )
        })
        .collect();
    (primary, alternatives)
}

fn relay_servers(config: &Config) -> Vec<RelayServer> {
    let mut servers: Vec<RelayServer> = (0..config.simulation.turn_servers)
        .map(|i| {
            RelayServer::turn(
                format!("turn{}.duplex.test", i + 1),
                3478,
                Some(Credentials::new("duplex", "simulated")),
            )
        })
        .collect();
    servers.push(RelayServer::stun("stun.duplex.test", 3478));
    servers
}

fn side_params(
    config: &Config,
    session_config: &SessionConfig,
    side: Side,
    key: &KeyMaterial,
    tag: &[u8],
) -> CallSessionParams {
    let (primary, alternatives) = descriptors(config, tag);
    let sim = &config.simulation;

    let mut params = CallSessionParams::new(
        global::versions(false).last().cloned().unwrap_or_default(),
        primary,
        key.clone(),
        side == Side::Caller,
    )
    .with_alternatives(alternatives)
    .with_relay_servers(relay_servers(config))
    .with_network(sim.network, sim.data_saving)
    .with_max_layer(sim.max_layer)
    .with_p2p(sim.allow_p2p)
    .with_config(session_config.clone());

    if let Some(dir) = &config.logging.debug_log_dir {
        params = params.with_log_path(dir.join(format!("{side}.log")));
    }
    params
}

fn spawn_signaling_pump(mut rx: mpsc::UnboundedReceiver<Vec<u8>>, to: Arc<CallSession>) {
    tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            to.add_signaling_data(payload);
        }
    });
}

fn print_session_summary(
    side: Side,
    session: &CallSession,
    stats_line: &str,
    log_path: Option<&Path>,
) {
    println!("{side}:");
    println!("  Final state: {:?}", session.state());
    println!("  Traffic: {stats_line}");
    println!("  Needs rating: {}", session.need_rate());
    println!("  Derived state: {} bytes", session.get_derived_state().len());
    if let Some(info) = session.debug_info() {
        println!("  Debug info: {info}");
    }
    if let Some(path) = log_path {
        println!("  Debug log: {}", path.display());
    }
}

/// Run one simulated call and print what both sides observe.
///
/// # Errors
///
/// Returns an error if a session cannot be constructed or the call key
/// cannot be generated.
pub async fn run(config: &Config, options: SimulationOptions) -> anyhow::Result<()> {
    if options.print_session_log {
        global::setup_logging_function(Some(Arc::new(|line: &str| eprintln!("  | {line}"))));
    }

    let mut key_bytes = [0u8; CALL_KEY_SIZE];
    random::fill_random(&mut key_bytes)?;
    let key = KeyMaterial::new(CallKey::new(key_bytes));
    let mut tag = [0u8; 16];
    random::fill_random(&mut tag)?;

    let network = MemoryNetwork::new();
    if options.unreachable_primary {
        network.set_unreachable(PRIMARY_V4, PRIMARY_PORT, true);
        network.set_unreachable(PRIMARY_V6, PRIMARY_PORT, true);
    }

    let session_config = global::session_config().with_overrides(&config.session);
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let (caller_sig_tx, caller_sig_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (callee_sig_tx, callee_sig_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let caller_capturer = SimulatedCapturer::new("caller");
    let callee_capturer = SimulatedCapturer::new("callee");

    let mut caller_params = side_params(config, &session_config, Side::Caller, &key, &tag);
    if options.video {
        caller_params = caller_params.with_video_capturer(caller_capturer.clone());
    }
    let callee_params = side_params(config, &session_config, Side::Callee, &key, &tag)
        .with_video_view_factory(Arc::new(StaticViewFactory));

    let caller_log = caller_params.log_path.clone();
    let callee_log = callee_params.log_path.clone();

    let caller = Arc::new(CallSession::new(
        caller_params,
        SessionEnv {
            queue: SerialQueue::spawn(),
            observer: Arc::new(ForwardingObserver {
                side: Side::Caller,
                tx: event_tx.clone(),
            }),
            signaling: Arc::new(move |payload: Vec<u8>| {
                let _ = caller_sig_tx.send(payload);
            }),
            transport: Arc::new(network.clone()),
            runtime: None,
        },
    )?);

    let callee = Arc::new(CallSession::new(
        callee_params,
        SessionEnv {
            queue: SerialQueue::spawn(),
            observer: Arc::new(ForwardingObserver {
                side: Side::Callee,
                tx: event_tx,
            }),
            signaling: Arc::new(move |payload: Vec<u8>| {
                let _ = callee_sig_tx.send(payload);
            }),
            transport: Arc::new(network.clone()),
            runtime: None,
        },
    )?);

    spawn_signaling_pump(caller_sig_rx, Arc::clone(&callee));
    spawn_signaling_pump(callee_sig_rx, Arc::clone(&caller));

    let duration = Duration::from_secs(config.simulation.duration_secs);
    println!(
        "Simulating a {} call ({} alternative(s), {} TURN server(s){})",
        format_duration(duration),
        config.simulation.alternatives,
        config.simulation.turn_servers,
        if options.unreachable_primary { ", primary unreachable" } else { "" }
    );

    let started = tokio::time::Instant::now();
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    let mut switched_camera = false;

    loop {
        tokio::select! {
            () = &mut deadline => break,
            result = tokio::signal::ctrl_c() => {
                result?;
                println!("Interrupted");
                break;
            }
            Some(event) = events.recv() => match event {
                SimEvent::State { side, state, video, remote } => {
                    println!(
                        "[{:>6} ms] {side}: {state:?} video={video:?} remote={remote:?}",
                        started.elapsed().as_millis()
                    );
                    if side == Side::Callee && video == VideoState::IncomingRequested {
                        let capturer: Arc<dyn VideoCapturer> = callee_capturer.clone();
                        callee.accept_video(Some(capturer));
                    }
                    if side == Side::Callee && remote == RemoteVideoState::Active {
                        callee.make_incoming_video_view(|view| {
                            tracing::info!("Incoming video view ready: {}", view.is_some());
                        });
                    }
                    if side == Side::Caller && video == VideoState::Active && !switched_camera {
                        switched_camera = true;
                        caller.switch_camera();
                    }
                }
                SimEvent::Bars { side, bars } => {
                    println!("[{:>6} ms] {side}: {bars} bar(s)", started.elapsed().as_millis());
                }
            },
        }
    }

    let (caller_report, callee_report) = tokio::join!(caller.stop_async(), callee.stop_async());
    let caller_report = caller_report?;
    let callee_report = callee_report?;

    println!();
    print_session_summary(
        Side::Caller,
        &caller,
        &format_stats(&caller_report.stats),
        caller_log.as_deref(),
    );
    print_session_summary(
        Side::Callee,
        &callee,
        &format_stats(&callee_report.stats),
        callee_log.as_deref(),
    );

    if options.video {
        println!(
            "Caller camera: {} ({})",
            if caller_capturer.is_front() { "front" } else { "back" },
            if caller_capturer.is_enabled() { "capturing" } else { "paused" }
        );
    }

    if options.print_session_log {
        global::setup_logging_function(None);
    }
    Ok(())
}
