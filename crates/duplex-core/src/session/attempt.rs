//! Path tasks: opening and verifying a candidate, then keeping the active
//! path alive.
//!
//! Both run as spawned tasks and report back to the engine through
//! [`EngineEvent`]s tagged with the epoch they were started in, so the
//! engine can ignore reports from tasks it has already abandoned.

use crate::config::SessionConfig;
use crate::descriptor::{EndpointKey, ProxyConfig, RelayServer};
use crate::error::CallError;
use crate::link::{LinkCodec, LinkFrame, PathValidator, RttEstimator};
use crate::network::NetworkType;
use crate::path::Candidate;
use crate::stats::StatsAccumulator;
use crate::transport::{MediaLink, PathTarget, PathTransport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Everything a path task needs, shared read-only.
pub(crate) struct PathContext {
    pub transport: Arc<dyn PathTransport>,
    pub codec: LinkCodec,
    pub stats: Arc<StatsAccumulator>,
    pub network: watch::Receiver<NetworkType>,
    pub proxy: Option<ProxyConfig>,
    pub stun_hints: Arc<[RelayServer]>,
    pub config: SessionConfig,
}

impl PathContext {
    fn target(&self, candidate: &Candidate, endpoint: EndpointKey) -> PathTarget {
        PathTarget {
            candidate_id: candidate.id,
            kind: candidate.kind,
            endpoint,
            credentials: candidate.credentials.clone(),
            proxy: self.proxy.clone(),
            stun_hints: Arc::clone(&self.stun_hints),
            network_type: *self.network.borrow(),
        }
    }

    async fn send_frame(
        &self,
        link: &Arc<dyn MediaLink>,
        frame: &LinkFrame,
    ) -> Result<(), SendFailure> {
        let datagram = self.codec.seal(frame).map_err(SendFailure::Seal)?;
        let len = datagram.len() as u64;
        link.send(datagram).await.map_err(SendFailure::Link)?;
        self.stats.record_sent(len, *self.network.borrow());
        Ok(())
    }

    fn record_received(&self, len: usize) {
        self.stats
            .record_received(len as u64, *self.network.borrow());
    }
}

enum SendFailure {
    Seal(duplex_crypto::CryptoError),
    Link(TransportError),
}

impl SendFailure {
    fn into_call_error(self, id: i64) -> CallError {
        match self {
            SendFailure::Seal(err) => CallError::Key(err),
            SendFailure::Link(reason) => CallError::PathUnavailable { id, reason },
        }
    }
}

/// A candidate that completed the challenge exchange.
pub(crate) struct VerifiedPath {
    pub endpoint: EndpointKey,
    pub link: Arc<dyn MediaLink>,
    pub rtt: Duration,
}

/// Reports from path tasks to the engine.
pub(crate) enum EngineEvent {
    /// An attempt finished, successfully or not
    AttemptDone {
        epoch: u64,
        candidate: Candidate,
        result: Result<VerifiedPath, CallError>,
    },
    /// The active path died
    PathLost { epoch: u64, error: CallError },
    /// New smoothed RTT on the active path
    Rtt { epoch: u64, rtt: Duration },
}

/// Open and verify one candidate within the probe timeout.
pub(crate) async fn attempt(
    ctx: Arc<PathContext>,
    candidate: &Candidate,
) -> Result<VerifiedPath, CallError> {
    let id = candidate.id;
    let probe = async {
        let (endpoint, link) = open_preferred(&ctx, candidate).await?;
        let rtt = verify(&ctx, &link, id).await?;
        Ok::<_, CallError>(VerifiedPath { endpoint, link, rtt })
    };

    match tokio::time::timeout(ctx.config.probe_timeout, probe).await {
        Ok(result) => result,
        Err(_) => Err(CallError::HandshakeTimeout(id)),
    }
}

type OpenResult = Result<(EndpointKey, Arc<dyn MediaLink>), TransportError>;

/// Open every address of the candidate in parallel.
///
/// The winner is the most preferred address (IPv4 before IPv6) that opens;
/// a less preferred one is only used once every address ahead of it has
/// failed. Both peers apply the same rule, so they settle on the same link.
async fn open_preferred(
    ctx: &PathContext,
    candidate: &Candidate,
) -> Result<(EndpointKey, Arc<dyn MediaLink>), CallError> {
    let id = candidate.id;
    if candidate.endpoints.is_empty() {
        return Err(CallError::PathUnavailable {
            id,
            reason: TransportError::Unreachable("no address".into()),
        });
    }

    let mut opens = JoinSet::new();
    for (index, endpoint) in candidate.endpoints.iter().enumerate() {
        let transport = Arc::clone(&ctx.transport);
        let target = ctx.target(candidate, endpoint.clone());
        opens.spawn(async move {
            let result = transport
                .open(&target)
                .await
                .map(|link| (target.endpoint.clone(), link));
            (index, result)
        });
    }

    let mut slots: Vec<Option<OpenResult>> = candidate.endpoints.iter().map(|_| None).collect();

    while let Some(joined) = opens.join_next().await {
        let (index, result) = joined.map_err(|e| CallError::PathUnavailable {
            id,
            reason: TransportError::Io(e.to_string()),
        })?;
        if let Err(reason) = &result {
            tracing::trace!("Candidate {} address #{} failed: {}", id, index, reason);
        }
        slots[index] = Some(result);

        if let Some(winner) = preferred_ready(&slots) {
            opens.abort_all();
            let mut chosen = None;
            for (index, slot) in slots.into_iter().enumerate() {
                match slot {
                    Some(Ok(opened)) if index == winner => chosen = Some(opened),
                    Some(Ok((_, link))) => link.close(),
                    _ => {}
                }
            }
            return chosen.ok_or(CallError::PathUnavailable {
                id,
                reason: TransportError::Closed,
            });
        }
    }

    // Every address failed; report the most preferred one's reason
    let reason = slots
        .into_iter()
        .flatten()
        .find_map(Result::err)
        .unwrap_or(TransportError::Closed);
    Err(CallError::PathUnavailable { id, reason })
}

fn preferred_ready(slots: &[Option<OpenResult>]) -> Option<usize> {
    for (index, slot) in slots.iter().enumerate() {
        match slot {
            None => return None,
            Some(Ok(_)) => return Some(index),
            Some(Err(_)) => {}
        }
    }
    None
}

/// Run the challenge exchange until one of our challenges is answered.
async fn verify(ctx: &PathContext, link: &Arc<dyn MediaLink>, id: i64) -> Result<Duration, CallError> {
    let mut validator = PathValidator::new(ctx.config.probe_timeout);
    let mut challenges = tokio::time::interval(ctx.config.challenge_interval);

    loop {
        tokio::select! {
            _ = challenges.tick() => {
                validator.cleanup_expired();
                let challenge = validator.initiate_challenge()?;
                ctx.send_frame(link, &LinkFrame::Challenge(challenge))
                    .await
                    .map_err(|e| e.into_call_error(id))?;
            }
            received = link.recv() => {
                let datagram = received.map_err(|reason| CallError::PathUnavailable { id, reason })?;
                ctx.record_received(datagram.len());

                let reply = match ctx.codec.open(&datagram) {
                    Ok(LinkFrame::Response(response)) => {
                        if let Some(rtt) = validator.handle_response(&response) {
                            tracing::debug!("Candidate {} verified, rtt {:?}", id, rtt);
                            return Ok(rtt);
                        }
                        None
                    }
                    Ok(LinkFrame::Challenge(challenge)) => Some(LinkFrame::Response(challenge)),
                    Ok(LinkFrame::Ping(seq)) => Some(LinkFrame::Pong(seq)),
                    Ok(LinkFrame::Pong(_)) => None,
                    Err(e) => {
                        tracing::trace!("Dropping unauthenticated datagram on candidate {}: {}", id, e);
                        None
                    }
                };

                if let Some(reply) = reply {
                    ctx.send_frame(link, &reply)
                        .await
                        .map_err(|e| e.into_call_error(id))?;
                }
            }
        }
    }
}

/// Keep the active path alive until it dies, then report why.
pub(crate) async fn run_active(
    ctx: Arc<PathContext>,
    id: i64,
    link: Arc<dyn MediaLink>,
    initial_rtt: Duration,
    epoch: u64,
    events: mpsc::UnboundedSender<EngineEvent>,
) {
    let error = keep_alive(&ctx, id, &link, initial_rtt, epoch, &events).await;
    let _ = events.send(EngineEvent::PathLost { epoch, error });
}

async fn keep_alive(
    ctx: &PathContext,
    id: i64,
    link: &Arc<dyn MediaLink>,
    initial_rtt: Duration,
    epoch: u64,
    events: &mpsc::UnboundedSender<EngineEvent>,
) -> CallError {
    let mut rtt = RttEstimator::new(Some(initial_rtt));
    let mut keepalive = tokio::time::interval(ctx.config.keepalive_interval);
    let mut last_heard = Instant::now();

    loop {
        let deadline = last_heard + ctx.config.liveness_timeout;
        tokio::select! {
            _ = keepalive.tick() => {
                let seq = rtt.on_ping_sent();
                if let Err(e) = ctx.send_frame(link, &LinkFrame::Ping(seq)).await {
                    return match e {
                        SendFailure::Link(_) => CallError::PathClosed(id),
                        seal => seal.into_call_error(id),
                    };
                }
            }
            () = tokio::time::sleep_until(deadline) => {
                return CallError::LivenessTimeout(id);
            }
            received = link.recv() => {
                let Ok(datagram) = received else {
                    return CallError::PathClosed(id);
                };
                ctx.record_received(datagram.len());

                let frame = match ctx.codec.open(&datagram) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::trace!("Dropping unauthenticated datagram on path {}: {}", id, e);
                        continue;
                    }
                };
                last_heard = Instant::now();

                let reply = match frame {
                    LinkFrame::Challenge(challenge) => Some(LinkFrame::Response(challenge)),
                    LinkFrame::Ping(seq) => Some(LinkFrame::Pong(seq)),
                    LinkFrame::Pong(seq) => {
                        if let Some(smoothed) = rtt.on_pong(seq) {
                            let _ = events.send(EngineEvent::Rtt { epoch, rtt: smoothed });
                        }
                        None
                    }
                    LinkFrame::Response(_) => None,
                };

                if let Some(reply) = reply {
                    if ctx.send_frame(link, &reply).await.is_err() {
                        return CallError::PathClosed(id);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ConnectionDescriptor;
    use crate::transport::MemoryNetwork;
    use duplex_crypto::{CALL_KEY_SIZE, CallKey, Direction, KeySchedule};

    fn context(net: &MemoryNetwork, direction: Direction, key: u8) -> Arc<PathContext> {
        let schedule = KeySchedule::derive(&CallKey::new([key; CALL_KEY_SIZE]), direction);
        let (_, network) = watch::channel(NetworkType::Wifi);
        Arc::new(PathContext {
            transport: Arc::new(net.clone()),
            codec: LinkCodec::new(Arc::new(schedule)),
            stats: Arc::new(StatsAccumulator::new()),
            network,
            proxy: None,
            stun_hints: Arc::from(Vec::new()),
            config: SessionConfig {
                probe_timeout: Duration::from_millis(500),
                challenge_interval: Duration::from_millis(20),
                keepalive_interval: Duration::from_millis(50),
                liveness_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        })
    }

    fn dual_stack() -> Candidate {
        Candidate::from_descriptor(&ConnectionDescriptor::direct(
            1,
            "10.0.0.1",
            "2001:db8::1",
            500,
            vec![1],
        ))
    }

    #[tokio::test]
    async fn test_attempt_verifies_both_sides() {
        let net = MemoryNetwork::new();
        let caller = context(&net, Direction::Outgoing, 1);
        let callee = context(&net, Direction::Incoming, 1);
        let candidate = dual_stack();

        let (a, b) = tokio::join!(
            attempt(Arc::clone(&caller), &candidate),
            attempt(Arc::clone(&callee), &candidate)
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        // IPv4 preferred on both sides
        assert_eq!(a.endpoint.address, "10.0.0.1");
        assert_eq!(b.endpoint.address, "10.0.0.1");
        assert!(caller.stats.snapshot().bytes_sent_wifi > 0);
        assert!(callee.stats.snapshot().bytes_received_wifi > 0);
    }

    #[tokio::test]
    async fn test_ipv6_used_when_ipv4_unreachable() {
        let net = MemoryNetwork::new();
        net.set_unreachable("10.0.0.1", 500, true);
        let caller = context(&net, Direction::Outgoing, 1);
        let callee = context(&net, Direction::Incoming, 1);
        let candidate = dual_stack();

        let (a, b) = tokio::join!(attempt(caller, &candidate), attempt(callee, &candidate));
        assert_eq!(a.unwrap().endpoint.address, "2001:db8::1");
        assert_eq!(b.unwrap().endpoint.address, "2001:db8::1");
    }

    #[tokio::test]
    async fn test_attempt_unreachable() {
        let net = MemoryNetwork::new();
        net.set_unreachable("10.0.0.1", 500, true);
        net.set_unreachable("2001:db8::1", 500, true);

        let err = attempt(context(&net, Direction::Outgoing, 1), &dual_stack())
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            CallError::PathUnavailable {
                id: 1,
                reason: TransportError::Unreachable(_)
            }
        ));
        assert!(err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_times_out_on_key_mismatch() {
        let net = MemoryNetwork::new();
        let caller = context(&net, Direction::Outgoing, 1);
        let stranger = context(&net, Direction::Incoming, 2);
        let candidate = dual_stack();

        let (a, b) = tokio::join!(attempt(caller, &candidate), attempt(stranger, &candidate));
        assert!(matches!(a.err().unwrap(), CallError::HandshakeTimeout(1)));
        assert!(matches!(b.err().unwrap(), CallError::HandshakeTimeout(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_path_liveness() {
        let net = MemoryNetwork::new();
        let caller = context(&net, Direction::Outgoing, 1);
        let callee = context(&net, Direction::Incoming, 1);
        let candidate = dual_stack();

        let (a, b) = tokio::join!(
            attempt(Arc::clone(&caller), &candidate),
            attempt(Arc::clone(&callee), &candidate)
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(run_active(Arc::clone(&caller), 1, a.link, a.rtt, 7, tx.clone()));
        tokio::spawn(run_active(callee, 1, b.link, b.rtt, 8, tx));

        // Healthy path keeps producing RTT samples
        let mut samples = 0;
        while samples < 4 {
            if let Some(EngineEvent::Rtt { .. }) = rx.recv().await {
                samples += 1;
            }
        }

        net.set_blackholed("10.0.0.1", 500, true);
        let mut lost = Vec::new();
        while lost.len() < 2 {
            if let Some(EngineEvent::PathLost { epoch, error }) = rx.recv().await {
                assert!(matches!(error, CallError::LivenessTimeout(1)));
                lost.push(epoch);
            }
        }
        lost.sort_unstable();
        assert_eq!(lost, vec![7, 8]);
    }

    #[tokio::test]
    async fn test_active_path_closed() {
        let net = MemoryNetwork::new();
        let caller = context(&net, Direction::Outgoing, 1);
        let callee = context(&net, Direction::Incoming, 1);
        let candidate = dual_stack();

        let (a, b) = tokio::join!(
            attempt(Arc::clone(&caller), &candidate),
            attempt(Arc::clone(&callee), &candidate)
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(run_active(caller, 1, a.link, a.rtt, 1, tx));
        b.link.close();

        loop {
            if let Some(EngineEvent::PathLost { error, .. }) = rx.recv().await {
                assert!(matches!(error, CallError::PathClosed(1)));
                break;
            }
        }
    }
}
