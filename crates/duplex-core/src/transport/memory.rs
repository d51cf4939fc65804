//! In-process transport.
//!
//! Two parties that open the same [`EndpointKey`] are paired into a
//! bidirectional link, the way two peers meet on a relay by presenting the
//! same call tag. Endpoints can be made unreachable, black-holed or severed
//! to drive the failure paths of the session.

use super::{MediaLink, PathTarget, PathTransport, TransportError, TransportResult};
use crate::descriptor::EndpointKey;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{mpsc, oneshot, watch};

type Address = (String, u16);

#[derive(Default)]
struct NetworkState {
    /// First party waiting at an endpoint key for its partner
    waiting: HashMap<EndpointKey, oneshot::Sender<Arc<MemoryLink>>>,
    unreachable: HashSet<Address>,
    blackholes: HashMap<Address, Arc<AtomicBool>>,
    links: Vec<(Address, Weak<MemoryLink>)>,
    attempts: Vec<EndpointKey>,
}

impl NetworkState {
    fn blackhole_flag(&mut self, address: &Address) -> Arc<AtomicBool> {
        Arc::clone(
            self.blackholes
                .entry(address.clone())
                .or_insert_with(|| Arc::new(AtomicBool::new(false))),
        )
    }
}

/// In-memory network shared by every party of a test or simulation.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    /// Create an empty network where every endpoint is reachable
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every open towards `address:port` fail at once.
    pub fn set_unreachable(&self, address: &str, port: u16, unreachable: bool) {
        let key = (address.to_string(), port);
        let mut state = self.lock();
        if unreachable {
            state.unreachable.insert(key);
        } else {
            state.unreachable.remove(&key);
        }
    }

    /// Silently drop every datagram sent through `address:port`, including
    /// on links that are already open.
    pub fn set_blackholed(&self, address: &str, port: u16, blackholed: bool) {
        let key = (address.to_string(), port);
        self.lock()
            .blackhole_flag(&key)
            .store(blackholed, Ordering::SeqCst);
    }

    /// Close every open link through `address:port` on both sides.
    pub fn sever(&self, address: &str, port: u16) {
        let key = (address.to_string(), port);
        let victims: Vec<Arc<MemoryLink>> = {
            let mut state = self.lock();
            state.links.retain(|(_, link)| link.strong_count() > 0);
            state
                .links
                .iter()
                .filter(|(addr, _)| *addr == key)
                .filter_map(|(_, link)| link.upgrade())
                .collect()
        };

        tracing::debug!("Severing {} link(s) at {}:{}", victims.len(), address, port);
        for link in victims {
            link.close();
        }
    }

    /// Number of opens attempted towards `address:port` by any party.
    #[must_use]
    pub fn attempt_count(&self, address: &str, port: u16) -> usize {
        self.lock()
            .attempts
            .iter()
            .filter(|key| key.address == address && key.port == port)
            .count()
    }

    /// Number of links currently open through `address:port`.
    #[must_use]
    pub fn open_links(&self, address: &str, port: u16) -> usize {
        self.lock()
            .links
            .iter()
            .filter(|((addr, p), _)| addr == address && *p == port)
            .filter_map(|(_, link)| link.upgrade())
            .filter(|link| !link.is_closed())
            .count()
    }
}

#[async_trait]
impl PathTransport for MemoryNetwork {
    async fn open(&self, target: &PathTarget) -> TransportResult<Arc<dyn MediaLink>> {
        let key = target.endpoint.clone();
        let address = (key.address.clone(), key.port);

        let waiter = {
            let mut state = self.lock();
            state.attempts.push(key.clone());

            if state.unreachable.contains(&address) {
                return Err(TransportError::Unreachable(key.to_string()));
            }

            match state.waiting.remove(&key) {
                Some(partner) if !partner.is_closed() => {
                    let blackhole = state.blackhole_flag(&address);
                    let (ours, theirs) = MemoryLink::pair(key.clone(), blackhole);
                    state.links.push((address.clone(), Arc::downgrade(&ours)));
                    state.links.push((address, Arc::downgrade(&theirs)));

                    if partner.send(theirs).is_err() {
                        return Err(TransportError::Unreachable(key.to_string()));
                    }
                    tracing::trace!("Paired link at {}", key);
                    return Ok(ours);
                }
                _ => {
                    let (tx, rx) = oneshot::channel();
                    state.waiting.insert(key.clone(), tx);
                    rx
                }
            }
        };

        let link = waiter.await.map_err(|_| TransportError::Closed)?;
        Ok(link)
    }
}

/// One side of a paired in-memory link.
pub struct MemoryLink {
    endpoint: EndpointKey,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: watch::Sender<bool>,
    blackhole: Arc<AtomicBool>,
}

impl MemoryLink {
    fn pair(endpoint: EndpointKey, blackhole: Arc<AtomicBool>) -> (Arc<Self>, Arc<Self>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();

        let side = |tx, rx| {
            Arc::new(Self {
                endpoint: endpoint.clone(),
                outbound: Mutex::new(Some(tx)),
                inbound: tokio::sync::Mutex::new(rx),
                closed: watch::channel(false).0,
                blackhole: Arc::clone(&blackhole),
            })
        };

        (side(a_tx, b_rx), side(b_tx, a_rx))
    }

    /// Endpoint this link was opened towards
    #[must_use]
    pub fn endpoint(&self) -> &EndpointKey {
        &self.endpoint
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

async fn wait_closed(mut closed: watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl MediaLink for MemoryLink {
    async fn send(&self, datagram: Vec<u8>) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.blackhole.load(Ordering::SeqCst) {
            return Ok(());
        }

        let outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        match outbound.as_ref() {
            Some(tx) => tx.send(datagram).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn recv(&self) -> TransportResult<Vec<u8>> {
        let closed = self.closed.subscribe();
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            datagram = inbound.recv() => datagram.ok_or(TransportError::Closed),
            () = wait_closed(closed) => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        self.closed.send_replace(true);
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.closed.send_replace(true);
    }
}
