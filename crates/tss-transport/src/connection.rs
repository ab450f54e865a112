//! Outgoing connections, heartbeats and peer readiness.
//!
//! The [`ConnectionManager`] keeps one outgoing connection per peer, each
//! carrying a single bidirectional stream. A per-peer task dials with capped
//! exponential backoff, writes queued frames, and sends a heartbeat every
//! half interval. The peer answers each heartbeat on the same stream; a peer
//! is *ready* while its last answer is younger than `heartbeat_interval`.
//!
//! A TLS pin mismatch stops the dial loop for that peer. Nothing here ever
//! fails a session; errors only shrink the ready set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use quinn::{RecvStream, SendStream};
use serde::Serialize;
use tokio::sync::{mpsc, watch, RwLock};
use tss_types::{CoreAddress, Party, PartyStatus};

use crate::quic::QuicNode;
use crate::registry::Registry;
use crate::wire::{self, Frame, WireMessage};
use crate::{Envelope, Transport, TransportError};

/// Timing knobs for the connection manager.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub heartbeat_interval: Duration,
    pub dial_backoff_initial: Duration,
    pub dial_backoff_max: Duration,
    /// Frames buffered per peer before `send` waits.
    pub send_queue_capacity: usize,
}

impl ConnectionConfig {
    pub fn with_heartbeat(heartbeat_interval: Duration) -> Self {
        Self {
            heartbeat_interval,
            dial_backoff_initial: Duration::from_millis(250),
            dial_backoff_max: Duration::from_secs(30),
            send_queue_capacity: 256,
        }
    }
}

/// Immutable view of one peer's health.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PeerSnapshot {
    pub core_address: CoreAddress,
    pub connected: bool,
    pub ready: bool,
    /// Status the peer advertised in its last heartbeat.
    pub status: Option<PartyStatus>,
}

#[derive(Debug, Default)]
struct PeerState {
    connected: bool,
    last_healthy: Option<Instant>,
    status: Option<PartyStatus>,
}

/// Process-wide party status advertised in heartbeats.
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new(status: PartyStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub fn get(&self) -> PartyStatus {
        PartyStatus::from_u8(self.0.load(Ordering::Relaxed)).unwrap_or(PartyStatus::Idle)
    }

    pub fn set(&self, status: PartyStatus) {
        self.0.store(status as u8, Ordering::Relaxed);
    }
}

/// Owns the connection table. The only writer of peer health.
pub struct ConnectionManager {
    local: CoreAddress,
    registry: Arc<Registry>,
    config: ConnectionConfig,
    peers: RwLock<HashMap<CoreAddress, PeerState>>,
    outbound: HashMap<CoreAddress, mpsc::Sender<Vec<u8>>>,
    status: Arc<StatusCell>,
}

impl ConnectionManager {
    /// Create the manager and spawn one dial task per remote party.
    pub fn start(
        node: Arc<QuicNode>,
        local: CoreAddress,
        registry: Arc<Registry>,
        config: ConnectionConfig,
        status: Arc<StatusCell>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let mut outbound = HashMap::new();
        let mut receivers = Vec::new();
        let mut peers = HashMap::new();
        for party in registry.others(&local) {
            let (tx, rx) = mpsc::channel(config.send_queue_capacity.max(1));
            outbound.insert(party.core_address.clone(), tx);
            peers.insert(party.core_address.clone(), PeerState::default());
            receivers.push((party.clone(), rx));
        }

        let manager = Arc::new(Self {
            local,
            registry,
            config,
            peers: RwLock::new(peers),
            outbound,
            status,
        });

        for (party, rx) in receivers {
            let task = Arc::clone(&manager).run_peer(node.clone(), party, rx, shutdown.clone());
            tokio::spawn(task);
        }

        tracing::info!(
            local = %manager.local,
            peers = manager.outbound.len(),
            "connection manager started"
        );
        manager
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn status_cell(&self) -> &Arc<StatusCell> {
        &self.status
    }

    /// Whether `peer` answered a heartbeat within the last interval.
    pub async fn is_ready(&self, peer: &CoreAddress) -> bool {
        let peers = self.peers.read().await;
        peers
            .get(peer)
            .is_some_and(|state| self.state_ready(state, Instant::now()))
    }

    /// Snapshot of every peer's health.
    pub async fn statuses(&self) -> Vec<PeerSnapshot> {
        let now = Instant::now();
        let peers = self.peers.read().await;
        let mut out: Vec<PeerSnapshot> = peers
            .iter()
            .map(|(address, state)| PeerSnapshot {
                core_address: address.clone(),
                connected: state.connected,
                ready: self.state_ready(state, now),
                status: state.status,
            })
            .collect();
        out.sort_by(|a, b| a.core_address.cmp(&b.core_address));
        out
    }

    /// Record a status advertised by `peer` through any channel.
    pub async fn record_peer_status(&self, peer: &CoreAddress, status: PartyStatus) {
        let local = self.status.get();
        if status != local && status != PartyStatus::Idle && local != PartyStatus::Idle {
            tracing::warn!(%peer, remote = %status, %local, "party status mismatch");
        }
        if let Some(state) = self.peers.write().await.get_mut(peer) {
            state.status = Some(status);
        }
    }

    fn state_ready(&self, state: &PeerState, now: Instant) -> bool {
        state.connected
            && state
                .last_healthy
                .is_some_and(|t| now.duration_since(t) <= self.config.heartbeat_interval)
    }

    async fn set_connected(&self, peer: &CoreAddress, connected: bool) {
        if let Some(state) = self.peers.write().await.get_mut(peer) {
            state.connected = connected;
            if !connected {
                state.last_healthy = None;
            }
        }
    }

    async fn mark_healthy(&self, peer: &CoreAddress) {
        if let Some(state) = self.peers.write().await.get_mut(peer) {
            state.last_healthy = Some(Instant::now());
        }
    }

    // -----------------------------------------------------------------------
    // Per-peer task
    // -----------------------------------------------------------------------

    async fn run_peer(
        self: Arc<Self>,
        node: Arc<QuicNode>,
        party: Party,
        mut rx: mpsc::Receiver<Vec<u8>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let peer = party.core_address.clone();
        let mismatch = Arc::new(AtomicBool::new(false));
        let mut backoff = self.config.dial_backoff_initial;

        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.dial(&node, &party, mismatch.clone()).await {
                Ok((connection, send, recv)) => {
                    backoff = self.config.dial_backoff_initial;
                    self.set_connected(&peer, true).await;
                    tracing::info!(%peer, "peer connected");
                    let result = self.pump(&peer, send, recv, &mut rx, &mut shutdown).await;
                    self.set_connected(&peer, false).await;
                    connection.close(quinn::VarInt::from_u32(0), b"reconnect");
                    match result {
                        Ok(()) => return,
                        Err(e) => tracing::warn!(%peer, error = %e, "peer stream closed"),
                    }
                }
                Err(e) => {
                    if mismatch.load(Ordering::Relaxed) {
                        tracing::error!(%peer, "TLS key mismatch; giving up on peer");
                        return;
                    }
                    tracing::debug!(%peer, error = %e, backoff_ms = backoff.as_millis() as u64, "dial failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
            backoff = (backoff * 2).min(self.config.dial_backoff_max);
        }
    }

    async fn dial(
        &self,
        node: &QuicNode,
        party: &Party,
        mismatch: Arc<AtomicBool>,
    ) -> Result<(quinn::Connection, SendStream, RecvStream), TransportError> {
        let addr = tokio::net::lookup_host(&party.endpoint)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?
            .next()
            .ok_or_else(|| TransportError::Io(format!("cannot resolve {}", party.endpoint)))?;
        let connection = node.connect(addr, &party.tls_public_key, mismatch).await?;
        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok((connection, send, recv))
    }

    /// Drive one established stream until it fails or shutdown is signalled.
    async fn pump(
        self: &Arc<Self>,
        peer: &CoreAddress,
        mut send: SendStream,
        recv: RecvStream,
        rx: &mut mpsc::Receiver<Vec<u8>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), TransportError> {
        let mut replies = tokio::spawn(Arc::clone(self).read_replies(peer.clone(), recv));
        let mut ticker = tokio::time::interval(
            (self.config.heartbeat_interval / 2).max(Duration::from_millis(1)),
        );

        let result = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let sent = match WireMessage::new(Frame::heartbeat(self.status.get())).to_bytes() {
                        Ok(frame) => QuicNode::send_frame(&mut send, &frame).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = sent {
                        break Err(e);
                    }
                }
                frame = rx.recv() => match frame {
                    Some(bytes) => {
                        if let Err(e) = QuicNode::send_frame(&mut send, &bytes).await {
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                },
                joined = &mut replies => {
                    let err = match joined {
                        Ok(Err(e)) => e,
                        Ok(Ok(())) => TransportError::Connection("stream finished".to_string()),
                        Err(e) => TransportError::Connection(e.to_string()),
                    };
                    break Err(err);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }
            }
        };
        replies.abort();
        result
    }

    /// Heartbeat answers come back on the receive half of our own stream.
    async fn read_replies(
        self: Arc<Self>,
        peer: CoreAddress,
        mut recv: RecvStream,
    ) -> Result<(), TransportError> {
        loop {
            let bytes = QuicNode::recv_frame(&mut recv).await?;
            match WireMessage::from_bytes(&bytes) {
                Ok(WireMessage {
                    frame: Frame::Heartbeat { status },
                    ..
                }) => {
                    self.mark_healthy(&peer).await;
                    if let Some(status) = PartyStatus::from_u8(status) {
                        self.record_peer_status(&peer, status).await;
                    }
                }
                Ok(_) => tracing::debug!(%peer, "ignoring non-heartbeat reply"),
                Err(e) => tracing::debug!(%peer, error = %e, "malformed heartbeat reply"),
            }
        }
    }
}

#[async_trait]
impl Transport for ConnectionManager {
    fn local_address(&self) -> &CoreAddress {
        &self.local
    }

    async fn send(&self, to: &CoreAddress, envelope: Envelope) -> crate::Result<()> {
        let tx = self
            .outbound
            .get(to)
            .ok_or_else(|| TransportError::UnknownPeer(to.clone()))?;
        if !self.is_ready(to).await {
            return Err(TransportError::PeerUnavailable(to.clone()));
        }
        let bytes = wire::encode_envelope(&envelope)?;
        tokio::time::timeout(self.config.heartbeat_interval, tx.send(bytes))
            .await
            .map_err(|_| TransportError::Backpressure(to.clone()))?
            .map_err(|_| TransportError::PeerUnavailable(to.clone()))
    }

    async fn ready_peers(&self) -> Vec<CoreAddress> {
        let now = Instant::now();
        let peers = self.peers.read().await;
        let mut ready: Vec<CoreAddress> = peers
            .iter()
            .filter(|(_, state)| self.state_ready(state, now))
            .map(|(address, _)| address.clone())
            .collect();
        ready.sort();
        ready
    }

    async fn peer_status(&self, peer: &CoreAddress) -> Option<PartyStatus> {
        self.peers.read().await.get(peer).and_then(|state| state.status)
    }

    fn set_party_status(&self, status: PartyStatus) {
        self.status.set(status);
    }

    fn party_status(&self) -> PartyStatus {
        self.status.get()
    }
}
