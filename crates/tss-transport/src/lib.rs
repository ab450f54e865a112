//! # tss-transport
//!
//! Authenticated peer-to-peer transport for the signing committee.
//!
//! - **QUIC/TLS 1.3** with mutually pinned certificates via [`quic`] and [`tls`]
//! - **Connection manager** with dial backoff and heartbeats via [`connection`]
//! - **Inbound acceptor** that authenticates senders via [`server`]
//! - **Wire frames** (CBOR, length-prefixed) via [`wire`]
//! - **In-memory network** for tests via [`memory`]
//!
//! ## Architecture
//!
//! ```text
//! Session ── Transport::send ──▶ ConnectionManager ── one stream per peer ──▶ QuicNode
//!                                                                              │
//! Session ◀── Inbound::deliver ◀── server::serve (sender auth, type check) ◀──┘
//! ```

use async_trait::async_trait;
use tss_types::{CoreAddress, PartyStatus};

pub mod connection;
pub mod counters;
pub mod memory;
pub mod quic;
pub mod registry;
pub mod server;
pub mod tls;
pub mod wire;

pub use counters::{DropCounters, DropReason, DropSnapshot};
pub use registry::Registry;
pub use wire::{Envelope, RequestType};

/// Error types for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// CBOR serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// CBOR deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Protocol violation (version mismatch, oversized payload, etc.).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Invalid or oversized frame.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// TLS/certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// QUIC connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// I/O error (socket, stream read/write).
    #[error("I/O error: {0}")]
    Io(String),

    /// The peer is not in the registry.
    #[error("unknown peer: {0}")]
    UnknownPeer(CoreAddress),

    /// The peer is not currently health-checked.
    #[error("peer unavailable: {0}")]
    PeerUnavailable(CoreAddress),

    /// The peer's send queue stayed full.
    #[error("send queue full for {0}")]
    Backpressure(CoreAddress),
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Outbound side of the transport as seen by sessions.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The local party's address, used as `sender` on every envelope.
    fn local_address(&self) -> &CoreAddress;

    /// Send one envelope to one peer.
    async fn send(&self, to: &CoreAddress, envelope: Envelope) -> Result<()>;

    /// Send the same envelope to every recipient, returning per-peer failures.
    async fn broadcast(
        &self,
        recipients: &[CoreAddress],
        envelope: &Envelope,
    ) -> Vec<(CoreAddress, TransportError)> {
        let mut failures = Vec::new();
        for peer in recipients {
            if peer == self.local_address() {
                continue;
            }
            if let Err(e) = self.send(peer, envelope.clone()).await {
                failures.push((peer.clone(), e));
            }
        }
        failures
    }

    /// Remote peers health-checked within the last heartbeat interval.
    async fn ready_peers(&self) -> Vec<CoreAddress>;

    async fn ready_count(&self) -> usize {
        self.ready_peers().await.len()
    }

    /// Status a remote peer last advertised, if any.
    async fn peer_status(&self, peer: &CoreAddress) -> Option<PartyStatus>;

    /// Ready peers not consumed by a session of another kind: idle, of
    /// unknown status, or advertising `activity` themselves.
    async fn available_peers(&self, activity: PartyStatus) -> Vec<CoreAddress> {
        let mut available = Vec::new();
        for peer in self.ready_peers().await {
            match self.peer_status(&peer).await {
                Some(status) if status != PartyStatus::Idle && status != activity => {
                    tracing::debug!(%peer, %status, %activity, "peer busy with another session");
                }
                _ => available.push(peer),
            }
        }
        available
    }

    /// Advertise the local party status in heartbeats.
    fn set_party_status(&self, status: PartyStatus);

    fn party_status(&self) -> PartyStatus;
}

/// Inbound side: receives envelopes that passed transport-level checks.
///
/// Called on the receive path; implementations must not block.
pub trait Inbound: Send + Sync + 'static {
    fn deliver(&self, envelope: Envelope);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::Serialization("test".to_string());
        assert_eq!(err.to_string(), "serialization error: test");
        let err = TransportError::PeerUnavailable(CoreAddress::from("bridge1a"));
        assert_eq!(err.to_string(), "peer unavailable: bridge1a");
    }
}
