//! Inbound acceptor.
//!
//! Accepts connections from committee members, resolves each connection to a
//! party through the pinned TLS key it authenticated with, and reads frames
//! from its streams. Heartbeats are answered on the same stream. Session
//! frames are checked against the authenticated sender and the known request
//! types before they reach the [`Inbound`] sink. Bad frames are dropped and
//! counted; the connection stays open.

use std::sync::Arc;

use quinn::{Connection, RecvStream, SendStream};
use tokio::sync::watch;
use tss_types::{CoreAddress, PartyStatus};

use crate::connection::ConnectionManager;
use crate::counters::{DropCounters, DropReason};
use crate::quic::QuicNode;
use crate::registry::Registry;
use crate::wire::{Envelope, Frame, WireMessage};
use crate::{Inbound, TransportError};

/// Transport-level screening shared by every receive path.
///
/// Returns the envelope if it may be handed to the session layer.
pub fn admit(
    envelope: Envelope,
    authenticated: &CoreAddress,
    counters: &DropCounters,
) -> Option<Envelope> {
    if &envelope.sender != authenticated {
        tracing::warn!(
            claimed = %envelope.sender,
            %authenticated,
            session_id = %envelope.session_id,
            "dropping envelope with forged sender"
        );
        counters.bump(DropReason::WrongSender);
        return None;
    }
    if envelope.request_type().is_none() {
        tracing::debug!(
            peer = %authenticated,
            msg_type = envelope.msg_type,
            session_id = %envelope.session_id,
            "dropping envelope with unknown type"
        );
        counters.bump(DropReason::UnknownType);
        return None;
    }
    Some(envelope)
}

/// Everything the accept loop needs.
#[derive(Clone)]
pub struct ServerContext {
    pub registry: Arc<Registry>,
    pub connections: Arc<ConnectionManager>,
    pub inbound: Arc<dyn Inbound>,
    pub counters: Arc<DropCounters>,
}

/// Accept connections until the endpoint closes or shutdown is signalled.
pub async fn serve(node: Arc<QuicNode>, ctx: ServerContext, mut shutdown: watch::Receiver<bool>) {
    tracing::info!(addr = %node.local_addr(), "P2P server listening");
    loop {
        let incoming = tokio::select! {
            incoming = node.accept() => incoming,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };
        let Some(incoming) = incoming else {
            break;
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            match incoming.await {
                Ok(connection) => handle_connection(connection, ctx).await,
                Err(e) => tracing::debug!(error = %e, "inbound handshake failed"),
            }
        });
    }
    tracing::info!("P2P server stopped");
}

async fn handle_connection(connection: Connection, ctx: ServerContext) {
    let remote = connection.remote_address();
    let peer = match QuicNode::peer_public_key(&connection)
        .ok()
        .and_then(|key| ctx.registry.by_tls_key(&key).map(|p| p.core_address.clone()))
    {
        Some(peer) => peer,
        None => {
            tracing::warn!(%remote, "closing connection from unknown TLS key");
            connection.close(quinn::VarInt::from_u32(1), b"unknown peer");
            return;
        }
    };
    tracing::debug!(%peer, %remote, "inbound connection");

    loop {
        match connection.accept_bi().await {
            Ok((send, recv)) => {
                let ctx = ctx.clone();
                let peer = peer.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_stream(&peer, send, recv, &ctx).await {
                        tracing::debug!(%peer, error = %e, "inbound stream ended");
                    }
                });
            }
            Err(e) => {
                tracing::debug!(%peer, error = %e, "inbound connection closed");
                return;
            }
        }
    }
}

async fn handle_stream(
    peer: &CoreAddress,
    mut send: SendStream,
    mut recv: RecvStream,
    ctx: &ServerContext,
) -> Result<(), TransportError> {
    loop {
        let bytes = QuicNode::recv_frame(&mut recv).await?;
        let message = match WireMessage::from_bytes(&bytes) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "dropping malformed frame");
                ctx.counters.bump(DropReason::Malformed);
                continue;
            }
        };
        match message.frame {
            Frame::Heartbeat { status } => {
                if let Some(status) = PartyStatus::from_u8(status) {
                    ctx.connections.record_peer_status(peer, status).await;
                }
                let reply = WireMessage::new(Frame::heartbeat(ctx.connections.status_cell().get()))
                    .to_bytes()?;
                QuicNode::send_frame(&mut send, &reply).await?;
            }
            Frame::SessionSubmit(envelope) => {
                if let Some(envelope) = admit(envelope, peer, &ctx.counters) {
                    ctx.inbound.deliver(envelope);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RequestType;

    fn envelope(sender: &str) -> Envelope {
        Envelope::new("SIGN:evm/1", RequestType::TssRound, sender.into(), vec![7])
    }

    #[test]
    fn test_admit_accepts_matching_sender() {
        let counters = DropCounters::new();
        let admitted = admit(envelope("bridge1a"), &"bridge1a".into(), &counters);
        assert!(admitted.is_some());
        assert_eq!(counters.snapshot().total(), 0);
    }

    #[test]
    fn test_admit_rejects_forged_sender() {
        let counters = DropCounters::new();
        assert!(admit(envelope("bridge1b"), &"bridge1a".into(), &counters).is_none());
        assert_eq!(counters.snapshot().wrong_sender, 1);
    }

    #[test]
    fn test_admit_rejects_unknown_type() {
        let counters = DropCounters::new();
        let mut env = envelope("bridge1a");
        env.msg_type = 0xBEEF;
        assert!(admit(env, &"bridge1a".into(), &counters).is_none());
        assert_eq!(counters.snapshot().unknown_type, 1);
    }
}
