//! In-memory loopback network.
//!
//! Every joined node gets a [`MemoryTransport`] that delivers straight into
//! the target's [`Inbound`] sink after the same screening the QUIC server
//! applies. Nodes can be taken offline to simulate crashes: an offline node
//! neither sends nor receives and drops out of everyone's ready set.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tss_types::{CoreAddress, PartyStatus};

use crate::connection::StatusCell;
use crate::counters::DropCounters;
use crate::server::admit;
use crate::{Envelope, Inbound, Transport, TransportError};

struct MemoryNode {
    inbound: Arc<dyn Inbound>,
    counters: Arc<DropCounters>,
    status: Arc<StatusCell>,
    online: bool,
}

/// A shared switchboard connecting [`MemoryTransport`]s.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    nodes: Arc<RwLock<HashMap<CoreAddress, MemoryNode>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node; it is online immediately.
    pub fn join(
        &self,
        local: CoreAddress,
        inbound: Arc<dyn Inbound>,
        counters: Arc<DropCounters>,
    ) -> MemoryTransport {
        let status = Arc::new(StatusCell::new(PartyStatus::Idle));
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                local.clone(),
                MemoryNode {
                    inbound,
                    counters,
                    status: status.clone(),
                    online: true,
                },
            );
        MemoryTransport {
            local,
            network: self.clone(),
            status,
        }
    }

    pub fn set_online(&self, address: &CoreAddress, online: bool) {
        if let Some(node) = self
            .nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(address)
        {
            node.online = online;
        }
    }

    pub fn is_online(&self, address: &CoreAddress) -> bool {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .is_some_and(|n| n.online)
    }

    /// Advertised status of a node, as a heartbeat would carry it.
    pub fn status_of(&self, address: &CoreAddress) -> Option<PartyStatus> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .map(|n| n.status.get())
    }
}

/// One node's view of a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    local: CoreAddress,
    network: MemoryNetwork,
    status: Arc<StatusCell>,
}

impl MemoryTransport {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_address(&self) -> &CoreAddress {
        &self.local
    }

    async fn send(&self, to: &CoreAddress, envelope: Envelope) -> crate::Result<()> {
        let (inbound, counters) = {
            let nodes = self
                .network
                .nodes
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if !nodes.get(&self.local).is_some_and(|n| n.online) {
                return Err(TransportError::Connection("local node offline".to_string()));
            }
            let target = nodes
                .get(to)
                .ok_or_else(|| TransportError::UnknownPeer(to.clone()))?;
            if !target.online {
                return Err(TransportError::PeerUnavailable(to.clone()));
            }
            (target.inbound.clone(), target.counters.clone())
        };
        if let Some(envelope) = admit(envelope, &self.local, &counters) {
            inbound.deliver(envelope);
        }
        Ok(())
    }

    async fn ready_peers(&self) -> Vec<CoreAddress> {
        let nodes = self
            .network
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if !nodes.get(&self.local).is_some_and(|n| n.online) {
            return Vec::new();
        }
        let mut ready: Vec<CoreAddress> = nodes
            .iter()
            .filter(|(address, node)| *address != &self.local && node.online)
            .map(|(address, _)| address.clone())
            .collect();
        ready.sort();
        ready
    }

    async fn peer_status(&self, peer: &CoreAddress) -> Option<PartyStatus> {
        self.network.status_of(peer)
    }

    fn set_party_status(&self, status: PartyStatus) {
        self.status.set(status);
    }

    fn party_status(&self) -> PartyStatus {
        self.status.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RequestType;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Sink(Mutex<Vec<Envelope>>);

    impl Inbound for Sink {
        fn deliver(&self, envelope: Envelope) {
            self.0.lock().unwrap_or_else(PoisonError::into_inner).push(envelope);
        }
    }

    impl Sink {
        fn len(&self) -> usize {
            self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
        }
    }

    fn setup() -> (MemoryNetwork, MemoryTransport, Arc<Sink>, Arc<DropCounters>) {
        let network = MemoryNetwork::new();
        let a = network.join(
            "bridge1a".into(),
            Arc::new(Sink::default()),
            Arc::new(DropCounters::new()),
        );
        let sink = Arc::new(Sink::default());
        let counters = Arc::new(DropCounters::new());
        network.join("bridge1b".into(), sink.clone(), counters.clone());
        (network, a, sink, counters)
    }

    #[tokio::test]
    async fn test_send_delivers() {
        let (_net, a, sink, _) = setup();
        let env = Envelope::new("KEYGEN/1", RequestType::TssRound, "bridge1a".into(), vec![1]);
        a.send(&"bridge1b".into(), env).await.expect("send");
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_offline_peer_unavailable() {
        let (net, a, sink, _) = setup();
        net.set_online(&"bridge1b".into(), false);
        let env = Envelope::new("KEYGEN/1", RequestType::TssRound, "bridge1a".into(), vec![1]);
        assert!(matches!(
            a.send(&"bridge1b".into(), env).await,
            Err(TransportError::PeerUnavailable(_))
        ));
        assert_eq!(sink.len(), 0);
        assert!(a.ready_peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_forged_sender_counted() {
        let (_net, a, sink, counters) = setup();
        let env = Envelope::new("KEYGEN/1", RequestType::TssRound, "bridge1z".into(), vec![1]);
        a.send(&"bridge1b".into(), env).await.expect("send");
        assert_eq!(sink.len(), 0);
        assert_eq!(counters.snapshot().wrong_sender, 1);
    }

    #[tokio::test]
    async fn test_ready_peers_and_status() {
        let (net, a, _, _) = setup();
        assert_eq!(a.ready_peers().await, vec![CoreAddress::from("bridge1b")]);
        a.set_party_status(PartyStatus::Signing);
        assert_eq!(net.status_of(&"bridge1a".into()), Some(PartyStatus::Signing));
    }

    #[tokio::test]
    async fn test_available_peers_skip_other_kinds() {
        let (net, a, _, _) = setup();
        let c = net.join(
            "bridge1c".into(),
            Arc::new(Sink::default()),
            Arc::new(DropCounters::new()),
        );
        c.set_party_status(PartyStatus::Keygen);
        assert_eq!(
            a.available_peers(PartyStatus::Signing).await,
            vec![CoreAddress::from("bridge1b")]
        );
        assert_eq!(
            a.available_peers(PartyStatus::Keygen).await,
            vec![CoreAddress::from("bridge1b"), CoreAddress::from("bridge1c")]
        );
        c.set_party_status(PartyStatus::Idle);
        assert_eq!(a.available_peers(PartyStatus::Signing).await.len(), 2);
        assert_eq!(a.ready_count().await, 2);
    }
}
