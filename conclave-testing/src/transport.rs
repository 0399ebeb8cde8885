//! In-process message routing between simulated cluster nodes.
//!
//! A [`TransportHub`] connects every node's outbound [`Transport`] to the
//! other nodes' inbound channels and lets tests impose network partitions.
//! Delivery is immediate and in order per sender; a partitioned or unknown
//! target turns the send into an error, which the engine already treats as
//! a missing response.

use async_trait::async_trait;
use conclave_core::messages::ProtocolMessage;
use conclave_core::transport::{inbound_channel, InboundReceiver, InboundSender, Transport};
use conclave_core::{ConclaveError, NodeId, Result};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::trace;

struct HubInner {
    links: HashMap<NodeId, InboundSender>,
    /// `None` means fully connected. Otherwise two nodes can talk iff they
    /// share a group; a node in no group is unreachable.
    groups: Option<Vec<HashSet<NodeId>>>,
}

impl HubInner {
    fn reachable(&self, a: NodeId, b: NodeId) -> bool {
        match &self.groups {
            None => true,
            Some(groups) => groups
                .iter()
                .any(|group| group.contains(&a) && group.contains(&b)),
        }
    }
}

/// Central router for a simulated cluster.
#[derive(Clone)]
pub struct TransportHub {
    inner: Arc<RwLock<HubInner>>,
}

impl TransportHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HubInner {
                links: HashMap::new(),
                groups: None,
            })),
        }
    }

    /// Attach a node, returning its outbound transport and the inbound
    /// channel its coordinator loop drains. Registering an id again
    /// replaces the previous link (used for restarts).
    pub fn register(&self, node: NodeId) -> (HubTransport, InboundReceiver) {
        let (tx, rx) = inbound_channel();
        self.inner.write().links.insert(node, tx);
        (
            HubTransport {
                local: node,
                inner: Arc::clone(&self.inner),
            },
            rx,
        )
    }

    /// Split the cluster into disjoint groups; messages cross group
    /// boundaries in neither direction.
    pub fn partition<G, N>(&self, groups: G)
    where
        G: IntoIterator<Item = N>,
        N: IntoIterator<Item = NodeId>,
    {
        let groups: Vec<HashSet<NodeId>> = groups
            .into_iter()
            .map(|group| group.into_iter().collect())
            .collect();
        self.inner.write().groups = Some(groups);
    }

    /// Cut one node off from everyone else.
    pub fn isolate(&self, node: NodeId) {
        let mut inner = self.inner.write();
        let others: HashSet<NodeId> = inner
            .links
            .keys()
            .copied()
            .filter(|id| *id != node)
            .collect();
        inner.groups = Some(vec![HashSet::from([node]), others]);
    }

    /// Remove all partitions.
    pub fn heal(&self) {
        self.inner.write().groups = None;
    }
}

impl Default for TransportHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-node outbound transport routed through a [`TransportHub`].
pub struct HubTransport {
    local: NodeId,
    inner: Arc<RwLock<HubInner>>,
}

#[async_trait]
impl Transport for HubTransport {
    async fn send_to(&self, target: NodeId, message: ProtocolMessage) -> Result<()> {
        let inner = self.inner.read();
        if !inner.reachable(self.local, target) {
            trace!("dropping message {} -> {}: partitioned", self.local, target);
            return Err(ConclaveError::network("target partitioned"));
        }
        let Some(link) = inner.links.get(&target) else {
            return Err(ConclaveError::network("unknown target node"));
        };
        link.send((self.local, message))
            .map_err(|_| ConclaveError::network("target inbound channel closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_core::messages::{HeartbeatAck, ProtocolMessage};
    use conclave_core::Term;

    fn ack(from: NodeId, to: NodeId) -> ProtocolMessage {
        ProtocolMessage::heartbeat_ack(
            from,
            to,
            HeartbeatAck {
                current_term: Term(1),
            },
        )
    }

    #[tokio::test]
    async fn test_delivery_and_partition() {
        let hub = TransportHub::new();
        let a = NodeId::from(1);
        let b = NodeId::from(2);
        let (transport_a, _rx_a) = hub.register(a);
        let (_transport_b, mut rx_b) = hub.register(b);

        transport_a.send_to(b, ack(a, b)).await.unwrap();
        let (from, _message) = rx_b.recv().await.unwrap();
        assert_eq!(from, a);

        hub.partition([[a], [b]].map(|g| g.to_vec()));
        assert!(transport_a.send_to(b, ack(a, b)).await.is_err());

        hub.heal();
        transport_a.send_to(b, ack(a, b)).await.unwrap();
    }

    #[tokio::test]
    async fn test_isolation_cuts_both_directions() {
        let hub = TransportHub::new();
        let ids = [1, 2, 3].map(NodeId::from);
        let mut transports = Vec::new();
        let mut receivers = Vec::new();
        for id in ids {
            let (transport, rx) = hub.register(id);
            transports.push(transport);
            // a dropped receiver closes the link, keep them alive
            receivers.push(rx);
        }

        hub.isolate(ids[0]);
        assert!(transports[0].send_to(ids[1], ack(ids[0], ids[1])).await.is_err());
        assert!(transports[1].send_to(ids[0], ack(ids[1], ids[0])).await.is_err());
        // the other two still talk
        assert!(transports[1].send_to(ids[2], ack(ids[1], ids[2])).await.is_ok());
    }
}
