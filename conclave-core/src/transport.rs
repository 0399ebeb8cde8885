//! Transport seam and static cluster membership.
//!
//! The protocol assumes a reliable point-to-point request/response transport
//! supplied externally; per-message timeouts are applied by the engine, not
//! here. Outbound messages go through the [`Transport`] trait; inbound
//! messages are delivered to the coordinator loop over a channel so that the
//! coordinator processes every message through one serialized entry point.

use crate::messages::ProtocolMessage;
use crate::{Node, NodeId, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Channel half the network layer pushes inbound messages into.
pub type InboundSender = mpsc::UnboundedSender<(NodeId, ProtocolMessage)>;
/// Channel half the coordinator loop drains.
pub type InboundReceiver = mpsc::UnboundedReceiver<(NodeId, ProtocolMessage)>;

/// Creates the inbound message channel connecting a transport to a
/// coordinator loop.
pub fn inbound_channel() -> (InboundSender, InboundReceiver) {
    mpsc::unbounded_channel()
}

/// The local node plus every peer known at startup (from discovery).
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub local: Node,
    pub nodes: BTreeMap<NodeId, Node>,
}

impl ClusterConfig {
    pub fn new(local: Node, nodes: impl IntoIterator<Item = Node>) -> Self {
        let mut map: BTreeMap<NodeId, Node> = nodes.into_iter().map(|n| (n.id, n)).collect();
        map.insert(local.id, local.clone());
        Self { local, nodes: map }
    }

    pub fn local_id(&self) -> NodeId {
        self.local.id
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// All node ids except the local one.
    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.nodes
            .keys()
            .copied()
            .filter(|id| *id != self.local.id)
            .collect()
    }

    pub fn total_nodes(&self) -> usize {
        self.nodes.len()
    }
}

/// Point-to-point outbound message transport between coordination nodes.
///
/// A send error is treated by the engine like a missing response: the
/// publication or fault-detector timeout covers it, so implementations
/// should not retry internally.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_to(&self, target: NodeId, message: ProtocolMessage) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_ids_exclude_local() {
        let local = Node::new(NodeId::from(1), "10.0.0.1");
        let peers = [2u64, 3].map(|i| Node::new(NodeId::from(i), format!("10.0.0.{}", i)));
        let config = ClusterConfig::new(local, peers);

        assert_eq!(config.total_nodes(), 3);
        let peer_ids = config.peer_ids();
        assert_eq!(peer_ids.len(), 2);
        assert!(!peer_ids.contains(&NodeId::from(1)));
    }
}
