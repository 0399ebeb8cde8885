//! Multi-node cluster harness.
//!
//! [`TestCluster`] spins up a set of coordinators wired through a
//! [`TransportHub`](crate::transport::TransportHub), with one shared
//! in-memory store per node so a restarted node recovers its durable term
//! and accepted state. Tests drive it through the coordinator handles and
//! the hub's partition controls.

use crate::transport::TransportHub;
use bytes::Bytes;
use conclave_core::election::VotingOnlyStrategy;
use conclave_core::transport::ClusterConfig;
use conclave_core::{ClusterState, Node, NodeId, Result, StateVersion, VotingConfiguration};
use conclave_engine::{ConclaveConfig, Coordinator, CoordinatorHandle};
use conclave_persistence::InMemoryStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;

struct Member {
    node: Node,
    store: InMemoryStore,
    handle: CoordinatorHandle,
    task: JoinHandle<Result<()>>,
    running: bool,
}

pub struct TestCluster {
    hub: TransportHub,
    config: ConclaveConfig,
    members: Vec<Member>,
}

impl TestCluster {
    /// Start `size` nodes, ids 1..=size, all master-eligible.
    pub async fn start(size: usize) -> Self {
        Self::start_with(size, &[]).await
    }

    /// Start `size` nodes; the listed indices are voting-only.
    pub async fn start_with(size: usize, voting_only: &[usize]) -> Self {
        let nodes: Vec<Node> = (0..size)
            .map(|i| {
                let node = Node::new(NodeId::from(i as u64 + 1), format!("10.0.0.{}", i + 1));
                if voting_only.contains(&i) {
                    node.voting_only()
                } else {
                    node
                }
            })
            .collect();

        let hub = TransportHub::new();
        let config = ConclaveConfig::default();
        let mut cluster = Self {
            hub,
            config,
            members: Vec::new(),
        };
        for (i, node) in nodes.iter().enumerate() {
            let member = cluster
                .spawn(node.clone(), &nodes, InMemoryStore::new(), i as u64)
                .await;
            cluster.members.push(member);
        }
        cluster
    }

    async fn spawn(&self, local: Node, nodes: &[Node], store: InMemoryStore, seed: u64) -> Member {
        let peers = nodes.iter().filter(|n| n.id != local.id).cloned();
        let cluster_config = ClusterConfig::new(local.clone(), peers);
        let initial = ClusterState::initial(
            VotingConfiguration::of(nodes.iter().map(|n| n.id)),
            nodes.iter().cloned(),
        );
        let (transport, inbound_rx) = self.hub.register(local.id);

        let (coordinator, handle) = Coordinator::new(
            cluster_config,
            self.config.clone().with_randomization_seed(seed),
            Arc::new(VotingOnlyStrategy),
            store.clone(),
            transport,
            inbound_rx,
            initial,
        )
        .await
        .expect("coordinator startup");
        let task = tokio::spawn(coordinator.run());

        Member {
            node: local,
            store,
            handle,
            task,
            running: true,
        }
    }

    pub fn hub(&self) -> &TransportHub {
        &self.hub
    }

    pub fn id(&self, index: usize) -> NodeId {
        self.members[index].node.id
    }

    pub fn handle(&self, index: usize) -> &CoordinatorHandle {
        &self.members[index].handle
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    fn running_indices(&self) -> Vec<usize> {
        self.members
            .iter()
            .enumerate()
            .filter(|(_, m)| m.running)
            .map(|(i, _)| i)
            .collect()
    }

    /// Wait until exactly one running node reports itself leader and return
    /// its index.
    pub async fn await_leader(&self, wait: Duration) -> usize {
        let indices = self.running_indices();
        self.await_leader_among(&indices, wait).await
    }

    /// Wait until exactly one of `indices` reports itself leader.
    pub async fn await_leader_among(&self, indices: &[usize], wait: Duration) -> usize {
        timeout(wait, async {
            loop {
                let leaders: Vec<usize> = indices
                    .iter()
                    .copied()
                    .filter(|i| self.members[*i].handle.is_leader())
                    .collect();
                if let [leader] = leaders[..] {
                    return leader;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("no leader elected within the deadline")
    }

    /// Wait until the node at `index` has committed a state with the given
    /// payload.
    pub async fn await_payload(&self, index: usize, payload: &Bytes, wait: Duration) {
        timeout(wait, async {
            loop {
                if &self.members[index].handle.current_state().payload == payload {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "node {} never observed the expected payload",
                self.members[index].node.id
            )
        })
    }

    /// Wait until the node at `index` has committed at least `version`.
    pub async fn await_version(&self, index: usize, version: StateVersion, wait: Duration) {
        timeout(wait, async {
            loop {
                if self.members[index].handle.current_state().version >= version {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "node {} never reached version {}",
                self.members[index].node.id, version
            )
        })
    }

    /// Shut the node down, keeping its durable store for a later restart.
    pub async fn stop(&mut self, index: usize) {
        let member = &mut self.members[index];
        if !member.running {
            return;
        }
        member.handle.shutdown();
        let _ = (&mut member.task).await;
        member.running = false;
    }

    /// Restart a stopped node against its original store.
    pub async fn restart(&mut self, index: usize) {
        assert!(!self.members[index].running, "node is still running");
        let nodes: Vec<Node> = self.members.iter().map(|m| m.node.clone()).collect();
        let local = self.members[index].node.clone();
        let store = self.members[index].store.clone();
        let member = self.spawn(local, &nodes, store, index as u64 + 100).await;
        self.members[index] = member;
    }

    pub async fn shutdown(mut self) {
        let indices: Vec<usize> = (0..self.members.len()).collect();
        for index in indices {
            self.stop(index).await;
        }
    }
}
