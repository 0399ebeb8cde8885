//! Heartbeat fault detection.
//!
//! Followers run a [`LeaderChecker`] against the current leader; the leader
//! runs a [`FollowerChecker`] against every peer it is responsible for.
//! Both use a fixed probe interval and a bounded consecutive-failure count
//! rather than exponential backoff: a false positive merely triggers a
//! re-election, which the term/quorum invariants make safe.
//!
//! The checkers hold bookkeeping only. The coordinator loop drives them
//! from its heartbeat tick and sends the probes itself, so all protocol
//! activity stays on the single serialized thread of control.

use conclave_core::NodeId;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Outcome of a leader-checker tick on a follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderCheck {
    /// Send another probe to the leader.
    Probe,
    /// The retry budget is exhausted; start an election.
    LeaderFailed,
}

/// Follower-side detector for an unresponsive leader.
#[derive(Debug)]
pub struct LeaderChecker {
    leader: NodeId,
    retry_count: u32,
    failures: u32,
    awaiting: bool,
}

impl LeaderChecker {
    pub fn new(leader: NodeId, retry_count: u32) -> Self {
        Self {
            leader,
            retry_count,
            failures: 0,
            awaiting: false,
        }
    }

    pub fn leader(&self) -> NodeId {
        self.leader
    }

    /// Called on every heartbeat tick. An unanswered probe from the
    /// previous tick counts as one failure.
    pub fn on_tick(&mut self) -> LeaderCheck {
        if self.awaiting {
            self.failures += 1;
            if self.failures >= self.retry_count {
                debug!(
                    "leader {} failed {} consecutive checks",
                    self.leader, self.failures
                );
                return LeaderCheck::LeaderFailed;
            }
        }
        self.awaiting = true;
        LeaderCheck::Probe
    }

    /// Any valid contact from the leader (heartbeat ack, publish, commit)
    /// resets the failure count.
    pub fn on_contact(&mut self) {
        self.failures = 0;
        self.awaiting = false;
    }
}

#[derive(Debug, Default)]
struct PeerProbe {
    failures: u32,
    awaiting: bool,
}

/// Leader-side detector, one probe stream per peer.
#[derive(Debug)]
pub struct FollowerChecker {
    retry_count: u32,
    peers: HashMap<NodeId, PeerProbe>,
}

impl FollowerChecker {
    pub fn new(retry_count: u32) -> Self {
        Self {
            retry_count,
            peers: HashMap::new(),
        }
    }

    /// Replace the probed peer set, keeping existing counters for peers
    /// that remain.
    pub fn set_peers(&mut self, peers: impl IntoIterator<Item = NodeId>) {
        let wanted: HashSet<NodeId> = peers.into_iter().collect();
        self.peers.retain(|id, _| wanted.contains(id));
        for id in wanted {
            self.peers.entry(id).or_default();
        }
    }

    /// Called on every heartbeat tick. Returns the peers to probe and the
    /// peers that just exhausted their retry budget.
    pub fn on_tick(&mut self) -> (Vec<NodeId>, Vec<NodeId>) {
        let mut probes = Vec::new();
        let mut newly_faulty = Vec::new();
        for (id, probe) in &mut self.peers {
            if probe.awaiting {
                probe.failures += 1;
                if probe.failures == self.retry_count {
                    debug!("follower {} failed {} consecutive checks", id, probe.failures);
                    newly_faulty.push(*id);
                }
            }
            probe.awaiting = true;
            probes.push(*id);
        }
        (probes, newly_faulty)
    }

    pub fn on_ack(&mut self, from: NodeId) {
        if let Some(probe) = self.peers.get_mut(&from) {
            probe.failures = 0;
            probe.awaiting = false;
        }
    }

    /// Peers currently past their retry budget.
    pub fn faulty_peers(&self) -> HashSet<NodeId> {
        self.peers
            .iter()
            .filter(|(_, p)| p.failures >= self.retry_count)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Peers still within their retry budget.
    pub fn healthy_peers(&self) -> HashSet<NodeId> {
        self.peers
            .iter()
            .filter(|(_, p)| p.failures < self.retry_count)
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leader_checker_trips_after_retries() {
        let mut checker = LeaderChecker::new(NodeId::from(1), 3);

        assert_eq!(checker.on_tick(), LeaderCheck::Probe); // probe 1 out
        assert_eq!(checker.on_tick(), LeaderCheck::Probe); // failure 1
        assert_eq!(checker.on_tick(), LeaderCheck::Probe); // failure 2
        assert_eq!(checker.on_tick(), LeaderCheck::LeaderFailed); // failure 3
    }

    #[test]
    fn test_leader_contact_resets_budget() {
        let mut checker = LeaderChecker::new(NodeId::from(1), 2);
        assert_eq!(checker.on_tick(), LeaderCheck::Probe);
        checker.on_contact();
        assert_eq!(checker.on_tick(), LeaderCheck::Probe);
        checker.on_contact();
        assert_eq!(checker.on_tick(), LeaderCheck::Probe);
    }

    #[test]
    fn test_follower_checker_isolates_faulty_peer() {
        let mut checker = FollowerChecker::new(2);
        checker.set_peers([2, 3].map(NodeId::from));

        let (probes, faulty) = checker.on_tick();
        assert_eq!(probes.len(), 2);
        assert!(faulty.is_empty());

        // node 2 answers, node 3 does not
        checker.on_ack(NodeId::from(2));
        let (_, faulty) = checker.on_tick();
        assert!(faulty.is_empty());
        let (_, faulty) = checker.on_tick();
        assert_eq!(faulty, vec![NodeId::from(3)]);

        assert_eq!(checker.faulty_peers().len(), 1);
        assert!(checker.healthy_peers().contains(&NodeId::from(2)));
    }

    #[test]
    fn test_set_peers_keeps_existing_counters() {
        let mut checker = FollowerChecker::new(2);
        checker.set_peers([2].map(NodeId::from));
        checker.on_tick();
        checker.on_tick();
        checker.on_tick();
        assert_eq!(checker.faulty_peers().len(), 1);

        checker.set_peers([2, 3].map(NodeId::from));
        assert_eq!(checker.faulty_peers().len(), 1); // node 2 still faulty
        checker.set_peers([3].map(NodeId::from));
        assert!(checker.faulty_peers().is_empty());
    }
}
