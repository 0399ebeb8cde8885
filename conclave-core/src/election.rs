//! Election policy: what counts as a winning set of votes and who may lead.

use crate::{Node, NodeId, StateVersion, Term, VotingConfiguration};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A granted vote as recorded by the candidate that received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Join {
    pub voter: NodeId,
    pub term: Term,
    pub last_accepted_term: Term,
    pub last_accepted_version: StateVersion,
}

/// Pluggable policy answering "is this vote/ack set sufficient" and "may
/// this node ever become leader".
///
/// The default is a strict majority of the relevant voting configuration.
/// The voting-only variant keeps the same quorum rules but bars
/// voting-only nodes from starting a binding election.
pub trait ElectionStrategy: Send + Sync {
    /// True iff `votes` suffices to win an election under `config`.
    fn is_election_quorum(&self, config: &VotingConfiguration, votes: &HashSet<NodeId>) -> bool;

    /// True iff `acks` suffices to commit a publication under `config`.
    fn is_publish_quorum(&self, config: &VotingConfiguration, acks: &HashSet<NodeId>) -> bool;

    /// True iff `node` is permitted to become leader. Nodes for which this
    /// returns false still vote, count toward quorum, and follow.
    fn may_lead(&self, node: &Node) -> bool;
}

/// Default policy: strict majority for both quorums; every master-eligible
/// node may lead.
#[derive(Debug, Clone, Copy, Default)]
pub struct MajorityStrategy;

impl ElectionStrategy for MajorityStrategy {
    fn is_election_quorum(&self, config: &VotingConfiguration, votes: &HashSet<NodeId>) -> bool {
        config.has_quorum(votes)
    }

    fn is_publish_quorum(&self, config: &VotingConfiguration, acks: &HashSet<NodeId>) -> bool {
        config.has_quorum(acks)
    }

    fn may_lead(&self, node: &Node) -> bool {
        node.master_eligible
    }
}

/// Majority quorums plus the voting-only exception: a node marked
/// `voting_only` may never transition into a binding candidacy, even when
/// its accepted state would otherwise make it the best candidate.
#[derive(Debug, Clone, Copy, Default)]
pub struct VotingOnlyStrategy;

impl ElectionStrategy for VotingOnlyStrategy {
    fn is_election_quorum(&self, config: &VotingConfiguration, votes: &HashSet<NodeId>) -> bool {
        config.has_quorum(votes)
    }

    fn is_publish_quorum(&self, config: &VotingConfiguration, acks: &HashSet<NodeId>) -> bool {
        config.has_quorum(acks)
    }

    fn may_lead(&self, node: &Node) -> bool {
        node.master_eligible && !node.voting_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> VotingConfiguration {
        VotingConfiguration::of([1, 2, 3].map(NodeId::from))
    }

    #[test]
    fn test_majority_quorum() {
        let strategy = MajorityStrategy;
        let votes: HashSet<NodeId> = [1, 2].map(NodeId::from).into_iter().collect();
        assert!(strategy.is_election_quorum(&config(), &votes));

        let minority: HashSet<NodeId> = [1].map(NodeId::from).into_iter().collect();
        assert!(!strategy.is_election_quorum(&config(), &minority));
    }

    #[test]
    fn test_voting_only_node_may_not_lead() {
        let strategy = VotingOnlyStrategy;
        let regular = Node::new(NodeId::from(1), "10.0.0.1");
        let voting_only = Node::new(NodeId::from(2), "10.0.0.2").voting_only();

        assert!(strategy.may_lead(&regular));
        assert!(!strategy.may_lead(&voting_only));

        // quorum counting is unchanged: the voting-only node's vote counts
        let votes: HashSet<NodeId> = [2, 3].map(NodeId::from).into_iter().collect();
        assert!(strategy.is_election_quorum(&config(), &votes));
    }

    #[test]
    fn test_default_strategy_ignores_voting_only_flag() {
        let strategy = MajorityStrategy;
        let voting_only = Node::new(NodeId::from(2), "10.0.0.2").voting_only();
        assert!(strategy.may_lead(&voting_only));
    }
}
