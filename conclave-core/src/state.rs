//! # Cluster State
//!
//! The immutable, versioned snapshot of cluster metadata agreed on by the
//! coordination protocol.

use crate::{Node, NodeId, StateVersion, Term, VotingConfiguration};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A versioned snapshot of the agreed cluster metadata.
///
/// Instances are created only by the current leader inside a publication,
/// are immutable once created, and are retired once superseded by a higher
/// `(term, version)`. All committed states observed cluster-wide form a
/// strict total order by `(term, version)`; no two distinct payloads are
/// ever committed at the same pair.
///
/// `voting_config` is the configuration this state proposes;
/// `last_committed_config` is the configuration under which the previous
/// state committed. When the two differ, the publication carrying this
/// state is transitional and must satisfy a quorum of **both**.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    pub term: Term,
    pub version: StateVersion,
    pub voting_config: VotingConfiguration,
    pub last_committed_config: VotingConfiguration,
    /// Known members keyed by id; includes non-voting nodes.
    pub nodes: BTreeMap<NodeId, Node>,
    /// Opaque metadata payload (index definitions, routing, settings).
    pub payload: Bytes,
}

impl ClusterState {
    /// The bootstrap state for a fresh cluster: term and version zero with
    /// the initial voting configuration committed to itself.
    pub fn initial(config: VotingConfiguration, nodes: impl IntoIterator<Item = Node>) -> Self {
        Self {
            term: Term::ZERO,
            version: StateVersion::ZERO,
            voting_config: config.clone(),
            last_committed_config: config,
            nodes: nodes.into_iter().map(|n| (n.id, n)).collect(),
            payload: Bytes::new(),
        }
    }

    /// Builds the successor state a leader publishes: same membership, next
    /// version at the leader's term, new payload.
    pub fn successor(&self, term: Term, payload: Bytes) -> Self {
        Self {
            term,
            version: self.version.next(),
            voting_config: self.voting_config.clone(),
            last_committed_config: self.voting_config.clone(),
            nodes: self.nodes.clone(),
            payload,
        }
    }

    /// Builds the transitional successor that carries a configuration
    /// change. `last_committed_config` keeps the old configuration so the
    /// publication checks both quorums.
    pub fn reconfigured(&self, term: Term, new_config: VotingConfiguration) -> Self {
        Self {
            term,
            version: self.version.next(),
            voting_config: new_config,
            last_committed_config: self.voting_config.clone(),
            nodes: self.nodes.clone(),
            payload: self.payload.clone(),
        }
    }

    /// True iff this state supersedes `(term, version)`.
    pub fn is_later_than(&self, term: Term, version: StateVersion) -> bool {
        (self.term, self.version) > (term, version)
    }

    /// True iff this state carries a voting-configuration change.
    pub fn is_reconfiguration(&self) -> bool {
        self.voting_config != self.last_committed_config
    }

    /// Node ids a publication of this state must target for acks: the union
    /// of the old and new voting configurations.
    pub fn publish_targets(&self) -> BTreeSet<NodeId> {
        self.voting_config
            .node_ids
            .union(&self.last_committed_config.node_ids)
            .copied()
            .collect()
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ClusterState{{term={}, version={}, config={}}}",
            self.term, self.version, self.voting_config
        )
    }
}
