//! # Core Types
//!
//! Fundamental identity, epoch, and membership types used throughout the
//! Conclave coordination protocol.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a node in the coordination cluster.
///
/// Each participating node has a unique identifier generated when the node
/// first starts. The identifier is used for message routing, vote counting,
/// and voting-configuration membership.
///
/// # Examples
///
/// ```rust
/// use conclave_core::NodeId;
///
/// let node_id = NodeId::new();
/// assert_ne!(node_id, NodeId::new());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Creates a new random node identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        // Convert u64 to UUID for deterministic test identities
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&id.to_be_bytes());
        Self(Uuid::from_bytes(bytes))
    }
}

/// Monotonically increasing epoch identifier ordering leadership periods.
///
/// A node never accepts a message carrying a term lower than its own current
/// term, and granting a vote or accepting a publish request for term `T`
/// raises the local term to at least `T` before the reply is sent.
///
/// # Examples
///
/// ```rust
/// use conclave_core::Term;
///
/// let t = Term(4);
/// assert!(t.next() > t);
/// ```
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Term = Term(0);

    /// Returns the next term in sequence.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version of a cluster state, monotonic within a term.
///
/// Each new term starts publication from the highest version previously
/// accepted by the new leader, so committed states form a strict total order
/// by `(term, version)` cluster-wide.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct StateVersion(pub u64);

impl StateVersion {
    pub const ZERO: StateVersion = StateVersion(0);

    /// Returns the next version in sequence.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A member of the cluster as seen by the coordination layer.
///
/// `master_eligible` gates participation in elections entirely;
/// `voting_only` marks a node that votes and counts toward quorum but is
/// permanently ineligible to become leader itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub address: String,
    pub master_eligible: bool,
    pub voting_only: bool,
}

impl Node {
    /// Creates a master-eligible node with the given id and address.
    pub fn new(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            master_eligible: true,
            voting_only: false,
        }
    }

    /// Marks this node as voting-only: it still votes and counts toward
    /// quorum but can never be elected leader.
    pub fn voting_only(mut self) -> Self {
        self.voting_only = true;
        self
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// The authoritative set of node identifiers whose acknowledgements count
/// toward quorum.
///
/// The configuration is an immutable value; reconfiguration happens by
/// committing a cluster state carrying a new configuration. Members are not
/// necessarily still live. Quorum is a strict majority:
/// `floor(len / 2) + 1`.
///
/// # Examples
///
/// ```rust
/// use conclave_core::{NodeId, VotingConfiguration};
///
/// let config = VotingConfiguration::of([1, 2, 3].map(NodeId::from));
/// assert_eq!(config.quorum_size(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotingConfiguration {
    pub node_ids: BTreeSet<NodeId>,
}

impl VotingConfiguration {
    /// Builds a configuration from any iterator of node ids.
    pub fn of(node_ids: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            node_ids: node_ids.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.node_ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.node_ids.len()
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.node_ids.contains(node_id)
    }

    /// Number of acknowledgements required for a decision to be binding.
    pub fn quorum_size(&self) -> usize {
        self.node_ids.len() / 2 + 1
    }

    /// True iff `acks` contains a strict majority of this configuration's
    /// members. Acks from nodes outside the configuration never count.
    pub fn has_quorum(&self, acks: &HashSet<NodeId>) -> bool {
        if self.node_ids.is_empty() {
            return false;
        }
        let counted = self.node_ids.iter().filter(|id| acks.contains(id)).count();
        counted >= self.quorum_size()
    }
}

impl fmt::Display for VotingConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VotingConfiguration{{")?;
        for (i, id) in self.node_ids.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", id)?;
        }
        write!(f, "}}")
    }
}
