//! Durable `(current_term, last_accepted_state)` record.
//!
//! The coordination protocol is only safe if a node never grants a vote or
//! acks a publish request it cannot durably justify after a restart. The
//! engine therefore writes through a [`CoordinationStore`] and waits for the
//! write to complete before the dependent message goes on the wire. A store
//! failure disqualifies the node from further participation until storage
//! recovers.

use crate::{ClusterState, ConclaveError, Result, Term};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The durable coordination record a node recovers from after a crash.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedCoordinationState {
    pub current_term: Term,
    pub last_accepted: Option<ClusterState>,
}

impl PersistedCoordinationState {
    pub fn new(current_term: Term, last_accepted: Option<ClusterState>) -> Self {
        Self {
            current_term,
            last_accepted,
        }
    }

    /// Serialize the record for persistence.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            ConclaveError::serialization(format!("failed to serialize coordination state: {}", e))
        })
    }

    /// Deserialize a persisted record.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| {
            ConclaveError::serialization(format!("failed to deserialize coordination state: {}", e))
        })
    }
}

/// Durable single-node key/value persistence primitive for term and
/// accepted-state bookkeeping.
///
/// Implementations must make each write durable (fsync or equivalent)
/// before returning `Ok`; the caller sends vote grants and publish acks
/// only after the corresponding write has returned.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Load the persisted record, or `None` on first startup.
    async fn load(&self) -> Result<Option<PersistedCoordinationState>>;

    /// Durably record a new current term.
    async fn store_term(&self, term: Term) -> Result<()>;

    /// Durably record a newly accepted (not yet committed) state.
    async fn store_accepted_state(&self, state: &ClusterState) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Node, NodeId, VotingConfiguration};

    #[test]
    fn test_round_trip() {
        let ids = [1, 2, 3].map(NodeId::from);
        let state = ClusterState::initial(
            VotingConfiguration::of(ids),
            ids.iter().map(|id| Node::new(*id, "local")),
        );
        let record = PersistedCoordinationState::new(Term(7), Some(state));

        let bytes = record.to_bytes().unwrap();
        let decoded = PersistedCoordinationState::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.current_term, Term(7));
        assert_eq!(
            decoded.last_accepted.unwrap().voting_config,
            record.last_accepted.unwrap().voting_config
        );
    }

    #[test]
    fn test_corrupt_bytes_rejected() {
        assert!(PersistedCoordinationState::from_bytes(b"{not json").is_err());
    }
}
