//! # Error Types
//!
//! Error taxonomy for the Conclave coordination protocol.

use crate::{NodeId, StateVersion, Term};
use thiserror::Error;

/// Errors surfaced by the coordination protocol.
///
/// The taxonomy follows the protocol's failure classes:
///
/// - **Stale-term**: a peer has seen a higher term; always recoverable by
///   the sender stepping down and updating its term.
/// - **Quorum-timeout**: an election or publication missed its deadline;
///   surfaced to the caller as a failed update, never retried silently.
/// - **Durability**: the local store cannot persist a term/state update;
///   fatal to this node's participation until storage recovers.
/// - **Configuration-safety**: a proposed reconfiguration would drop quorum
///   below the tolerated-failure floor; rejected synchronously.
///
/// # Examples
///
/// ```rust
/// use conclave_core::ConclaveError;
///
/// let error = ConclaveError::network("connection refused");
/// assert!(error.is_retryable());
/// ```
#[derive(Error, Debug)]
pub enum ConclaveError {
    /// The node is not the leader and cannot accept state updates.
    #[error("Not leader{}", leader.map(|l| format!(", current leader is {}", l)).unwrap_or_default())]
    NotLeader { leader: Option<NodeId> },

    /// A peer rejected a request because it has seen a higher term.
    #[error("Stale term: peer is at term {current}")]
    StaleTerm { current: Term },

    /// An election or publication failed to reach quorum within its deadline.
    #[error("Quorum timeout during {operation}")]
    QuorumTimeout { operation: String },

    /// The operation was overtaken by a newer term before completing.
    #[error("Superseded by term {term}")]
    Superseded { term: Term },

    /// A commit arrived for a `(term, version)` that does not match the
    /// last accepted state; stale or out-of-order, ignored by the receiver.
    #[error("Commit mismatch: commit for ({term}, {version}) does not match accepted state")]
    CommitMismatch { term: Term, version: StateVersion },

    /// The persistent store could not make a term/state update durable.
    #[error("Durability error: {message}")]
    Durability { message: String },

    /// A proposed voting-configuration change violates the safety floor.
    #[error("Unsafe configuration change: {message}")]
    ConfigurationUnsafe { message: String },

    /// The coordinator loop has shut down and no longer serves requests.
    #[error("Coordinator unavailable")]
    CoordinatorUnavailable,

    /// Network communication failure between nodes.
    #[error("Network error: {message}")]
    Network { message: String },

    /// JSON serialization/deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// File system or network I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected internal error.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Type alias for Results in the Conclave coordination system.
pub type Result<T> = std::result::Result<T, ConclaveError>;

impl ConclaveError {
    pub fn not_leader(leader: Option<NodeId>) -> Self {
        Self::NotLeader { leader }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn durability(message: impl Into<String>) -> Self {
        Self::Durability {
            message: message.into(),
        }
    }

    pub fn configuration_unsafe(message: impl Into<String>) -> Self {
        Self::ConfigurationUnsafe {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Internal {
            message: format!("Serialization error: {}", message.into()),
        }
    }

    /// Whether retrying the operation (possibly after a new election) can
    /// succeed. Durability and configuration-safety failures cannot be
    /// retried without operator intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. }
                | Self::QuorumTimeout { .. }
                | Self::StaleTerm { .. }
                | Self::Superseded { .. }
                | Self::NotLeader { .. }
        )
    }
}
