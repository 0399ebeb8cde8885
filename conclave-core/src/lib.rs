//! # Conclave Core
//!
//! Core building blocks for the Conclave cluster coordination engine.
//!
//! Conclave elects a single master among many nodes and propagates agreed
//! cluster metadata to every node with strict `(term, version)` ordering and
//! durability guarantees. This crate holds the pieces shared by the engine,
//! the persistence backends, and the test harness:
//!
//! - **Identity and epoch types**: [`NodeId`], [`Term`], [`StateVersion`]
//! - **Cluster metadata**: [`ClusterState`], [`VotingConfiguration`], [`Node`]
//! - **Protocol messages**: pre-vote, vote, publish, commit, and heartbeat
//!   request/response pairs
//! - **Election policy**: the [`election::ElectionStrategy`] seam with the
//!   default majority policy and the voting-only variant
//! - **Persistence seam**: [`store::CoordinationStore`] for the durable
//!   `(current_term, last_accepted_state)` record
//! - **Transport seam**: [`transport::Transport`] for point-to-point
//!   coordination messages
//! - **Error taxonomy**: [`ConclaveError`] with retryability classification

pub mod election;
pub mod error;
pub mod messages;
pub mod state;
pub mod store;
pub mod transport;
pub mod types;

pub use error::*;
pub use state::*;
pub use types::*;
