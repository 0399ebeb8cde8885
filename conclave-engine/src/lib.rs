//! The Conclave coordination engine.
//!
//! This crate holds the moving parts of the protocol: the
//! [`coordination::CoordinationState`] kernel that owns term and state
//! bookkeeping, the [`coordinator::Coordinator`] actor that serializes all
//! protocol activity on one loop, per-publication tracking, heartbeat fault
//! detection, and the voting-configuration policy.
//!
//! Collaborators interact through a [`coordinator::CoordinatorHandle`]: they
//! submit metadata updates and read the last committed cluster state, and
//! the engine takes care of elections, quorum, durability, and commit
//! ordering underneath.

pub mod config;
pub mod coordination;
pub mod coordinator;
pub mod fault;
pub mod publication;
pub mod reconfigure;

pub use config::ConclaveConfig;
pub use coordination::CoordinationState;
pub use coordinator::{Coordinator, CoordinatorCommand, CoordinatorHandle, Mode};
pub use publication::{Publication, PublicationTargetState};
pub use reconfigure::Reconfigurator;
