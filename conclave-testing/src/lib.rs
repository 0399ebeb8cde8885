//! Test harness for the Conclave coordination engine: an in-process message
//! hub with partition controls and a multi-node cluster builder.

pub mod cluster;
pub mod transport;

pub use cluster::TestCluster;
pub use transport::{HubTransport, TransportHub};
