//! Cluster coordination and replication.
//!
//! Every node runs leader election and log replication against its peers.
//! Client writes go through the leader's log and are applied to each
//! node's [`ReplicatedStore`](crate::store::ReplicatedStore) once a
//! majority holds them.

pub mod election;
pub mod node;
pub mod replication;
pub mod state;
pub mod transport;

#[cfg(test)]
pub(crate) mod sim;

pub use node::{ConsensusNode, NodeStatus, Timing};
pub use state::{Command, LogEntry, Role};
pub use transport::{HttpTransport, PeerTransport};
