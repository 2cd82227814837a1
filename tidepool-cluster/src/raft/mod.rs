//! A compact raft implementation sized for the config replication
//! workload: leader election, log replication, commitment, and snapshot
//! install, behind a pure step/tick core.
//!
//! The core ([`RaftNode`]) owns no I/O beyond its log store: it is advanced
//! by `tick()` and `step()` and emits messages to send and entries to
//! apply. The config controller runtime drives it from a single task.

pub mod message;
pub mod store;
pub mod node;
pub mod transport;

pub use message::{Entry, Envelope, RaftMessage};
pub use node::{RaftNode, RaftOutput, Role};
pub use store::{HardState, RaftStore, SnapshotRecord};
pub use transport::{ClusterNetwork, NetworkTransport, RaftTransport};
