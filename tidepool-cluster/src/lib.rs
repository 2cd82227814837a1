//! Tidepool Cluster
//!
//! The replicated control plane: a deterministic cluster configuration
//! state machine (membership, token placement, sites, relays), a compact
//! raft implementation for replicating it, and the config controller
//! runtime that ties the two together.

pub mod state;
pub mod command;
pub mod delta;
pub mod controller;
pub mod raft;
pub mod config;

pub use command::ClusterCommand;
pub use config::{ConfigController, ConfigControllerConfig, DeltaHandler};
pub use controller::ClusterController;
pub use delta::ClusterStateDelta;
pub use state::{ClusterSettings, ClusterState, NodeConfig, PeerAddress};
