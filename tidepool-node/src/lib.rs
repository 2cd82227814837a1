//! Tidepool Node
//!
//! The cloud-tier cluster node: lifecycle (start, join, decommission,
//! stop), the delta coordinator that reifies config changes locally, the
//! quorum-aware cluster I/O agent, and the inter-node call seams.

pub mod client;
pub mod clusterio;
pub mod coordinator;
pub mod node;

pub use client::{BatchResult, ClusterFacade, InterNodeClient, NodeHub};
pub use clusterio::{ClusterIoAgent, PartitionResolver};
pub use coordinator::{NodeCoordinatorFacade, NodeStateCoordinator};
pub use node::{
    ClusterNode, ClusterNodeConfig, NodeInitializationOptions, RAFT_STORE_STORAGE_PREFIX,
    SITE_STORE_STORAGE_PREFIX,
};
