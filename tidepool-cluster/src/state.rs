//! The raft-replicated cluster configuration.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Where a cluster member can be reached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub node_id: u64,
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn is_empty(&self) -> bool {
        self.node_id == 0 && self.host.is_empty()
    }
}

/// One member's static configuration. Capacity 0 retires the node from
/// token ownership without removing it (the decommission step).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub address: PeerAddress,
    pub capacity: u64,
}

/// Cluster-wide settings, immutable once tokens have been allocated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSettings {
    pub replication_factor: u64,
    pub partitions: u64,
}

impl ClusterSettings {
    pub fn initialized(&self) -> bool {
        self.replication_factor > 0 && self.partitions > 0
    }
}

/// The full replicated state. `tokens[i]` is the owner of token `i`
/// (0 = unowned); `partition_owners[p]` lists the replica owners of
/// partition `p` in replica-slot order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    pub nodes: BTreeMap<u64, NodeConfig>,
    pub removed_node_ids: BTreeSet<u64>,
    pub settings: ClusterSettings,
    pub sites: BTreeSet<String>,
    pub relays: BTreeMap<String, Option<String>>,
    pub tokens: Vec<u64>,
    pub partition_owners: Vec<Vec<u64>>,
}

impl ClusterState {
    /// Tokens allocate the first time settings are initialized and a node
    /// with nonzero capacity exists. Settings freeze at that point.
    pub fn tokens_allocated(&self) -> bool {
        self.tokens.iter().any(|owner| *owner != 0)
    }

    /// Nodes eligible to own tokens.
    pub fn live_node_ids(&self) -> Vec<u64> {
        self.nodes
            .iter()
            .filter(|(_, config)| config.capacity > 0)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn owners(&self, partition: u64) -> &[u64] {
        self.partition_owners
            .get(partition as usize)
            .map(|owners| owners.as_slice())
            .unwrap_or(&[])
    }
}
