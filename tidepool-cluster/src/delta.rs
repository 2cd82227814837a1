//! Cluster state deltas: the minimal canonical change set between two
//! configurations.

use crate::state::ClusterState;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterStateDelta {
    NodeAdded { node_id: u64 },
    NodeRemoved {
        node_id: u64,
        /// Carried from the removal command: whether the departing node
        /// destroys the replica data it still materializes.
        #[serde(default)]
        wipe_present_replicas: bool,
        /// Whether it also sweeps leftover data for partitions it no
        /// longer materializes.
        #[serde(default)]
        wipe_absent_replicas: bool,
    },
    NodeGainedToken { node_id: u64, token: u64 },
    NodeLostToken { node_id: u64, token: u64 },
    NodeGainedPartitionReplica { node_id: u64, partition: u64, replica: u64 },
    NodeLostPartitionReplica { node_id: u64, partition: u64, replica: u64 },
    SiteAdded { site_id: String },
    SiteRemoved { site_id: String },
    RelayAdded { relay_id: String },
    RelayRemoved { relay_id: String },
    RelayMoved { relay_id: String, site_id: Option<String> },
}

impl ClusterStateDelta {
    /// True when a node applying deltas locally cares about this one.
    pub fn concerns(&self, node_id: u64) -> bool {
        match self {
            ClusterStateDelta::NodeAdded { node_id: n }
            | ClusterStateDelta::NodeRemoved { node_id: n, .. }
            | ClusterStateDelta::NodeGainedToken { node_id: n, .. }
            | ClusterStateDelta::NodeLostToken { node_id: n, .. }
            | ClusterStateDelta::NodeGainedPartitionReplica { node_id: n, .. }
            | ClusterStateDelta::NodeLostPartitionReplica { node_id: n, .. } => *n == node_id,
            // Site and relay changes concern every node
            _ => true,
        }
    }
}

/// Diff two configurations into the minimal delta set, in canonical order:
/// node adds, node removes, token changes, replica changes, sites, relays.
///
/// Applying commands one at a time and concatenating per-command deltas
/// yields the same list as diffing the endpoints command by command; tests
/// pin this.
pub fn diff(before: &ClusterState, after: &ClusterState) -> Vec<ClusterStateDelta> {
    let mut deltas = Vec::new();

    for node_id in after.nodes.keys() {
        if !before.nodes.contains_key(node_id) {
            deltas.push(ClusterStateDelta::NodeAdded { node_id: *node_id });
        }
    }
    for node_id in before.nodes.keys() {
        if !after.nodes.contains_key(node_id) {
            // Wipe intent is command metadata, not state: a pure diff
            // defaults it off and `apply` stamps it from the command
            deltas.push(ClusterStateDelta::NodeRemoved {
                node_id: *node_id,
                wipe_present_replicas: false,
                wipe_absent_replicas: false,
            });
        }
    }

    let tokens = before.tokens.len().max(after.tokens.len());
    for token in 0..tokens {
        let old = before.tokens.get(token).copied().unwrap_or(0);
        let new = after.tokens.get(token).copied().unwrap_or(0);
        if old != new {
            if old != 0 {
                deltas.push(ClusterStateDelta::NodeLostToken { node_id: old, token: token as u64 });
            }
            if new != 0 {
                deltas.push(ClusterStateDelta::NodeGainedToken { node_id: new, token: token as u64 });
            }
        }
    }

    let partitions = before.partition_owners.len().max(after.partition_owners.len());
    for partition in 0..partitions {
        let empty: Vec<u64> = Vec::new();
        let old = before.partition_owners.get(partition).unwrap_or(&empty);
        let new = after.partition_owners.get(partition).unwrap_or(&empty);
        let slots = old.len().max(new.len());
        for replica in 0..slots {
            let old_owner = old.get(replica).copied();
            let new_owner = new.get(replica).copied();
            if old_owner != new_owner {
                if let Some(node_id) = old_owner {
                    deltas.push(ClusterStateDelta::NodeLostPartitionReplica {
                        node_id,
                        partition: partition as u64,
                        replica: replica as u64,
                    });
                }
                if let Some(node_id) = new_owner {
                    deltas.push(ClusterStateDelta::NodeGainedPartitionReplica {
                        node_id,
                        partition: partition as u64,
                        replica: replica as u64,
                    });
                }
            }
        }
    }

    for site_id in after.sites.iter() {
        if !before.sites.contains(site_id) {
            deltas.push(ClusterStateDelta::SiteAdded { site_id: site_id.clone() });
        }
    }
    for site_id in before.sites.iter() {
        if !after.sites.contains(site_id) {
            deltas.push(ClusterStateDelta::SiteRemoved { site_id: site_id.clone() });
        }
    }

    for (relay_id, site) in after.relays.iter() {
        match before.relays.get(relay_id) {
            None => deltas.push(ClusterStateDelta::RelayAdded { relay_id: relay_id.clone() }),
            Some(old_site) if old_site != site => {
                deltas.push(ClusterStateDelta::RelayMoved {
                    relay_id: relay_id.clone(),
                    site_id: site.clone(),
                });
            }
            Some(_) => {}
        }
    }
    for relay_id in before.relays.keys() {
        if !after.relays.contains_key(relay_id) {
            deltas.push(ClusterStateDelta::RelayRemoved { relay_id: relay_id.clone() });
        }
    }

    deltas
}
