//! Cluster commands: the proposals replicated through raft.

use crate::state::NodeConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterCommand {
    SetReplicationFactor {
        replication_factor: u64,
    },
    SetPartitionCount {
        partitions: u64,
    },
    AddNode {
        node_config: NodeConfig,
    },
    RemoveNode {
        node_id: u64,
        #[serde(default)]
        replacement_node_id: Option<u64>,
        /// Tell the removed node to destroy the replica data it currently
        /// holds.
        #[serde(default)]
        wipe_present_replicas: bool,
        /// Tell the removed node to destroy leftover data for partitions it
        /// no longer materializes.
        #[serde(default)]
        wipe_absent_replicas: bool,
    },
    UpdateNode {
        node_id: u64,
        node_config: NodeConfig,
    },
    AddSite {
        site_id: String,
    },
    RemoveSite {
        site_id: String,
    },
    AddRelay {
        relay_id: String,
    },
    RemoveRelay {
        relay_id: String,
    },
    MoveRelay {
        relay_id: String,
        site_id: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_round_trip_as_json() {
        let commands = vec![
            ClusterCommand::SetReplicationFactor { replication_factor: 3 },
            ClusterCommand::AddSite { site_id: "s1".into() },
            ClusterCommand::RemoveNode {
                node_id: 7,
                replacement_node_id: Some(9),
                wipe_present_replicas: true,
                wipe_absent_replicas: false,
            },
            ClusterCommand::MoveRelay { relay_id: "r1".into(), site_id: None },
        ];
        for cmd in commands {
            let encoded = serde_json::to_string(&cmd).unwrap();
            let decoded: ClusterCommand = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded, cmd);
        }
    }
}
