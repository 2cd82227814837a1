//! The node state coordinator: turns committed cluster deltas into local
//! actions.
//!
//! Deltas from a single commit apply in the order emitted; distinct commits
//! are serialized by the config controller's apply path. Nothing here
//! blocks the raft apply path: long work (transfer pulls, site wipes)
//! happens on background workers owned by the facade's implementations.

use std::collections::HashMap;
use std::sync::Mutex;
use tidepool_cluster::{ClusterController, ClusterStateDelta};

/// The local actions the coordinator can take. Implemented by the cluster
/// node; narrow on purpose, it is the main seam for exercising delta
/// handling without a full node.
pub trait NodeCoordinatorFacade: Send + Sync {
    /// A replica was gained: materialize the partition and pull its
    /// content from the nodes that held it before this change.
    fn provision_partition_replica(&self, partition: u64, sources: Vec<u64>);

    /// A replica was lost: write-lock and queue the outgoing handoff. The
    /// partition drops when the new owner acknowledges.
    fn retire_partition_replica(&self, partition: u64);

    fn add_site(&self, site_id: &str);
    fn remove_site(&self, site_id: &str);

    fn set_relay_site(&self, relay_id: &str, site_id: Option<String>);
    fn drop_relay(&self, relay_id: &str);

    fn notify_joined(&self);
    fn notify_removed(&self);

    /// Forced removal asked this node to destroy replica data: partitions
    /// it currently materializes (`present`) and/or leftover storage for
    /// partitions it no longer materializes (`absent`).
    fn wipe_replicas(&self, present: bool, absent: bool);
}

/// Per-partition owner slots as the coordinator last saw them.
type OwnersView = HashMap<u64, HashMap<u64, u64>>;

pub struct NodeStateCoordinator<F: NodeCoordinatorFacade> {
    local_id: u64,
    facade: F,
    owners: Mutex<OwnersView>,
}

impl<F: NodeCoordinatorFacade> NodeStateCoordinator<F> {
    pub fn new(local_id: u64, facade: F) -> Self {
        Self {
            local_id,
            facade,
            owners: Mutex::new(HashMap::new()),
        }
    }

    /// Reify the node's current state at boot, before any new deltas
    /// arrive: local partitions materialize, sites appear, transfers
    /// resume against the other current owners.
    pub fn initialize(&self, controller: &ClusterController) {
        {
            let mut owners = match self.owners.lock() {
                Ok(owners) => owners,
                Err(_) => return,
            };
            for (partition, slots) in controller.state.partition_owners.iter().enumerate() {
                let view = owners.entry(partition as u64).or_default();
                for (slot, owner) in slots.iter().enumerate() {
                    view.insert(slot as u64, *owner);
                }
            }
        }

        for site_id in controller.state.sites.iter() {
            self.facade.add_site(site_id);
        }
        for (relay_id, site) in controller.state.relays.iter() {
            self.facade.set_relay_site(relay_id, site.clone());
        }

        for (partition, _) in controller.local_partition_replicas() {
            let sources: Vec<u64> = controller
                .partition_owners(partition)
                .into_iter()
                .filter(|owner| *owner != self.local_id)
                .collect();
            self.facade.provision_partition_replica(partition, sources);
        }
    }

    /// Apply one commit's delta batch.
    pub fn process_deltas(&self, deltas: &[ClusterStateDelta]) {
        // Owner slots before this batch: the transfer sources for any
        // replica gained here
        let previous: OwnersView = match self.owners.lock() {
            Ok(owners) => owners.clone(),
            Err(_) => return,
        };

        // Fold the batch into the owners view
        if let Ok(mut owners) = self.owners.lock() {
            for delta in deltas {
                match delta {
                    ClusterStateDelta::NodeLostPartitionReplica { partition, replica, .. } => {
                        owners.entry(*partition).or_default().remove(replica);
                    }
                    ClusterStateDelta::NodeGainedPartitionReplica {
                        node_id,
                        partition,
                        replica,
                    } => {
                        owners.entry(*partition).or_default().insert(*replica, *node_id);
                    }
                    _ => {}
                }
            }
        }

        // Membership, site, and relay actions, in emitted order
        let mut gained: Vec<u64> = Vec::new();
        let mut lost: Vec<u64> = Vec::new();
        for delta in deltas {
            match delta {
                ClusterStateDelta::NodeAdded { node_id } if *node_id == self.local_id => {
                    self.facade.notify_joined();
                }
                ClusterStateDelta::NodeRemoved {
                    node_id,
                    wipe_present_replicas,
                    wipe_absent_replicas,
                } if *node_id == self.local_id => {
                    if *wipe_present_replicas || *wipe_absent_replicas {
                        self.facade.wipe_replicas(*wipe_present_replicas, *wipe_absent_replicas);
                    }
                    self.facade.notify_removed();
                }
                ClusterStateDelta::NodeGainedPartitionReplica { node_id, partition, .. }
                    if *node_id == self.local_id =>
                {
                    gained.push(*partition);
                }
                ClusterStateDelta::NodeLostPartitionReplica { node_id, partition, .. }
                    if *node_id == self.local_id =>
                {
                    lost.push(*partition);
                }
                ClusterStateDelta::SiteAdded { site_id } => {
                    self.facade.add_site(site_id);
                }
                ClusterStateDelta::SiteRemoved { site_id } => {
                    self.facade.remove_site(site_id);
                }
                ClusterStateDelta::RelayAdded { relay_id } => {
                    self.facade.set_relay_site(relay_id, None);
                }
                ClusterStateDelta::RelayMoved { relay_id, site_id } => {
                    self.facade.set_relay_site(relay_id, site_id.clone());
                }
                ClusterStateDelta::RelayRemoved { relay_id } => {
                    self.facade.drop_relay(relay_id);
                }
                _ => {}
            }
        }

        // Replica actions consolidate against the post-batch view: slots
        // can shuffle within one commit, and a partition both lost and
        // gained in different slots stays exactly where it is
        gained.sort_unstable();
        gained.dedup();
        lost.sort_unstable();
        lost.dedup();

        for partition in gained {
            if !self.owns(partition) {
                continue;
            }
            let sources: Vec<u64> = previous
                .get(&partition)
                .map(|slots| {
                    let mut sources: Vec<u64> = slots
                        .values()
                        .copied()
                        .filter(|owner| *owner != self.local_id)
                        .collect();
                    sources.sort_unstable();
                    sources.dedup();
                    sources
                })
                .unwrap_or_default();
            self.facade.provision_partition_replica(partition, sources);
        }
        for partition in lost {
            if !self.owns(partition) {
                self.facade.retire_partition_replica(partition);
            }
        }
    }

    fn owns(&self, partition: u64) -> bool {
        self.owners
            .lock()
            .map(|owners| {
                owners
                    .get(&partition)
                    .map(|slots| slots.values().any(|owner| *owner == self.local_id))
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Action {
        Provision(u64, Vec<u64>),
        Retire(u64),
        AddSite(String),
        RemoveSite(String),
        SetRelay(String, Option<String>),
        DropRelay(String),
        Joined,
        Removed,
        Wipe(bool, bool),
    }

    #[derive(Default)]
    struct Recorder {
        actions: Mutex<Vec<Action>>,
    }

    impl NodeCoordinatorFacade for Arc<Recorder> {
        fn provision_partition_replica(&self, partition: u64, sources: Vec<u64>) {
            self.actions.lock().unwrap().push(Action::Provision(partition, sources));
        }
        fn retire_partition_replica(&self, partition: u64) {
            self.actions.lock().unwrap().push(Action::Retire(partition));
        }
        fn add_site(&self, site_id: &str) {
            self.actions.lock().unwrap().push(Action::AddSite(site_id.to_string()));
        }
        fn remove_site(&self, site_id: &str) {
            self.actions.lock().unwrap().push(Action::RemoveSite(site_id.to_string()));
        }
        fn set_relay_site(&self, relay_id: &str, site_id: Option<String>) {
            self.actions.lock().unwrap().push(Action::SetRelay(relay_id.to_string(), site_id));
        }
        fn drop_relay(&self, relay_id: &str) {
            self.actions.lock().unwrap().push(Action::DropRelay(relay_id.to_string()));
        }
        fn notify_joined(&self) {
            self.actions.lock().unwrap().push(Action::Joined);
        }
        fn notify_removed(&self) {
            self.actions.lock().unwrap().push(Action::Removed);
        }
        fn wipe_replicas(&self, present: bool, absent: bool) {
            self.actions.lock().unwrap().push(Action::Wipe(present, absent));
        }
    }

    fn coordinator() -> (NodeStateCoordinator<Arc<Recorder>>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        (NodeStateCoordinator::new(1, recorder.clone()), recorder)
    }

    #[test]
    fn gained_replica_pulls_from_previous_owner() {
        let (coordinator, recorder) = coordinator();

        // Node 2 owned (p0, r0); ownership moves to us
        coordinator.process_deltas(&[ClusterStateDelta::NodeGainedPartitionReplica {
            node_id: 2,
            partition: 0,
            replica: 0,
        }]);
        recorder.actions.lock().unwrap().clear();

        coordinator.process_deltas(&[
            ClusterStateDelta::NodeLostPartitionReplica { node_id: 2, partition: 0, replica: 0 },
            ClusterStateDelta::NodeGainedPartitionReplica { node_id: 1, partition: 0, replica: 0 },
        ]);

        let actions = recorder.actions.lock().unwrap();
        assert_eq!(*actions, vec![Action::Provision(0, vec![2])]);
    }

    #[test]
    fn first_allocation_has_no_sources() {
        let (coordinator, recorder) = coordinator();
        coordinator.process_deltas(&[ClusterStateDelta::NodeGainedPartitionReplica {
            node_id: 1,
            partition: 3,
            replica: 0,
        }]);

        let actions = recorder.actions.lock().unwrap();
        assert_eq!(*actions, vec![Action::Provision(3, vec![])]);
    }

    #[test]
    fn lost_replica_retires_partition() {
        let (coordinator, recorder) = coordinator();
        coordinator.process_deltas(&[
            ClusterStateDelta::NodeLostPartitionReplica { node_id: 1, partition: 7, replica: 0 },
            ClusterStateDelta::NodeGainedPartitionReplica { node_id: 2, partition: 7, replica: 0 },
        ]);

        let actions = recorder.actions.lock().unwrap();
        assert_eq!(*actions, vec![Action::Retire(7)]);
    }

    #[test]
    fn forced_removal_wipes_before_shutdown_notice() {
        let (coordinator, recorder) = coordinator();
        coordinator.process_deltas(&[ClusterStateDelta::NodeRemoved {
            node_id: 1,
            wipe_present_replicas: true,
            wipe_absent_replicas: true,
        }]);

        let actions = recorder.actions.lock().unwrap();
        assert_eq!(*actions, vec![Action::Wipe(true, true), Action::Removed]);
    }

    #[test]
    fn plain_removal_does_not_wipe() {
        let (coordinator, recorder) = coordinator();
        coordinator.process_deltas(&[ClusterStateDelta::NodeRemoved {
            node_id: 1,
            wipe_present_replicas: false,
            wipe_absent_replicas: false,
        }]);

        let actions = recorder.actions.lock().unwrap();
        assert_eq!(*actions, vec![Action::Removed]);
    }

    #[test]
    fn slot_shuffle_within_one_commit_keeps_the_replica() {
        let (coordinator, recorder) = coordinator();

        // We own slot 0; node 2 owns slot 1
        coordinator.process_deltas(&[
            ClusterStateDelta::NodeGainedPartitionReplica { node_id: 1, partition: 0, replica: 0 },
            ClusterStateDelta::NodeGainedPartitionReplica { node_id: 2, partition: 0, replica: 1 },
        ]);
        recorder.actions.lock().unwrap().clear();

        // The commit swaps our slot: lost slot 0, gained slot 1. The
        // partition must not retire
        coordinator.process_deltas(&[
            ClusterStateDelta::NodeLostPartitionReplica { node_id: 1, partition: 0, replica: 0 },
            ClusterStateDelta::NodeLostPartitionReplica { node_id: 2, partition: 0, replica: 1 },
            ClusterStateDelta::NodeGainedPartitionReplica { node_id: 2, partition: 0, replica: 0 },
            ClusterStateDelta::NodeGainedPartitionReplica { node_id: 1, partition: 0, replica: 1 },
        ]);

        let actions = recorder.actions.lock().unwrap();
        assert_eq!(*actions, vec![Action::Provision(0, vec![2])]);
    }

    #[test]
    fn other_nodes_replica_changes_are_ignored_locally() {
        let (coordinator, recorder) = coordinator();
        coordinator.process_deltas(&[
            ClusterStateDelta::NodeGainedPartitionReplica { node_id: 5, partition: 1, replica: 0 },
            ClusterStateDelta::NodeLostPartitionReplica { node_id: 6, partition: 2, replica: 1 },
        ]);
        assert!(recorder.actions.lock().unwrap().is_empty());
    }

    #[test]
    fn membership_and_site_relay_deltas_fan_out() {
        let (coordinator, recorder) = coordinator();
        coordinator.process_deltas(&[
            ClusterStateDelta::NodeAdded { node_id: 1 },
            ClusterStateDelta::SiteAdded { site_id: "s1".into() },
            ClusterStateDelta::RelayAdded { relay_id: "r1".into() },
            ClusterStateDelta::RelayMoved { relay_id: "r1".into(), site_id: Some("s1".into()) },
            ClusterStateDelta::SiteRemoved { site_id: "s1".into() },
            ClusterStateDelta::RelayRemoved { relay_id: "r1".into() },
            ClusterStateDelta::NodeRemoved {
                node_id: 1,
                wipe_present_replicas: false,
                wipe_absent_replicas: false,
            },
        ]);

        let actions = recorder.actions.lock().unwrap();
        assert_eq!(
            *actions,
            vec![
                Action::Joined,
                Action::AddSite("s1".into()),
                Action::SetRelay("r1".into(), None),
                Action::SetRelay("r1".into(), Some("s1".into())),
                Action::RemoveSite("s1".into()),
                Action::DropRelay("r1".into()),
                Action::Removed,
            ]
        );
    }
}
