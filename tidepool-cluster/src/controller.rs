//! Deterministic cluster configuration state machine.
//!
//! `apply` is a pure function of `(state, command)`: identical command
//! sequences produce identical states and identical delta lists on every
//! node, which is what lets the configuration ride on raft.

use crate::command::ClusterCommand;
use crate::delta::{diff, ClusterStateDelta};
use crate::state::{ClusterState, NodeConfig};
use std::collections::BTreeMap;
use tidepool_model::{error, DbError};

/// Hash a site id onto the partition ring.
pub fn site_partition(site_id: &str, partitions: u64) -> u64 {
    let digest = blake3::hash(site_id.as_bytes());
    let position = u64::from_be_bytes(digest.as_bytes()[..8].try_into().unwrap_or([0u8; 8]));
    position % partitions.max(1)
}

#[derive(Debug, Clone, Default)]
pub struct ClusterController {
    pub state: ClusterState,
    pub local_node_id: u64,
}

impl ClusterController {
    pub fn new(local_node_id: u64) -> Self {
        Self {
            state: ClusterState::default(),
            local_node_id,
        }
    }

    pub fn with_state(local_node_id: u64, state: ClusterState) -> Self {
        Self { state, local_node_id }
    }

    /// Apply one command, returning the minimal delta set. The state is
    /// untouched when the command is rejected.
    pub fn apply(&mut self, command: &ClusterCommand) -> Result<Vec<ClusterStateDelta>, DbError> {
        let mut next = self.state.clone();
        Self::apply_to(&mut next, command)?;
        let mut deltas = diff(&self.state, &next);
        Self::stamp_wipe_flags(&mut deltas, command);
        self.state = next;
        Ok(deltas)
    }

    /// Wipe intent rides the removal command, not the state, so the diff
    /// cannot produce it: copy it onto the matching removal delta.
    fn stamp_wipe_flags(deltas: &mut [ClusterStateDelta], command: &ClusterCommand) {
        let ClusterCommand::RemoveNode {
            node_id,
            wipe_present_replicas,
            wipe_absent_replicas,
            ..
        } = command
        else {
            return;
        };
        if !*wipe_present_replicas && !*wipe_absent_replicas {
            return;
        }

        for delta in deltas.iter_mut() {
            if let ClusterStateDelta::NodeRemoved {
                node_id: removed,
                wipe_present_replicas: present,
                wipe_absent_replicas: absent,
            } = delta
            {
                if *removed == *node_id {
                    *present = *wipe_present_replicas;
                    *absent = *wipe_absent_replicas;
                }
            }
        }
    }

    /// Replace the whole state (snapshot install), returning the deltas
    /// between old and new.
    pub fn install(&mut self, state: ClusterState) -> Vec<ClusterStateDelta> {
        let deltas = diff(&self.state, &state);
        self.state = state;
        deltas
    }

    fn apply_to(state: &mut ClusterState, command: &ClusterCommand) -> Result<(), DbError> {
        let mut rebalance = true;
        match command {
            ClusterCommand::SetReplicationFactor { replication_factor } => {
                if state.tokens_allocated() {
                    return Err(error::E_INVALID_OP);
                }
                if *replication_factor == 0 {
                    return Err(error::E_INVALID_OP);
                }
                state.settings.replication_factor = *replication_factor;
            }
            ClusterCommand::SetPartitionCount { partitions } => {
                if state.tokens_allocated() {
                    return Err(error::E_INVALID_OP);
                }
                if *partitions == 0 || !partitions.is_power_of_two() {
                    return Err(error::E_INVALID_OP);
                }
                state.settings.partitions = *partitions;
            }
            ClusterCommand::AddNode { node_config } => {
                let node_id = node_config.address.node_id;
                if node_id == 0 {
                    return Err(error::E_INVALID_PEER);
                }
                if state.nodes.contains_key(&node_id) || state.removed_node_ids.contains(&node_id) {
                    return Err(error::E_DUPLICATE_NODE_ID);
                }
                state.nodes.insert(node_id, node_config.clone());
            }
            ClusterCommand::RemoveNode { node_id, replacement_node_id, .. } => {
                if !state.nodes.contains_key(node_id) {
                    return Err(error::E_INVALID_PEER);
                }
                if let Some(replacement) = replacement_node_id {
                    if *replacement == *node_id || !state.nodes.contains_key(replacement) {
                        return Err(error::E_INVALID_PEER);
                    }
                    // Tokens transfer atomically to the replacement; no
                    // quota rebalance on this command
                    for owner in state.tokens.iter_mut() {
                        if *owner == *node_id {
                            *owner = *replacement;
                        }
                    }
                    rebalance = false;
                }
                state.nodes.remove(node_id);
                state.removed_node_ids.insert(*node_id);
            }
            ClusterCommand::UpdateNode { node_id, node_config } => {
                if node_config.address.node_id != *node_id {
                    return Err(error::E_INVALID_PEER);
                }
                match state.nodes.get_mut(node_id) {
                    Some(existing) => *existing = node_config.clone(),
                    None => return Err(error::E_INVALID_PEER),
                }
            }
            ClusterCommand::AddSite { site_id } => {
                if site_id.is_empty() {
                    return Err(error::E_EMPTY);
                }
                state.sites.insert(site_id.clone());
            }
            ClusterCommand::RemoveSite { site_id } => {
                state.sites.remove(site_id);
                // Relays must reference only existing sites
                for bound in state.relays.values_mut() {
                    if bound.as_deref() == Some(site_id.as_str()) {
                        *bound = None;
                    }
                }
            }
            ClusterCommand::AddRelay { relay_id } => {
                if relay_id.is_empty() {
                    return Err(error::E_EMPTY);
                }
                state.relays.entry(relay_id.clone()).or_insert(None);
            }
            ClusterCommand::RemoveRelay { relay_id } => {
                state.relays.remove(relay_id);
            }
            ClusterCommand::MoveRelay { relay_id, site_id } => {
                if !state.relays.contains_key(relay_id) {
                    return Err(error::E_INVALID_PEER);
                }
                if let Some(site) = site_id {
                    if !state.sites.contains(site) {
                        return Err(error::E_NO_SUCH_SITE);
                    }
                }
                state.relays.insert(relay_id.clone(), site_id.clone());
            }
        }

        if rebalance {
            Self::place(state);
        } else if state.settings.initialized() {
            Self::compute_owners(state);
        }
        Ok(())
    }

    /// Recompute token assignment and partition owners. Deterministic and
    /// stable: tokens stay with a live owner that is still within quota.
    fn place(state: &mut ClusterState) {
        if !state.settings.initialized() {
            return;
        }

        let partitions = state.settings.partitions as usize;
        state.tokens.resize(partitions, 0);

        let live: Vec<(u64, u64)> = state
            .nodes
            .iter()
            .filter(|(_, config)| config.capacity > 0)
            .map(|(id, config)| (*id, config.capacity))
            .collect();

        if live.is_empty() {
            state.tokens = vec![0; partitions];
            state.partition_owners = vec![Vec::new(); partitions];
            return;
        }

        let targets = Self::quotas(&live, partitions as u64);

        // Keep stable assignments within quota, free the rest
        let mut kept: BTreeMap<u64, u64> = BTreeMap::new();
        let mut free: Vec<usize> = Vec::new();
        for token in 0..partitions {
            let owner = state.tokens[token];
            let target = targets.get(&owner).copied().unwrap_or(0);
            let count = kept.entry(owner).or_insert(0);
            if owner != 0 && *count < target {
                *count += 1;
            } else {
                free.push(token);
            }
        }

        // Hand freed tokens to under-quota nodes in ascending id order
        let mut need: Vec<(u64, u64)> = targets
            .iter()
            .map(|(id, target)| {
                let have = kept.get(id).copied().unwrap_or(0);
                (*id, target.saturating_sub(have))
            })
            .filter(|(_, n)| *n > 0)
            .collect();

        let mut need_index = 0;
        for token in free {
            while need_index < need.len() && need[need_index].1 == 0 {
                need_index += 1;
            }
            match need.get_mut(need_index) {
                Some((id, n)) => {
                    state.tokens[token] = *id;
                    *n -= 1;
                }
                None => state.tokens[token] = 0,
            }
        }

        Self::compute_owners(state);
    }

    /// Capacity-proportional token quotas by largest remainder, ties broken
    /// by node id.
    fn quotas(live: &[(u64, u64)], partitions: u64) -> BTreeMap<u64, u64> {
        let total: u64 = live.iter().map(|(_, capacity)| *capacity).sum();
        let mut quotas: BTreeMap<u64, u64> = BTreeMap::new();
        let mut remainders: Vec<(u128, u64)> = Vec::new();
        let mut assigned = 0u64;

        for (id, capacity) in live {
            let exact = (partitions as u128) * (*capacity as u128);
            let quota = (exact / total as u128) as u64;
            let remainder = exact % total as u128;
            quotas.insert(*id, quota);
            assigned += quota;
            remainders.push((remainder, *id));
        }

        // Largest remainder first; ties by ascending node id
        remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        let mut index = 0;
        while assigned < partitions {
            let (_, id) = remainders[index % remainders.len()];
            *quotas.entry(id).or_insert(0) += 1;
            assigned += 1;
            index += 1;
        }

        quotas
    }

    /// Owners for partition `p`: walk the token ring clockwise from `p`,
    /// collecting the first `RF` distinct owners.
    fn compute_owners(state: &mut ClusterState) {
        let partitions = state.tokens.len();
        let rf = state.settings.replication_factor as usize;
        let mut owners = Vec::with_capacity(partitions);

        for p in 0..partitions {
            let mut slots: Vec<u64> = Vec::with_capacity(rf);
            for step in 0..partitions {
                let owner = state.tokens[(p + step) % partitions];
                if owner != 0 && !slots.contains(&owner) {
                    slots.push(owner);
                    if slots.len() == rf {
                        break;
                    }
                }
            }
            owners.push(slots);
        }

        state.partition_owners = owners;
    }

    // --- Local-node views used by the coordinator and I/O paths ---

    pub fn local_node_is_in_cluster(&self) -> bool {
        self.state.nodes.contains_key(&self.local_node_id)
    }

    pub fn local_node_was_removed(&self) -> bool {
        self.state.removed_node_ids.contains(&self.local_node_id)
    }

    pub fn local_node_config(&self) -> Option<&NodeConfig> {
        self.state.nodes.get(&self.local_node_id)
    }

    pub fn local_node_holds_partition(&self, partition: u64) -> bool {
        self.state.owners(partition).contains(&self.local_node_id)
    }

    /// `(partition, replica-slot)` pairs the local node currently owns.
    pub fn local_partition_replicas(&self) -> Vec<(u64, u64)> {
        let mut held = Vec::new();
        for (partition, owners) in self.state.partition_owners.iter().enumerate() {
            for (replica, owner) in owners.iter().enumerate() {
                if *owner == self.local_node_id {
                    held.push((partition as u64, replica as u64));
                }
            }
        }
        held
    }

    pub fn partition_of_site(&self, site_id: &str) -> u64 {
        site_partition(site_id, self.state.settings.partitions)
    }

    pub fn partition_owners(&self, partition: u64) -> Vec<u64> {
        self.state.owners(partition).to_vec()
    }

    pub fn relay_site(&self, relay_id: &str) -> Option<String> {
        self.state.relays.get(relay_id).cloned().flatten()
    }

    pub fn member_address(&self, node_id: u64) -> Option<crate::state::PeerAddress> {
        self.state.nodes.get(&node_id).map(|config| config.address.clone())
    }

    pub fn member_ids(&self) -> Vec<u64> {
        self.state.nodes.keys().copied().collect()
    }
}
