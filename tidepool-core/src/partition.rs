//! Partitions: in-memory handles over one shard of sites.

use crate::site::SitePool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Where a locally held replica is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    /// Owned and serving reads and writes.
    Holding,
    /// Ownership lost; writes locked while the outgoing transfer drains.
    LockedForOutgoing,
    /// Transfer acknowledged; awaiting teardown.
    Retiring,
}

/// A locally materialized partition replica.
///
/// The write gate is advisory: cluster writes check it and fail with a
/// routing miss while a handoff holds it, which sends the writer to another
/// owner.
pub struct Partition {
    number: u64,
    sites: Arc<dyn SitePool>,
    write_locked: AtomicBool,
    state: Mutex<ReplicaState>,
}

impl Partition {
    pub fn new(number: u64, sites: Arc<dyn SitePool>) -> Self {
        Self {
            number,
            sites,
            write_locked: AtomicBool::new(false),
            state: Mutex::new(ReplicaState::Holding),
        }
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn sites(&self) -> &Arc<dyn SitePool> {
        &self.sites
    }

    pub fn lock_writes(&self) {
        self.write_locked.store(true, Ordering::SeqCst);
    }

    pub fn unlock_writes(&self) {
        self.write_locked.store(false, Ordering::SeqCst);
    }

    pub fn writes_locked(&self) -> bool {
        self.write_locked.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ReplicaState {
        self.state.lock().map(|s| *s).unwrap_or(ReplicaState::Holding)
    }

    pub fn set_state(&self, state: ReplicaState) {
        if let Ok(mut s) = self.state.lock() {
            *s = state;
        }
    }
}

/// All partitions this node currently materializes, by number.
#[derive(Default)]
pub struct PartitionPool {
    partitions: RwLock<HashMap<u64, Arc<Partition>>>,
}

impl PartitionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, partition: Arc<Partition>) {
        if let Ok(mut partitions) = self.partitions.write() {
            partitions.insert(partition.number(), partition);
        }
    }

    pub fn remove(&self, number: u64) -> Option<Arc<Partition>> {
        self.partitions.write().ok()?.remove(&number)
    }

    pub fn get(&self, number: u64) -> Option<Arc<Partition>> {
        self.partitions.read().ok()?.get(&number).cloned()
    }

    pub fn numbers(&self) -> Vec<u64> {
        let mut numbers: Vec<u64> = self
            .partitions
            .read()
            .map(|p| p.keys().copied().collect())
            .unwrap_or_default();
        numbers.sort_unstable();
        numbers
    }

    pub fn len(&self) -> usize {
        self.partitions.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::{CloudSitePool, SiteFactory};
    use tidepool_storage::MemoryStorageDriver;

    fn partition(number: u64) -> Arc<Partition> {
        let storage = Arc::new(MemoryStorageDriver::new());
        let pool = CloudSitePool::new(SiteFactory::new(storage, 4, "node-a"));
        Arc::new(Partition::new(number, Arc::new(pool)))
    }

    #[test]
    fn write_gate_toggles() {
        let p = partition(3);
        assert!(!p.writes_locked());
        p.lock_writes();
        assert!(p.writes_locked());
        p.unlock_writes();
        assert!(!p.writes_locked());
    }

    #[test]
    fn pool_tracks_partitions_by_number() {
        let pool = PartitionPool::new();
        pool.add(partition(0));
        pool.add(partition(5));

        assert_eq!(pool.numbers(), vec![0, 5]);
        assert!(pool.get(5).is_some());
        assert!(pool.get(1).is_none());

        pool.remove(5);
        assert_eq!(pool.len(), 1);
    }
}
