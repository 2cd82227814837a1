//! The partition transfer agent.
//!
//! Destinations pull: when a node gains a replica it downloads the stream
//! from a node that held the partition before the ownership change, merges
//! it, and acknowledges. Sources hold the write-locked partition until the
//! acknowledgment arrives, then drop it. The agent tracks every replica
//! this node materialized; the set draining to empty is the decommission
//! gate.

use crate::frame::{apply_frames, snapshot_partition, TransferFrame};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tidepool_core::{PartitionPool, ReplicaState};
use tidepool_model::{error, DbError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(32);

/// Inter-node calls the agent needs; implemented over the node's client.
#[async_trait]
pub trait TransferClient: Send + Sync {
    /// Pull a partition's full framed content from `from`.
    async fn download_partition(
        &self,
        from: u64,
        partition: u64,
    ) -> Result<Vec<TransferFrame>, DbError>;

    /// Tell `to` its outgoing stream for `partition` was fully merged.
    async fn ack_partition_transfer(&self, to: u64, partition: u64) -> Result<(), DbError>;
}

struct AgentState {
    incoming: HashMap<u64, CancellationToken>,
    outgoing: HashSet<u64>,
    held: HashSet<u64>,
    /// Acks that arrived before this node processed its ownership loss.
    /// Consumed when the partition is marked outgoing.
    acked: HashSet<u64>,
}

/// Invoked on the source once a transfer is confirmed; the owner drops the
/// partition and wipes its storage.
pub type OutgoingCompleteFn = Box<dyn Fn(u64) + Send + Sync>;

pub struct TransferAgent {
    local_id: u64,
    partitions: Arc<PartitionPool>,
    client: Arc<dyn TransferClient>,
    state: Arc<Mutex<AgentState>>,
    held_tx: watch::Sender<usize>,
    on_outgoing_complete: Mutex<Option<OutgoingCompleteFn>>,
}

impl TransferAgent {
    pub fn new(
        local_id: u64,
        partitions: Arc<PartitionPool>,
        client: Arc<dyn TransferClient>,
    ) -> Self {
        let (held_tx, _) = watch::channel(0usize);
        Self {
            local_id,
            partitions,
            client,
            state: Arc::new(Mutex::new(AgentState {
                incoming: HashMap::new(),
                outgoing: HashSet::new(),
                held: HashSet::new(),
                acked: HashSet::new(),
            })),
            held_tx,
            on_outgoing_complete: Mutex::new(None),
        }
    }

    pub fn on_outgoing_complete(&self, callback: OutgoingCompleteFn) {
        if let Ok(mut slot) = self.on_outgoing_complete.lock() {
            *slot = Some(callback);
        }
    }

    // --- held-replica tracking ---

    pub fn hold(&self, partition: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.held.insert(partition);
            let _ = self.held_tx.send(state.held.len());
        }
    }

    pub fn release_held(&self, partition: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.held.remove(&partition);
            let _ = self.held_tx.send(state.held.len());
        }
    }

    pub fn held_count(&self) -> usize {
        self.state.lock().map(|s| s.held.len()).unwrap_or(0)
    }

    pub fn held_partitions(&self) -> Vec<u64> {
        let mut held: Vec<u64> = self
            .state
            .lock()
            .map(|s| s.held.iter().copied().collect())
            .unwrap_or_default();
        held.sort_unstable();
        held
    }

    /// Resolve when every held replica has been confirmed transferred away
    /// (or was never populated). Cancellable.
    pub async fn wait_empty(&self, cancel: &CancellationToken) -> Result<(), DbError> {
        let mut rx = self.held_tx.subscribe();
        loop {
            if *rx.borrow() == 0 {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(error::E_CANCELLED),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(error::E_STOPPED);
                    }
                }
            }
        }
    }

    // --- incoming ---

    /// Start pulling a gained replica from the nodes that held it before
    /// the ownership change. An empty source list means the partition was
    /// never populated anywhere; it starts fresh.
    pub fn start_incoming(&self, partition: u64, sources: Vec<u64>) {
        let sources: Vec<u64> = sources.into_iter().filter(|s| *s != self.local_id).collect();
        if sources.is_empty() {
            return;
        }

        let cancel = CancellationToken::new();
        {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(_) => return,
            };
            if let Some(previous) = state.incoming.insert(partition, cancel.clone()) {
                previous.cancel();
            }
        }

        let client = self.client.clone();
        let partitions = self.partitions.clone();
        let state = self.state.clone();
        let local_id = self.local_id;

        tokio::spawn(async move {
            let mut backoff = RETRY_BASE;
            'retry: loop {
                for source in &sources {
                    if cancel.is_cancelled() {
                        break 'retry;
                    }

                    match client.download_partition(*source, partition).await {
                        Ok(frames) => {
                            let target = match partitions.get(partition) {
                                Some(target) => target,
                                None => break 'retry,
                            };
                            match apply_frames(&target, &frames) {
                                Ok(rows) => {
                                    tracing::info!(
                                        node = local_id,
                                        partition,
                                        from = source,
                                        rows,
                                        "incoming partition transfer complete"
                                    );
                                    // Every previous owner may be waiting to
                                    // drain this replica, not just the one we
                                    // happened to pull from
                                    for previous in &sources {
                                        if let Err(e) = client
                                            .ack_partition_transfer(*previous, partition)
                                            .await
                                        {
                                            tracing::debug!(partition, to = previous, error = %e, "transfer ack failed");
                                        }
                                    }
                                    break 'retry;
                                }
                                Err(e) => {
                                    tracing::warn!(partition, from = source, error = %e, "bad transfer stream");
                                }
                            }
                        }
                        Err(e) => {
                            tracing::debug!(partition, from = source, error = %e, "transfer source unavailable");
                        }
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => break 'retry,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(RETRY_CAP);
            }

            if let Ok(mut state) = state.lock() {
                state.incoming.remove(&partition);
            }
        });
    }

    pub fn stop_incoming(&self, partition: u64) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(cancel) = state.incoming.remove(&partition) {
                cancel.cancel();
            }
        }
    }

    // --- outgoing ---

    /// Mark a lost replica as draining: writes lock and the partition
    /// stays until the new owner acknowledges its pull. At most one
    /// outgoing transfer exists per partition. An ack that raced ahead of
    /// the ownership change completes the drain immediately.
    pub fn enable_outgoing(&self, partition: u64) {
        let (newly, already_acked) = match self.state.lock() {
            Ok(mut state) => {
                let already_acked = state.acked.remove(&partition);
                let newly = !already_acked && state.outgoing.insert(partition);
                (newly, already_acked)
            }
            Err(_) => return,
        };

        if already_acked {
            self.complete_outgoing(partition);
            return;
        }
        if !newly {
            return;
        }
        if let Some(held) = self.partitions.get(partition) {
            held.lock_writes();
            held.set_state(ReplicaState::LockedForOutgoing);
        }
    }

    /// Ownership came back before the handoff finished: keep the replica.
    pub fn cancel_outgoing(&self, partition: u64) {
        let was_draining = match self.state.lock() {
            Ok(mut state) => {
                state.acked.remove(&partition);
                state.outgoing.remove(&partition)
            }
            Err(_) => return,
        };
        if was_draining {
            if let Some(held) = self.partitions.get(partition) {
                held.unlock_writes();
                held.set_state(ReplicaState::Holding);
            }
        }
    }

    /// Serve the framed snapshot of a locally held partition. Writes are
    /// locked for the scan; a partition this node still owns unlocks after.
    pub fn serve_outgoing(&self, partition: u64) -> Result<Vec<TransferFrame>, DbError> {
        let held = self.partitions.get(partition).ok_or(error::E_NO_SUCH_PARTITION)?;
        let draining = self
            .state
            .lock()
            .map(|s| s.outgoing.contains(&partition))
            .unwrap_or(false);

        held.lock_writes();
        let frames = snapshot_partition(&held);
        if !draining {
            held.unlock_writes();
        }
        frames
    }

    /// Destination acknowledged. Drops the drained partition, or records
    /// the ack for a loss this node has not processed yet. Acks for
    /// partitions this node still rightfully holds (a co-owner served the
    /// pull) are consumed when — and only if — ownership is lost.
    pub fn confirm_outgoing(&self, partition: u64) {
        let was_draining = match self.state.lock() {
            Ok(mut state) => {
                let was_draining = state.outgoing.remove(&partition);
                if !was_draining && state.held.contains(&partition) {
                    state.acked.insert(partition);
                }
                was_draining
            }
            Err(_) => return,
        };
        if was_draining {
            self.complete_outgoing(partition);
        }
    }

    fn complete_outgoing(&self, partition: u64) {
        if let Some(held) = self.partitions.get(partition) {
            held.set_state(ReplicaState::Retiring);
        }
        tracing::info!(node = self.local_id, partition, "outgoing partition transfer confirmed");

        let callback = self.on_outgoing_complete.lock().ok();
        if let Some(slot) = callback {
            if let Some(callback) = slot.as_ref() {
                callback(partition);
            }
        }
        self.release_held(partition);
    }

    /// Abandon everything in flight (decommission entry, shutdown).
    pub fn stop_all_transfers(&self) {
        if let Ok(mut state) = self.state.lock() {
            for (_, cancel) in state.incoming.drain() {
                cancel.cancel();
            }
        }
    }
}
