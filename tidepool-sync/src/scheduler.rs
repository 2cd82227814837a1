//! Round-robin sync scheduling across `(peer, bucket)` pairs.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::MIN_SYNC_PERIOD_MS;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncJob {
    pub peer_id: String,
    pub bucket: String,
}

struct SchedulerState {
    queue: VecDeque<(SyncJob, Instant)>,
    scheduled: HashSet<SyncJob>,
}

/// Hands out due jobs one at a time; a finished (or deferred) job goes to
/// the back of the rotation, one period out.
pub struct MultiSyncScheduler {
    period: Duration,
    state: Mutex<SchedulerState>,
    notify: Notify,
}

impl MultiSyncScheduler {
    pub fn new(period: Duration) -> Self {
        let floor = Duration::from_millis(MIN_SYNC_PERIOD_MS);
        Self {
            period: period.max(floor),
            state: Mutex::new(SchedulerState {
                queue: VecDeque::new(),
                scheduled: HashSet::new(),
            }),
            notify: Notify::new(),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Add a job to the rotation, due immediately. No-op if present.
    pub fn schedule(&self, job: SyncJob) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        if state.scheduled.insert(job.clone()) {
            state.queue.push_back((job, Instant::now()));
            self.notify.notify_one();
        }
    }

    /// Put a job back into the rotation, due one period from now.
    pub fn defer(&self, job: SyncJob) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        if state.scheduled.contains(&job) && !state.queue.iter().any(|(j, _)| *j == job) {
            let due = Instant::now() + self.period;
            state.queue.push_back((job, due));
            self.notify.notify_one();
        }
    }

    /// Drop every job for a peer.
    pub fn unschedule_peer(&self, peer_id: &str) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        state.scheduled.retain(|job| job.peer_id != peer_id);
        state.queue.retain(|(job, _)| job.peer_id != peer_id);
    }

    /// The next due job, waiting as long as it takes. `None` once cancelled.
    pub async fn next(&self, cancel: &CancellationToken) -> Option<SyncJob> {
        loop {
            let wait = {
                let mut state = self.state.lock().ok()?;
                let now = Instant::now();

                let due = state
                    .queue
                    .iter()
                    .position(|(_, due)| *due <= now);
                match due {
                    Some(index) => {
                        let (job, _) = state.queue.remove(index)?;
                        return Some(job);
                    }
                    None => state
                        .queue
                        .iter()
                        .map(|(_, due)| due.saturating_duration_since(now))
                        .min(),
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(wait.unwrap_or(Duration::from_secs(3600))) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(peer: &str, bucket: &str) -> SyncJob {
        SyncJob { peer_id: peer.to_string(), bucket: bucket.to_string() }
    }

    #[test]
    fn period_is_clamped() {
        let scheduler = MultiSyncScheduler::new(Duration::from_millis(10));
        assert_eq!(scheduler.period(), Duration::from_millis(MIN_SYNC_PERIOD_MS));
    }

    #[tokio::test]
    async fn jobs_rotate_round_robin() {
        let scheduler = MultiSyncScheduler::new(Duration::from_secs(1));
        let cancel = CancellationToken::new();

        scheduler.schedule(job("r1", "default"));
        scheduler.schedule(job("r1", "lww"));
        scheduler.schedule(job("r2", "default"));

        let first = scheduler.next(&cancel).await.unwrap();
        let second = scheduler.next(&cancel).await.unwrap();
        let third = scheduler.next(&cancel).await.unwrap();
        assert_eq!(first, job("r1", "default"));
        assert_eq!(second, job("r1", "lww"));
        assert_eq!(third, job("r2", "default"));
    }

    #[tokio::test]
    async fn duplicate_schedule_is_ignored() {
        let scheduler = MultiSyncScheduler::new(Duration::from_secs(1));
        let cancel = CancellationToken::new();

        scheduler.schedule(job("r1", "default"));
        scheduler.schedule(job("r1", "default"));

        assert!(scheduler.next(&cancel).await.is_some());
        // Nothing else queued: next() must block until cancelled
        let waiter = scheduler.next(&cancel);
        tokio::pin!(waiter);
        tokio::select! {
            _ = &mut waiter => panic!("queue should be empty"),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
    }

    #[tokio::test]
    async fn unschedule_peer_removes_jobs() {
        let scheduler = MultiSyncScheduler::new(Duration::from_secs(1));
        let cancel = CancellationToken::new();

        scheduler.schedule(job("r1", "default"));
        scheduler.schedule(job("r2", "default"));
        scheduler.unschedule_peer("r1");

        assert_eq!(scheduler.next(&cancel).await.unwrap(), job("r2", "default"));
        cancel.cancel();
        assert!(scheduler.next(&cancel).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_jobs_come_back_after_a_period() {
        let scheduler = MultiSyncScheduler::new(Duration::from_secs(1));
        let cancel = CancellationToken::new();

        scheduler.schedule(job("r1", "default"));
        let taken = scheduler.next(&cancel).await.unwrap();
        scheduler.defer(taken);

        // Not due yet
        let waiter = scheduler.next(&cancel);
        tokio::pin!(waiter);
        tokio::select! {
            _ = &mut waiter => panic!("job should not be due yet"),
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(scheduler.next(&cancel).await.unwrap(), job("r1", "default"));
    }
}
