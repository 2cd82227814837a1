//! Ordered change feed for a bucket.
//!
//! Listeners register a set of byte-prefix ranges and a channel; the
//! monitor delivers matching rows to every listener in strictly increasing
//! `local_version` order, buffering out-of-order arrivals until the gap
//! fills.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tidepool_model::Row;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Listener {
    id: u64,
    mins: Vec<Vec<u8>>,
    maxs: Vec<Vec<u8>>,
    tx: mpsc::UnboundedSender<Row>,
}

impl Listener {
    fn matches(&self, key: &[u8]) -> bool {
        if self.mins.is_empty() && self.maxs.is_empty() {
            return true;
        }

        let ranges = self.mins.len().max(self.maxs.len());
        for i in 0..ranges {
            let lo_ok = match self.mins.get(i) {
                Some(min) => key >= min.as_slice(),
                None => true,
            };
            let hi_ok = match self.maxs.get(i) {
                Some(max) => key <= max.as_slice() || key.starts_with(max),
                None => true,
            };
            if lo_ok && hi_ok {
                return true;
            }
        }
        false
    }
}

struct MonitorState {
    last_delivered: u64,
    buffer: BTreeMap<u64, Row>,
    listeners: Vec<Listener>,
    next_listener_id: u64,
}

/// Per-bucket update monitor.
///
/// Ordering rules:
/// - versions ≤ `last_delivered` (and > 0) are discarded
/// - version 0 rows are delivered only while nothing versioned has been
///   delivered yet, and do not advance the cursor
/// - a version gap buffers rows until the missing version arrives, then the
///   whole run drains in order
#[derive(Clone)]
pub struct Monitor {
    state: Arc<Mutex<MonitorState>>,
}

impl Monitor {
    pub fn new(last_delivered: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(MonitorState {
                last_delivered,
                buffer: BTreeMap::new(),
                listeners: Vec::new(),
                next_listener_id: 0,
            })),
        }
    }

    /// Register a listener. The channel closes (sender dropped) when
    /// `cancel` fires and the listener is removed.
    pub fn add_listener(
        &self,
        cancel: CancellationToken,
        mins: Vec<Vec<u8>>,
        maxs: Vec<Vec<u8>>,
        tx: mpsc::UnboundedSender<Row>,
    ) {
        let id = {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(_) => return,
            };
            let id = state.next_listener_id;
            state.next_listener_id += 1;
            state.listeners.push(Listener { id, mins, maxs, tx });
            id
        };

        let state = self.state.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            if let Ok(mut state) = state.lock() {
                state.listeners.retain(|l| l.id != id);
            }
        });
    }

    /// Submit an update to the feed.
    pub fn notify(&self, row: Row) {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(_) => return,
        };

        if row.local_version == 0 {
            if state.last_delivered == 0 {
                Self::deliver(&mut state, row);
            }
            return;
        }

        if row.local_version <= state.last_delivered {
            return;
        }

        state.buffer.insert(row.local_version, row);
        Self::drain(&mut state);
    }

    /// Advance the cursor past versions that will never arrive (e.g. after
    /// keys were forgotten), draining anything buffered at or below.
    pub fn discard_up_to(&self, version: u64) {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(_) => return,
        };
        if version > state.last_delivered {
            state.last_delivered = version;
            state.buffer.retain(|v, _| *v > version);
            Self::drain(&mut state);
        }
    }

    fn drain(state: &mut MonitorState) {
        loop {
            let next = state.last_delivered + 1;
            match state.buffer.remove(&next) {
                Some(row) => {
                    state.last_delivered = next;
                    Self::deliver(state, row);
                }
                None => break,
            }
        }
    }

    fn deliver(state: &mut MonitorState, row: Row) {
        let key = row.key.as_bytes().to_vec();
        state
            .listeners
            .retain(|l| !l.matches(&key) || l.tx.send(row.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidepool_model::SiblingSet;

    fn row(key: &str, version: u64) -> Row {
        Row {
            key: key.to_string(),
            local_version: version,
            siblings: SiblingSet::new(),
        }
    }

    fn listener(monitor: &Monitor) -> (CancellationToken, mpsc::UnboundedReceiver<Row>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        monitor.add_listener(cancel.clone(), vec![], vec![b"a".to_vec()], tx);
        (cancel, rx)
    }

    fn drain_versions(rx: &mut mpsc::UnboundedReceiver<Row>) -> Vec<u64> {
        let mut got = Vec::new();
        while let Ok(row) = rx.try_recv() {
            got.push(row.local_version);
        }
        got
    }

    #[tokio::test]
    async fn version_zero_delivered_only_before_first_delivery() {
        let monitor = Monitor::new(0);
        let (_cancel, mut rx) = listener(&monitor);

        monitor.notify(row("abc", 0));
        assert_eq!(drain_versions(&mut rx), vec![0]);

        monitor.notify(row("abc", 1));
        assert_eq!(drain_versions(&mut rx), vec![1]);

        monitor.notify(row("abc", 0));
        assert_eq!(drain_versions(&mut rx), Vec::<u64>::new());
    }

    #[tokio::test]
    async fn stale_versions_discarded() {
        let monitor = Monitor::new(3);
        let (_cancel, mut rx) = listener(&monitor);

        monitor.notify(row("abc", 1));
        monitor.notify(row("abc", 3));
        assert_eq!(drain_versions(&mut rx), Vec::<u64>::new());

        monitor.notify(row("abc", 4));
        assert_eq!(drain_versions(&mut rx), vec![4]);
    }

    #[tokio::test]
    async fn gap_buffers_until_filled() {
        // The decommission-era scenario: last=3; 5,6,8 buffer; 4 releases
        // 4,5,6; 7 releases 7,8.
        let monitor = Monitor::new(3);
        let (_cancel, mut rx) = listener(&monitor);

        monitor.notify(row("abcdef", 5));
        monitor.notify(row("abcdg", 6));
        monitor.notify(row("abcd", 8));
        assert_eq!(drain_versions(&mut rx), Vec::<u64>::new());

        monitor.notify(row("abc", 4));
        assert_eq!(drain_versions(&mut rx), vec![4, 5, 6]);

        monitor.notify(row("aaaa", 7));
        assert_eq!(drain_versions(&mut rx), vec![7, 8]);
    }

    #[tokio::test]
    async fn cancellation_closes_channel() {
        let monitor = Monitor::new(0);
        let (cancel, mut rx) = listener(&monitor);

        cancel.cancel();
        // The watcher task removes the listener, dropping its sender
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            loop {
                if rx.recv().await.is_none() {
                    break;
                }
            }
        })
        .await
        .expect("channel should close after cancellation");
    }

    #[tokio::test]
    async fn prefix_ranges_filter_keys() {
        let monitor = Monitor::new(0);
        let (tx, mut rx) = mpsc::unbounded_channel();
        monitor.add_listener(
            CancellationToken::new(),
            vec![b"m".to_vec()],
            vec![b"p".to_vec()],
            tx,
        );

        monitor.notify(row("apple", 1));
        monitor.notify(row("night", 2));
        monitor.notify(row("zebra", 3));

        let keys: Vec<String> = {
            let mut out = Vec::new();
            while let Ok(r) = rx.try_recv() {
                out.push(r.key);
            }
            out
        };
        assert_eq!(keys, vec!["night".to_string()]);
    }

    #[tokio::test]
    async fn discard_up_to_skips_missing_versions() {
        let monitor = Monitor::new(0);
        let (_cancel, mut rx) = listener(&monitor);

        monitor.notify(row("abc", 3));
        assert_eq!(drain_versions(&mut rx), Vec::<u64>::new());

        monitor.discard_up_to(2);
        assert_eq!(drain_versions(&mut rx), vec![3]);
    }
}
