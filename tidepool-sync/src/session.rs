//! One anti-entropy session: a top-down Merkle walk between an initiator
//! (writable local view) and a responder (peer view).
//!
//! Starting at the root, equal hashes close a subtree; unequal hashes
//! descend until a leaf, whose keys are fetched from the responder and
//! merged into the initiator. The walk fetches at most `path_limit` leaves
//! per session; remaining divergence waits for the next scheduled session,
//! which keeps sessions short and fair across buckets.

use crate::proxy::BucketProxy;
use std::collections::HashMap;
use tidepool_model::{DbError, SiblingSet};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub leaves_fetched: u32,
    pub keys_merged: u64,
    /// False when the path limit cut the walk short.
    pub completed: bool,
}

pub struct SyncSession {
    path_limit: u32,
}

impl SyncSession {
    pub fn new(path_limit: u32) -> Self {
        Self { path_limit: path_limit.max(1) }
    }

    pub async fn run(
        &self,
        initiator: &dyn BucketProxy,
        responder: &dyn BucketProxy,
    ) -> Result<SyncOutcome, DbError> {
        let local_depth = initiator.merkle_depth().await?;
        let remote_depth = responder.merkle_depth().await?;

        // Heap node ids address the same hash-space slice in both trees, so
        // the walk descends only while a node is internal to BOTH; at the
        // shallower tree's leaf level, fetch the whole remaining subtree.
        let min_depth = local_depth.min(remote_depth);
        let first_fetch_level = 1u32 << (min_depth.saturating_sub(1) as u32);

        let mut outcome = SyncOutcome::default();
        let mut stack: Vec<u32> = vec![1];

        while let Some(node) = stack.pop() {
            let local_hash = initiator.node_hash(node).await?;
            let remote_hash = responder.node_hash(node).await?;
            if local_hash == remote_hash {
                continue;
            }

            if node < first_fetch_level {
                stack.push(node * 2 + 1);
                stack.push(node * 2);
                continue;
            }

            if outcome.leaves_fetched >= self.path_limit {
                tracing::debug!(
                    bucket = initiator.name(),
                    limit = self.path_limit,
                    "sync session hit path limit"
                );
                return Ok(outcome);
            }

            let rows = responder.get_sync_children(node).await?;
            let patch: HashMap<String, SiblingSet> = rows
                .into_iter()
                .map(|row| (row.key, row.siblings))
                .collect();

            outcome.leaves_fetched += 1;
            outcome.keys_merged += patch.len() as u64;
            initiator.merge(&patch).await?;
        }

        outcome.completed = true;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{DummyBucketProxy, RelayBucketProxy};
    use std::sync::Arc;
    use tidepool_core::{RelaySitePool, SiteFactory, SitePool};
    use tidepool_model::{Row, SiblingSet, UpdateBatch, VersionVector};
    use tidepool_storage::MemoryStorageDriver;

    fn relay_proxy(node_name: &str, depth: u8) -> RelayBucketProxy {
        let site = SiteFactory::new(Arc::new(MemoryStorageDriver::new()), depth, node_name)
            .create("")
            .unwrap();
        let sites: Arc<dyn SitePool> = Arc::new(RelaySitePool::new(site));
        let site = sites.acquire("").unwrap();
        let bucket = site.bucket("default").unwrap();
        RelayBucketProxy { bucket, site_id: String::new(), sites }
    }

    async fn roots(a: &RelayBucketProxy, b: &RelayBucketProxy) -> (u128, u128) {
        (a.node_hash(1).await.unwrap(), b.node_hash(1).await.unwrap())
    }

    #[tokio::test]
    async fn identical_buckets_fetch_nothing() {
        let a = relay_proxy("a", 4);
        let b = relay_proxy("b", 4);

        let outcome = SyncSession::new(16).run(&a, &b).await.unwrap();
        assert_eq!(outcome, SyncOutcome { leaves_fetched: 0, keys_merged: 0, completed: true });
    }

    #[tokio::test]
    async fn one_divergent_leaf_converges_in_one_session() {
        let a = relay_proxy("a", 4);
        let b = relay_proxy("b", 4);

        b.bucket
            .batch(&UpdateBatch::new().put("only-on-b", b"v".to_vec(), ""))
            .unwrap();

        let (ra, rb) = roots(&a, &b).await;
        assert_ne!(ra, rb);

        let outcome = SyncSession::new(1).run(&a, &b).await.unwrap();
        assert!(outcome.completed);
        assert_eq!(outcome.leaves_fetched, 1);
        assert_eq!(outcome.keys_merged, 1);

        let (ra, rb) = roots(&a, &b).await;
        assert_eq!(ra, rb);
        let got = a.bucket.get(&["only-on-b".to_string()]).unwrap();
        assert_eq!(got[0].live_values(), vec![b"v".as_slice()]);
    }

    #[tokio::test]
    async fn path_limit_bounds_one_session_and_later_sessions_finish() {
        let a = relay_proxy("a", 4);
        let b = relay_proxy("b", 4);

        for i in 0..32 {
            b.bucket
                .batch(&UpdateBatch::new().put(format!("key-{i}"), vec![i as u8], ""))
                .unwrap();
        }

        let session = SyncSession::new(2);
        let first = session.run(&a, &b).await.unwrap();
        assert!(!first.completed);
        assert_eq!(first.leaves_fetched, 2);

        // Divergence shrinks every session and converges in finitely many
        let mut sessions = 1;
        loop {
            let outcome = session.run(&a, &b).await.unwrap();
            sessions += 1;
            if outcome.completed {
                break;
            }
            assert!(sessions <= 16, "sessions did not converge");
        }

        let (ra, rb) = roots(&a, &b).await;
        assert_eq!(ra, rb);
    }

    #[tokio::test]
    async fn bidirectional_sessions_converge_divergent_buckets() {
        let a = relay_proxy("a", 5);
        let b = relay_proxy("b", 5);

        a.bucket.batch(&UpdateBatch::new().put("from-a", b"1".to_vec(), "")).unwrap();
        b.bucket.batch(&UpdateBatch::new().put("from-b", b"2".to_vec(), "")).unwrap();

        let session = SyncSession::new(16);
        session.run(&a, &b).await.unwrap();
        session.run(&b, &a).await.unwrap();

        let (ra, rb) = roots(&a, &b).await;
        assert_eq!(ra, rb);
    }

    #[tokio::test]
    async fn dummy_responder_feeds_an_initiator() {
        let local = relay_proxy("a", 4);

        let seeded = SiblingSet::new();
        let sibling = seeded.event(VersionVector::new(), "fixture", Some(b"x".to_vec()));
        let responder = DummyBucketProxy::new(
            "default",
            4,
            vec![Row {
                key: "seeded".to_string(),
                local_version: 1,
                siblings: SiblingSet::from_siblings(vec![sibling]),
            }],
        )
        .unwrap();

        let outcome = SyncSession::new(8).run(&local, &responder).await.unwrap();
        assert!(outcome.completed);
        assert_eq!(outcome.keys_merged, 1);

        let got = local.bucket.get(&["seeded".to_string()]).unwrap();
        assert_eq!(got[0].live_values(), vec![b"x".as_slice()]);
    }

    #[tokio::test]
    async fn mismatched_depths_still_converge() {
        let shallow = relay_proxy("a", 3);
        let deep = relay_proxy("b", 6);

        deep.bucket.batch(&UpdateBatch::new().put("k", b"v".to_vec(), "")).unwrap();

        let session = SyncSession::new(16);
        let outcome = session.run(&shallow, &deep).await.unwrap();
        assert!(outcome.completed);

        let got = shallow.bucket.get(&["k".to_string()]).unwrap();
        assert_eq!(got[0].live_values(), vec![b"v".as_slice()]);
    }
}
