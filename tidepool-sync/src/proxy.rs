//! Bucket proxies: the bucket-shaped handles a sync session walks.
//!
//! Four shapes exist. The relay proxy is the only writable one: cloud-side
//! proxies answer reads but swallow merges, because cloud writes flow
//! through the quorum I/O path rather than through sync sessions.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tidepool_cluster::PeerAddress;
use tidepool_core::{Bucket, SitePool};
use tidepool_merkle::NodeHash;
use tidepool_model::{DbError, Row, SiblingSet};

use crate::factory::SyncClient;

#[async_trait]
pub trait BucketProxy: Send + Sync {
    fn name(&self) -> &str;

    async fn merkle_depth(&self) -> Result<u8, DbError>;

    async fn node_hash(&self, node_id: u32) -> Result<NodeHash, DbError>;

    /// Rows stored under the given Merkle node's leaf range.
    async fn get_sync_children(&self, node_id: u32) -> Result<Vec<Row>, DbError>;

    async fn merge(&self, patch: &HashMap<String, SiblingSet>) -> Result<(), DbError>;

    async fn forget(&self, keys: &[String]) -> Result<(), DbError>;

    /// Release whatever the proxy acquired (site refs, connections).
    fn close(&self);
}

/// Direct handle to a relay-side bucket; merges write through.
pub struct RelayBucketProxy {
    pub bucket: Arc<Bucket>,
    pub site_id: String,
    pub sites: Arc<dyn SitePool>,
}

#[async_trait]
impl BucketProxy for RelayBucketProxy {
    fn name(&self) -> &str {
        self.bucket.name()
    }

    async fn merkle_depth(&self) -> Result<u8, DbError> {
        Ok(self.bucket.merkle_depth())
    }

    async fn node_hash(&self, node_id: u32) -> Result<NodeHash, DbError> {
        self.bucket.merkle_node_hash(node_id)
    }

    async fn get_sync_children(&self, node_id: u32) -> Result<Vec<Row>, DbError> {
        self.bucket.get_sync_children(node_id)
    }

    async fn merge(&self, patch: &HashMap<String, SiblingSet>) -> Result<(), DbError> {
        self.bucket.merge(patch)
    }

    async fn forget(&self, keys: &[String]) -> Result<(), DbError> {
        self.bucket.forget(keys)
    }

    fn close(&self) {
        self.sites.release(&self.site_id);
    }
}

/// Read-only view of a locally held partition replica.
pub struct CloudLocalBucketProxy {
    pub bucket: Arc<Bucket>,
    pub site_id: String,
    pub sites: Arc<dyn SitePool>,
}

#[async_trait]
impl BucketProxy for CloudLocalBucketProxy {
    fn name(&self) -> &str {
        self.bucket.name()
    }

    async fn merkle_depth(&self) -> Result<u8, DbError> {
        Ok(self.bucket.merkle_depth())
    }

    async fn node_hash(&self, node_id: u32) -> Result<NodeHash, DbError> {
        self.bucket.merkle_node_hash(node_id)
    }

    async fn get_sync_children(&self, node_id: u32) -> Result<Vec<Row>, DbError> {
        self.bucket.get_sync_children(node_id)
    }

    async fn merge(&self, _patch: &HashMap<String, SiblingSet>) -> Result<(), DbError> {
        // Cloud replicas take writes through the cluster I/O path only
        Ok(())
    }

    async fn forget(&self, _keys: &[String]) -> Result<(), DbError> {
        Ok(())
    }

    fn close(&self) {
        self.sites.release(&self.site_id);
    }
}

/// Fixed, read-only bucket contents. Stands in for a responder in tests
/// and simulations: answers hashes and sync children from a prebuilt tree,
/// swallows writes.
pub struct DummyBucketProxy {
    name: String,
    tree: tidepool_merkle::MerkleTree,
    rows: Vec<Row>,
}

impl DummyBucketProxy {
    pub fn new(name: impl Into<String>, depth: u8, rows: Vec<Row>) -> Result<Self, DbError> {
        let mut tree = tidepool_merkle::MerkleTree::new(depth)?;
        for row in &rows {
            let leaf = tree.leaf_for_key(row.key.as_bytes());
            tree.apply_delta(leaf, row.siblings.hash(row.key.as_bytes()))?;
        }
        Ok(Self { name: name.into(), tree, rows })
    }
}

#[async_trait]
impl BucketProxy for DummyBucketProxy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn merkle_depth(&self) -> Result<u8, DbError> {
        Ok(self.tree.depth())
    }

    async fn node_hash(&self, node_id: u32) -> Result<NodeHash, DbError> {
        self.tree.node_hash(node_id)
    }

    async fn get_sync_children(&self, node_id: u32) -> Result<Vec<Row>, DbError> {
        let (lo, hi) = self.tree.leaf_range(node_id)?;
        Ok(self
            .rows
            .iter()
            .filter(|row| {
                let leaf = self.tree.leaf_for_key(row.key.as_bytes());
                (lo..=hi).contains(&leaf)
            })
            .cloned()
            .collect())
    }

    async fn merge(&self, _patch: &HashMap<String, SiblingSet>) -> Result<(), DbError> {
        Ok(())
    }

    async fn forget(&self, _keys: &[String]) -> Result<(), DbError> {
        Ok(())
    }

    fn close(&self) {}
}

/// Read-only view of a bucket replica held by another cluster node.
pub struct CloudRemoteBucketProxy {
    pub client: Arc<dyn SyncClient>,
    pub peer: PeerAddress,
    pub site_id: String,
    pub bucket_name: String,
}

#[async_trait]
impl BucketProxy for CloudRemoteBucketProxy {
    fn name(&self) -> &str {
        &self.bucket_name
    }

    async fn merkle_depth(&self) -> Result<u8, DbError> {
        self.client
            .merkle_depth(&self.peer, &self.site_id, &self.bucket_name)
            .await
    }

    async fn node_hash(&self, node_id: u32) -> Result<NodeHash, DbError> {
        self.client
            .merkle_node_hash(&self.peer, &self.site_id, &self.bucket_name, node_id)
            .await
    }

    async fn get_sync_children(&self, node_id: u32) -> Result<Vec<Row>, DbError> {
        self.client
            .merkle_keys(&self.peer, &self.site_id, &self.bucket_name, node_id)
            .await
    }

    async fn merge(&self, _patch: &HashMap<String, SiblingSet>) -> Result<(), DbError> {
        Ok(())
    }

    async fn forget(&self, _keys: &[String]) -> Result<(), DbError> {
        Ok(())
    }

    fn close(&self) {}
}
