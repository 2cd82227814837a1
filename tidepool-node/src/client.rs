//! The inter-node call surface and its in-process incarnation.
//!
//! [`ClusterFacade`] is everything one node exposes to its peers, to the
//! route layer, and to the relay hub. [`InterNodeClient`] is the outbound
//! half the cluster I/O agent and the join loop speak. [`NodeHub`] wires
//! the two together in-process; the HTTP incarnation of both sides is
//! transport plumbing outside this crate, carrying the same JSON shapes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, Weak};
use tidepool_cluster::{NodeConfig, PeerAddress};
use tidepool_merkle::NodeHash;
use tidepool_model::{error, DbError, Row, SiblingSet, UpdateBatch};
use tidepool_sync::SyncClient;
use tidepool_transfer::{TransferClient, TransferFrame};

/// Result of a quorum write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BatchResult {
    pub replicas: u64,
    pub n_applied: u64,
}

/// Everything a cluster node answers for: cluster admin, quorum data ops,
/// per-replica local ops, the sync read surface, and partition transfer.
#[async_trait]
pub trait ClusterFacade: Send + Sync {
    // cluster admin
    async fn add_node(&self, node_config: NodeConfig) -> Result<(), DbError>;

    /// Remove a member. `wipe` is the removal endpoint's `?wipe=` toggle:
    /// it instructs the departing node to destroy both its present and any
    /// leftover absent replica data.
    async fn remove_node(
        &self,
        node_id: u64,
        replacement: Option<u64>,
        wipe: bool,
    ) -> Result<(), DbError>;
    async fn add_site(&self, site_id: &str) -> Result<(), DbError>;
    async fn remove_site(&self, site_id: &str) -> Result<(), DbError>;
    async fn add_relay(&self, relay_id: &str) -> Result<(), DbError>;
    async fn remove_relay(&self, relay_id: &str) -> Result<(), DbError>;
    async fn move_relay(&self, relay_id: &str, site_id: Option<String>) -> Result<(), DbError>;
    fn local_node_id(&self) -> u64;
    fn peer_address(&self, node_id: u64) -> Option<PeerAddress>;

    // quorum data ops
    async fn batch(
        &self,
        site_id: &str,
        bucket: &str,
        update: &UpdateBatch,
    ) -> Result<BatchResult, DbError>;
    async fn get(
        &self,
        site_id: &str,
        bucket: &str,
        keys: &[String],
    ) -> Result<Vec<SiblingSet>, DbError>;
    async fn get_matches(
        &self,
        site_id: &str,
        bucket: &str,
        prefixes: &[String],
    ) -> Result<Vec<Row>, DbError>;

    // local replica ops
    fn local_batch(
        &self,
        partition: u64,
        site_id: &str,
        bucket: &str,
        update: &UpdateBatch,
    ) -> Result<HashMap<String, SiblingSet>, DbError>;
    fn local_merge(
        &self,
        partition: u64,
        site_id: &str,
        bucket: &str,
        patch: &HashMap<String, SiblingSet>,
    ) -> Result<(), DbError>;
    fn local_get(
        &self,
        partition: u64,
        site_id: &str,
        bucket: &str,
        keys: &[String],
    ) -> Result<Vec<SiblingSet>, DbError>;
    fn local_get_matches(
        &self,
        partition: u64,
        site_id: &str,
        bucket: &str,
        prefixes: &[String],
    ) -> Result<Vec<Row>, DbError>;

    // sync read surface
    fn merkle_depth(&self, site_id: &str, bucket: &str) -> Result<u8, DbError>;
    fn merkle_node_hash(&self, site_id: &str, bucket: &str, node_id: u32)
        -> Result<NodeHash, DbError>;
    fn merkle_keys(&self, site_id: &str, bucket: &str, node_id: u32) -> Result<Vec<Row>, DbError>;

    // partition transfer
    fn download_partition(&self, partition: u64) -> Result<Vec<TransferFrame>, DbError>;
    fn ack_partition_transfer(&self, partition: u64) -> Result<(), DbError>;
}

/// Outbound inter-node calls, addressed by node id (the seed join call
/// addresses by peer address since the joiner knows no ids yet).
#[async_trait]
pub trait InterNodeClient: Send + Sync {
    async fn add_node(&self, seed: &PeerAddress, node_config: NodeConfig) -> Result<(), DbError>;

    async fn remove_node(
        &self,
        peer: &PeerAddress,
        node_id: u64,
        replacement: Option<u64>,
        wipe: bool,
    ) -> Result<(), DbError>;

    async fn local_batch(
        &self,
        node_id: u64,
        partition: u64,
        site_id: &str,
        bucket: &str,
        update: &UpdateBatch,
    ) -> Result<HashMap<String, SiblingSet>, DbError>;

    async fn local_merge(
        &self,
        node_id: u64,
        partition: u64,
        site_id: &str,
        bucket: &str,
        patch: &HashMap<String, SiblingSet>,
    ) -> Result<(), DbError>;

    async fn local_get(
        &self,
        node_id: u64,
        partition: u64,
        site_id: &str,
        bucket: &str,
        keys: &[String],
    ) -> Result<Vec<SiblingSet>, DbError>;

    async fn local_get_matches(
        &self,
        node_id: u64,
        partition: u64,
        site_id: &str,
        bucket: &str,
        prefixes: &[String],
    ) -> Result<Vec<Row>, DbError>;
}

/// In-process message fabric: routes calls to registered facades. Holds
/// weak references only, so the hub never extends a node's lifetime.
#[derive(Default)]
pub struct NodeHub {
    facades: Mutex<HashMap<u64, Weak<dyn ClusterFacade>>>,
}

impl NodeHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_id: u64, facade: Weak<dyn ClusterFacade>) {
        if let Ok(mut facades) = self.facades.lock() {
            facades.insert(node_id, facade);
        }
    }

    pub fn unregister(&self, node_id: u64) {
        if let Ok(mut facades) = self.facades.lock() {
            facades.remove(&node_id);
        }
    }

    fn facade(&self, node_id: u64) -> Result<std::sync::Arc<dyn ClusterFacade>, DbError> {
        self.facades
            .lock()
            .ok()
            .and_then(|facades| facades.get(&node_id).and_then(|weak| weak.upgrade()))
            .ok_or(error::E_INVALID_PEER)
    }
}

#[async_trait]
impl InterNodeClient for NodeHub {
    async fn add_node(&self, seed: &PeerAddress, node_config: NodeConfig) -> Result<(), DbError> {
        self.facade(seed.node_id)?.add_node(node_config).await
    }

    async fn remove_node(
        &self,
        peer: &PeerAddress,
        node_id: u64,
        replacement: Option<u64>,
        wipe: bool,
    ) -> Result<(), DbError> {
        self.facade(peer.node_id)?.remove_node(node_id, replacement, wipe).await
    }

    async fn local_batch(
        &self,
        node_id: u64,
        partition: u64,
        site_id: &str,
        bucket: &str,
        update: &UpdateBatch,
    ) -> Result<HashMap<String, SiblingSet>, DbError> {
        self.facade(node_id)?.local_batch(partition, site_id, bucket, update)
    }

    async fn local_merge(
        &self,
        node_id: u64,
        partition: u64,
        site_id: &str,
        bucket: &str,
        patch: &HashMap<String, SiblingSet>,
    ) -> Result<(), DbError> {
        self.facade(node_id)?.local_merge(partition, site_id, bucket, patch)
    }

    async fn local_get(
        &self,
        node_id: u64,
        partition: u64,
        site_id: &str,
        bucket: &str,
        keys: &[String],
    ) -> Result<Vec<SiblingSet>, DbError> {
        self.facade(node_id)?.local_get(partition, site_id, bucket, keys)
    }

    async fn local_get_matches(
        &self,
        node_id: u64,
        partition: u64,
        site_id: &str,
        bucket: &str,
        prefixes: &[String],
    ) -> Result<Vec<Row>, DbError> {
        self.facade(node_id)?.local_get_matches(partition, site_id, bucket, prefixes)
    }
}

#[async_trait]
impl SyncClient for NodeHub {
    async fn merkle_depth(
        &self,
        peer: &PeerAddress,
        site_id: &str,
        bucket: &str,
    ) -> Result<u8, DbError> {
        self.facade(peer.node_id)?.merkle_depth(site_id, bucket)
    }

    async fn merkle_node_hash(
        &self,
        peer: &PeerAddress,
        site_id: &str,
        bucket: &str,
        node_id: u32,
    ) -> Result<NodeHash, DbError> {
        self.facade(peer.node_id)?.merkle_node_hash(site_id, bucket, node_id)
    }

    async fn merkle_keys(
        &self,
        peer: &PeerAddress,
        site_id: &str,
        bucket: &str,
        node_id: u32,
    ) -> Result<Vec<Row>, DbError> {
        self.facade(peer.node_id)?.merkle_keys(site_id, bucket, node_id)
    }
}

#[async_trait]
impl TransferClient for NodeHub {
    async fn download_partition(
        &self,
        from: u64,
        partition: u64,
    ) -> Result<Vec<TransferFrame>, DbError> {
        self.facade(from)?.download_partition(partition)
    }

    async fn ack_partition_transfer(&self, to: u64, partition: u64) -> Result<(), DbError> {
        self.facade(to)?.ack_partition_transfer(partition)
    }
}
