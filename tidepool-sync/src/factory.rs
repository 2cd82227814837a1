//! Proxy factories: decide, per peer and bucket, which proxy shape to
//! build and which buckets sync in each direction.

use crate::proxy::{BucketProxy, CloudLocalBucketProxy, CloudRemoteBucketProxy, RelayBucketProxy};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tidepool_cluster::{ClusterController, PeerAddress};
use tidepool_core::{PartitionPool, SitePool};
use tidepool_merkle::NodeHash;
use tidepool_model::{error, DbError, Row};

/// The read surface a remote proxy needs from the inter-node client.
#[async_trait]
pub trait SyncClient: Send + Sync {
    async fn merkle_depth(
        &self,
        peer: &PeerAddress,
        site_id: &str,
        bucket: &str,
    ) -> Result<u8, DbError>;

    async fn merkle_node_hash(
        &self,
        peer: &PeerAddress,
        site_id: &str,
        bucket: &str,
        node_id: u32,
    ) -> Result<NodeHash, DbError>;

    async fn merkle_keys(
        &self,
        peer: &PeerAddress,
        site_id: &str,
        bucket: &str,
        node_id: u32,
    ) -> Result<Vec<Row>, DbError>;
}

#[async_trait]
pub trait BucketProxyFactory: Send + Sync {
    /// Buckets whose updates may flow from the peer into this node.
    fn incoming_buckets(&self, peer_id: &str) -> HashSet<String>;

    /// Buckets whose updates may flow from this node to the peer.
    fn outgoing_buckets(&self, peer_id: &str) -> HashSet<String>;

    async fn create_bucket_proxy(
        &self,
        peer_id: &str,
        bucket: &str,
    ) -> Result<Box<dyn BucketProxy>, DbError>;
}

/// Factory for the relay side: one site, direct bucket access, writable.
pub struct RelayBucketProxyFactory {
    pub sites: Arc<dyn SitePool>,
}

#[async_trait]
impl BucketProxyFactory for RelayBucketProxyFactory {
    fn incoming_buckets(&self, _peer_id: &str) -> HashSet<String> {
        match self.sites.acquire("") {
            Some(site) => {
                let buckets = site.incoming_buckets();
                self.sites.release("");
                buckets
            }
            None => HashSet::new(),
        }
    }

    fn outgoing_buckets(&self, _peer_id: &str) -> HashSet<String> {
        match self.sites.acquire("") {
            Some(site) => {
                let buckets = site.outgoing_buckets();
                self.sites.release("");
                buckets
            }
            None => HashSet::new(),
        }
    }

    async fn create_bucket_proxy(
        &self,
        _peer_id: &str,
        bucket: &str,
    ) -> Result<Box<dyn BucketProxy>, DbError> {
        let site = self.sites.acquire("").ok_or(error::E_NO_SUCH_SITE)?;
        match site.bucket(bucket) {
            Some(bucket) => Ok(Box::new(RelayBucketProxy {
                bucket,
                site_id: String::new(),
                sites: self.sites.clone(),
            })),
            None => {
                self.sites.release("");
                Err(error::E_NO_SUCH_BUCKET)
            }
        }
    }
}

/// Picks a replica owner index; injectable so tests are deterministic.
pub type OwnerPick = Box<dyn Fn(usize) -> usize + Send + Sync>;

/// Factory for the cloud side: resolves the relay's site to a partition
/// owner, chosen uniformly at random to spread sync load, and builds a
/// local or remote read-only proxy.
pub struct CloudBucketProxyFactory {
    pub client: Arc<dyn SyncClient>,
    pub controller: Arc<RwLock<ClusterController>>,
    pub partitions: Arc<PartitionPool>,
    pick: OwnerPick,
}

impl CloudBucketProxyFactory {
    pub fn new(
        client: Arc<dyn SyncClient>,
        controller: Arc<RwLock<ClusterController>>,
        partitions: Arc<PartitionPool>,
    ) -> Self {
        Self {
            client,
            controller,
            partitions,
            pick: Box::new(|n| rand::thread_rng().gen_range(0..n)),
        }
    }

    pub fn with_owner_pick(mut self, pick: OwnerPick) -> Self {
        self.pick = pick;
        self
    }
}

#[async_trait]
impl BucketProxyFactory for CloudBucketProxyFactory {
    fn incoming_buckets(&self, _peer_id: &str) -> HashSet<String> {
        HashSet::from(["default".to_string(), "lww".to_string()])
    }

    fn outgoing_buckets(&self, _peer_id: &str) -> HashSet<String> {
        HashSet::from(["default".to_string(), "lww".to_string(), "cloud".to_string()])
    }

    async fn create_bucket_proxy(
        &self,
        peer_id: &str,
        bucket: &str,
    ) -> Result<Box<dyn BucketProxy>, DbError> {
        let (site_id, partition, owner, local_id, peer_address) = {
            let controller = self.controller.read().map_err(|_| error::E_STORAGE)?;
            let site_id = controller.relay_site(peer_id).ok_or(error::E_NO_SUCH_SITE)?;
            let partition = controller.partition_of_site(&site_id);
            let owners = controller.partition_owners(partition);
            if owners.is_empty() {
                return Err(error::E_NO_VNODE);
            }
            let owner = owners[(self.pick)(owners.len())];
            let address = controller.member_address(owner);
            (site_id, partition, owner, controller.local_node_id, address)
        };

        if owner == local_id {
            let partition = self.partitions.get(partition).ok_or(error::E_NO_SUCH_PARTITION)?;
            let sites = partition.sites().clone();
            let site = sites.acquire(&site_id).ok_or(error::E_NO_SUCH_SITE)?;
            match site.bucket(bucket) {
                Some(bucket) => Ok(Box::new(CloudLocalBucketProxy {
                    bucket,
                    site_id,
                    sites,
                })),
                None => {
                    sites.release(&site_id);
                    Err(error::E_NO_SUCH_BUCKET)
                }
            }
        } else {
            let peer = peer_address.ok_or(error::E_INVALID_PEER)?;
            Ok(Box::new(CloudRemoteBucketProxy {
                client: self.client.clone(),
                peer,
                site_id,
                bucket_name: bucket.to_string(),
            }))
        }
    }
}
