//! Quorum-aware routing of application reads and writes across partition
//! replicas.

use crate::client::{BatchResult, ClusterFacade, InterNodeClient};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tidepool_cluster::ClusterController;
use tidepool_model::{error, DbError, Row, SiblingSet, UpdateBatch};
use tokio_util::sync::CancellationToken;

const REMOTE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maps sites to partitions and partitions to replica owners off the
/// replicated configuration.
#[derive(Clone)]
pub struct PartitionResolver {
    controller: Arc<RwLock<ClusterController>>,
}

impl PartitionResolver {
    pub fn new(controller: Arc<RwLock<ClusterController>>) -> Self {
        Self { controller }
    }

    pub fn partition(&self, site_id: &str) -> u64 {
        self.controller
            .read()
            .map(|controller| controller.partition_of_site(site_id))
            .unwrap_or(0)
    }

    pub fn owners(&self, partition: u64) -> Vec<u64> {
        self.controller
            .read()
            .map(|controller| controller.partition_owners(partition))
            .unwrap_or_default()
    }

    pub fn local_node_id(&self) -> u64 {
        self.controller
            .read()
            .map(|controller| controller.local_node_id)
            .unwrap_or(0)
    }
}

/// Errors that mean "this target will never work": surface immediately.
fn is_terminal(e: &DbError) -> bool {
    *e == error::E_NO_SUCH_SITE || *e == error::E_NO_SUCH_BUCKET
}

/// Errors that mean "another owner may serve this": retry there.
fn is_routing_miss(e: &DbError) -> bool {
    *e == error::E_NO_SUCH_PARTITION || *e == error::E_NO_VNODE || *e == error::E_STORAGE
}

pub struct ClusterIoAgent {
    resolver: PartitionResolver,
    client: Arc<dyn InterNodeClient>,
    local: Weak<dyn ClusterFacade>,
}

impl ClusterIoAgent {
    pub fn new(
        resolver: PartitionResolver,
        client: Arc<dyn InterNodeClient>,
        local: Weak<dyn ClusterFacade>,
    ) -> Self {
        Self { resolver, client, local }
    }

    /// Apply a write batch on every replica owner in parallel. Succeeds at
    /// a majority of the replica set.
    pub async fn batch(
        &self,
        cancel: &CancellationToken,
        site_id: &str,
        bucket: &str,
        update: &UpdateBatch,
    ) -> Result<BatchResult, DbError> {
        update.validate()?;
        let partition = self.resolver.partition(site_id);
        let owners = self.resolver.owners(partition);
        if owners.is_empty() {
            return Err(error::E_NO_QUORUM);
        }

        let replicas = owners.len() as u64;
        let quorum = replicas / 2 + 1;

        let mut futures = Vec::new();
        for owner in &owners {
            futures.push(self.batch_one(*owner, partition, site_id, bucket, update));
        }

        let results = tokio::select! {
            _ = cancel.cancelled() => return Err(error::E_CANCELLED),
            results = futures_util::future::join_all(futures) => results,
        };

        let mut applied = 0u64;
        let mut terminal: Option<DbError> = None;
        for result in &results {
            match result {
                Ok(_) => applied += 1,
                Err(e) => {
                    if is_terminal(e) {
                        terminal = Some(e.clone());
                    } else {
                        tracing::debug!(site = site_id, bucket, error = %e, "replica write failed");
                    }
                }
            }
        }

        if applied == 0 {
            if let Some(e) = terminal {
                return Err(e);
            }
        }
        if applied >= quorum {
            Ok(BatchResult { replicas, n_applied: applied })
        } else {
            Err(error::E_NO_QUORUM)
        }
    }

    /// Merge a causal patch into every replica owner: the write path for
    /// relay-pushed updates. Same quorum arithmetic as `batch`.
    pub async fn merge(
        &self,
        cancel: &CancellationToken,
        site_id: &str,
        bucket: &str,
        patch: &HashMap<String, SiblingSet>,
    ) -> Result<(), DbError> {
        let partition = self.resolver.partition(site_id);
        let owners = self.resolver.owners(partition);
        if owners.is_empty() {
            return Err(error::E_NO_QUORUM);
        }
        let quorum = owners.len() / 2 + 1;

        let mut futures = Vec::new();
        for owner in &owners {
            futures.push(self.merge_one(*owner, partition, site_id, bucket, patch));
        }
        let results = tokio::select! {
            _ = cancel.cancelled() => return Err(error::E_CANCELLED),
            results = futures_util::future::join_all(futures) => results,
        };

        let mut applied = 0;
        let mut terminal = None;
        for result in &results {
            match result {
                Ok(()) => applied += 1,
                Err(e) if is_terminal(e) => terminal = Some(e.clone()),
                Err(_) => {}
            }
        }

        if applied >= quorum {
            Ok(())
        } else if applied == 0 && terminal.is_some() {
            Err(terminal.unwrap_or(error::E_NO_QUORUM))
        } else {
            Err(error::E_NO_QUORUM)
        }
    }

    /// Read keys from the replica set, joining every successful response.
    /// Routing misses get one retry pass (owners may be mid-handoff).
    pub async fn get(
        &self,
        cancel: &CancellationToken,
        site_id: &str,
        bucket: &str,
        keys: &[String],
    ) -> Result<Vec<SiblingSet>, DbError> {
        let partition = self.resolver.partition(site_id);

        let mut attempts = 0;
        loop {
            attempts += 1;
            let owners = self.resolver.owners(partition);
            if owners.is_empty() {
                return Err(error::E_NO_QUORUM);
            }

            let mut futures = Vec::new();
            for owner in &owners {
                futures.push(self.get_one(*owner, partition, site_id, bucket, keys));
            }
            let results = tokio::select! {
                _ = cancel.cancelled() => return Err(error::E_CANCELLED),
                results = futures_util::future::join_all(futures) => results,
            };

            let mut merged: Option<Vec<SiblingSet>> = None;
            let mut terminal: Option<DbError> = None;
            let mut routing_miss = false;
            for result in results {
                match result {
                    Ok(sets) => {
                        merged = Some(match merged {
                            None => sets,
                            Some(acc) => acc
                                .into_iter()
                                .zip(sets)
                                .map(|(a, b)| a.join(&b))
                                .collect(),
                        });
                    }
                    Err(e) if is_terminal(&e) => terminal = Some(e),
                    Err(e) => routing_miss |= is_routing_miss(&e),
                }
            }

            if let Some(sets) = merged {
                return Ok(sets);
            }
            if let Some(e) = terminal {
                return Err(e);
            }
            if !routing_miss || attempts > 1 {
                return Err(error::E_NO_QUORUM);
            }
        }
    }

    /// Prefix reads across the replica set, joined per key. Same retry
    /// policy as [`get`](Self::get).
    pub async fn get_matches(
        &self,
        cancel: &CancellationToken,
        site_id: &str,
        bucket: &str,
        prefixes: &[String],
    ) -> Result<Vec<Row>, DbError> {
        let partition = self.resolver.partition(site_id);

        let mut attempts = 0;
        loop {
            attempts += 1;
            let owners = self.resolver.owners(partition);
            if owners.is_empty() {
                return Err(error::E_NO_QUORUM);
            }

            let mut futures = Vec::new();
            for owner in &owners {
                futures.push(self.get_matches_one(*owner, partition, site_id, bucket, prefixes));
            }
            let results = tokio::select! {
                _ = cancel.cancelled() => return Err(error::E_CANCELLED),
                results = futures_util::future::join_all(futures) => results,
            };

            let mut merged: HashMap<String, Row> = HashMap::new();
            let mut any_success = false;
            let mut terminal: Option<DbError> = None;
            let mut routing_miss = false;
            for result in results {
                match result {
                    Ok(rows) => {
                        any_success = true;
                        for row in rows {
                            match merged.get_mut(&row.key) {
                                Some(existing) => {
                                    existing.siblings = existing.siblings.join(&row.siblings);
                                    existing.local_version =
                                        existing.local_version.max(row.local_version);
                                }
                                None => {
                                    merged.insert(row.key.clone(), row);
                                }
                            }
                        }
                    }
                    Err(e) if is_terminal(&e) => terminal = Some(e),
                    Err(e) => routing_miss |= is_routing_miss(&e),
                }
            }

            if any_success {
                let mut rows: Vec<Row> = merged.into_values().collect();
                rows.sort_by(|a, b| a.key.cmp(&b.key));
                return Ok(rows);
            }
            if let Some(e) = terminal {
                return Err(e);
            }
            if !routing_miss || attempts > 1 {
                return Err(error::E_NO_QUORUM);
            }
        }
    }

    async fn batch_one(
        &self,
        owner: u64,
        partition: u64,
        site_id: &str,
        bucket: &str,
        update: &UpdateBatch,
    ) -> Result<HashMap<String, SiblingSet>, DbError> {
        if owner == self.resolver.local_node_id() {
            let local = self.local.upgrade().ok_or(error::E_STOPPED)?;
            return local.local_batch(partition, site_id, bucket, update);
        }
        tokio::time::timeout(
            REMOTE_TIMEOUT,
            self.client.local_batch(owner, partition, site_id, bucket, update),
        )
        .await
        .map_err(|_| error::E_STORAGE)?
    }

    async fn merge_one(
        &self,
        owner: u64,
        partition: u64,
        site_id: &str,
        bucket: &str,
        patch: &HashMap<String, SiblingSet>,
    ) -> Result<(), DbError> {
        if owner == self.resolver.local_node_id() {
            let local = self.local.upgrade().ok_or(error::E_STOPPED)?;
            return local.local_merge(partition, site_id, bucket, patch);
        }
        tokio::time::timeout(
            REMOTE_TIMEOUT,
            self.client.local_merge(owner, partition, site_id, bucket, patch),
        )
        .await
        .map_err(|_| error::E_STORAGE)?
    }

    async fn get_one(
        &self,
        owner: u64,
        partition: u64,
        site_id: &str,
        bucket: &str,
        keys: &[String],
    ) -> Result<Vec<SiblingSet>, DbError> {
        if owner == self.resolver.local_node_id() {
            let local = self.local.upgrade().ok_or(error::E_STOPPED)?;
            return local.local_get(partition, site_id, bucket, keys);
        }
        tokio::time::timeout(
            REMOTE_TIMEOUT,
            self.client.local_get(owner, partition, site_id, bucket, keys),
        )
        .await
        .map_err(|_| error::E_STORAGE)?
    }

    async fn get_matches_one(
        &self,
        owner: u64,
        partition: u64,
        site_id: &str,
        bucket: &str,
        prefixes: &[String],
    ) -> Result<Vec<Row>, DbError> {
        if owner == self.resolver.local_node_id() {
            let local = self.local.upgrade().ok_or(error::E_STOPPED)?;
            return local.local_get_matches(partition, site_id, bucket, prefixes);
        }
        tokio::time::timeout(
            REMOTE_TIMEOUT,
            self.client.local_get_matches(owner, partition, site_id, bucket, prefixes),
        )
        .await
        .map_err(|_| error::E_STORAGE)?
    }
}
