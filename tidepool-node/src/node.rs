//! The cluster node: one process-wide instance owning the storage driver,
//! raft store, config controller, partition pool, transfer agent, sync
//! controller, and cluster I/O agent.
//!
//! `start` brackets the whole lifecycle: open storage (with one recovery
//! attempt), derive the stable node id, wire the components leaf-first,
//! resume an interrupted decommission, then join or initialize the cluster
//! and park until shutdown or removal.

use crate::client::{BatchResult, ClusterFacade, InterNodeClient, NodeHub};
use crate::clusterio::{ClusterIoAgent, PartitionResolver};
use crate::coordinator::{NodeCoordinatorFacade, NodeStateCoordinator};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::Duration;
use tidepool_cluster::raft::{ClusterNetwork, RaftStore};
use tidepool_cluster::{
    ClusterCommand, ClusterSettings, ConfigController, ConfigControllerConfig, NodeConfig,
    PeerAddress,
};
use tidepool_core::{CloudSitePool, Partition, PartitionPool, SiteFactory, SitePool};
use tidepool_merkle::NodeHash;
use tidepool_model::{error, uuid64, DbError, Row, SiblingSet, UpdateBatch};
use tidepool_storage::{purge_prefix, PrefixedStorageDriver, SharedStorageDriver, StorageDriver, WriteBatch};
use tidepool_sync::{
    BucketProxyFactory, CloudBucketProxyFactory, MultiSyncScheduler, SyncController,
};
use tidepool_transfer::{TransferAgent, TransferFrame};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// First byte of the raft store's keyspace.
pub const RAFT_STORE_STORAGE_PREFIX: u8 = 0x00;
/// First byte of the partition/site keyspace.
pub const SITE_STORE_STORAGE_PREFIX: u8 = 0x01;

const CLUSTER_JOIN_RETRY: Duration = Duration::from_secs(5);
const DUPLICATE_ID_GRACE: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct ClusterNodeConfig {
    pub storage: SharedStorageDriver,
    pub host: String,
    pub port: u16,
    pub capacity: u64,
    pub merkle_depth: u8,
    pub network: ClusterNetwork,
    pub hub: Arc<NodeHub>,
    pub sync_period: Duration,
    pub sync_max_sessions: usize,
    pub sync_path_limit: u32,
}

#[derive(Clone, Default)]
pub struct NodeInitializationOptions {
    pub start_cluster: bool,
    pub seed: Option<PeerAddress>,
    pub cluster_settings: ClusterSettings,
}

pub struct ClusterNode {
    weak_self: Weak<ClusterNode>,
    storage: SharedStorageDriver,
    raft_store: RaftStore,
    network: ClusterNetwork,
    hub: Arc<NodeHub>,
    host: String,
    port: u16,
    capacity: u64,
    merkle_depth: u8,
    sync_period: Duration,
    sync_max_sessions: usize,
    sync_path_limit: u32,

    partitions: Arc<PartitionPool>,
    node_id: OnceLock<u64>,
    config_controller: OnceLock<Arc<ConfigController>>,
    transfer_agent: OnceLock<Arc<TransferAgent>>,
    clusterio: OnceLock<Arc<ClusterIoAgent>>,
    sync_controller: OnceLock<Arc<SyncController>>,

    relay_sites: RwLock<HashMap<String, Option<String>>>,
    shutdown: CancellationToken,
    joined: watch::Sender<bool>,
    left_cluster: watch::Sender<bool>,
    decommission_result: Mutex<Option<watch::Receiver<Option<DbError>>>>,
}

fn partition_storage_prefix(partition: u64) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(9);
    prefix.push(SITE_STORE_STORAGE_PREFIX);
    prefix.extend_from_slice(&partition.to_be_bytes());
    prefix
}

impl ClusterNode {
    pub fn new(config: ClusterNodeConfig) -> Arc<Self> {
        let raft_store = RaftStore::new(Arc::new(PrefixedStorageDriver::new(
            vec![RAFT_STORE_STORAGE_PREFIX],
            config.storage.clone(),
        )));

        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            storage: config.storage,
            raft_store,
            network: config.network,
            hub: config.hub,
            host: config.host,
            port: config.port,
            capacity: config.capacity,
            merkle_depth: config.merkle_depth,
            sync_period: config.sync_period,
            sync_max_sessions: config.sync_max_sessions,
            sync_path_limit: config.sync_path_limit,
            partitions: Arc::new(PartitionPool::new()),
            node_id: OnceLock::new(),
            config_controller: OnceLock::new(),
            transfer_agent: OnceLock::new(),
            clusterio: OnceLock::new(),
            sync_controller: OnceLock::new(),
            relay_sites: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            joined: watch::channel(false).0,
            left_cluster: watch::channel(false).0,
            decommission_result: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.node_id.get().copied().unwrap_or(0)
    }

    /// Replica name stamped into causal dots created here.
    pub fn name(&self) -> String {
        format!("cloud-{}", self.id())
    }

    pub fn partitions(&self) -> &Arc<PartitionPool> {
        &self.partitions
    }

    pub fn cluster_io(&self) -> Option<Arc<ClusterIoAgent>> {
        self.clusterio.get().cloned()
    }

    pub fn config_controller(&self) -> Option<Arc<ConfigController>> {
        self.config_controller.get().cloned()
    }

    fn local_address(&self) -> PeerAddress {
        PeerAddress {
            node_id: self.id(),
            host: self.host.clone(),
            port: self.port,
        }
    }

    fn local_node_config(&self) -> NodeConfig {
        NodeConfig {
            address: self.local_address(),
            capacity: self.capacity,
        }
    }

    /// Run the node to completion. Returns when the node shuts down (`Ok`),
    /// is removed from the cluster (`E_REMOVED`), or fails fatally.
    pub async fn start(&self, options: NodeInitializationOptions) -> Result<(), DbError> {
        let result = self.start_inner(options).await;
        self.stop();
        result
    }

    async fn start_inner(&self, options: NodeInitializationOptions) -> Result<(), DbError> {
        self.open_storage()?;

        let node_id = self.acquire_node_id()?;
        tracing::info!(node = node_id, "local node starting up");

        // Config controller replays persisted state before anything else
        let inbox = self.network.register(node_id);
        let config_controller = Arc::new(ConfigController::new(
            ConfigControllerConfig {
                local_id: node_id,
                create_cluster: options.start_cluster,
            },
            self.raft_store.clone(),
            Arc::new(self.network.transport()),
            inbox,
        )?);
        let _ = self.config_controller.set(config_controller.clone());

        {
            let controller = config_controller.cluster_controller();
            let controller = controller.read().map_err(|_| error::E_STORAGE)?;
            if controller.local_node_was_removed() {
                tracing::error!(node = node_id, "unable to start: removed from cluster");
                return Err(error::E_REMOVED);
            }
        }

        // Leaf-first wiring: transfers, I/O, sync, then the coordinator
        let transfer_agent = Arc::new(TransferAgent::new(
            node_id,
            self.partitions.clone(),
            self.hub.clone(),
        ));
        {
            let weak = self.weak_self.clone();
            transfer_agent.on_outgoing_complete(Box::new(move |partition| {
                if let Some(node) = weak.upgrade() {
                    node.drop_partition(partition);
                }
            }));
        }
        let _ = self.transfer_agent.set(transfer_agent);

        let resolver = PartitionResolver::new(config_controller.cluster_controller());
        let facade: Arc<dyn ClusterFacade> = self.weak_self.upgrade().ok_or(error::E_STOPPED)?;
        let _ = self.clusterio.set(Arc::new(ClusterIoAgent::new(
            resolver,
            self.hub.clone(),
            Arc::downgrade(&facade),
        )));

        let local_factory: Arc<dyn BucketProxyFactory> = Arc::new(CloudBucketProxyFactory::new(
            self.hub.clone(),
            config_controller.cluster_controller(),
            self.partitions.clone(),
        ));
        let _ = self.sync_controller.set(Arc::new(SyncController::new(
            self.sync_max_sessions,
            local_factory,
            MultiSyncScheduler::new(self.sync_period),
            self.sync_path_limit,
        )));

        let coordinator = Arc::new(NodeStateCoordinator::new(
            node_id,
            CoordinatorHandle { node: self.weak_self.clone() },
        ));
        {
            let coordinator = coordinator.clone();
            config_controller.on_local_deltas(Box::new(move |deltas| {
                coordinator.process_deltas(deltas);
            }));
        }

        self.hub.register(node_id, Arc::downgrade(&facade));
        config_controller.start();

        // Reify the node's last known state before ownership changes land.
        // Snapshot first: initialize re-enters the controller lock.
        let boot_state = {
            let controller = config_controller.cluster_controller();
            let controller = controller.read().map_err(|_| error::E_STORAGE)?;
            controller.clone()
        };
        coordinator.initialize(&boot_state);

        if let Some(sync_controller) = self.sync_controller.get() {
            sync_controller.start();
        }

        if self.raft_store.is_decommissioning()? {
            tracing::info!(node = node_id, "resuming decommissioning process");
            let mut result = self.leave_cluster()?;
            let outcome = loop {
                if let Some(outcome) = result.borrow().clone() {
                    break outcome;
                }
                if result.changed().await.is_err() {
                    break error::E_STOPPED;
                }
            };
            return Err(outcome);
        }

        let needs_membership = {
            let controller = config_controller.cluster_controller();
            let controller = controller.read().map_err(|_| error::E_STORAGE)?;
            !controller.local_node_is_in_cluster() || !controller.state.settings.initialized()
        };

        if needs_membership {
            match options.seed.clone() {
                Some(seed) => {
                    tracing::info!(
                        node = node_id,
                        seed = %format!("{}:{}", seed.host, seed.port),
                        "joining existing cluster"
                    );
                    self.join_cluster(&seed).await?;
                }
                None if options.start_cluster => {
                    tracing::info!(node = node_id, "creating new cluster");
                    self.initialize_cluster(&options.cluster_settings).await?;
                }
                None => {}
            }
        }

        let mut left = self.left_cluster.subscribe();
        tokio::select! {
            _ = self.shutdown.cancelled() => Ok(()),
            _ = left.wait_for(|left| *left) => {
                tracing::info!(node = node_id, "local node was removed from the cluster; shutting down");
                Err(error::E_REMOVED)
            }
        }
    }

    pub fn stop(&self) {
        if let Some(sync_controller) = self.sync_controller.get() {
            sync_controller.stop();
        }
        if let Some(transfer_agent) = self.transfer_agent.get() {
            transfer_agent.stop_all_transfers();
        }
        if let Some(config_controller) = self.config_controller.get() {
            config_controller.stop();
        }
        self.hub.unregister(self.id());
        self.network.unregister(self.id());
        self.shutdown.cancel();
        let _ = self.storage.close();
    }

    fn open_storage(&self) -> Result<(), DbError> {
        match self.storage.open() {
            Ok(()) => Ok(()),
            Err(e) if e == error::E_CORRUPTED => {
                tracing::error!("database is corrupted; attempting automatic recovery");
                self.storage.recover().map_err(|recover_error| {
                    tracing::error!(error = %recover_error, "unable to recover corrupted database");
                    error::E_STORAGE
                })
            }
            Err(e) => {
                tracing::error!(error = %e, "error opening storage driver");
                Err(error::E_STORAGE)
            }
        }
    }

    fn acquire_node_id(&self) -> Result<u64, DbError> {
        let mut node_id = self.raft_store.node_id()?;
        if node_id == 0 {
            node_id = uuid64();
            tracing::info!(node = node_id, "local node initializing with new id");
            self.raft_store.set_node_id(node_id)?;
        }
        let _ = self.node_id.set(node_id);
        Ok(node_id)
    }

    async fn initialize_cluster(&self, settings: &ClusterSettings) -> Result<(), DbError> {
        let config_controller = self.config_controller.get().ok_or(error::E_STOPPED)?;
        let cancel = self.shutdown.child_token();

        {
            let controller = config_controller.cluster_controller();
            let in_cluster = controller
                .read()
                .map_err(|_| error::E_STORAGE)?
                .local_node_is_in_cluster();
            if !in_cluster {
                config_controller.add_node(&cancel, self.local_node_config()).await?;
            }
        }

        let initialized = {
            let controller = config_controller.cluster_controller();
            let controller = controller.read().map_err(|_| error::E_STORAGE)?;
            controller.state.settings.initialized()
        };
        if !initialized {
            tracing::info!(
                replication_factor = settings.replication_factor,
                partitions = settings.partitions,
                "initializing cluster settings"
            );
            config_controller
                .cluster_command(
                    &cancel,
                    ClusterCommand::SetReplicationFactor {
                        replication_factor: settings.replication_factor,
                    },
                )
                .await?;
            config_controller
                .cluster_command(
                    &cancel,
                    ClusterCommand::SetPartitionCount { partitions: settings.partitions },
                )
                .await?;
            tracing::info!("cluster initialization complete");
        }

        Ok(())
    }

    /// The join loop: ask the seed to propose our membership, retrying
    /// every few seconds, treating observed config deltas naming us as
    /// success even when the RPC response was lost.
    async fn join_cluster(&self, seed: &PeerAddress) -> Result<(), DbError> {
        let mut joined = self.joined.subscribe();
        let member_config = self.local_node_config();

        loop {
            if *joined.borrow() {
                return Ok(());
            }

            let attempt = tokio::select! {
                _ = self.shutdown.cancelled() => return Err(error::E_STOPPED),
                _ = joined.wait_for(|joined| *joined) => return Ok(()),
                result = self.hub.add_node(seed, member_config.clone()) => result,
            };

            match attempt {
                Ok(()) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(error::E_STOPPED),
                        _ = joined.wait_for(|joined| *joined) => return Ok(()),
                    }
                }
                Err(e) if e == error::E_DUPLICATE_NODE_ID => {
                    tracing::error!(
                        node = self.id(),
                        "join failed: node id is not unique; waiting in case our own proposal was already accepted"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(error::E_STOPPED),
                        _ = joined.wait_for(|joined| *joined) => return Ok(()),
                        _ = tokio::time::sleep(DUPLICATE_ID_GRACE) => return Err(error::E_DUPLICATE_NODE_ID),
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        node = self.id(),
                        error = %e,
                        retry_seconds = CLUSTER_JOIN_RETRY.as_secs(),
                        "error joining cluster; will retry"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(error::E_STOPPED),
                        _ = joined.wait_for(|joined| *joined) => return Ok(()),
                        _ = tokio::time::sleep(CLUSTER_JOIN_RETRY) => continue,
                    }
                }
            }
        }
    }

    /// Begin (or rejoin) the decommissioning process. Idempotent: a second
    /// call returns the same result channel. The channel yields the final
    /// outcome, `E_DECOMMISSIONED` on a clean exit.
    pub fn leave_cluster(&self) -> Result<watch::Receiver<Option<DbError>>, DbError> {
        let mut slot = self.decommission_result.lock().map_err(|_| error::E_STORAGE)?;
        if let Some(result) = slot.as_ref() {
            return Ok(result.clone());
        }

        tracing::info!(node = self.id(), "local node entering decommissioning mode");
        self.raft_store.set_decommissioning_flag()?;

        let (tx, rx) = watch::channel(None);
        let cancel = self.shutdown.child_token();
        let node = self.weak_self.upgrade().ok_or(error::E_STOPPED)?;
        tokio::spawn(async move {
            let outcome = node.run_decommission(cancel).await;
            let _ = tx.send(Some(outcome));
        });

        *slot = Some(rx.clone());
        Ok(rx)
    }

    async fn run_decommission(&self, cancel: CancellationToken) -> DbError {
        let config_controller = match self.config_controller.get() {
            Some(config_controller) => config_controller.clone(),
            None => return error::E_STOPPED,
        };
        let transfer_agent = match self.transfer_agent.get() {
            Some(transfer_agent) => transfer_agent.clone(),
            None => return error::E_STOPPED,
        };

        let local_config = {
            let controller = config_controller.cluster_controller();
            let result = match controller.read() {
                Ok(controller) => controller.local_node_config().cloned(),
                Err(_) => return error::E_STORAGE,
            };
            result
        };
        let local_config = match local_config {
            Some(local_config) => local_config,
            None => {
                tracing::error!(node = self.id(), "cannot decommission: not in cluster config");
                return error::E_REMOVED;
            }
        };

        if local_config.capacity != 0 {
            tracing::info!(node = self.id(), "decommissioning (1/4): giving up tokens");
            let mut retired = local_config.clone();
            retired.capacity = 0;
            if let Err(e) = config_controller
                .cluster_command(
                    &cancel,
                    ClusterCommand::UpdateNode { node_id: self.id(), node_config: retired },
                )
                .await
            {
                tracing::error!(node = self.id(), error = %e, "unable to give up tokens");
                return e;
            }
        }

        // Losing every token already stopped incoming transfers and locked
        // the held partitions; make sure of it before draining
        transfer_agent.stop_all_transfers();
        let held = transfer_agent.held_partitions();
        if !held.is_empty() {
            tracing::info!(node = self.id(), partitions = held.len(), "decommissioning (2/4): locking partitions");
            for partition in &held {
                transfer_agent.enable_outgoing(*partition);
            }

            tracing::info!(node = self.id(), "decommissioning (3/4): transferring partition data");
            let mut left = self.left_cluster.subscribe();
            tokio::select! {
                _ = left.wait_for(|left| *left) => return error::E_REMOVED,
                result = transfer_agent.wait_empty(&cancel) => {
                    if let Err(e) = result {
                        return e;
                    }
                }
            }
        }

        tracing::info!(node = self.id(), "decommissioning (4/4): leaving cluster");
        if let Err(e) = config_controller.remove_node(&cancel, self.id()).await {
            tracing::error!(node = self.id(), error = %e, "unable to leave cluster");
            return e;
        }

        error::E_DECOMMISSIONED
    }

    // --- local replica data path ---

    fn local_bucket<T>(
        &self,
        partition: u64,
        site_id: &str,
        bucket: &str,
        f: impl FnOnce(&tidepool_core::Bucket) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        let held = self.partitions.get(partition).ok_or(error::E_NO_SUCH_PARTITION)?;
        let site = held.sites().acquire(site_id).ok_or(error::E_NO_SUCH_SITE)?;
        let result = match site.bucket(bucket) {
            Some(bucket) => f(&bucket),
            None => Err(error::E_NO_SUCH_BUCKET),
        };
        held.sites().release(site_id);
        result
    }

    fn holds_partition(&self, partition: u64) -> bool {
        self.config_controller
            .get()
            .and_then(|config_controller| {
                config_controller
                    .cluster_controller()
                    .read()
                    .ok()
                    .map(|controller| controller.local_node_holds_partition(partition))
            })
            .unwrap_or(false)
    }

    fn drop_partition(&self, partition: u64) {
        tracing::info!(node = self.id(), partition, "dropping transferred partition");
        self.partitions.remove(partition);
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = purge_prefix(storage.as_ref(), &partition_storage_prefix(partition)) {
                tracing::error!(partition, error = %e, "failed to wipe partition storage");
            }
        });
    }

    fn make_partition(&self, partition: u64) -> Arc<Partition> {
        let storage: SharedStorageDriver = Arc::new(PrefixedStorageDriver::new(
            partition_storage_prefix(partition),
            self.storage.clone(),
        ));
        let factory = SiteFactory::new(storage, self.merkle_depth, self.name());
        let pool = CloudSitePool::new(factory);

        // Seed the pool with current site membership
        if let Some(config_controller) = self.config_controller.get() {
            if let Ok(controller) = config_controller.cluster_controller().read() {
                for site_id in controller.state.sites.iter() {
                    pool.add(site_id);
                }
            }
        }

        Arc::new(Partition::new(partition, Arc::new(pool)))
    }

    // --- relay connections ---

    /// A relay authenticated and connected: start syncing its buckets. The
    /// peer factory wraps whatever carries the relay's side (the websocket
    /// hub in production, a direct factory in tests).
    pub fn connect_relay(
        &self,
        relay_id: &str,
        peer_factory: Arc<dyn BucketProxyFactory>,
    ) -> Result<(), DbError> {
        let bound_site = {
            let relays = self.relay_sites.read().map_err(|_| error::E_STORAGE)?;
            match relays.get(relay_id) {
                Some(site) => site.clone(),
                None => return Err(error::E_UNAUTHORIZED),
            }
        };

        if bound_site.is_none() {
            // Known relay with no site yet: accept, nothing to sync
            return Ok(());
        }

        let sync_controller = self.sync_controller.get().ok_or(error::E_STOPPED)?;
        sync_controller.add_peer(relay_id, peer_factory);
        Ok(())
    }

    pub fn disconnect_relay(&self, relay_id: &str) {
        if let Some(sync_controller) = self.sync_controller.get() {
            sync_controller.remove_peer(relay_id);
        }
    }

    /// A connected relay pushed updates for one of its buckets. This is the
    /// relay→cloud write path: the patch goes through quorum merge on the
    /// site's replica owners (sync-session merges on cloud proxies are
    /// deliberately no-ops).
    pub async fn relay_push(
        &self,
        relay_id: &str,
        bucket: &str,
        patch: &HashMap<String, SiblingSet>,
    ) -> Result<(), DbError> {
        let site_id = {
            let relays = self.relay_sites.read().map_err(|_| error::E_STORAGE)?;
            match relays.get(relay_id) {
                Some(Some(site_id)) => site_id.clone(),
                Some(None) => return Err(error::E_NO_SUCH_SITE),
                None => return Err(error::E_UNAUTHORIZED),
            }
        };

        let clusterio = self.clusterio.get().ok_or(error::E_STOPPED)?;
        clusterio
            .merge(&self.shutdown.child_token(), &site_id, bucket, patch)
            .await
    }
}

/// The coordinator's view of the node. Holds a weak reference: the
/// coordinator never extends the node's lifetime.
pub struct CoordinatorHandle {
    node: Weak<ClusterNode>,
}

impl NodeCoordinatorFacade for CoordinatorHandle {
    fn provision_partition_replica(&self, partition: u64, sources: Vec<u64>) {
        let node = match self.node.upgrade() {
            Some(node) => node,
            None => return,
        };
        let transfer_agent = match node.transfer_agent.get() {
            Some(transfer_agent) => transfer_agent.clone(),
            None => return,
        };

        match node.partitions.get(partition) {
            Some(existing) => {
                // Re-gained mid-handoff: keep it, reopen writes
                transfer_agent.cancel_outgoing(partition);
                existing.unlock_writes();
            }
            None => {
                node.partitions.add(node.make_partition(partition));
                transfer_agent.hold(partition);
            }
        }

        if !sources.is_empty() {
            transfer_agent.start_incoming(partition, sources);
        }
    }

    fn retire_partition_replica(&self, partition: u64) {
        let node = match self.node.upgrade() {
            Some(node) => node,
            None => return,
        };
        if let Some(transfer_agent) = node.transfer_agent.get() {
            transfer_agent.stop_incoming(partition);
            transfer_agent.enable_outgoing(partition);
        }
    }

    fn add_site(&self, site_id: &str) {
        let node = match self.node.upgrade() {
            Some(node) => node,
            None => return,
        };
        for partition in node.partitions.numbers() {
            if let Some(held) = node.partitions.get(partition) {
                held.sites().add(site_id);
            }
        }
    }

    fn remove_site(&self, site_id: &str) {
        let node = match self.node.upgrade() {
            Some(node) => node,
            None => return,
        };
        // Storage wipes are slow; keep them off the apply path
        let site_id = site_id.to_string();
        let partitions = node.partitions.clone();
        tokio::task::spawn_blocking(move || {
            for partition in partitions.numbers() {
                if let Some(held) = partitions.get(partition) {
                    if let Err(e) = held.sites().remove(&site_id) {
                        tracing::error!(partition, site = %site_id, error = %e, "site teardown failed");
                    }
                }
            }
        });
    }

    fn set_relay_site(&self, relay_id: &str, site_id: Option<String>) {
        let node = match self.node.upgrade() {
            Some(node) => node,
            None => return,
        };
        if let Ok(mut relays) = node.relay_sites.write() {
            relays.insert(relay_id.to_string(), site_id);
        };
    }

    fn drop_relay(&self, relay_id: &str) {
        let node = match self.node.upgrade() {
            Some(node) => node,
            None => return,
        };
        if let Ok(mut relays) = node.relay_sites.write() {
            relays.remove(relay_id);
        }
        node.disconnect_relay(relay_id);
    }

    fn notify_joined(&self) {
        if let Some(node) = self.node.upgrade() {
            let _ = node.joined.send(true);
        }
    }

    fn notify_removed(&self) {
        if let Some(node) = self.node.upgrade() {
            let _ = node.left_cluster.send(true);
        }
    }

    fn wipe_replicas(&self, present: bool, absent: bool) {
        let node = match self.node.upgrade() {
            Some(node) => node,
            None => return,
        };

        tracing::warn!(node = node.id(), present, absent, "wiping replica data on removal");

        let held = node.partitions.numbers();
        if present {
            if let Some(transfer_agent) = node.transfer_agent.get() {
                transfer_agent.stop_all_transfers();
            }
            for partition in &held {
                node.partitions.remove(*partition);
                if let Some(transfer_agent) = node.transfer_agent.get() {
                    transfer_agent.release_held(*partition);
                }
            }
        }

        let storage = node.storage.clone();
        tokio::task::spawn_blocking(move || {
            let result = if present && absent {
                // Everything under the site store goes
                purge_prefix(storage.as_ref(), &[SITE_STORE_STORAGE_PREFIX])
            } else if present {
                held.iter().try_for_each(|partition| {
                    purge_prefix(storage.as_ref(), &partition_storage_prefix(*partition))
                })
            } else {
                // Absent only: sweep storage for partitions that are no
                // longer materialized
                purge_absent_partitions(storage.as_ref(), &held)
            };
            if let Err(e) = result {
                tracing::error!(error = %e, "replica wipe failed");
            }
        });
    }
}

/// Delete site-store data belonging to partitions outside the `keep` set.
fn purge_absent_partitions(storage: &dyn StorageDriver, keep: &[u64]) -> Result<(), DbError> {
    let mut batch = WriteBatch::new();
    storage.scan_prefix(&[SITE_STORE_STORAGE_PREFIX], &mut |key, _| {
        let partition = key
            .get(1..9)
            .and_then(|raw| <[u8; 8]>::try_from(raw).ok())
            .map(u64::from_be_bytes);
        if let Some(partition) = partition {
            if !keep.contains(&partition) {
                batch.delete(key.to_vec());
            }
        }
        true
    })?;
    if !batch.is_empty() {
        storage.batch(&batch)?;
    }
    Ok(())
}

#[async_trait]
impl ClusterFacade for ClusterNode {
    async fn add_node(&self, node_config: NodeConfig) -> Result<(), DbError> {
        if self.raft_store.is_decommissioning()? {
            return Err(error::E_NODE_DECOMMISSIONING);
        }
        let config_controller = self.config_controller.get().ok_or(error::E_STOPPED)?;
        config_controller.add_node(&self.shutdown.child_token(), node_config).await
    }

    async fn remove_node(
        &self,
        node_id: u64,
        replacement: Option<u64>,
        wipe: bool,
    ) -> Result<(), DbError> {
        let config_controller = self.config_controller.get().ok_or(error::E_STOPPED)?;
        let cancel = self.shutdown.child_token();
        match replacement {
            Some(replacement) => config_controller.replace_node(&cancel, node_id, replacement).await,
            // The endpoint's single wipe toggle covers present and absent
            // replica data alike
            None if wipe => config_controller.force_remove_node(&cancel, node_id, true, true).await,
            None => config_controller.remove_node(&cancel, node_id).await,
        }
    }

    async fn add_site(&self, site_id: &str) -> Result<(), DbError> {
        let config_controller = self.config_controller.get().ok_or(error::E_STOPPED)?;
        config_controller
            .cluster_command(
                &self.shutdown.child_token(),
                ClusterCommand::AddSite { site_id: site_id.to_string() },
            )
            .await
    }

    async fn remove_site(&self, site_id: &str) -> Result<(), DbError> {
        let config_controller = self.config_controller.get().ok_or(error::E_STOPPED)?;
        config_controller
            .cluster_command(
                &self.shutdown.child_token(),
                ClusterCommand::RemoveSite { site_id: site_id.to_string() },
            )
            .await
    }

    async fn add_relay(&self, relay_id: &str) -> Result<(), DbError> {
        let config_controller = self.config_controller.get().ok_or(error::E_STOPPED)?;
        config_controller
            .cluster_command(
                &self.shutdown.child_token(),
                ClusterCommand::AddRelay { relay_id: relay_id.to_string() },
            )
            .await
    }

    async fn remove_relay(&self, relay_id: &str) -> Result<(), DbError> {
        let config_controller = self.config_controller.get().ok_or(error::E_STOPPED)?;
        config_controller
            .cluster_command(
                &self.shutdown.child_token(),
                ClusterCommand::RemoveRelay { relay_id: relay_id.to_string() },
            )
            .await
    }

    async fn move_relay(&self, relay_id: &str, site_id: Option<String>) -> Result<(), DbError> {
        let config_controller = self.config_controller.get().ok_or(error::E_STOPPED)?;
        config_controller
            .cluster_command(
                &self.shutdown.child_token(),
                ClusterCommand::MoveRelay { relay_id: relay_id.to_string(), site_id },
            )
            .await
    }

    fn local_node_id(&self) -> u64 {
        self.id()
    }

    fn peer_address(&self, node_id: u64) -> Option<PeerAddress> {
        let config_controller = self.config_controller.get()?;
        let controller = config_controller.cluster_controller();
        let controller = controller.read().ok()?;
        controller.member_address(node_id)
    }

    async fn batch(
        &self,
        site_id: &str,
        bucket: &str,
        update: &UpdateBatch,
    ) -> Result<BatchResult, DbError> {
        let clusterio = self.clusterio.get().ok_or(error::E_STOPPED)?;
        clusterio.batch(&self.shutdown.child_token(), site_id, bucket, update).await
    }

    async fn get(
        &self,
        site_id: &str,
        bucket: &str,
        keys: &[String],
    ) -> Result<Vec<SiblingSet>, DbError> {
        let clusterio = self.clusterio.get().ok_or(error::E_STOPPED)?;
        clusterio.get(&self.shutdown.child_token(), site_id, bucket, keys).await
    }

    async fn get_matches(
        &self,
        site_id: &str,
        bucket: &str,
        prefixes: &[String],
    ) -> Result<Vec<Row>, DbError> {
        let clusterio = self.clusterio.get().ok_or(error::E_STOPPED)?;
        clusterio
            .get_matches(&self.shutdown.child_token(), site_id, bucket, prefixes)
            .await
    }

    fn local_batch(
        &self,
        partition: u64,
        site_id: &str,
        bucket: &str,
        update: &UpdateBatch,
    ) -> Result<HashMap<String, SiblingSet>, DbError> {
        let held = self.partitions.get(partition).ok_or(error::E_NO_SUCH_PARTITION)?;
        if held.writes_locked() {
            // Mid-handoff: the writer should try another owner
            return Err(error::E_NO_VNODE);
        }
        if !self.holds_partition(partition) {
            return Err(error::E_NO_QUORUM);
        }
        self.local_bucket(partition, site_id, bucket, |bucket| bucket.batch(update))
    }

    fn local_merge(
        &self,
        partition: u64,
        site_id: &str,
        bucket: &str,
        patch: &HashMap<String, SiblingSet>,
    ) -> Result<(), DbError> {
        self.local_bucket(partition, site_id, bucket, |bucket| bucket.merge(patch))?;
        if !self.holds_partition(partition) {
            return Err(error::E_NO_QUORUM);
        }
        Ok(())
    }

    fn local_get(
        &self,
        partition: u64,
        site_id: &str,
        bucket: &str,
        keys: &[String],
    ) -> Result<Vec<SiblingSet>, DbError> {
        self.local_bucket(partition, site_id, bucket, |bucket| bucket.get(keys))
    }

    fn local_get_matches(
        &self,
        partition: u64,
        site_id: &str,
        bucket: &str,
        prefixes: &[String],
    ) -> Result<Vec<Row>, DbError> {
        self.local_bucket(partition, site_id, bucket, |bucket| bucket.get_matches(prefixes))
    }

    fn merkle_depth(&self, site_id: &str, bucket: &str) -> Result<u8, DbError> {
        let partition = self.partition_of(site_id)?;
        self.local_bucket(partition, site_id, bucket, |bucket| Ok(bucket.merkle_depth()))
    }

    fn merkle_node_hash(
        &self,
        site_id: &str,
        bucket: &str,
        node_id: u32,
    ) -> Result<NodeHash, DbError> {
        let partition = self.partition_of(site_id)?;
        self.local_bucket(partition, site_id, bucket, |bucket| bucket.merkle_node_hash(node_id))
    }

    fn merkle_keys(&self, site_id: &str, bucket: &str, node_id: u32) -> Result<Vec<Row>, DbError> {
        let partition = self.partition_of(site_id)?;
        self.local_bucket(partition, site_id, bucket, |bucket| bucket.get_sync_children(node_id))
    }

    fn download_partition(&self, partition: u64) -> Result<Vec<TransferFrame>, DbError> {
        let transfer_agent = self.transfer_agent.get().ok_or(error::E_STOPPED)?;
        transfer_agent.serve_outgoing(partition)
    }

    fn ack_partition_transfer(&self, partition: u64) -> Result<(), DbError> {
        let transfer_agent = self.transfer_agent.get().ok_or(error::E_STOPPED)?;
        transfer_agent.confirm_outgoing(partition);
        Ok(())
    }
}

impl ClusterNode {
    fn partition_of(&self, site_id: &str) -> Result<u64, DbError> {
        let config_controller = self.config_controller.get().ok_or(error::E_STOPPED)?;
        let controller = config_controller.cluster_controller();
        let controller = controller.read().map_err(|_| error::E_STORAGE)?;
        Ok(controller.partition_of_site(site_id))
    }
}
