//! Multi-node scenarios over the in-process fabric: bootstrap, join with
//! partition handoff, quorum writes, decommission drain, and relay sync.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tidepool_cluster::raft::ClusterNetwork;
use tidepool_cluster::{ClusterSettings, PeerAddress};
use tidepool_core::{RelaySitePool, SiteFactory, SitePool};
use tidepool_model::{error, SiblingSet, UpdateBatch};
use tidepool_node::{ClusterFacade, ClusterNode, ClusterNodeConfig, NodeHub, NodeInitializationOptions};
use tidepool_storage::MemoryStorageDriver;
use tidepool_sync::{BucketProxyFactory, RelayBucketProxyFactory};

struct Cluster {
    network: ClusterNetwork,
    hub: Arc<NodeHub>,
    next_port: u16,
}

impl Cluster {
    fn new() -> Self {
        Self {
            network: ClusterNetwork::new(),
            hub: Arc::new(NodeHub::new()),
            next_port: 9000,
        }
    }

    fn node(&mut self, capacity: u64) -> Arc<ClusterNode> {
        let port = self.next_port;
        self.next_port += 1;
        ClusterNode::new(ClusterNodeConfig {
            storage: Arc::new(MemoryStorageDriver::new()),
            host: "localhost".to_string(),
            port,
            capacity,
            merkle_depth: 4,
            network: self.network.clone(),
            hub: self.hub.clone(),
            sync_period: Duration::from_secs(1),
            sync_max_sessions: 4,
            sync_path_limit: 16,
        })
    }
}

fn bootstrap_options(replication_factor: u64, partitions: u64) -> NodeInitializationOptions {
    NodeInitializationOptions {
        start_cluster: true,
        seed: None,
        cluster_settings: ClusterSettings { replication_factor, partitions },
    }
}

fn join_options(seed: &Arc<ClusterNode>) -> NodeInitializationOptions {
    NodeInitializationOptions {
        start_cluster: false,
        seed: Some(PeerAddress {
            node_id: seed.id(),
            host: "localhost".to_string(),
            port: 0,
        }),
        cluster_settings: ClusterSettings::default(),
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting: {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn spawn(node: &Arc<ClusterNode>, options: NodeInitializationOptions) {
    let node = node.clone();
    tokio::spawn(async move {
        let _ = node.start(options).await;
    });
}

fn members_of(node: &Arc<ClusterNode>) -> Vec<u64> {
    node.config_controller()
        .map(|config_controller| {
            let controller = config_controller.cluster_controller();
            let controller = controller.read().unwrap();
            controller.member_ids()
        })
        .unwrap_or_default()
}

fn tokens_of(node: &Arc<ClusterNode>, owner: u64) -> usize {
    node.config_controller()
        .map(|config_controller| {
            let controller = config_controller.cluster_controller();
            let controller = controller.read().unwrap();
            controller.state.tokens.iter().filter(|o| **o == owner).count()
        })
        .unwrap_or(0)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bootstrap_single_node_materializes_all_partitions() {
    let mut cluster = Cluster::new();
    let node = cluster.node(1);
    spawn(&node, bootstrap_options(1, 64));

    wait_until("node joins its own cluster", || !members_of(&node).is_empty()).await;
    wait_until("all partitions materialize", || node.partitions().len() == 64).await;

    assert_eq!(members_of(&node), vec![node.id()]);
    assert_eq!(tokens_of(&node, node.id()), 64);

    node.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_node_joins_and_takes_half_the_ring() {
    let mut cluster = Cluster::new();
    let a = cluster.node(1);
    spawn(&a, bootstrap_options(1, 16));
    wait_until("seed bootstraps", || node_partition_count(&a) == 16).await;

    // Seed some data so the handoff moves real content
    a.add_site("site1").await.unwrap();
    a.batch("site1", "default", &UpdateBatch::new().put("k", b"v".to_vec(), ""))
        .await
        .unwrap();

    let b = cluster.node(1);
    spawn(&b, join_options(&a));

    wait_until("tokens split evenly", || {
        tokens_of(&a, a.id()) == 8 && tokens_of(&a, b.id()) == 8
    })
    .await;
    wait_until("b materializes its partitions", || node_partition_count(&b) == 8).await;
    wait_until("a drains transferred partitions", || node_partition_count(&a) == 8).await;

    // Both nodes agree on the configuration
    let state_a = a.config_controller().unwrap().cluster_controller();
    let state_b = b.config_controller().unwrap().cluster_controller();
    assert_eq!(state_a.read().unwrap().state, state_b.read().unwrap().state);

    // The data survived the handoff wherever it landed
    let got = b.get("site1", "default", &["k".to_string()]).await.unwrap();
    assert_eq!(got[0].live_values(), vec![b"v".as_slice()]);

    a.stop();
    b.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn quorum_batch_applies_on_all_replicas() {
    let mut cluster = Cluster::new();
    let a = cluster.node(1);
    spawn(&a, bootstrap_options(3, 16));
    wait_until("seed bootstraps", || node_partition_count(&a) == 16).await;

    let b = cluster.node(1);
    let c = cluster.node(1);
    spawn(&b, join_options(&a));
    spawn(&c, join_options(&a));

    // With RF=3 and three nodes every node owns every partition
    wait_until("all nodes own all partitions", || {
        node_partition_count(&b) == 16 && node_partition_count(&c) == 16
    })
    .await;

    a.add_site("site1").await.unwrap();
    wait_until("site propagates", || {
        [&a, &b, &c].iter().all(|node| {
            node.partitions()
                .numbers()
                .iter()
                .all(|p| node.partitions().get(*p).unwrap().sites().contains("site1"))
        })
    })
    .await;

    let result = a
        .batch("site1", "default", &UpdateBatch::new().put("k", b"v".to_vec(), ""))
        .await
        .unwrap();
    assert_eq!(result.replicas, 3);
    assert_eq!(result.n_applied, 3);

    // Reading from any node returns the sibling
    for node in [&a, &b, &c] {
        let got = node.get("site1", "default", &["k".to_string()]).await.unwrap();
        assert_eq!(got[0].live_values(), vec![b"v".as_slice()]);
    }

    // Unknown site surfaces the terminal error
    let missing = a
        .batch("nope", "default", &UpdateBatch::new().put("k", b"v".to_vec(), ""))
        .await;
    assert_eq!(missing.err(), Some(error::E_NO_SUCH_SITE));

    a.stop();
    b.stop();
    c.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn decommission_drains_and_leaves() {
    let mut cluster = Cluster::new();
    let a = cluster.node(1);
    spawn(&a, bootstrap_options(2, 16));
    wait_until("seed bootstraps", || node_partition_count(&a) == 16).await;

    let b = cluster.node(1);
    let c = cluster.node(1);
    spawn(&b, join_options(&a));
    spawn(&c, join_options(&a));
    wait_until("cluster converges to three members", || members_of(&a).len() == 3).await;
    wait_until("replicas settle", || {
        node_partition_count(&a) + node_partition_count(&b) + node_partition_count(&c) == 32
    })
    .await;

    a.add_site("site1").await.unwrap();
    a.batch("site1", "default", &UpdateBatch::new().put("k", b"v".to_vec(), ""))
        .await
        .unwrap();

    let mut result = b.leave_cluster().unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if let Some(outcome) = result.borrow().clone() {
                break outcome;
            }
            result.changed().await.unwrap();
        }
    })
    .await
    .expect("decommission never finished");
    assert_eq!(outcome, error::E_DECOMMISSIONED);

    wait_until("b leaves the membership", || {
        members_of(&a).len() == 2 && !members_of(&a).contains(&b.id())
    })
    .await;
    assert_eq!(tokens_of(&a, b.id()), 0);

    // Data remains readable from the survivors
    let got = a.get("site1", "default", &["k".to_string()]).await.unwrap();
    assert_eq!(got[0].live_values(), vec![b"v".as_slice()]);

    a.stop();
    b.stop();
    c.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forced_removal_with_wipe_destroys_local_replicas() {
    let mut cluster = Cluster::new();
    let a = cluster.node(1);
    spawn(&a, bootstrap_options(2, 16));
    wait_until("seed bootstraps", || node_partition_count(&a) == 16).await;

    let b = cluster.node(1);
    let c = cluster.node(1);
    spawn(&b, join_options(&a));
    spawn(&c, join_options(&a));
    wait_until("cluster converges to three members", || members_of(&a).len() == 3).await;
    wait_until("replicas settle", || {
        node_partition_count(&a) + node_partition_count(&b) + node_partition_count(&c) == 32
    })
    .await;

    a.add_site("site1").await.unwrap();
    a.batch("site1", "default", &UpdateBatch::new().put("k", b"v".to_vec(), ""))
        .await
        .unwrap();

    // Force b out, wiping whatever it holds
    a.remove_node(b.id(), None, true).await.unwrap();

    wait_until("b leaves the membership", || !members_of(&a).contains(&b.id())).await;
    wait_until("b's replicas are wiped", || node_partition_count(&b) == 0).await;

    // The survivors still serve the data through quorum reads
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        if let Ok(got) = a.get("site1", "default", &["k".to_string()]).await {
            if got[0].live_values() == vec![b"v".as_slice()] {
                break;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "data lost after forced removal");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    a.stop();
    b.stop();
    c.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn relay_data_syncs_into_the_cloud() {
    let mut cluster = Cluster::new();
    let node = cluster.node(1);
    spawn(&node, bootstrap_options(1, 16));
    wait_until("node bootstraps", || node_partition_count(&node) == 16).await;

    node.add_site("site1").await.unwrap();
    node.add_relay("relay-1").await.unwrap();
    node.move_relay("relay-1", Some("site1".to_string())).await.unwrap();
    wait_until("site lands in partition pools", || {
        node.partitions()
            .numbers()
            .iter()
            .all(|p| node.partitions().get(*p).unwrap().sites().contains("site1"))
    })
    .await;

    // The relay's side: a single-site pool with local data
    let relay_storage = Arc::new(MemoryStorageDriver::new());
    let relay_site = SiteFactory::new(relay_storage, 4, "relay-1").create("").unwrap();
    let relay_sites: Arc<dyn SitePool> = Arc::new(RelaySitePool::new(relay_site));
    {
        let site = relay_sites.acquire("").unwrap();
        site.bucket("default")
            .unwrap()
            .batch(&UpdateBatch::new().put("sensor", b"21.5".to_vec(), ""))
            .unwrap();
        relay_sites.release("");
    }

    // Unknown relays are rejected
    let relay_factory = Arc::new(RelayBucketProxyFactory { sites: relay_sites.clone() });
    let unknown = node.connect_relay("intruder", relay_factory.clone());
    assert_eq!(unknown.err(), Some(error::E_UNAUTHORIZED));
    let unknown_push = node.relay_push("intruder", "default", &Default::default()).await;
    assert_eq!(unknown_push.err(), Some(error::E_UNAUTHORIZED));

    node.connect_relay("relay-1", relay_factory.clone()).unwrap();

    // Relay → cloud: pushed updates write through the quorum merge path
    let pushed: HashMap<String, SiblingSet> = {
        let site = relay_sites.acquire("").unwrap();
        let rows = site.bucket("default").unwrap().get_matches(&["sensor".to_string()]).unwrap();
        relay_sites.release("");
        rows.into_iter().map(|row| (row.key, row.siblings)).collect()
    };
    node.relay_push("relay-1", "default", &pushed).await.unwrap();

    let got = node.get("site1", "default", &["sensor".to_string()]).await.unwrap();
    assert_eq!(got[0].live_values(), vec![b"21.5".as_slice()]);

    // Cloud → relay: write cloud-side, then run one initiator session from
    // the relay's perspective against the cloud's read surface
    node.batch("site1", "default", &UpdateBatch::new().put("config", b"on".to_vec(), ""))
        .await
        .unwrap();

    let cloud_factory = tidepool_sync::CloudBucketProxyFactory::new(
        cluster.hub.clone(),
        node.config_controller().unwrap().cluster_controller(),
        node.partitions().clone(),
    );
    let relay_proxy = relay_factory.create_bucket_proxy("relay-1", "default").await.unwrap();
    let cloud_proxy = cloud_factory.create_bucket_proxy("relay-1", "default").await.unwrap();
    let outcome = tidepool_sync::SyncSession::new(16)
        .run(&*relay_proxy, &*cloud_proxy)
        .await
        .unwrap();
    assert!(outcome.completed);
    relay_proxy.close();
    cloud_proxy.close();

    let site = relay_sites.acquire("").unwrap();
    let got = site.bucket("default").unwrap().get(&["config".to_string()]).unwrap();
    relay_sites.release("");
    assert_eq!(got[0].live_values(), vec![b"on".as_slice()]);

    node.stop();
}

fn node_partition_count(node: &Arc<ClusterNode>) -> usize {
    node.partitions().len()
}
