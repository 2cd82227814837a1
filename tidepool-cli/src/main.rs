//! tidepoold — the tidepool cluster node daemon.
//!
//! `tidepoold start --conf <file>` loads the config, opens storage, starts
//! the node, and blocks until shutdown or removal from the cluster.

mod config;

use clap::{Parser, Subcommand};
use config::ServerConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tidepool_cluster::raft::ClusterNetwork;
use tidepool_cluster::{ClusterSettings, PeerAddress};
use tidepool_model::error;
use tidepool_node::{ClusterNode, ClusterNodeConfig, NodeHub, NodeInitializationOptions};
use tidepool_storage::RedbStorageDriver;
use tracing_subscriber::EnvFilter;

// Exit codes surfaced to process supervisors
const EXIT_FATAL: i32 = 1;
const EXIT_CORRUPTED: i32 = 2;
const EXIT_DUPLICATE_ID: i32 = 3;
const EXIT_REMOVED: i32 = 4;

#[derive(Parser, Debug)]
#[command(name = "tidepoold", version, about = "Tidepool cluster node")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a cluster node
    Start {
        /// Path to the JSON config file
        #[arg(long, short)]
        conf: PathBuf,
    },
}

fn main() {
    let args = Args::parse();
    match args.command {
        Command::Start { conf } => {
            let config = match ServerConfig::load(&conf) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("{e}");
                    std::process::exit(EXIT_FATAL);
                }
            };
            init_tracing(&config.log_level);
            std::process::exit(run(config));
        }
    }
}

fn init_tracing(level: &str) {
    let mut filter = EnvFilter::from_default_env();
    if std::env::var("RUST_LOG").is_err() {
        if let Ok(directive) = level.parse() {
            filter = filter.add_directive(directive);
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run(config: ServerConfig) -> i32 {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "unable to start runtime");
            return EXIT_FATAL;
        }
    };

    runtime.block_on(async move {
        tracing::info!(version = env!("CARGO_PKG_VERSION"), "tidepoold starting");

        let node = ClusterNode::new(ClusterNodeConfig {
            storage: Arc::new(RedbStorageDriver::new(&config.storage_path)),
            host: config.host.clone(),
            port: config.port,
            capacity: config.capacity,
            merkle_depth: config.merkle_depth,
            network: ClusterNetwork::new(),
            hub: Arc::new(NodeHub::new()),
            sync_period: Duration::from_millis(config.sync_period_ms),
            sync_max_sessions: config.sync_max_sessions,
            sync_path_limit: config.sync_path_limit,
        });

        let options = NodeInitializationOptions {
            start_cluster: config.start_cluster,
            seed: config.seed.as_ref().map(|seed| PeerAddress {
                node_id: 0,
                host: seed.host.clone(),
                port: seed.port,
            }),
            cluster_settings: ClusterSettings {
                replication_factor: config.replication_factor,
                partitions: config.partitions,
            },
        };

        {
            let node = node.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                tracing::info!("shutdown signal received");
                node.stop();
            });
        }

        match node.start(options).await {
            Ok(()) => {
                tracing::info!("tidepoold stopped");
                0
            }
            Err(e) if e == error::E_REMOVED || e == error::E_DECOMMISSIONED => {
                tracing::info!("node left the cluster");
                EXIT_REMOVED
            }
            Err(e) if e == error::E_DUPLICATE_NODE_ID => {
                tracing::error!("node id already in use by the cluster");
                EXIT_DUPLICATE_ID
            }
            Err(e) if e == error::E_CORRUPTED || e == error::E_STORAGE => {
                tracing::error!(error = %e, "storage failure");
                EXIT_CORRUPTED
            }
            Err(e) => {
                tracing::error!(error = %e, "node stopped with error");
                EXIT_FATAL
            }
        }
    })
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sigint) => sigint,
            Err(_) => return std::future::pending().await,
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(_) => return std::future::pending().await,
        };
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
