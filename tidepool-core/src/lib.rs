//! Tidepool Core
//!
//! The node-local data plane: buckets (causal KV namespaces backed by
//! storage and a Merkle tree), the ordered update monitor, sites and site
//! pools, and partitions.

pub mod bucket;
pub mod monitor;
pub mod site;
pub mod partition;

pub use bucket::{Bucket, BucketConfig};
pub use monitor::Monitor;
pub use partition::{Partition, PartitionPool, ReplicaState};
pub use site::{CloudSitePool, RelaySitePool, Site, SiteFactory, SitePool};

/// Length-prefixed name encoding used in the persisted key layout:
/// `len(2B BE) | name`.
pub fn length_prefixed(name: &str) -> Vec<u8> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(2 + bytes.len());
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
    out
}
