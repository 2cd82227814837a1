//! Sites: per-tenant bucket collections, and the pools that cache them.

use crate::bucket::{Bucket, BucketConfig};
use crate::length_prefixed;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tidepool_model::DbError;
use tidepool_storage::{purge_prefix, PrefixedStorageDriver, SharedStorageDriver};

/// The bucket set every site carries, with its relay replication policy:
/// (name, relay→cloud allowed, cloud→relay allowed).
const SITE_BUCKETS: &[(&str, bool, bool)] = &[
    ("default", true, true),
    ("lww", true, true),
    ("cloud", false, true),
    ("local", false, false),
];

/// A tenant namespace: a fixed set of named buckets.
pub struct Site {
    id: String,
    buckets: HashMap<String, Arc<Bucket>>,
}

impl Site {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bucket(&self, name: &str) -> Option<Arc<Bucket>> {
        self.buckets.get(name).cloned()
    }

    pub fn bucket_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buckets.keys().cloned().collect();
        names.sort();
        names
    }

    /// Buckets a relay may push into.
    pub fn incoming_buckets(&self) -> HashSet<String> {
        self.buckets
            .values()
            .filter(|b| b.replicates_incoming())
            .map(|b| b.name().to_string())
            .collect()
    }

    /// Buckets this node may push to a relay.
    pub fn outgoing_buckets(&self) -> HashSet<String> {
        self.buckets
            .values()
            .filter(|b| b.replicates_outgoing())
            .map(|b| b.name().to_string())
            .collect()
    }
}

/// Builds sites under a partition's storage prefix. Bucket storage lands at
/// `site-len(2B) | site | bucket-len(2B) | bucket | …`.
#[derive(Clone)]
pub struct SiteFactory {
    storage: SharedStorageDriver,
    merkle_depth: u8,
    node_name: String,
}

impl SiteFactory {
    pub fn new(storage: SharedStorageDriver, merkle_depth: u8, node_name: impl Into<String>) -> Self {
        Self {
            storage,
            merkle_depth,
            node_name: node_name.into(),
        }
    }

    pub fn site_prefix(site_id: &str) -> Vec<u8> {
        length_prefixed(site_id)
    }

    pub fn create(&self, site_id: &str) -> Result<Site, DbError> {
        let site_storage: SharedStorageDriver = Arc::new(PrefixedStorageDriver::new(
            Self::site_prefix(site_id),
            self.storage.clone(),
        ));

        let mut buckets = HashMap::new();
        for (name, incoming, outgoing) in SITE_BUCKETS {
            let bucket_storage: SharedStorageDriver = Arc::new(PrefixedStorageDriver::new(
                length_prefixed(name),
                site_storage.clone(),
            ));
            let bucket = Bucket::open(
                BucketConfig {
                    name: name.to_string(),
                    node_name: self.node_name.clone(),
                    merkle_depth: self.merkle_depth,
                    replicate_incoming: *incoming,
                    replicate_outgoing: *outgoing,
                },
                bucket_storage,
            )?;
            buckets.insert(name.to_string(), Arc::new(bucket));
        }

        Ok(Site {
            id: site_id.to_string(),
            buckets,
        })
    }
}

/// A cacheable collection of sites. Callers pair every `acquire` with a
/// `release`; the pool may evict an unreferenced site's in-memory state.
pub trait SitePool: Send + Sync {
    fn acquire(&self, site_id: &str) -> Option<Arc<Site>>;
    fn release(&self, site_id: &str);
    fn add(&self, site_id: &str);
    fn remove(&self, site_id: &str) -> Result<(), DbError>;
    fn contains(&self, site_id: &str) -> bool;
    fn site_ids(&self) -> Vec<String>;
}

struct CloudSiteEntry {
    site: Option<Arc<Site>>,
    refs: usize,
}

/// Site pool for one locally held partition. Membership is driven by the
/// cluster config (the coordinator calls `add`/`remove`); the in-memory
/// site materializes lazily on first acquire.
pub struct CloudSitePool {
    factory: SiteFactory,
    entries: Mutex<HashMap<String, CloudSiteEntry>>,
}

impl CloudSitePool {
    pub fn new(factory: SiteFactory) -> Self {
        Self {
            factory,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn storage(&self) -> &SharedStorageDriver {
        &self.factory.storage
    }
}

impl SitePool for CloudSitePool {
    fn acquire(&self, site_id: &str) -> Option<Arc<Site>> {
        let mut entries = self.entries.lock().ok()?;
        let entry = entries.get_mut(site_id)?;

        if entry.site.is_none() {
            match self.factory.create(site_id) {
                Ok(site) => entry.site = Some(Arc::new(site)),
                Err(e) => {
                    tracing::error!(site = site_id, error = %e, "unable to materialize site");
                    return None;
                }
            }
        }

        entry.refs += 1;
        entry.site.clone()
    }

    fn release(&self, site_id: &str) {
        let mut entries = match self.entries.lock() {
            Ok(e) => e,
            Err(_) => return,
        };
        if let Some(entry) = entries.get_mut(site_id) {
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 {
                entry.site = None;
            }
        }
    }

    fn add(&self, site_id: &str) {
        let mut entries = match self.entries.lock() {
            Ok(e) => e,
            Err(_) => return,
        };
        entries
            .entry(site_id.to_string())
            .or_insert(CloudSiteEntry { site: None, refs: 0 });
    }

    fn remove(&self, site_id: &str) -> Result<(), DbError> {
        {
            let mut entries = self.entries.lock().map_err(|_| tidepool_model::error::E_STORAGE)?;
            entries.remove(site_id);
        }
        purge_prefix(self.storage().as_ref(), &SiteFactory::site_prefix(site_id))
    }

    fn contains(&self, site_id: &str) -> bool {
        self.entries
            .lock()
            .map(|e| e.contains_key(site_id))
            .unwrap_or(false)
    }

    fn site_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .lock()
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

/// Site pool for a relay: exactly one site, whatever id is asked for.
pub struct RelaySitePool {
    site: Arc<Site>,
}

impl RelaySitePool {
    pub fn new(site: Site) -> Self {
        Self { site: Arc::new(site) }
    }
}

impl SitePool for RelaySitePool {
    fn acquire(&self, _site_id: &str) -> Option<Arc<Site>> {
        Some(self.site.clone())
    }

    fn release(&self, _site_id: &str) {}

    fn add(&self, _site_id: &str) {}

    fn remove(&self, _site_id: &str) -> Result<(), DbError> {
        Ok(())
    }

    fn contains(&self, _site_id: &str) -> bool {
        true
    }

    fn site_ids(&self) -> Vec<String> {
        vec![self.site.id().to_string()]
    }
}
