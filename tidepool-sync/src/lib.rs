//! Tidepool Sync
//!
//! Anti-entropy between pairs of buckets: proxy abstractions over local and
//! remote buckets, the Merkle-walk session state machine, and the scheduler
//! that fans sessions out across peers under a global cap.

pub mod proxy;
pub mod factory;
pub mod session;
pub mod scheduler;
pub mod controller;

pub use controller::SyncController;
pub use factory::{BucketProxyFactory, CloudBucketProxyFactory, RelayBucketProxyFactory, SyncClient};
pub use proxy::{
    BucketProxy, CloudLocalBucketProxy, CloudRemoteBucketProxy, DummyBucketProxy, RelayBucketProxy,
};
pub use scheduler::{MultiSyncScheduler, SyncJob};
pub use session::{SyncOutcome, SyncSession};

/// Sessions shorter than this churn without making progress.
pub const MIN_SYNC_PERIOD_MS: u64 = 1000;
/// Leaves fetched per session before it yields to the next one.
pub const DEFAULT_SYNC_PATH_LIMIT: u32 = 32;
/// Concurrent sessions across all peers.
pub const DEFAULT_SYNC_MAX_SESSIONS: usize = 8;
