//! Small shared helpers: node ids, name validation, wall clock.

use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Generate a random non-zero 64-bit node id. Zero is reserved to mean
/// "unassigned" in the raft store metadata.
pub fn uuid64() -> u64 {
    let mut rng = rand::thread_rng();
    loop {
        let id: u64 = rng.gen();
        if id != 0 {
            return id;
        }
    }
}

/// Bucket names: `[A-Za-z0-9_.-]+`.
pub fn valid_bucket_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-')
}

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
