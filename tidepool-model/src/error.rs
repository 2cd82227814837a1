//! Coded error values propagated across layers.
//!
//! Every cross-component failure in tidepool is one of a fixed set of named
//! errors carrying a stable integer code. The codes travel over the wire in
//! JSON error bodies, so peers can match on them without string comparison.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use thiserror::Error;

/// A named, coded error value.
///
/// Compare against the constants below (`err == E_NO_SUCH_SITE`). Codes are
/// stable across versions; messages are informational.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message} (code {code})")]
pub struct DbError {
    pub message: Cow<'static, str>,
    pub code: i32,
}

impl DbError {
    pub const fn new(message: &'static str, code: i32) -> Self {
        Self {
            message: Cow::Borrowed(message),
            code,
        }
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn to_json(&self) -> String {
        // Serialization of a flat struct cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

pub const E_EMPTY: DbError = DbError::new("Parameter was empty or nil", 0);
pub const E_LENGTH: DbError = DbError::new("Parameter is too long", 1);
pub const E_NO_VNODE: DbError = DbError::new("This node does not contain keys in this partition", 2);
pub const E_STORAGE: DbError = DbError::new("The storage driver experienced an error", 3);
pub const E_CORRUPTED: DbError = DbError::new("The storage medium is corrupted", 4);
pub const E_INVALID_KEY: DbError = DbError::new("A key was misformatted", 5);
pub const E_INVALID_BUCKET: DbError = DbError::new("An invalid bucket was specified", 6);
pub const E_INVALID_BATCH: DbError = DbError::new("An invalid batch was specified", 7);
pub const E_MERKLE_RANGE: DbError = DbError::new("An invalid merkle node was requested", 8);
pub const E_INVALID_OP: DbError = DbError::new("An invalid operation was specified", 9);
pub const E_INVALID_CONTEXT: DbError = DbError::new("An invalid context was provided in an update", 10);
pub const E_UNAUTHORIZED: DbError = DbError::new("Operation not permitted", 11);
pub const E_INVALID_PEER: DbError = DbError::new("The specified peer is invalid", 12);
pub const E_NODE_DECOMMISSIONING: DbError = DbError::new("This node is in the process of leaving the cluster", 13);
pub const E_PROPOSAL_ERROR: DbError = DbError::new("An error occurred while proposing cluster configuration change", 14);
pub const E_DUPLICATE_NODE_ID: DbError = DbError::new("The ID the node is using was already used by a cluster member at some point", 15);
pub const E_NO_SUCH_SITE: DbError = DbError::new("The specified site does not exist at this node", 16);
pub const E_NO_SUCH_BUCKET: DbError = DbError::new("The site does not contain the specified bucket", 17);
pub const E_NO_SUCH_PARTITION: DbError = DbError::new("This node does not hold the specified partition", 18);
pub const E_NO_QUORUM: DbError = DbError::new("The update was not applied to enough replicas", 19);
pub const E_REMOVED: DbError = DbError::new("This node was removed from the cluster", 20);
pub const E_DECOMMISSIONED: DbError = DbError::new("This node has finished leaving the cluster", 21);
pub const E_CANCELLED: DbError = DbError::new("The operation was cancelled", 22);
pub const E_STOPPED: DbError = DbError::new("The node was stopped", 23);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_and_distinct() {
        let all = [
            E_EMPTY, E_LENGTH, E_NO_VNODE, E_STORAGE, E_CORRUPTED, E_INVALID_KEY,
            E_INVALID_BUCKET, E_INVALID_BATCH, E_MERKLE_RANGE, E_INVALID_OP,
            E_INVALID_CONTEXT, E_UNAUTHORIZED, E_INVALID_PEER, E_NODE_DECOMMISSIONING,
            E_PROPOSAL_ERROR, E_DUPLICATE_NODE_ID, E_NO_SUCH_SITE, E_NO_SUCH_BUCKET,
            E_NO_SUCH_PARTITION, E_NO_QUORUM, E_REMOVED, E_DECOMMISSIONED,
            E_CANCELLED, E_STOPPED,
        ];
        let mut codes: Vec<i32> = all.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn json_round_trip() {
        let encoded = E_NO_SUCH_SITE.to_json();
        let decoded: DbError = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, E_NO_SUCH_SITE);
    }
}
