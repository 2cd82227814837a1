//! Update batches and rows.

use crate::clock::Dvv;
use crate::error::{self, DbError};
use crate::sibling::SiblingSet;
use serde::{Deserialize, Serialize};

/// Longest key accepted anywhere in the system, in bytes.
pub const MAX_KEY_LENGTH: usize = 1024;

/// One stored key: its monotonically assigned local version and the current
/// sibling set. The local version is the bucket's change-feed clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub key: String,
    pub local_version: u64,
    pub siblings: SiblingSet,
}

/// A single operation in an update batch. `context` is the serialized
/// [`Dvv`](crate::clock::Dvv) the writer observed; empty means "no prior
/// knowledge".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum UpdateOp {
    Put {
        key: String,
        value: Vec<u8>,
        context: String,
    },
    Delete {
        key: String,
        context: String,
    },
}

impl UpdateOp {
    pub fn key(&self) -> &str {
        match self {
            UpdateOp::Put { key, .. } => key,
            UpdateOp::Delete { key, .. } => key,
        }
    }

    pub fn context(&self) -> &str {
        match self {
            UpdateOp::Put { context, .. } => context,
            UpdateOp::Delete { context, .. } => context,
        }
    }

    pub fn value(&self) -> Option<&[u8]> {
        match self {
            UpdateOp::Put { value, .. } => Some(value),
            UpdateOp::Delete { .. } => None,
        }
    }

    /// Decode the op's context. An empty string is the empty clock.
    pub fn decode_context(&self) -> Result<Dvv, DbError> {
        let raw = self.context();
        if raw.is_empty() {
            return Ok(Dvv::default());
        }
        serde_json::from_str(raw).map_err(|_| error::E_INVALID_CONTEXT)
    }
}

/// An ordered list of per-key operations applied atomically to one bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateBatch {
    pub ops: Vec<UpdateOp>,
}

impl UpdateBatch {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    pub fn put(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>, context: impl Into<String>) -> Self {
        self.ops.push(UpdateOp::Put {
            key: key.into(),
            value: value.into(),
            context: context.into(),
        });
        self
    }

    pub fn delete(mut self, key: impl Into<String>, context: impl Into<String>) -> Self {
        self.ops.push(UpdateOp::Delete {
            key: key.into(),
            context: context.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Check every op before any of them is applied.
    pub fn validate(&self) -> Result<(), DbError> {
        if self.ops.is_empty() {
            return Err(error::E_INVALID_BATCH);
        }

        for op in &self.ops {
            if op.key().is_empty() {
                return Err(error::E_EMPTY);
            }
            if op.key().len() > MAX_KEY_LENGTH {
                return Err(error::E_LENGTH);
            }
            op.decode_context()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_batch_is_invalid() {
        assert_eq!(UpdateBatch::new().validate(), Err(error::E_INVALID_BATCH));
    }

    #[test]
    fn empty_key_rejected() {
        let batch = UpdateBatch::new().put("", b"v".to_vec(), "");
        assert_eq!(batch.validate(), Err(error::E_EMPTY));
    }

    #[test]
    fn oversized_key_rejected() {
        let key = "k".repeat(MAX_KEY_LENGTH + 1);
        let batch = UpdateBatch::new().delete(key, "");
        assert_eq!(batch.validate(), Err(error::E_LENGTH));
    }

    #[test]
    fn garbage_context_rejected() {
        let batch = UpdateBatch::new().put("k", b"v".to_vec(), "not json");
        assert_eq!(batch.validate(), Err(error::E_INVALID_CONTEXT));
    }

    #[test]
    fn empty_context_means_no_prior_knowledge() {
        let batch = UpdateBatch::new().put("k", b"v".to_vec(), "");
        assert!(batch.validate().is_ok());
        assert_eq!(batch.ops[0].decode_context().unwrap(), Dvv::default());
    }

    #[test]
    fn round_trips_as_json() {
        let batch = UpdateBatch::new()
            .put("a", b"1".to_vec(), "")
            .delete("b", "");
        let encoded = serde_json::to_string(&batch).unwrap();
        let decoded: UpdateBatch = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, batch);
    }
}
