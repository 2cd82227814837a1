//! Tidepool Model
//!
//! Pure data types for the tidepool system, decoupled from storage engines,
//! transports, and the cluster runtime: the coded error taxonomy, causal
//! clocks (version vectors and dotted version vectors), sibling sets, rows,
//! and update batches.

pub mod error;
pub mod clock;
pub mod sibling;
pub mod batch;
pub mod ids;

pub use error::DbError;
pub use clock::{Dot, Dvv, VersionVector};
pub use sibling::{Sibling, SiblingSet};
pub use batch::{Row, UpdateBatch, UpdateOp, MAX_KEY_LENGTH};
pub use ids::{uuid64, valid_bucket_name, now_millis};
