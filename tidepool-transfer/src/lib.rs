//! Tidepool Transfer
//!
//! Moves the full content of a partition replica between nodes during
//! rebalancing and decommissioning: consistent snapshot framing on the
//! source, merge-on-arrival on the destination, and the held-replica set
//! whose emptiness gates decommission.

pub mod frame;
pub mod agent;

pub use agent::{TransferAgent, TransferClient};
pub use frame::{apply_frames, decode_frames, encode_frames, snapshot_partition, TransferFrame};
