//! Raft wire messages.

use serde::{Deserialize, Serialize};

/// One replicated log entry. Empty `data` is a leadership no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub index: u64,
    pub term: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RaftMessage {
    Vote {
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
    },
    VoteReply {
        term: u64,
        granted: bool,
    },
    Append {
        term: u64,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<Entry>,
        commit: u64,
    },
    AppendReply {
        term: u64,
        success: bool,
        match_index: u64,
    },
    Snapshot {
        term: u64,
        last_index: u64,
        last_term: u64,
        data: Vec<u8>,
    },
    /// Proposal forwarded from a follower to the leader.
    Propose {
        data: Vec<u8>,
    },
}

impl RaftMessage {
    pub fn term(&self) -> Option<u64> {
        match self {
            RaftMessage::Vote { term, .. }
            | RaftMessage::VoteReply { term, .. }
            | RaftMessage::Append { term, .. }
            | RaftMessage::AppendReply { term, .. }
            | RaftMessage::Snapshot { term, .. } => Some(*term),
            RaftMessage::Propose { .. } => None,
        }
    }
}

/// A routed message between two cluster members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: u64,
    pub to: u64,
    pub message: RaftMessage,
}
