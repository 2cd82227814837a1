//! Message routing between cluster members.
//!
//! The HTTP incarnation of this seam is transport plumbing outside this
//! crate; the in-process [`ClusterNetwork`] broker backs tests, simulations,
//! and single-process clusters.

use crate::raft::message::Envelope;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Best-effort, non-blocking delivery of raft messages. Lost messages are
/// fine; raft retries.
pub trait RaftTransport: Send + Sync {
    fn send(&self, envelope: Envelope);
}

/// Shared in-process broker: each member registers an inbox and sends
/// through a [`NetworkTransport`] handle.
#[derive(Clone, Default)]
pub struct ClusterNetwork {
    inboxes: Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<Envelope>>>>,
}

impl ClusterNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_id: u64) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut inboxes) = self.inboxes.lock() {
            inboxes.insert(node_id, tx);
        }
        rx
    }

    /// Drop a member's inbox; messages to it vanish (simulates a partition
    /// or a stopped node).
    pub fn unregister(&self, node_id: u64) {
        if let Ok(mut inboxes) = self.inboxes.lock() {
            inboxes.remove(&node_id);
        }
    }

    pub fn transport(&self) -> NetworkTransport {
        NetworkTransport { network: self.clone() }
    }
}

#[derive(Clone)]
pub struct NetworkTransport {
    network: ClusterNetwork,
}

impl RaftTransport for NetworkTransport {
    fn send(&self, envelope: Envelope) {
        let inboxes = match self.network.inboxes.lock() {
            Ok(inboxes) => inboxes,
            Err(_) => return,
        };
        if let Some(inbox) = inboxes.get(&envelope.to) {
            // Receiver gone: drop, raft will retry
            let _ = inbox.send(envelope);
        }
    }
}
