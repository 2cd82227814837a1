//! The config controller: the raft runtime wrapped around the cluster
//! controller.
//!
//! One driver task owns the raft core and the replicated state machine. It
//! selects over inbound raft messages, a tick interval, and proposal
//! requests; committed commands apply to the [`ClusterController`] in log
//! order and each commit's deltas fire the local delta handler serially.

use crate::command::ClusterCommand;
use crate::controller::ClusterController;
use crate::delta::ClusterStateDelta;
use crate::raft::{Envelope, RaftMessage, RaftNode, RaftOutput, RaftStore, RaftTransport};
use crate::state::ClusterState;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tidepool_model::{error, uuid64, DbError};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

const TICK_INTERVAL: Duration = Duration::from_millis(50);
const PROPOSAL_TIMEOUT: Duration = Duration::from_secs(10);
const RESUBMIT_INTERVAL: Duration = Duration::from_millis(500);
/// Snapshot the cluster state every this many applied commands.
const SNAPSHOT_INTERVAL: u64 = 64;

/// Callback invoked with each commit's delta batch, in log order.
pub type DeltaHandler = Box<dyn Fn(&[ClusterStateDelta]) + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Proposal {
    id: u64,
    command: ClusterCommand,
}

#[derive(Debug, Clone)]
pub struct ConfigControllerConfig {
    pub local_id: u64,
    pub create_cluster: bool,
}

enum Control {
    Propose {
        proposal_id: u64,
        data: Vec<u8>,
        resp: oneshot::Sender<Result<(), DbError>>,
    },
}

struct DriverParts {
    raft: RaftNode,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    cmd_rx: mpsc::UnboundedReceiver<Control>,
    applied: HashSet<u64>,
}

pub struct ConfigController {
    local_id: u64,
    controller: Arc<RwLock<ClusterController>>,
    store: RaftStore,
    transport: Arc<dyn RaftTransport>,
    cmd_tx: mpsc::UnboundedSender<Control>,
    cancel: CancellationToken,
    parts: Mutex<Option<DriverParts>>,
    handler: Mutex<Option<DeltaHandler>>,
    driver: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ConfigController {
    /// Build the controller, replaying any persisted snapshot and committed
    /// log entries into the in-memory cluster state. No callbacks fire for
    /// replayed history; callers read the resulting state directly.
    pub fn new(
        config: ConfigControllerConfig,
        store: RaftStore,
        transport: Arc<dyn RaftTransport>,
        inbox: mpsc::UnboundedReceiver<Envelope>,
    ) -> Result<Self, DbError> {
        let raft = RaftNode::new(config.local_id, store.clone(), config.create_cluster)?;
        let mut controller = ClusterController::new(config.local_id);
        let mut applied = HashSet::new();

        if let Some(snapshot) = store.snapshot()? {
            let state: ClusterState =
                serde_json::from_slice(&snapshot.data).map_err(|_| error::E_CORRUPTED)?;
            controller.install(state);
        }

        for entry in raft.replay_entries()? {
            if entry.index > raft.commit_index() || entry.data.is_empty() {
                continue;
            }
            if let Ok(proposal) = serde_json::from_slice::<Proposal>(&entry.data) {
                if applied.insert(proposal.id) {
                    // Historical commands re-apply deterministically;
                    // rejections replay as rejections
                    let _ = controller.apply(&proposal.command);
                }
            }
        }

        let mut raft = raft;
        raft.set_peers(controller.member_ids());

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        Ok(Self {
            local_id: config.local_id,
            controller: Arc::new(RwLock::new(controller)),
            store,
            transport,
            cmd_tx,
            cancel: CancellationToken::new(),
            parts: Mutex::new(Some(DriverParts { raft, inbox, cmd_rx, applied })),
            handler: Mutex::new(None),
            driver: Mutex::new(None),
        })
    }

    /// Register the local delta handler. Must precede [`start`](Self::start).
    pub fn on_local_deltas(&self, handler: DeltaHandler) {
        if let Ok(mut slot) = self.handler.lock() {
            *slot = Some(handler);
        }
    }

    /// Spawn the driver task. Idempotent.
    pub fn start(&self) {
        let parts = match self.parts.lock().ok().and_then(|mut p| p.take()) {
            Some(parts) => parts,
            None => return,
        };
        let handler = self.handler.lock().ok().and_then(|mut h| h.take());

        let mut driver = Driver {
            local_id: self.local_id,
            raft: parts.raft,
            inbox: parts.inbox,
            cmd_rx: parts.cmd_rx,
            transport: self.transport.clone(),
            controller: self.controller.clone(),
            handler,
            pending: HashMap::new(),
            applied: parts.applied,
            in_flight: HashSet::new(),
            applied_since_snapshot: 0,
        };

        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            driver.run(cancel).await;
        });
        if let Ok(mut slot) = self.driver.lock() {
            *slot = Some(handle);
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        if let Ok(mut slot) = self.driver.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }

    pub fn local_node_id(&self) -> u64 {
        self.local_id
    }

    pub fn cluster_controller(&self) -> Arc<RwLock<ClusterController>> {
        self.controller.clone()
    }

    pub fn raft_store(&self) -> RaftStore {
        self.store.clone()
    }

    /// Propose a command and wait for it to commit and apply locally.
    pub async fn cluster_command(
        &self,
        cancel: &CancellationToken,
        command: ClusterCommand,
    ) -> Result<(), DbError> {
        let proposal = Proposal { id: uuid64(), command };
        let data = serde_json::to_vec(&proposal).map_err(|_| error::E_PROPOSAL_ERROR)?;

        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Control::Propose { proposal_id: proposal.id, data, resp: tx })
            .map_err(|_| error::E_STOPPED)?;

        tokio::select! {
            _ = cancel.cancelled() => Err(error::E_CANCELLED),
            _ = self.cancel.cancelled() => Err(error::E_STOPPED),
            result = rx => result.map_err(|_| error::E_STOPPED)?,
        }
    }

    pub async fn add_node(
        &self,
        cancel: &CancellationToken,
        node_config: crate::state::NodeConfig,
    ) -> Result<(), DbError> {
        self.cluster_command(cancel, ClusterCommand::AddNode { node_config }).await
    }

    pub async fn remove_node(&self, cancel: &CancellationToken, node_id: u64) -> Result<(), DbError> {
        self.cluster_command(
            cancel,
            ClusterCommand::RemoveNode {
                node_id,
                replacement_node_id: None,
                wipe_present_replicas: false,
                wipe_absent_replicas: false,
            },
        )
        .await
    }

    /// Remove a node and instruct it to destroy its replica data: the
    /// forced-decommission path (`DELETE /cluster/nodes/{id}?wipe=true`).
    pub async fn force_remove_node(
        &self,
        cancel: &CancellationToken,
        node_id: u64,
        wipe_present_replicas: bool,
        wipe_absent_replicas: bool,
    ) -> Result<(), DbError> {
        self.cluster_command(
            cancel,
            ClusterCommand::RemoveNode {
                node_id,
                replacement_node_id: None,
                wipe_present_replicas,
                wipe_absent_replicas,
            },
        )
        .await
    }

    pub async fn replace_node(
        &self,
        cancel: &CancellationToken,
        node_id: u64,
        replacement_node_id: u64,
    ) -> Result<(), DbError> {
        self.cluster_command(
            cancel,
            ClusterCommand::RemoveNode {
                node_id,
                replacement_node_id: Some(replacement_node_id),
                wipe_present_replicas: false,
                wipe_absent_replicas: false,
            },
        )
        .await
    }
}

struct Pending {
    resp: oneshot::Sender<Result<(), DbError>>,
    data: Vec<u8>,
    deadline: Instant,
    last_submit: Option<Instant>,
}

struct Driver {
    local_id: u64,
    raft: RaftNode,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    cmd_rx: mpsc::UnboundedReceiver<Control>,
    transport: Arc<dyn RaftTransport>,
    controller: Arc<RwLock<ClusterController>>,
    handler: Option<DeltaHandler>,
    pending: HashMap<u64, Pending>,
    /// Proposal ids already applied to the state machine.
    applied: HashSet<u64>,
    /// Proposal ids appended locally but not yet committed.
    in_flight: HashSet<u64>,
    applied_since_snapshot: u64,
}

impl Driver {
    async fn run(&mut self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let outputs = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    self.expire_and_resubmit();
                    self.raft.tick()
                }
                Some(envelope) = self.inbox.recv() => self.raft.step(envelope),
                Some(control) = self.cmd_rx.recv() => {
                    self.handle_control(control);
                    self.raft.drive_commit()
                }
            };

            match outputs {
                Ok(outputs) => self.handle_outputs(outputs),
                Err(e) => tracing::error!(error = %e, "raft driver fault"),
            }
        }

        // Shutting down: fail anything still waiting
        for (_, pending) in self.pending.drain() {
            let _ = pending.resp.send(Err(error::E_STOPPED));
        }
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::Propose { proposal_id, data, resp } => {
                self.pending.insert(
                    proposal_id,
                    Pending {
                        resp,
                        data,
                        deadline: Instant::now() + PROPOSAL_TIMEOUT,
                        last_submit: None,
                    },
                );
                self.submit_pending();
            }
        }
    }

    fn expire_and_resubmit(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| now >= p.deadline)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                let _ = pending.resp.send(Err(error::E_PROPOSAL_ERROR));
            }
        }
        self.submit_pending();
    }

    /// Hand unproposed (or stalled) proposals to the current leader: append
    /// locally when leading, forward otherwise.
    fn submit_pending(&mut self) {
        let now = Instant::now();
        let leader = self.raft.leader();
        let is_leader = self.raft.is_leader();

        let due: Vec<(u64, Vec<u8>)> = self
            .pending
            .iter()
            .filter(|(id, p)| {
                !self.applied.contains(id)
                    && p.last_submit.map_or(true, |t| now.duration_since(t) >= RESUBMIT_INTERVAL)
            })
            .map(|(id, p)| (*id, p.data.clone()))
            .collect();

        for (id, data) in due {
            if is_leader {
                if self.in_flight.insert(id) {
                    let envelope = Envelope {
                        from: self.local_id,
                        to: self.local_id,
                        message: RaftMessage::Propose { data },
                    };
                    match self.raft.step(envelope) {
                        Ok(outputs) => self.handle_outputs(outputs),
                        Err(e) => tracing::error!(error = %e, "local propose failed"),
                    }
                }
            } else if let Some(leader) = leader {
                self.transport.send(Envelope {
                    from: self.local_id,
                    to: leader,
                    message: RaftMessage::Propose { data },
                });
            } else {
                // No leader known yet; retried on a later tick
                continue;
            }
            if let Some(pending) = self.pending.get_mut(&id) {
                pending.last_submit = Some(now);
            }
        }
    }

    fn handle_outputs(&mut self, outputs: Vec<RaftOutput>) {
        for output in outputs {
            match output {
                RaftOutput::Send { to, message } => {
                    self.transport.send(Envelope { from: self.local_id, to, message });
                }
                RaftOutput::Committed { index, data } => {
                    self.apply_committed(index, data);
                }
                RaftOutput::InstallState { index, data } => {
                    self.install_state(index, data);
                }
            }
        }
    }

    fn apply_committed(&mut self, index: u64, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }

        let proposal: Proposal = match serde_json::from_slice(&data) {
            Ok(proposal) => proposal,
            Err(e) => {
                tracing::error!(index, error = %e, "undecodable committed entry");
                return;
            }
        };

        self.in_flight.remove(&proposal.id);

        if !self.applied.insert(proposal.id) {
            // A duplicate of an already-applied proposal committed again
            self.resolve(proposal.id, Ok(()));
            return;
        }

        let result = match self.controller.write() {
            Ok(mut controller) => controller.apply(&proposal.command),
            Err(_) => Err(error::E_STORAGE),
        };

        match result {
            Ok(deltas) => {
                tracing::debug!(index, command = ?proposal.command, "applied cluster command");
                self.sync_peers();
                if let Some(handler) = &self.handler {
                    handler(&deltas);
                }
                self.resolve(proposal.id, Ok(()));
            }
            Err(e) => {
                tracing::debug!(index, command = ?proposal.command, error = %e, "cluster command rejected");
                self.resolve(proposal.id, Err(e));
            }
        }

        self.applied_since_snapshot += 1;
        if self.applied_since_snapshot >= SNAPSHOT_INTERVAL {
            self.compact(index);
        }
    }

    fn install_state(&mut self, index: u64, data: Vec<u8>) {
        let state: ClusterState = match serde_json::from_slice(&data) {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(index, error = %e, "undecodable snapshot");
                return;
            }
        };

        let deltas = match self.controller.write() {
            Ok(mut controller) => controller.install(state),
            Err(_) => return,
        };
        tracing::info!(index, deltas = deltas.len(), "installed cluster snapshot");
        self.sync_peers();
        if let Some(handler) = &self.handler {
            handler(&deltas);
        }
    }

    fn compact(&mut self, index: u64) {
        let state = match self.controller.read() {
            Ok(controller) => serde_json::to_vec(&controller.state),
            Err(_) => return,
        };
        if let Ok(state) = state {
            if let Err(e) = self.raft.compact(index, state) {
                tracing::error!(error = %e, "log compaction failed");
                return;
            }
            self.applied_since_snapshot = 0;
        }
    }

    fn sync_peers(&mut self) {
        if let Ok(controller) = self.controller.read() {
            let members = controller.member_ids();
            if members.contains(&self.local_id) {
                self.raft.set_peers(members);
            } else {
                // A removed node must not keep campaigning against the
                // cluster it left
                self.raft.set_peers(Vec::new());
            }
        }
    }

    fn resolve(&mut self, proposal_id: u64, result: Result<(), DbError>) {
        if let Some(pending) = self.pending.remove(&proposal_id) {
            let _ = pending.resp.send(result);
        }
    }
}
