//! The raft core: a pure state machine advanced by ticks and messages.

use crate::raft::message::{Entry, Envelope, RaftMessage};
use crate::raft::store::{HardState, RaftStore, SnapshotRecord};
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use tidepool_model::{error, DbError};

/// Heartbeats go out every tick while leading.
const HEARTBEAT_TICKS: u32 = 1;
/// Elections fire after a randomized `[MIN, 2*MIN)` quiet ticks.
const ELECTION_TICKS_MIN: u32 = 10;
/// Entries per append message.
const MAX_BATCH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// What the runtime must do after a tick or step.
#[derive(Debug)]
pub enum RaftOutput {
    Send { to: u64, message: RaftMessage },
    /// A log entry reached commitment; apply it.
    Committed { index: u64, data: Vec<u8> },
    /// A snapshot was installed; replace the state machine.
    InstallState { index: u64, data: Vec<u8> },
}

pub struct RaftNode {
    id: u64,
    peers: BTreeSet<u64>,
    role: Role,
    term: u64,
    voted_for: Option<u64>,
    leader: Option<u64>,
    commit: u64,
    applied: u64,
    store: RaftStore,

    last_index: u64,
    last_term: u64,
    snapshot_index: u64,
    snapshot_term: u64,

    votes: BTreeSet<u64>,
    next_index: BTreeMap<u64, u64>,
    match_index: BTreeMap<u64, u64>,

    election_elapsed: u32,
    heartbeat_elapsed: u32,
    election_timeout: u32,
    /// A freshly provisioned node that has never seen a membership must not
    /// elect itself leader of a one-node cluster; only a bootstrapping node
    /// may campaign with no known peers.
    bootstrap: bool,
}

impl RaftNode {
    pub fn new(id: u64, store: RaftStore, bootstrap: bool) -> Result<Self, DbError> {
        let hard_state = store.hard_state()?;
        let snapshot = store.snapshot()?;
        let (snapshot_index, snapshot_term) = snapshot
            .as_ref()
            .map(|s| (s.last_index, s.last_term))
            .unwrap_or((0, 0));

        let last_index = store.last_index()?;
        let last_term = if last_index == snapshot_index {
            snapshot_term
        } else {
            store.entry(last_index)?.map(|e| e.term).unwrap_or(0)
        };

        Ok(Self {
            id,
            peers: BTreeSet::new(),
            role: Role::Follower,
            term: hard_state.term,
            voted_for: hard_state.voted_for,
            leader: None,
            commit: hard_state.commit.min(last_index),
            applied: hard_state.commit.min(last_index),
            store,
            last_index,
            last_term,
            snapshot_index,
            snapshot_term,
            votes: BTreeSet::new(),
            next_index: BTreeMap::new(),
            match_index: BTreeMap::new(),
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            election_timeout: randomized_timeout(),
            bootstrap,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn leader(&self) -> Option<u64> {
        self.leader
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn commit_index(&self) -> u64 {
        self.commit
    }

    pub fn store(&self) -> &RaftStore {
        &self.store
    }

    /// Update the peer set from the applied membership (everyone but self).
    pub fn set_peers(&mut self, members: impl IntoIterator<Item = u64>) {
        let peers: BTreeSet<u64> = members.into_iter().filter(|m| *m != self.id).collect();
        if peers == self.peers {
            return;
        }

        self.next_index.retain(|p, _| peers.contains(p));
        self.match_index.retain(|p, _| peers.contains(p));
        for peer in &peers {
            self.next_index.entry(*peer).or_insert(self.last_index + 1);
            self.match_index.entry(*peer).or_insert(0);
        }
        self.peers = peers;
    }

    pub fn peers(&self) -> &BTreeSet<u64> {
        &self.peers
    }

    fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    fn quorum(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Drive timers forward one tick.
    pub fn tick(&mut self) -> Result<Vec<RaftOutput>, DbError> {
        let mut outputs = Vec::new();

        match self.role {
            Role::Leader => {
                self.heartbeat_elapsed += 1;
                if self.heartbeat_elapsed >= HEARTBEAT_TICKS {
                    self.heartbeat_elapsed = 0;
                    for peer in self.peers.clone() {
                        self.send_append(peer, &mut outputs)?;
                    }
                }
            }
            Role::Follower | Role::Candidate => {
                self.election_elapsed += 1;
                let may_campaign = self.bootstrap || !self.peers.is_empty();
                if self.election_elapsed >= self.election_timeout && may_campaign {
                    self.start_election(&mut outputs)?;
                }
            }
        }

        Ok(outputs)
    }

    /// Handle one inbound message.
    pub fn step(&mut self, envelope: Envelope) -> Result<Vec<RaftOutput>, DbError> {
        let mut outputs = Vec::new();
        let from = envelope.from;
        let message = envelope.message;

        if let Some(term) = message.term() {
            if term > self.term {
                self.become_follower(term, None)?;
            }
        }

        match message {
            RaftMessage::Vote { term, last_log_index, last_log_term } => {
                if term < self.term {
                    outputs.push(RaftOutput::Send {
                        to: from,
                        message: RaftMessage::VoteReply { term: self.term, granted: false },
                    });
                    return Ok(outputs);
                }

                let up_to_date = last_log_term > self.last_term
                    || (last_log_term == self.last_term && last_log_index >= self.last_index);
                let granted = up_to_date
                    && (self.voted_for.is_none() || self.voted_for == Some(from));

                if granted {
                    self.voted_for = Some(from);
                    self.election_elapsed = 0;
                    self.persist_hard_state()?;
                }

                outputs.push(RaftOutput::Send {
                    to: from,
                    message: RaftMessage::VoteReply { term: self.term, granted },
                });
            }
            RaftMessage::VoteReply { term, granted } => {
                if self.role == Role::Candidate && term == self.term && granted {
                    self.votes.insert(from);
                    if self.votes.len() >= self.quorum() {
                        self.become_leader(&mut outputs)?;
                    }
                }
            }
            RaftMessage::Append { term, prev_index, prev_term, entries, commit } => {
                if term < self.term {
                    outputs.push(RaftOutput::Send {
                        to: from,
                        message: RaftMessage::AppendReply {
                            term: self.term,
                            success: false,
                            match_index: 0,
                        },
                    });
                    return Ok(outputs);
                }

                self.become_follower(term, Some(from))?;
                self.election_elapsed = 0;

                if !self.matches_log(prev_index, prev_term)? {
                    let hint = self.last_index.min(prev_index.saturating_sub(1));
                    outputs.push(RaftOutput::Send {
                        to: from,
                        message: RaftMessage::AppendReply {
                            term: self.term,
                            success: false,
                            match_index: hint,
                        },
                    });
                    return Ok(outputs);
                }

                self.append_entries(&entries)?;

                // Only commit through what this append verified matches
                let match_index = prev_index + entries.len() as u64;
                let new_commit = commit.min(match_index.max(self.commit));
                if new_commit > self.commit {
                    self.commit = new_commit;
                    self.persist_hard_state()?;
                    self.emit_committed(&mut outputs)?;
                }

                outputs.push(RaftOutput::Send {
                    to: from,
                    message: RaftMessage::AppendReply {
                        term: self.term,
                        success: true,
                        match_index,
                    },
                });
            }
            RaftMessage::AppendReply { term, success, match_index } => {
                if self.role != Role::Leader || term != self.term {
                    return Ok(outputs);
                }

                if success {
                    let matched = self.match_index.entry(from).or_insert(0);
                    if match_index > *matched {
                        *matched = match_index;
                    }
                    self.next_index.insert(from, match_index + 1);
                    self.advance_commit(&mut outputs)?;
                } else {
                    let next = self.next_index.entry(from).or_insert(1);
                    *next = (*next).saturating_sub(1).max(1).min(match_index + 1);
                    self.send_append(from, &mut outputs)?;
                }
            }
            RaftMessage::Snapshot { term, last_index, last_term, data } => {
                if term < self.term {
                    return Ok(outputs);
                }
                self.become_follower(term, Some(from))?;
                self.election_elapsed = 0;

                if last_index > self.commit {
                    self.store.set_snapshot(&SnapshotRecord {
                        last_index,
                        last_term,
                        data: data.clone(),
                    })?;
                    self.store.truncate_from(1)?;
                    self.snapshot_index = last_index;
                    self.snapshot_term = last_term;
                    self.last_index = last_index;
                    self.last_term = last_term;
                    self.commit = last_index;
                    self.applied = last_index;
                    self.persist_hard_state()?;
                    outputs.push(RaftOutput::InstallState { index: last_index, data });
                }

                outputs.push(RaftOutput::Send {
                    to: from,
                    message: RaftMessage::AppendReply {
                        term: self.term,
                        success: true,
                        match_index: self.last_index,
                    },
                });
            }
            RaftMessage::Propose { data } => {
                if self.role == Role::Leader {
                    self.propose(data)?;
                    // Replicate eagerly instead of waiting for the next tick
                    for peer in self.peers.clone() {
                        self.send_append(peer, &mut outputs)?;
                    }
                    self.advance_commit(&mut outputs)?;
                }
            }
        }

        Ok(outputs)
    }

    /// Append a proposal to the local log. Leader only.
    pub fn propose(&mut self, data: Vec<u8>) -> Result<u64, DbError> {
        if self.role != Role::Leader {
            return Err(error::E_PROPOSAL_ERROR);
        }

        let entry = Entry {
            index: self.last_index + 1,
            term: self.term,
            data,
        };
        self.store.append(std::slice::from_ref(&entry))?;
        self.last_index = entry.index;
        self.last_term = entry.term;
        Ok(entry.index)
    }

    /// Single-node fast path and post-propose commitment check.
    pub fn drive_commit(&mut self) -> Result<Vec<RaftOutput>, DbError> {
        let mut outputs = Vec::new();
        if self.role == Role::Leader {
            self.advance_commit(&mut outputs)?;
        }
        Ok(outputs)
    }

    /// Compact the log through `index`, storing `state` as the snapshot.
    pub fn compact(&mut self, index: u64, state: Vec<u8>) -> Result<(), DbError> {
        if index <= self.snapshot_index || index > self.applied {
            return Ok(());
        }
        let term = self.term_at(index)?;
        self.store.set_snapshot(&SnapshotRecord { last_index: index, last_term: term, data: state })?;
        self.snapshot_index = index;
        self.snapshot_term = term;
        Ok(())
    }

    /// Committed-but-unapplied entries to replay at boot.
    pub fn replay_entries(&self) -> Result<Vec<Entry>, DbError> {
        self.store.entries(self.snapshot_index + 1, self.commit.max(self.snapshot_index + 1))
    }

    // --- internals ---

    fn start_election(&mut self, outputs: &mut Vec<RaftOutput>) -> Result<(), DbError> {
        self.role = Role::Candidate;
        self.term += 1;
        self.voted_for = Some(self.id);
        self.leader = None;
        self.votes = BTreeSet::from([self.id]);
        self.election_elapsed = 0;
        self.election_timeout = randomized_timeout();
        self.persist_hard_state()?;

        tracing::debug!(node = self.id, term = self.term, "starting election");

        if self.votes.len() >= self.quorum() {
            self.become_leader(outputs)?;
            return Ok(());
        }

        for peer in &self.peers {
            outputs.push(RaftOutput::Send {
                to: *peer,
                message: RaftMessage::Vote {
                    term: self.term,
                    last_log_index: self.last_index,
                    last_log_term: self.last_term,
                },
            });
        }
        Ok(())
    }

    fn become_leader(&mut self, outputs: &mut Vec<RaftOutput>) -> Result<(), DbError> {
        tracing::info!(node = self.id, term = self.term, "became leader");
        self.role = Role::Leader;
        self.leader = Some(self.id);
        self.heartbeat_elapsed = 0;
        for peer in self.peers.clone() {
            self.next_index.insert(peer, self.last_index + 1);
            self.match_index.insert(peer, 0);
        }

        // Commit a no-op so earlier-term entries become committable
        self.propose(Vec::new())?;
        self.advance_commit(outputs)?;
        for peer in self.peers.clone() {
            self.send_append(peer, outputs)?;
        }
        Ok(())
    }

    fn become_follower(&mut self, term: u64, leader: Option<u64>) -> Result<(), DbError> {
        let term_changed = term > self.term;
        if term_changed {
            self.term = term;
            self.voted_for = None;
        }
        self.role = Role::Follower;
        if leader.is_some() {
            self.leader = leader;
        }
        self.votes.clear();
        if term_changed {
            self.persist_hard_state()?;
        }
        Ok(())
    }

    fn matches_log(&self, index: u64, term: u64) -> Result<bool, DbError> {
        if index == 0 {
            return Ok(true);
        }
        if index < self.snapshot_index {
            // Everything through the snapshot is committed and consistent
            return Ok(true);
        }
        if index > self.last_index {
            return Ok(false);
        }
        Ok(self.term_at(index)? == term)
    }

    fn term_at(&self, index: u64) -> Result<u64, DbError> {
        if index == 0 {
            return Ok(0);
        }
        if index == self.snapshot_index {
            return Ok(self.snapshot_term);
        }
        match self.store.entry(index)? {
            Some(entry) => Ok(entry.term),
            None => Err(error::E_PROPOSAL_ERROR),
        }
    }

    fn append_entries(&mut self, entries: &[Entry]) -> Result<(), DbError> {
        let mut to_append: Vec<Entry> = Vec::new();
        for entry in entries {
            if entry.index <= self.snapshot_index {
                continue;
            }
            if entry.index <= self.last_index {
                if self.term_at(entry.index)? == entry.term {
                    continue;
                }
                // Conflict: drop our divergent suffix
                self.store.truncate_from(entry.index)?;
                self.last_index = entry.index - 1;
                self.last_term = self.term_at(self.last_index)?;
            }
            to_append.push(entry.clone());
        }

        if let Some(last) = to_append.last() {
            self.last_index = last.index;
            self.last_term = last.term;
        }
        self.store.append(&to_append)
    }

    fn send_append(&mut self, peer: u64, outputs: &mut Vec<RaftOutput>) -> Result<(), DbError> {
        let next = *self.next_index.get(&peer).unwrap_or(&(self.last_index + 1));

        if next <= self.snapshot_index {
            let snapshot = self.store.snapshot()?.unwrap_or_default();
            outputs.push(RaftOutput::Send {
                to: peer,
                message: RaftMessage::Snapshot {
                    term: self.term,
                    last_index: snapshot.last_index,
                    last_term: snapshot.last_term,
                    data: snapshot.data,
                },
            });
            return Ok(());
        }

        let prev_index = next - 1;
        let prev_term = self.term_at(prev_index)?;
        let hi = self.last_index.min(next + MAX_BATCH as u64 - 1);
        let entries = if next > self.last_index {
            Vec::new()
        } else {
            self.store.entries(next, hi)?
        };

        outputs.push(RaftOutput::Send {
            to: peer,
            message: RaftMessage::Append {
                term: self.term,
                prev_index,
                prev_term,
                entries,
                commit: self.commit,
            },
        });
        Ok(())
    }

    fn advance_commit(&mut self, outputs: &mut Vec<RaftOutput>) -> Result<(), DbError> {
        // The quorum-th highest match index, counting our own log
        let mut matches: Vec<u64> = self.match_index.values().copied().collect();
        matches.push(self.last_index);
        matches.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = matches.get(self.quorum() - 1).copied().unwrap_or(0);
        if candidate > self.commit && self.term_at(candidate)? == self.term {
            self.commit = candidate;
            self.persist_hard_state()?;
            self.emit_committed(outputs)?;
        }
        Ok(())
    }

    fn emit_committed(&mut self, outputs: &mut Vec<RaftOutput>) -> Result<(), DbError> {
        while self.applied < self.commit {
            let index = self.applied + 1;
            match self.store.entry(index)? {
                Some(entry) => {
                    outputs.push(RaftOutput::Committed { index, data: entry.data });
                    self.applied = index;
                }
                None => break,
            }
        }
        Ok(())
    }

    fn persist_hard_state(&self) -> Result<(), DbError> {
        self.store.set_hard_state(&HardState {
            term: self.term,
            voted_for: self.voted_for,
            commit: self.commit,
        })
    }
}

fn randomized_timeout() -> u32 {
    rand::thread_rng().gen_range(ELECTION_TICKS_MIN..ELECTION_TICKS_MIN * 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tidepool_storage::MemoryStorageDriver;

    fn node(id: u64, bootstrap: bool) -> RaftNode {
        let store = RaftStore::new(Arc::new(MemoryStorageDriver::new()));
        RaftNode::new(id, store, bootstrap).unwrap()
    }

    /// Tick and route messages between nodes until quiescent.
    fn settle(nodes: &mut HashMap<u64, RaftNode>, applied: &mut Vec<(u64, Vec<u8>)>) {
        for _ in 0..200 {
            let mut inflight: Vec<Envelope> = Vec::new();
            let ids: Vec<u64> = nodes.keys().copied().collect();
            for id in &ids {
                let outputs = nodes.get_mut(id).unwrap().tick().unwrap();
                collect(*id, outputs, &mut inflight, applied);
            }
            let mut hops = 0;
            while !inflight.is_empty() && hops < 50 {
                hops += 1;
                let mut next: Vec<Envelope> = Vec::new();
                for envelope in inflight.drain(..) {
                    if let Some(target) = nodes.get_mut(&envelope.to) {
                        let outputs = target.step(envelope.clone()).unwrap();
                        collect(envelope.to, outputs, &mut next, applied);
                    }
                }
                inflight = next;
            }
        }
    }

    fn collect(
        from: u64,
        outputs: Vec<RaftOutput>,
        inflight: &mut Vec<Envelope>,
        applied: &mut Vec<(u64, Vec<u8>)>,
    ) {
        for output in outputs {
            match output {
                RaftOutput::Send { to, message } => {
                    inflight.push(Envelope { from, to, message })
                }
                RaftOutput::Committed { data, .. } => {
                    if !data.is_empty() {
                        applied.push((from, data));
                    }
                }
                RaftOutput::InstallState { .. } => {}
            }
        }
    }

    #[test]
    fn bootstrap_node_elects_itself() {
        let mut n = node(1, true);
        let mut leader = false;
        for _ in 0..40 {
            n.tick().unwrap();
            if n.is_leader() {
                leader = true;
                break;
            }
        }
        assert!(leader);
    }

    #[test]
    fn non_bootstrap_node_stays_quiet_without_peers() {
        let mut n = node(1, false);
        for _ in 0..100 {
            let outputs = n.tick().unwrap();
            assert!(outputs.is_empty());
        }
        assert!(!n.is_leader());
    }

    #[test]
    fn single_node_commits_own_proposals() {
        let mut n = node(1, true);
        while !n.is_leader() {
            n.tick().unwrap();
        }

        n.propose(b"cmd-1".to_vec()).unwrap();
        let outputs = n.drive_commit().unwrap();
        let committed: Vec<Vec<u8>> = outputs
            .into_iter()
            .filter_map(|o| match o {
                RaftOutput::Committed { data, .. } if !data.is_empty() => Some(data),
                _ => None,
            })
            .collect();
        assert_eq!(committed, vec![b"cmd-1".to_vec()]);
    }

    #[test]
    fn three_nodes_elect_one_leader_and_replicate() {
        let mut nodes: HashMap<u64, RaftNode> = HashMap::new();
        for id in 1..=3 {
            let mut n = node(id, id == 1);
            n.set_peers(vec![1, 2, 3]);
            nodes.insert(id, n);
        }

        let mut applied = Vec::new();
        settle(&mut nodes, &mut applied);

        let leaders: Vec<u64> = nodes
            .values()
            .filter(|n| n.is_leader())
            .map(|n| n.id())
            .collect();
        assert_eq!(leaders.len(), 1, "exactly one leader, got {leaders:?}");

        let leader = leaders[0];
        nodes.get_mut(&leader).unwrap().propose(b"hello".to_vec()).unwrap();
        settle(&mut nodes, &mut applied);

        // Every node applied the entry exactly once
        for id in 1..=3 {
            let count = applied
                .iter()
                .filter(|(node, data)| *node == id && data == b"hello")
                .count();
            assert_eq!(count, 1, "node {id} applied {count} times");
        }
    }

    #[test]
    fn state_survives_restart() {
        let storage: Arc<MemoryStorageDriver> = Arc::new(MemoryStorageDriver::new());
        {
            let store = RaftStore::new(storage.clone());
            let mut n = RaftNode::new(1, store, true).unwrap();
            while !n.is_leader() {
                n.tick().unwrap();
            }
            n.propose(b"persisted".to_vec()).unwrap();
            n.drive_commit().unwrap();
        }

        let store = RaftStore::new(storage);
        let n = RaftNode::new(1, store, true).unwrap();
        assert!(n.commit_index() >= 2);
        let replay = n.replay_entries().unwrap();
        assert!(replay.iter().any(|e| e.data == b"persisted"));
    }
}
