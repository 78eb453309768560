use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::persist::{DurableState, Persister};

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RaftRole {
    #[default]
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// A single entry in the replicated log. Ids are 1-based and contiguous;
/// id 0 means "no entry".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    pub term: u64,
    pub data: Vec<u8>,
}

/// Authoritative per-node Raft state.
///
/// The main loop is the only owner; all mutation happens there, so no
/// locking is required. Every mutation of a durable field (current term,
/// voted-for, log) persists the whole tuple before returning, which keeps
/// the durability guarantee ahead of any RPC reply built from it.
pub struct RaftState {
    // Persistent state
    pub current_term: u64,
    pub voted_for: Option<u32>,
    pub log: Vec<LogEntry>,

    // Volatile state on all servers
    pub role: RaftRole,
    pub commit_index: u64,
    pub last_applied: u64,
    /// Last moment a valid leader RPC was accepted or a vote was granted.
    pub last_heartbeat: Instant,
    /// Last known leader, used to redirect rejected client commands.
    pub leader_id: Option<u32>,

    // Volatile state on leaders (reinitialized after election)
    pub next_index: HashMap<u32, u64>,
    pub match_index: HashMap<u32, u64>,

    persister: Box<dyn Persister>,
}

impl RaftState {
    pub fn new(persister: Box<dyn Persister>) -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            role: RaftRole::Follower,
            commit_index: 0,
            last_applied: 0,
            last_heartbeat: Instant::now(),
            leader_id: None,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            persister,
        }
    }

    /// Restore the durable tuple from the persister. A node that fails to
    /// load must not start.
    pub fn load(&mut self) -> Result<()> {
        if let Some(durable) = self.persister.load()? {
            self.current_term = durable.current_term;
            self.voted_for = durable.voted_for;
            self.log = durable.log;
        }
        Ok(())
    }

    fn persist(&mut self) -> Result<()> {
        let durable = DurableState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            log: self.log.clone(),
        };
        self.persister.save(&durable)?;
        Ok(())
    }

    /// Id and term of the last log entry, `(0, 0)` on an empty log.
    pub fn last_log(&self) -> (u64, u64) {
        self.log.last().map(|e| (e.id, e.term)).unwrap_or((0, 0))
    }

    /// Get the log entry with the given id (1-based).
    pub fn get_log(&self, id: u64) -> Option<&LogEntry> {
        if id == 0 {
            return None;
        }
        self.log.get((id - 1) as usize)
    }

    /// All entries with `entry.id >= from_id`. `from_id` 0 returns the
    /// whole log.
    pub fn get_logs_from(&self, from_id: u64) -> &[LogEntry] {
        let start = (from_id.saturating_sub(1)) as usize;
        if start >= self.log.len() {
            return &[];
        }
        &self.log[start..]
    }

    /// Append entries to the log tail and persist.
    pub fn append_logs(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        self.log.extend(entries);
        self.persist()
    }

    /// Remove every entry with `entry.id > id` and persist. Entries with
    /// `entry.id <= id` are kept.
    pub fn delete_logs_after(&mut self, id: u64) -> Result<()> {
        self.log.truncate(id as usize);
        self.persist()
    }

    /// Record a vote for `candidate` and persist. With `increment_term` the
    /// current term is bumped first (a candidate voting for itself).
    pub fn vote_for(&mut self, candidate: u32, increment_term: bool) -> Result<()> {
        if increment_term {
            self.current_term += 1;
        }
        self.voted_for = Some(candidate);
        self.persist()
    }

    /// Step down to follower at `term`, clearing the recorded vote, and
    /// persist.
    pub fn to_follower(&mut self, term: u64) -> Result<()> {
        self.role = RaftRole::Follower;
        self.current_term = term;
        self.voted_for = None;
        self.persist()
    }

    /// Convert to candidate. The term bump happens in `vote_for` when the
    /// candidate votes for itself.
    pub fn to_candidate(&mut self) {
        self.role = RaftRole::Candidate;
        self.leader_id = None;
    }

    /// Convert to leader and reinitialize the replication indexes for every
    /// peer.
    pub fn to_leader(&mut self, peer_ids: &[u32]) {
        self.role = RaftRole::Leader;
        self.leader_id = None;

        let (last_log_id, _) = self.last_log();
        self.next_index.clear();
        self.match_index.clear();
        for &peer_id in peer_ids {
            self.next_index.insert(peer_id, last_log_id + 1);
            self.match_index.insert(peer_id, 0);
        }
    }

    /// Advance the commit index. Lower values are ignored; the commit index
    /// never moves backwards.
    pub fn set_commit_index(&mut self, index: u64) {
        if index > self.commit_index {
            self.commit_index = index;
        }
    }

    pub fn set_next_and_match(&mut self, peer_id: u32, next: u64, matched: u64) {
        self.next_index.insert(peer_id, next);
        self.match_index.insert(peer_id, matched);
    }

    /// Mark that a valid RPC from the current leader (or a granted vote)
    /// was just accepted.
    pub fn mark_heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    /// Deliver every committed-but-unapplied entry to the sink in id order,
    /// advancing `last_applied` per delivery. Blocks when the sink is full;
    /// the node does not race ahead of its application.
    pub async fn apply_logs(&mut self, apply_tx: &mpsc::Sender<LogEntry>) {
        while self.last_applied < self.commit_index {
            let next = self.last_applied + 1;
            let entry = match self.get_log(next) {
                Some(entry) => entry.clone(),
                None => {
                    tracing::warn!(id = next, "committed entry missing from log");
                    return;
                }
            };
            if apply_tx.send(entry).await.is_err() {
                tracing::warn!("apply channel closed, holding back committed entries");
                return;
            }
            self.last_applied = next;
        }
    }

    /// Whether a candidate with this last entry is at least as up-to-date
    /// as the local log.
    pub fn is_log_up_to_date(&self, last_log_id: u64, last_log_term: u64) -> bool {
        let (local_last_id, local_last_term) = self.last_log();

        last_log_term > local_last_term
            || (last_log_term == local_last_term && last_log_id >= local_last_id)
    }
}
