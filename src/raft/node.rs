use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{RaftError, Result};
use crate::persist::Persister;
use crate::proto::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use crate::raft::peer::PeerSet;
use crate::raft::rpc::{entry_to_proto, handle_append_entries, handle_request_vote};
use crate::raft::state::{LogEntry, RaftRole, RaftState};
use crate::raft::timer::random_timeout;

/// Events consumed by the Raft node event loop. Inbound RPCs and client
/// commands are serialized onto the loop through these messages; the loop
/// is the only place node state is touched.
#[derive(Debug)]
pub enum RaftMessage {
    AppendEntries {
        req: AppendEntriesRequest,
        response_tx: oneshot::Sender<AppendEntriesResponse>,
    },
    RequestVote {
        req: RequestVoteRequest,
        response_tx: oneshot::Sender<RequestVoteResponse>,
    },
    /// A client asks the leader to append a new command to the log. The
    /// entry is returned as soon as it is durable locally; replication
    /// happens on the following heartbeats.
    ApplyCommand {
        data: Vec<u8>,
        response_tx: oneshot::Sender<Result<LogEntry>>,
    },
}

/// Point-in-time view of the node, published on a watch channel at loop
/// boundaries so other components can observe the node without touching
/// its state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeStatus {
    pub role: RaftRole,
    pub term: u64,
    pub voted_for: Option<u32>,
    pub leader_id: Option<u32>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_id: u64,
}

struct VoteResult {
    peer_id: u32,
    resp: RequestVoteResponse,
}

struct AppendEntriesResult {
    peer_id: u32,
    /// Id of the last entry included in the request, `None` for a pure
    /// heartbeat.
    last_entry_id: Option<u64>,
    resp: AppendEntriesResponse,
}

/// The per-node Raft state machine.
///
/// One cooperative loop owns all state; outbound RPCs are spawned as
/// fire-and-forget tasks that report back through result channels bounded
/// to the peer count. Stale results that arrive after a role change land in
/// a dropped channel or are discarded by term checks.
pub struct RaftNode {
    pub id: u32,
    config: NodeConfig,
    state: RaftState,
    peers: PeerSet,
    peer_ids: Vec<u32>,
    rpc_tx: mpsc::Sender<RaftMessage>,
    apply_tx: mpsc::Sender<LogEntry>,
    status_tx: watch::Sender<NodeStatus>,
}

impl RaftNode {
    /// Build a node around its durable store. Returns the node, the intake
    /// channel for RPCs and client commands, and the apply channel carrying
    /// committed entries in id order.
    pub fn new(
        config: NodeConfig,
        persister: Box<dyn Persister>,
    ) -> (Self, mpsc::Receiver<RaftMessage>, mpsc::Receiver<LogEntry>) {
        let (rpc_tx, rpc_rx) = mpsc::channel(100);
        let (apply_tx, apply_rx) = mpsc::channel(100);
        let (status_tx, _) = watch::channel(NodeStatus::default());

        let node = Self {
            id: config.node_id,
            peers: PeerSet::new(config.peers.clone()),
            peer_ids: config.peer_ids(),
            state: RaftState::new(persister),
            config,
            rpc_tx,
            apply_tx,
            status_tx,
        };

        (node, rpc_rx, apply_rx)
    }

    /// Sender half of the intake channel, for the gRPC services.
    pub fn message_sender(&self) -> mpsc::Sender<RaftMessage> {
        self.rpc_tx.clone()
    }

    /// Handle to the per-peer clients, for wiring and partition tests.
    pub fn peers(&self) -> PeerSet {
        self.peers.clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<NodeStatus> {
        self.status_tx.subscribe()
    }

    /// Run the node until the token is cancelled. Fails fast if the durable
    /// state cannot be loaded, and aborts if a mid-operation save fails;
    /// limping on without durability would break the crash guarantees.
    pub async fn run(
        mut self,
        mut rpc_rx: mpsc::Receiver<RaftMessage>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        self.state.load()?;

        tracing::info!(
            node_id = self.id,
            term = self.state.current_term,
            voted_for = ?self.state.voted_for,
            log_len = self.state.log.len(),
            "starting raft node"
        );

        while !shutdown.is_cancelled() {
            self.publish_status();
            match self.state.role {
                RaftRole::Follower => self.run_follower(&mut rpc_rx, &shutdown).await?,
                RaftRole::Candidate => self.run_candidate(&mut rpc_rx, &shutdown).await?,
                RaftRole::Leader => self.run_leader(&mut rpc_rx, &shutdown).await?,
            }
        }

        tracing::info!(node_id = self.id, "raft node stopped");
        Ok(())
    }

    async fn run_follower(
        &mut self,
        rpc_rx: &mut mpsc::Receiver<RaftMessage>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        tracing::debug!(node_id = self.id, term = self.state.current_term, "running follower");

        let timeout = sleep(random_timeout(self.config.heartbeat_timeout()));
        tokio::pin!(timeout);

        while self.state.role == RaftRole::Follower {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),

                () = timeout.as_mut() => {
                    timeout
                        .as_mut()
                        .reset(Instant::now() + random_timeout(self.config.heartbeat_timeout()));

                    if self.state.last_heartbeat.elapsed() > self.config.heartbeat_timeout() {
                        tracing::info!(
                            node_id = self.id,
                            term = self.state.current_term,
                            "heartbeat timeout, converting to candidate"
                        );
                        self.state.to_candidate();
                    }
                }

                Some(msg) = rpc_rx.recv() => self.handle_message(msg).await?,
            }
            self.publish_status();
        }
        Ok(())
    }

    async fn run_candidate(
        &mut self,
        rpc_rx: &mut mpsc::Receiver<RaftMessage>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        // Role-scoped election state: torn down when the loop exits, so a
        // late vote from a previous round cannot leak into the next one.
        let mut granted_votes = 0usize;
        let votes_needed = (self.peers.len() + 1) / 2 + 1;

        self.state.vote_for(self.id, true)?;
        granted_votes += 1;
        tracing::info!(
            node_id = self.id,
            term = self.state.current_term,
            "voted for self, starting election"
        );

        // A single-node cluster wins right here.
        if granted_votes >= votes_needed {
            self.state.to_leader(&self.peer_ids);
            tracing::info!(
                node_id = self.id,
                term = self.state.current_term,
                "election won"
            );
            return Ok(());
        }

        let (vote_tx, mut vote_rx) = mpsc::channel(self.peers.len().max(1));
        self.broadcast_request_vote(&vote_tx, shutdown).await;

        let timeout = sleep(random_timeout(self.config.election_timeout()));
        tokio::pin!(timeout);

        while self.state.role == RaftRole::Candidate {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),

                () = timeout.as_mut() => {
                    tracing::info!(
                        node_id = self.id,
                        term = self.state.current_term,
                        "election timeout, restarting election"
                    );
                    // The outer loop re-enters the candidate role, which
                    // increments the term again.
                    return Ok(());
                }

                Some(vote) = vote_rx.recv() => {
                    self.handle_vote_result(vote, &mut granted_votes, votes_needed)?;
                }

                Some(msg) = rpc_rx.recv() => self.handle_message(msg).await?,
            }
            self.publish_status();
        }
        Ok(())
    }

    async fn run_leader(
        &mut self,
        rpc_rx: &mut mpsc::Receiver<RaftMessage>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        tracing::info!(node_id = self.id, term = self.state.current_term, "running leader");

        let (result_tx, mut result_rx) = mpsc::channel(self.peers.len().max(1));
        // The first tick fires immediately, so followers hear from the new
        // leader before their election timers can expire.
        let mut heartbeat = interval(self.config.heartbeat_interval());

        while self.state.role == RaftRole::Leader {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),

                _ = heartbeat.tick() => {
                    self.broadcast_append_entries(&result_tx, shutdown).await;
                }

                Some(result) = result_rx.recv() => {
                    self.handle_append_entries_result(result).await?;
                }

                Some(msg) = rpc_rx.recv() => self.handle_message(msg).await?,
            }
            self.publish_status();
        }
        Ok(())
    }

    /// Dispatch one intake message. Persistence failures propagate and stop
    /// the node; the pending responder is dropped, which surfaces as a
    /// closed channel to the caller.
    async fn handle_message(&mut self, msg: RaftMessage) -> Result<()> {
        match msg {
            RaftMessage::AppendEntries { req, response_tx } => {
                let resp = handle_append_entries(&mut self.state, &req, &self.apply_tx).await?;
                let _ = response_tx.send(resp);
            }
            RaftMessage::RequestVote { req, response_tx } => {
                let resp = handle_request_vote(&mut self.state, &req)?;
                let _ = response_tx.send(resp);
            }
            RaftMessage::ApplyCommand { data, response_tx } => {
                match self.append_command(data) {
                    Err(err @ RaftError::Persistence(_)) => return Err(err),
                    result => {
                        let _ = response_tx.send(result);
                    }
                }
            }
        }
        Ok(())
    }

    fn append_command(&mut self, data: Vec<u8>) -> Result<LogEntry> {
        if self.state.role != RaftRole::Leader {
            return Err(RaftError::NotLeader(self.state.leader_id));
        }

        let (last_log_id, _) = self.state.last_log();
        let entry = LogEntry {
            id: last_log_id + 1,
            term: self.state.current_term,
            data,
        };
        self.state.append_logs(vec![entry.clone()])?;
        tracing::debug!(id = entry.id, term = entry.term, "appended client command");

        Ok(entry)
    }

    async fn broadcast_request_vote(
        &self,
        vote_tx: &mpsc::Sender<VoteResult>,
        shutdown: &CancellationToken,
    ) {
        let (last_log_id, last_log_term) = self.state.last_log();
        let req = RequestVoteRequest {
            term: self.state.current_term,
            candidate_id: self.id,
            last_log_id,
            last_log_term,
        };

        tracing::info!(node_id = self.id, term = req.term, "broadcasting request vote");

        for (peer_id, mut client) in self.peers.clients().await {
            let req = req.clone();
            let vote_tx = vote_tx.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    result = client.request_vote(req) => match result {
                        Ok(resp) => {
                            // The channel holds one slot per peer; a result
                            // that finds it closed belongs to a finished
                            // election and is dropped.
                            let _ = vote_tx.try_send(VoteResult {
                                peer_id,
                                resp: resp.into_inner(),
                            });
                        }
                        Err(status) => {
                            tracing::warn!(peer = peer_id, error = %status, "request vote rpc failed");
                        }
                    },
                }
            });
        }
    }

    fn handle_vote_result(
        &mut self,
        vote: VoteResult,
        granted_votes: &mut usize,
        votes_needed: usize,
    ) -> Result<()> {
        if vote.resp.term > self.state.current_term {
            self.state.to_follower(vote.resp.term)?;
            tracing::info!(
                peer = vote.peer_id,
                term = self.state.current_term,
                "newer term in vote response, stepping down"
            );
            return Ok(());
        }

        if vote.resp.vote_granted {
            *granted_votes += 1;
            tracing::info!(
                peer = vote.peer_id,
                granted = *granted_votes,
                needed = votes_needed,
                "vote granted"
            );
        }

        if *granted_votes >= votes_needed {
            self.state.to_leader(&self.peer_ids);
            tracing::info!(
                node_id = self.id,
                term = self.state.current_term,
                granted = *granted_votes,
                "election won"
            );
        }
        Ok(())
    }

    async fn broadcast_append_entries(
        &self,
        result_tx: &mpsc::Sender<AppendEntriesResult>,
        shutdown: &CancellationToken,
    ) {
        let (last_log_id, _) = self.state.last_log();

        for (peer_id, mut client) in self.peers.clients().await {
            let next_index = self
                .state
                .next_index
                .get(&peer_id)
                .copied()
                .unwrap_or(last_log_id + 1);
            let match_index = self.state.match_index.get(&peer_id).copied().unwrap_or(0);

            // Peers that already hold the whole log get a bare heartbeat.
            let (entries, prev_log_id, prev_log_term) = if match_index < last_log_id {
                let entries: Vec<_> = self
                    .state
                    .get_logs_from(next_index)
                    .iter()
                    .map(entry_to_proto)
                    .collect();
                let (prev_log_id, prev_log_term) = self
                    .state
                    .get_log(next_index - 1)
                    .map(|e| (e.id, e.term))
                    .unwrap_or((0, 0));
                (entries, prev_log_id, prev_log_term)
            } else {
                (Vec::new(), 0, 0)
            };

            let last_entry_id = entries.last().map(|e| e.id);
            let req = AppendEntriesRequest {
                term: self.state.current_term,
                leader_id: self.id,
                prev_log_id,
                prev_log_term,
                entries,
                leader_commit_id: self.state.commit_index,
            };

            tracing::trace!(
                peer = peer_id,
                entries = req.entries.len(),
                prev_log_id,
                "sending append entries"
            );

            let result_tx = result_tx.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    result = client.append_entries(req) => match result {
                        Ok(resp) => {
                            let _ = result_tx.try_send(AppendEntriesResult {
                                peer_id,
                                last_entry_id,
                                resp: resp.into_inner(),
                            });
                        }
                        Err(status) => {
                            // Transport failure; the next heartbeat retries.
                            tracing::warn!(peer = peer_id, error = %status, "append entries rpc failed");
                        }
                    },
                }
            });
        }
    }

    async fn handle_append_entries_result(&mut self, result: AppendEntriesResult) -> Result<()> {
        if result.resp.term > self.state.current_term {
            self.state.to_follower(result.resp.term)?;
            tracing::info!(
                peer = result.peer_id,
                term = self.state.current_term,
                "newer term in append entries response, stepping down"
            );
            return Ok(());
        }

        if !result.resp.success {
            // Log inconsistency: back the peer off one entry and let the
            // next heartbeat probe again. The match index is untouched.
            let next = self
                .state
                .next_index
                .get(&result.peer_id)
                .copied()
                .unwrap_or(1);
            let matched = self
                .state
                .match_index
                .get(&result.peer_id)
                .copied()
                .unwrap_or(0);
            if next > 1 {
                self.state.set_next_and_match(result.peer_id, next - 1, matched);
            }
            tracing::info!(
                peer = result.peer_id,
                next_index = next.saturating_sub(1).max(1),
                "append entries rejected, backing off next index"
            );
        } else if let Some(last_entry_id) = result.last_entry_id {
            self.state
                .set_next_and_match(result.peer_id, last_entry_id + 1, last_entry_id);
            tracing::debug!(
                peer = result.peer_id,
                next_index = last_entry_id + 1,
                match_index = last_entry_id,
                "append entries accepted"
            );
        }

        if let Some(commit_id) = find_majority_commit(&self.state, &self.peer_ids) {
            self.state.set_commit_index(commit_id);
            self.state.apply_logs(&self.apply_tx).await;
            tracing::info!(commit_index = commit_id, "advanced commit index");
        }
        Ok(())
    }

    fn publish_status(&self) {
        let (last_log_id, _) = self.state.last_log();
        let status = NodeStatus {
            role: self.state.role,
            term: self.state.current_term,
            voted_for: self.state.voted_for,
            leader_id: if self.state.role == RaftRole::Leader {
                Some(self.id)
            } else {
                self.state.leader_id
            },
            commit_index: self.state.commit_index,
            last_applied: self.state.last_applied,
            last_log_id,
        };
        self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }
}

/// Highest id above the commit index that is replicated on a majority and
/// belongs to the current term, scanning the suffix from the top down.
///
/// Entries from older terms are skipped: a leader only commits entries of
/// its own term directly, and older entries become committed with them.
fn find_majority_commit(state: &RaftState, peer_ids: &[u32]) -> Option<u64> {
    let replicas_needed = (peer_ids.len() + 1) / 2 + 1;

    for entry in state.get_logs_from(state.commit_index + 1).iter().rev() {
        if entry.id <= state.commit_index {
            break;
        }
        if entry.term != state.current_term {
            continue;
        }

        // Count the leader itself plus every peer known to hold the entry.
        let replicas = 1 + peer_ids
            .iter()
            .filter(|&&peer_id| {
                state.match_index.get(&peer_id).copied().unwrap_or(0) >= entry.id
            })
            .count();

        if replicas >= replicas_needed {
            return Some(entry.id);
        }
    }
    None
}
