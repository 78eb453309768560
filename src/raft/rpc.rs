use tokio::sync::mpsc;

use crate::error::Result;
use crate::proto::{
    AppendEntriesRequest, AppendEntriesResponse, Entry as ProtoEntry, RequestVoteRequest,
    RequestVoteResponse,
};
use crate::raft::state::{LogEntry, RaftRole, RaftState};

/// Handle an inbound AppendEntries RPC.
///
/// Newly committed entries are delivered through `apply_tx` before the
/// response is produced; the durable log is persisted by the state mutators
/// before any reply can be built from it.
pub async fn handle_append_entries(
    state: &mut RaftState,
    req: &AppendEntriesRequest,
    apply_tx: &mpsc::Sender<LogEntry>,
) -> Result<AppendEntriesResponse> {
    if req.term < state.current_term {
        tracing::info!(
            req_term = req.term,
            term = state.current_term,
            "rejecting append entries from an older term"
        );
        return Ok(AppendEntriesResponse {
            term: state.current_term,
            success: false,
        });
    }

    // From here on the request is valid as far as the term is concerned.
    state.mark_heartbeat();

    if req.term > state.current_term {
        state.to_follower(req.term)?;
        tracing::info!(term = state.current_term, "adopted newer term from leader");
    }

    // A candidate that hears from a legitimate leader steps down.
    if req.term >= state.current_term && state.role == RaftRole::Candidate {
        state.to_follower(req.term)?;
        tracing::info!(
            term = state.current_term,
            "leader established, stepping down to follower"
        );
    }
    state.leader_id = Some(req.leader_id);

    if req.prev_log_id != 0 {
        let local_term = state.get_log(req.prev_log_id).map(|e| e.term);
        if local_term != Some(req.prev_log_term) {
            tracing::info!(
                prev_log_id = req.prev_log_id,
                prev_log_term = req.prev_log_term,
                local_term = ?local_term,
                "previous log entry is missing or mismatched"
            );
            return Ok(AppendEntriesResponse {
                term: state.current_term,
                success: false,
            });
        }
    }

    if !req.entries.is_empty() {
        // Find the first entry that diverges from the local log. Everything
        // before it is already present and stays untouched, so replaying
        // the same request is a no-op.
        let mut divergence = None;
        for (i, req_entry) in req.entries.iter().enumerate() {
            match state.get_log(req_entry.id).map(|e| e.term) {
                Some(local_term) if local_term == req_entry.term => continue,
                Some(_) => {
                    // Conflicting suffix: drop the local entry and all that
                    // follow it, keep everything before it.
                    state.delete_logs_after(req_entry.id - 1)?;
                    divergence = Some(i);
                    break;
                }
                None => {
                    divergence = Some(i);
                    break;
                }
            }
        }

        if let Some(start) = divergence {
            let new_entries: Vec<LogEntry> =
                req.entries[start..].iter().map(proto_to_entry).collect();
            state.append_logs(new_entries)?;
            tracing::info!(
                appended = req.entries.len() - start,
                log_len = state.log.len(),
                "appended entries from leader"
            );
        }
    }

    if req.leader_commit_id > state.commit_index {
        let (last_log_id, _) = state.last_log();
        state.set_commit_index(req.leader_commit_id.min(last_log_id));
        state.apply_logs(apply_tx).await;
        tracing::info!(
            commit_index = state.commit_index,
            "advanced commit index from leader"
        );
    }

    Ok(AppendEntriesResponse {
        term: state.current_term,
        success: true,
    })
}

/// Handle an inbound RequestVote RPC.
pub fn handle_request_vote(
    state: &mut RaftState,
    req: &RequestVoteRequest,
) -> Result<RequestVoteResponse> {
    if req.term < state.current_term {
        tracing::info!(
            req_term = req.term,
            term = state.current_term,
            "rejecting vote request from an older term"
        );
        return Ok(RequestVoteResponse {
            term: state.current_term,
            vote_granted: false,
        });
    }

    if req.term > state.current_term {
        state.to_follower(req.term)?;
        tracing::info!(term = state.current_term, "adopted newer term from candidate");
    }

    if let Some(voted_for) = state.voted_for {
        if voted_for != req.candidate_id {
            tracing::info!(
                term = state.current_term,
                voted_for,
                candidate = req.candidate_id,
                "rejecting vote, already voted for another candidate"
            );
            return Ok(RequestVoteResponse {
                term: state.current_term,
                vote_granted: false,
            });
        }
    }

    if !state.is_log_up_to_date(req.last_log_id, req.last_log_term) {
        tracing::info!(
            candidate = req.candidate_id,
            "rejecting vote, local log is more up-to-date"
        );
        return Ok(RequestVoteResponse {
            term: state.current_term,
            vote_granted: false,
        });
    }

    state.vote_for(req.candidate_id, false)?;
    state.mark_heartbeat();
    tracing::info!(
        candidate = req.candidate_id,
        term = state.current_term,
        "vote granted"
    );

    Ok(RequestVoteResponse {
        term: state.current_term,
        vote_granted: true,
    })
}

pub fn entry_to_proto(entry: &LogEntry) -> ProtoEntry {
    ProtoEntry {
        id: entry.id,
        term: entry.term,
        data: entry.data.clone(),
    }
}

pub fn proto_to_entry(proto: &ProtoEntry) -> LogEntry {
    LogEntry {
        id: proto.id,
        term: proto.term,
        data: proto.data.clone(),
    }
}
