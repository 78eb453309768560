use tokio::sync::{mpsc, oneshot};
use tonic::{Request, Response, Status};

use crate::proto::raft_service_server::RaftService;
use crate::proto::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use crate::raft::RaftMessage;

/// gRPC service for peer-to-peer Raft traffic.
///
/// Handlers only forward onto the node's intake channel and wait for the
/// answer; every request is processed in arrival order on the event loop.
pub struct ClusterService {
    raft_tx: mpsc::Sender<RaftMessage>,
}

impl ClusterService {
    pub fn new(raft_tx: mpsc::Sender<RaftMessage>) -> Self {
        Self { raft_tx }
    }
}

#[tonic::async_trait]
impl RaftService for ClusterService {
    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(
            leader = req.leader_id,
            term = req.term,
            entries = req.entries.len(),
            "received append entries"
        );

        let (response_tx, response_rx) = oneshot::channel();
        self.raft_tx
            .send(RaftMessage::AppendEntries { req, response_tx })
            .await
            .map_err(|_| Status::unavailable("raft node is not running"))?;

        match response_rx.await {
            Ok(resp) => Ok(Response::new(resp)),
            Err(_) => Err(Status::unavailable("raft node dropped the request")),
        }
    }

    async fn request_vote(
        &self,
        request: Request<RequestVoteRequest>,
    ) -> Result<Response<RequestVoteResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(
            candidate = req.candidate_id,
            term = req.term,
            "received request vote"
        );

        let (response_tx, response_rx) = oneshot::channel();
        self.raft_tx
            .send(RaftMessage::RequestVote { req, response_tx })
            .await
            .map_err(|_| Status::unavailable("raft node is not running"))?;

        match response_rx.await {
            Ok(resp) => Ok(Response::new(resp)),
            Err(_) => Err(Status::unavailable("raft node dropped the request")),
        }
    }
}
