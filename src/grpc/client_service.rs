use tokio::sync::{mpsc, oneshot};
use tonic::{Request, Response, Status};

use crate::error::RaftError;
use crate::proto::command_service_server::CommandService;
use crate::proto::{ApplyCommandRequest, ApplyCommandResponse};
use crate::raft::rpc::entry_to_proto;
use crate::raft::RaftMessage;

/// gRPC service for client-facing commands.
pub struct ClientService {
    raft_tx: mpsc::Sender<RaftMessage>,
}

impl ClientService {
    pub fn new(raft_tx: mpsc::Sender<RaftMessage>) -> Self {
        Self { raft_tx }
    }
}

#[tonic::async_trait]
impl CommandService for ClientService {
    async fn apply_command(
        &self,
        request: Request<ApplyCommandRequest>,
    ) -> Result<Response<ApplyCommandResponse>, Status> {
        let req = request.into_inner();

        let (response_tx, response_rx) = oneshot::channel();
        self.raft_tx
            .send(RaftMessage::ApplyCommand {
                data: req.data,
                response_tx,
            })
            .await
            .map_err(|_| Status::unavailable("raft node is not running"))?;

        match response_rx.await {
            Ok(Ok(entry)) => Ok(Response::new(ApplyCommandResponse {
                entry: Some(entry_to_proto(&entry)),
            })),
            Ok(Err(RaftError::NotLeader(leader))) => {
                let message = match leader {
                    Some(id) => format!("not the leader, redirect to node {id}"),
                    None => "not the leader, leader unknown, retry later".to_string(),
                };
                Err(Status::failed_precondition(message))
            }
            Ok(Err(e)) => Err(Status::internal(e.to_string())),
            Err(_) => Err(Status::unavailable("raft node dropped the request")),
        }
    }
}
