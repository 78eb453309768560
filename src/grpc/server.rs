use std::net::SocketAddr;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::grpc::client_service::ClientService;
use crate::grpc::cluster_service::ClusterService;
use crate::proto::command_service_server::CommandServiceServer;
use crate::proto::raft_service_server::RaftServiceServer;
use crate::raft::RaftMessage;

pub struct GrpcServer {
    addr: SocketAddr,
    raft_tx: mpsc::Sender<RaftMessage>,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, raft_tx: mpsc::Sender<RaftMessage>) -> Self {
        Self { addr, raft_tx }
    }

    /// Serve both services until the token is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        let cluster_service = ClusterService::new(self.raft_tx.clone());
        let client_service = ClientService::new(self.raft_tx);

        tracing::info!(addr = %self.addr, "starting gRPC server");

        Server::builder()
            .add_service(RaftServiceServer::new(cluster_service))
            .add_service(CommandServiceServer::new(client_service))
            .serve_with_shutdown(self.addr, shutdown.cancelled_owned())
            .await
    }
}
