use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{RaftError, Result};
use crate::grpc::GrpcServer;
use crate::persist::{FilePersister, MemoryPersister, Persister};
use crate::raft::{LogEntry, RaftMessage, RaftNode};

/// Top-level node wiring the Raft loop, its durable store, and the gRPC
/// server together.
pub struct Node {
    pub config: NodeConfig,
    raft_node: RaftNode,
    rpc_rx: mpsc::Receiver<RaftMessage>,
}

impl Node {
    /// Build a node from its configuration. Returns the apply channel so
    /// the caller can hook up its state machine; committed entries arrive
    /// there in id order, without gaps or duplicates.
    pub fn new(config: NodeConfig) -> Result<(Self, mpsc::Receiver<LogEntry>)> {
        let persister: Box<dyn Persister> = match &config.data_dir {
            Some(dir) => Box::new(FilePersister::new(
                dir.join(format!("raft-{}.json", config.node_id)),
            )?),
            None => Box::new(MemoryPersister::default()),
        };

        let (raft_node, rpc_rx, apply_rx) = RaftNode::new(config.clone(), persister);

        let node = Self {
            config,
            raft_node,
            rpc_rx,
        };
        Ok((node, apply_rx))
    }

    pub fn raft_node(&self) -> &RaftNode {
        &self.raft_node
    }

    /// Run the gRPC server and the Raft loop until shutdown. Either side
    /// failing stops the other.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Node {
            config,
            raft_node,
            rpc_rx,
        } = self;

        raft_node.peers().connect_all().await;

        let server = GrpcServer::new(config.listen_addr, raft_node.message_sender());

        let raft_shutdown = shutdown.clone();
        let raft_task = tokio::spawn(raft_node.run(rpc_rx, raft_shutdown));

        let serve_result = server.run(shutdown.clone()).await;
        shutdown.cancel();

        match raft_task.await {
            Ok(result) => result?,
            Err(e) => return Err(RaftError::Internal(format!("raft task failed: {e}"))),
        }
        serve_result?;

        Ok(())
    }
}
