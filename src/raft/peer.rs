use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tonic::transport::Channel;

use crate::config::PeerConfig;
use crate::proto::raft_service_client::RaftServiceClient;

/// Cloneable handle over the per-peer gRPC clients.
///
/// The configured peer set is fixed for the lifetime of the node; only the
/// connected subset changes. Disconnect/reconnect exist so tests can
/// simulate partitions the same way an unreachable peer behaves in
/// production: RPCs to it simply never produce a result.
#[derive(Clone)]
pub struct PeerSet {
    configs: Arc<Vec<PeerConfig>>,
    clients: Arc<Mutex<HashMap<u32, RaftServiceClient<Channel>>>>,
}

impl PeerSet {
    pub fn new(configs: Vec<PeerConfig>) -> Self {
        Self {
            configs: Arc::new(configs),
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of configured peers, connected or not. Majority math is based
    /// on the full cluster, never on the reachable subset.
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Dial every configured peer. Failures are logged and left for the
    /// next reconnect attempt; an unreachable peer is not an error.
    pub async fn connect_all(&self) {
        let mut clients = self.clients.lock().await;
        for peer in self.configs.iter() {
            if clients.contains_key(&peer.node_id) {
                continue;
            }
            let addr = format!("http://{}", peer.addr);
            match RaftServiceClient::connect(addr.clone()).await {
                Ok(client) => {
                    tracing::info!(peer = peer.node_id, addr = %addr, "connected to peer");
                    clients.insert(peer.node_id, client);
                }
                Err(e) => {
                    tracing::warn!(peer = peer.node_id, addr = %addr, error = %e, "failed to connect to peer");
                }
            }
        }
    }

    /// Drop the client for a peer; broadcasts skip it until reconnected.
    pub async fn disconnect(&self, peer_id: u32) {
        self.clients.lock().await.remove(&peer_id);
    }

    /// Re-dial a previously disconnected peer.
    pub async fn reconnect(&self, peer_id: u32) {
        let Some(peer) = self.configs.iter().find(|p| p.node_id == peer_id) else {
            return;
        };
        let addr = format!("http://{}", peer.addr);
        match RaftServiceClient::connect(addr.clone()).await {
            Ok(client) => {
                tracing::info!(peer = peer_id, addr = %addr, "reconnected to peer");
                self.clients.lock().await.insert(peer_id, client);
            }
            Err(e) => {
                tracing::warn!(peer = peer_id, addr = %addr, error = %e, "failed to reconnect to peer");
            }
        }
    }

    /// Snapshot of the currently connected clients. Clients are cheap
    /// clones over a shared channel.
    pub async fn clients(&self) -> Vec<(u32, RaftServiceClient<Channel>)> {
        self.clients
            .lock()
            .await
            .iter()
            .map(|(id, client)| (*id, client.clone()))
            .collect()
    }
}
