//! Test harness for multi-node Raft cluster integration tests.
//!
//! Spawns real nodes with real gRPC transport on localhost ports and
//! observes them through their status watch channels and apply sinks.
#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use raft_lite::config::{NodeConfig, PeerConfig};
use raft_lite::grpc::GrpcServer;
use raft_lite::persist::MemoryPersister;
use raft_lite::raft::node::NodeStatus;
use raft_lite::raft::{LogEntry, PeerSet, RaftMessage, RaftNode, RaftRole};

/// Test node configuration with the short timeouts the scenarios assume.
pub fn test_node_config(node_id: u32, port: u16, peers: Vec<(u32, u16)>) -> NodeConfig {
    let peer_configs: Vec<PeerConfig> = peers
        .into_iter()
        .map(|(id, p)| PeerConfig {
            node_id: id,
            addr: format!("127.0.0.1:{}", p),
        })
        .collect();

    NodeConfig {
        node_id,
        listen_addr: format!("127.0.0.1:{}", port).parse().unwrap(),
        peers: peer_configs,
        heartbeat_timeout_ms: 100,
        heartbeat_interval_ms: 20,
        election_timeout_ms: 150,
        data_dir: None,
    }
}

/// Handle to a running test node
pub struct TestNode {
    pub node_id: u32,
    pub port: u16,
    raft_tx: mpsc::Sender<RaftMessage>,
    status_rx: watch::Receiver<NodeStatus>,
    peers: PeerSet,
    /// Entries delivered to this node's apply sink, in delivery order.
    pub applied: Arc<Mutex<Vec<LogEntry>>>,
    shutdown: CancellationToken,
    raft_handle: JoinHandle<()>,
    grpc_handle: JoinHandle<()>,
    apply_handle: JoinHandle<()>,
}

impl TestNode {
    pub fn status(&self) -> NodeStatus {
        self.status_rx.borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.status().role == RaftRole::Leader
    }

    pub fn current_term(&self) -> u64 {
        self.status().term
    }

    pub fn last_log_id(&self) -> u64 {
        self.status().last_log_id
    }

    pub fn commit_index(&self) -> u64 {
        self.status().commit_index
    }

    pub fn leader_id(&self) -> Option<u32> {
        self.status().leader_id
    }

    /// Submit a command to this node, returning the appended entry or the
    /// rejection.
    pub async fn apply_command(&self, data: &[u8]) -> Result<LogEntry, String> {
        let (tx, rx) = oneshot::channel();
        self.raft_tx
            .send(RaftMessage::ApplyCommand {
                data: data.to_vec(),
                response_tx: tx,
            })
            .await
            .map_err(|e| format!("failed to send command: {}", e))?;

        rx.await
            .map_err(|e| format!("failed to receive response: {}", e))?
            .map_err(|e| e.to_string())
    }

    pub async fn applied_entries(&self) -> Vec<LogEntry> {
        self.applied.lock().await.clone()
    }

    pub async fn applied_len(&self) -> usize {
        self.applied.lock().await.len()
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.raft_handle.abort();
        self.grpc_handle.abort();
        self.apply_handle.abort();
    }
}

/// Test cluster managing multiple nodes
pub struct TestCluster {
    pub nodes: HashMap<u32, TestNode>,
    configs: HashMap<u32, NodeConfig>,
    persisters: HashMap<u32, MemoryPersister>,
}

impl TestCluster {
    /// Create and start a cluster with n nodes on consecutive ports.
    pub async fn new(num_nodes: usize, base_port: u16) -> Self {
        let mut cluster = Self {
            nodes: HashMap::new(),
            configs: HashMap::new(),
            persisters: HashMap::new(),
        };

        let all_peers: Vec<(u32, u16)> = (0..num_nodes)
            .map(|i| ((i + 1) as u32, base_port + i as u16))
            .collect();

        for &(node_id, port) in &all_peers {
            let peers: Vec<(u32, u16)> = all_peers
                .iter()
                .filter(|(id, _)| *id != node_id)
                .copied()
                .collect();

            let config = test_node_config(node_id, port, peers);
            let persister = MemoryPersister::default();
            let test_node = start_node(config.clone(), persister.clone()).await;

            cluster.configs.insert(node_id, config);
            cluster.persisters.insert(node_id, persister);
            cluster.nodes.insert(node_id, test_node);
        }

        // Give every gRPC server a moment to bind before dialing.
        tokio::time::sleep(Duration::from_millis(100)).await;

        for node in cluster.nodes.values() {
            node.peers.connect_all().await;
        }

        cluster
    }

    pub fn get_node(&self, node_id: u32) -> Option<&TestNode> {
        self.nodes.get(&node_id)
    }

    pub async fn get_leader_id(&self) -> Option<u32> {
        for node in self.nodes.values() {
            if node.is_leader() {
                return Some(node.node_id);
            }
        }
        None
    }

    pub async fn count_leaders(&self) -> usize {
        self.nodes.values().filter(|n| n.is_leader()).count()
    }

    /// Wait for leader election with timeout
    pub async fn wait_for_leader(&self, timeout_duration: Duration) -> Option<u32> {
        let elected = wait_for(
            || async { self.get_leader_id().await.is_some() },
            timeout_duration,
            Duration::from_millis(20),
        )
        .await;

        if elected {
            self.get_leader_id().await
        } else {
            None
        }
    }

    /// Wait for a new leader among the nodes other than `excluded_node`.
    pub async fn wait_for_new_leader(
        &self,
        excluded_node: u32,
        timeout_duration: Duration,
    ) -> Option<u32> {
        let elected = wait_for(
            || async {
                self.nodes
                    .values()
                    .any(|n| n.node_id != excluded_node && n.is_leader())
            },
            timeout_duration,
            Duration::from_millis(20),
        )
        .await;

        if elected {
            self.nodes
                .values()
                .find(|n| n.node_id != excluded_node && n.is_leader())
                .map(|n| n.node_id)
        } else {
            None
        }
    }

    /// Submit a command through the current leader.
    pub async fn apply_through_leader(&self, data: &[u8]) -> Result<LogEntry, String> {
        let leader_id = self.get_leader_id().await.ok_or("No leader elected")?;
        let leader = self.get_node(leader_id).ok_or("Leader node not found")?;
        leader.apply_command(data).await
    }

    /// Wait until every listed node reports at least this last log id.
    pub async fn wait_for_log_id_on(
        &self,
        node_ids: &[u32],
        min_log_id: u64,
        timeout_duration: Duration,
    ) -> bool {
        wait_for(
            || async {
                node_ids.iter().all(|id| {
                    self.nodes
                        .get(id)
                        .map(|n| n.last_log_id() >= min_log_id)
                        .unwrap_or(false)
                })
            },
            timeout_duration,
            Duration::from_millis(20),
        )
        .await
    }

    /// Wait until every listed node has applied at least this many entries.
    pub async fn wait_for_applied_on(
        &self,
        node_ids: &[u32],
        min_applied: usize,
        timeout_duration: Duration,
    ) -> bool {
        wait_for(
            || async {
                for id in node_ids {
                    match self.nodes.get(id) {
                        Some(node) if node.applied_len().await >= min_applied => {}
                        _ => return false,
                    }
                }
                true
            },
            timeout_duration,
            Duration::from_millis(20),
        )
        .await
    }

    pub fn active_node_ids(&self) -> Vec<u32> {
        self.nodes.keys().copied().collect()
    }

    /// Cut a node off from every other node, both directions.
    pub async fn isolate_node(&self, node_id: u32) {
        for (other_id, other) in &self.nodes {
            if *other_id == node_id {
                continue;
            }
            other.peers.disconnect(node_id).await;
            if let Some(node) = self.nodes.get(&node_id) {
                node.peers.disconnect(*other_id).await;
            }
        }
    }

    /// Restore connectivity between a node and the rest of the cluster.
    pub async fn heal_node(&self, node_id: u32) {
        for (other_id, other) in &self.nodes {
            if *other_id == node_id {
                continue;
            }
            other.peers.reconnect(node_id).await;
            if let Some(node) = self.nodes.get(&node_id) {
                node.peers.reconnect(*other_id).await;
            }
        }
    }

    /// Stop a node, simulating a crash. Its durable state is retained.
    pub fn shutdown_node(&mut self, node_id: u32) -> bool {
        self.nodes.remove(&node_id).is_some()
    }

    /// Restart a previously shut down node from its durable state.
    pub async fn restart_node(&mut self, node_id: u32) {
        let config = self.configs.get(&node_id).expect("unknown node").clone();
        let persister = self
            .persisters
            .get(&node_id)
            .expect("unknown node")
            .clone();

        // Let the old listener release the port.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let test_node = start_node(config, persister).await;
        test_node.peers.connect_all().await;
        self.nodes.insert(node_id, test_node);

        // Surviving nodes re-dial the restarted listener.
        for (other_id, other) in &self.nodes {
            if *other_id != node_id {
                other.peers.reconnect(node_id).await;
            }
        }
    }
}

/// Start a single node over the given persister.
pub async fn start_node(config: NodeConfig, persister: MemoryPersister) -> TestNode {
    let node_id = config.node_id;
    let port = config.listen_addr.port();

    let (raft_node, rpc_rx, mut apply_rx) = RaftNode::new(config.clone(), Box::new(persister));
    let raft_tx = raft_node.message_sender();
    let status_rx = raft_node.subscribe_status();
    let peers = raft_node.peers();
    let shutdown = CancellationToken::new();

    let raft_shutdown = shutdown.clone();
    let raft_handle = tokio::spawn(async move {
        if let Err(e) = raft_node.run(rpc_rx, raft_shutdown).await {
            tracing::error!(node_id, error = %e, "raft node exited with error");
        }
    });

    let grpc_server = GrpcServer::new(config.listen_addr, raft_tx.clone());
    let grpc_shutdown = shutdown.clone();
    let grpc_handle = tokio::spawn(async move {
        if let Err(e) = grpc_server.run(grpc_shutdown).await {
            tracing::error!(node_id, error = %e, "gRPC server error");
        }
    });

    let applied = Arc::new(Mutex::new(Vec::new()));
    let applied_sink = applied.clone();
    let apply_handle = tokio::spawn(async move {
        while let Some(entry) = apply_rx.recv().await {
            applied_sink.lock().await.push(entry);
        }
    });

    TestNode {
        node_id,
        port,
        raft_tx,
        status_rx,
        peers,
        applied,
        shutdown,
        raft_handle,
        grpc_handle,
        apply_handle,
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
