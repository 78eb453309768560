use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: u32,
    pub listen_addr: SocketAddr,
    pub peers: Vec<PeerConfig>,
    /// A follower converts to candidate when no valid leader RPC arrives
    /// within this window.
    pub heartbeat_timeout_ms: u64,
    /// Interval between leader AppendEntries broadcasts. Must be well below
    /// `heartbeat_timeout_ms`.
    pub heartbeat_interval_ms: u64,
    /// How long a candidate waits for votes before restarting the election.
    pub election_timeout_ms: u64,
    /// Directory for durable Raft state. When unset, state lives in memory
    /// and does not survive a restart.
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub node_id: u32,
    pub addr: String, // host:port format, supports both IP and hostnames
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            listen_addr: "127.0.0.1:50051".parse().unwrap(),
            peers: Vec::new(),
            heartbeat_timeout_ms: 150,
            heartbeat_interval_ms: 30,
            election_timeout_ms: 150,
            data_dir: None,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: u32, listen_addr: SocketAddr) -> Self {
        Self {
            node_id,
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: u32, addr: String) -> Self {
        self.peers.push(PeerConfig { node_id, addr });
        self
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    /// Ids of all configured peers (not including this node).
    pub fn peer_ids(&self) -> Vec<u32> {
        self.peers.iter().map(|p| p.node_id).collect()
    }
}
