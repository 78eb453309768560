use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use raft_lite::config::{NodeConfig, PeerConfig};
use raft_lite::node::Node;
use raft_lite::shutdown::shutdown_token;

#[derive(Parser, Debug)]
#[command(name = "raft-lite")]
#[command(about = "A Raft replicated-log consensus node")]
struct Args {
    /// Node ID (unique identifier for this node)
    #[arg(long, default_value = "1")]
    node_id: u32,

    /// Port to listen on for gRPC
    #[arg(long, default_value = "50051")]
    port: u16,

    /// Peer addresses (comma-separated, format: "id:host:port")
    /// Example: "2:127.0.0.1:50052,3:127.0.0.1:50053"
    #[arg(long, default_value = "")]
    peers: String,

    /// Directory for durable Raft state; omit to keep state in memory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Follower election trigger window in milliseconds
    #[arg(long, default_value = "150")]
    heartbeat_timeout_ms: u64,

    /// Leader heartbeat interval in milliseconds
    #[arg(long, default_value = "30")]
    heartbeat_interval_ms: u64,

    /// Candidate election round timeout in milliseconds
    #[arg(long, default_value = "150")]
    election_timeout_ms: u64,
}

fn parse_peers(peers_str: &str) -> Vec<PeerConfig> {
    if peers_str.is_empty() {
        return Vec::new();
    }

    peers_str
        .split(',')
        .filter_map(|peer| {
            let parts: Vec<&str> = peer.trim().split(':').collect();
            if parts.len() == 3 {
                let node_id: u32 = parts[0].parse().ok()?;
                let addr = format!("{}:{}", parts[1], parts[2]);
                Some(PeerConfig { node_id, addr })
            } else {
                tracing::warn!(peer, "invalid peer format, expected id:host:port");
                None
            }
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let config = NodeConfig {
        node_id: args.node_id,
        listen_addr,
        peers: parse_peers(&args.peers),
        heartbeat_timeout_ms: args.heartbeat_timeout_ms,
        heartbeat_interval_ms: args.heartbeat_interval_ms,
        election_timeout_ms: args.election_timeout_ms,
        data_dir: args.data_dir,
    };

    tracing::info!(
        node_id = config.node_id,
        listen_addr = %config.listen_addr,
        peers = ?config.peers.iter().map(|p| format!("{}:{}", p.node_id, p.addr)).collect::<Vec<_>>(),
        "starting raft-lite node"
    );

    let (node, mut apply_rx) = Node::new(config)?;

    // Stand-in application state machine: drain committed entries and log
    // them. A real application would consume this channel instead.
    tokio::spawn(async move {
        while let Some(entry) = apply_rx.recv().await {
            tracing::info!(
                id = entry.id,
                term = entry.term,
                bytes = entry.data.len(),
                "applied entry"
            );
        }
    });

    let token = shutdown_token();
    node.run(token).await?;

    Ok(())
}
