use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use clap::Parser;
use raft_kv::client_api;
use raft_kv::config::TimerConfig;
use raft_kv::server::{Config, Server};
use raft_kv::types::NodeId;

#[derive(Parser)]
#[command(about = "Replicated key-value store on Raft with leader leases")]
struct Args {
    /// This node's numeric ID (must be unique in the cluster).
    #[arg(long)]
    id: u64,

    /// TCP address to listen on for Raft RPCs.
    #[arg(long)]
    addr: SocketAddr,

    /// A peer in the form ID=ADDR. Repeat for each peer.
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<(u64, SocketAddr)>,

    /// Directory for persistent state (meta.json, log.txt).
    #[arg(long)]
    data_dir: PathBuf,

    /// HTTP address for client requests (POST /client).
    #[arg(long)]
    client_addr: Option<SocketAddr>,

    #[arg(long, default_value_t = 5000)]
    election_timeout_min_ms: u64,

    #[arg(long, default_value_t = 10000)]
    election_timeout_max_ms: u64,

    #[arg(long, default_value_t = 1000)]
    heartbeat_interval_ms: u64,

    /// How long a majority-acknowledged heartbeat round lets the leader serve reads.
    #[arg(long, default_value_t = 2500)]
    lease_duration_ms: u64,

    /// Bound on one vote round and on each outbound connection.
    #[arg(long, default_value_t = 1000)]
    rpc_timeout_ms: u64,

    /// How long a client request may wait for its reply.
    #[arg(long, default_value_t = 10000)]
    client_timeout_ms: u64,
}

fn parse_peer(raw: &str) -> Result<(u64, SocketAddr), String> {
    let (id, addr) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected ID=ADDR, got: {raw}"))?;
    let id = id.parse().map_err(|e| format!("invalid peer id '{id}': {e}"))?;
    let addr = addr
        .parse()
        .map_err(|e| format!("invalid peer addr '{addr}': {e}"))?;
    Ok((id, addr))
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();

    let timers = TimerConfig {
        election_timeout_min: Duration::from_millis(args.election_timeout_min_ms),
        election_timeout_max: Duration::from_millis(args.election_timeout_max_ms),
        heartbeat_interval: Duration::from_millis(args.heartbeat_interval_ms),
        lease_duration: Duration::from_millis(args.lease_duration_ms),
        rpc_timeout: Duration::from_millis(args.rpc_timeout_ms),
    };
    timers.validate()?;

    let peers: HashMap<NodeId, SocketAddr> = args
        .peers
        .into_iter()
        .map(|(id, addr)| (NodeId::from(id), addr))
        .collect();

    let (client_tx, client_rx) = mpsc::channel();
    if let Some(client_addr) = args.client_addr {
        client_api::start(
            client_addr,
            client_tx,
            Duration::from_millis(args.client_timeout_ms),
        );
    }

    Server::start(
        Config {
            id: NodeId::from(args.id),
            addr: args.addr,
            peers,
            data_dir: args.data_dir,
            timers,
        },
        client_rx,
    )?
    .run()?;

    Ok(())
}
