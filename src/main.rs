//! Genesis Mesh node daemon.

use clap::Parser;
use genesis_mesh::config::NodeConfig;
use genesis_mesh::node;
use genesis_mesh::rbac::Role;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "meshd", version, about = "Genesis Mesh node")]
struct Args {
    /// Data directory (keys/, state/, genesis.json)
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Listen address for the mesh transport
    #[arg(short, long, default_value_t = node::default_listen())]
    listen: String,

    /// Extra bootstrap endpoints (comma-separated host:port)
    #[arg(short, long)]
    bootstrap: Option<String>,

    /// Role requested at join: operator, admin, anchor, client
    #[arg(short, long, default_value = "client")]
    role: String,

    /// Network Authority base URL
    #[arg(short = 'a', long)]
    authority_url: String,

    /// Maximum concurrent connections
    #[arg(long, default_value_t = 50)]
    max_connections: usize,

    /// Route announcement interval in seconds
    #[arg(long, default_value_t = 30)]
    route_announce_interval: u64,

    /// Peer discovery gossip interval in seconds
    #[arg(long, default_value_t = 60)]
    discovery_interval: u64,

    /// CRL announcement interval in seconds
    #[arg(long, default_value_t = 60)]
    crl_announce_interval: u64,

    /// Fraction of certificate lifetime before renewal starts
    #[arg(long, default_value_t = 0.5)]
    renewal_ratio: f64,

    /// Handshake timeout in seconds
    #[arg(long, default_value_t = 10)]
    handshake_timeout: u64,

    /// Ping interval in seconds
    #[arg(long, default_value_t = 15)]
    ping_interval: u64,

    /// Maximum datagram hop count
    #[arg(long, default_value_t = 6)]
    max_hops: u32,

    /// Maximum entries per discovery gossip response
    #[arg(long, default_value_t = 32)]
    peer_gossip_cap: usize,

    /// Seconds before an unheard peer is evicted
    #[arg(long, default_value_t = 900)]
    stale_peer_timeout: u64,

    /// Reputation below which a peer is blacklisted
    #[arg(long, default_value_t = 0.2)]
    reputation_blacklist_threshold: f64,
}

fn parse_config(args: Args) -> Result<NodeConfig, String> {
    let listen_address: SocketAddr = args
        .listen
        .parse()
        .map_err(|e| format!("invalid listen address {}: {e}", args.listen))?;

    let mut bootstrap_endpoints = Vec::new();
    if let Some(list) = args.bootstrap {
        for part in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let endpoint: SocketAddr = part
                .parse()
                .map_err(|e| format!("invalid bootstrap endpoint {part}: {e}"))?;
            bootstrap_endpoints.push(endpoint);
        }
    }

    let role = Role::parse(&args.role).ok_or_else(|| format!("invalid role {}", args.role))?;

    Ok(NodeConfig {
        data_dir: args.data_dir,
        listen_address,
        bootstrap_endpoints,
        role,
        authority_url: args.authority_url,
        max_connections: args.max_connections,
        route_announce_interval_s: args.route_announce_interval,
        discovery_interval_s: args.discovery_interval,
        crl_announce_interval_s: args.crl_announce_interval,
        renewal_ratio: args.renewal_ratio,
        handshake_timeout_s: args.handshake_timeout,
        ping_interval_s: args.ping_interval,
        max_hops: args.max_hops,
        peer_gossip_cap: args.peer_gossip_cap,
        stale_peer_timeout_s: args.stale_peer_timeout,
        reputation_blacklist_threshold: args.reputation_blacklist_threshold,
    })
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("genesis_mesh=info".parse().expect("static directive"))
                .add_directive("meshd=info".parse().expect("static directive")),
        )
        .init();

    let args = Args::parse();
    let cfg = match parse_config(args) {
        Ok(cfg) => cfg,
        Err(message) => {
            error!("{}", message);
            std::process::exit(1);
        }
    };

    info!("meshd v{} starting", env!("CARGO_PKG_VERSION"));
    match node::run(cfg).await {
        Ok(()) => {
            info!("clean exit");
        }
        Err(fatal) => {
            error!("{}", fatal);
            std::process::exit(fatal.exit_code);
        }
    }
}
