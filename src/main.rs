//! kadnet demo node: join a network, serve the four RPCs, keep buckets fresh

use clap::Parser;
use kadnet::{
    Dht, DhtConfig, MemoryStorage, NodeId, ParallelRouter, Storage, TcpProtocol, TcpRpcServer,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kadnet", about = "Run a Kademlia DHT node")]
struct Args {
    /// Port to listen on
    #[arg(long, default_value_t = 7401)]
    port: u16,

    /// Bind all interfaces instead of loopback only
    #[arg(long)]
    global: bool,

    /// Address of a known peer to bootstrap through, e.g. 192.0.2.1:7401
    #[arg(long, requires = "bootstrap_id")]
    bootstrap: Option<SocketAddr>,

    /// Hex id of the bootstrap peer
    #[arg(long)]
    bootstrap_id: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> kadnet::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "kadnet=debug" } else { "kadnet=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let ip = if args.global {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    };
    let addr = SocketAddr::new(ip, args.port);

    let config = DhtConfig::default();
    let our_id = NodeId::random(&mut rand::thread_rng());
    let protocol = Arc::new(TcpProtocol::new(addr, config.request_timeout));
    let router = Arc::new(ParallelRouter::new(config.clone()));
    let dht = Dht::new(config.clone(), our_id, protocol, router, || {
        Arc::new(MemoryStorage::new()) as Arc<dyn Storage>
    });

    let server = TcpRpcServer::bind(dht.node().clone(), addr).await?;
    info!(id = %our_id, addr = %server.local_addr(), "node up");

    if let (Some(peer_addr), Some(peer_id)) = (args.bootstrap, args.bootstrap_id.as_deref()) {
        let peer_protocol = Arc::new(TcpProtocol::new(peer_addr, config.request_timeout));
        let known = kadnet::Contact::new(NodeId::from_hex(peer_id)?, peer_protocol);
        dht.bootstrap(known).await?;
        info!(peer = %peer_addr, "bootstrapped");
    }

    dht.start_maintenance();

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    dht.shutdown().await;
    server.shutdown();
    Ok(())
}
