use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use seeks_dht::transport::udp::UdpTransport;
use seeks_dht::{BootstrapPeer, DhtConfig, PeerNode};

/// Run one peer of the overlay.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Address to bind the UDP endpoint to.
    #[arg(long, env = "SEEKS_DHT_BIND", default_value = "0.0.0.0:8250")]
    bind: SocketAddr,

    /// Number of virtual nodes to host.
    #[arg(long, default_value_t = 32)]
    vnodes: usize,

    /// Peer to join through, `host:port` or `host:port/0x<id>`. Repeatable.
    #[arg(long = "bootstrap", env = "SEEKS_DHT_BOOTSTRAP", value_delimiter = ',')]
    bootstrap: Vec<BootstrapPeer>,

    /// Start a new ring if no bootstrap peer answers.
    #[arg(long)]
    self_bootstrap: bool,

    /// Stabilization period in milliseconds.
    #[arg(long, default_value_t = 1000)]
    stabilize_ms: u64,

    /// RPC timeout in milliseconds.
    #[arg(long, default_value_t = 2000)]
    rpc_timeout_ms: u64,

    #[arg(long, default_value_t = 8)]
    successor_list_len: usize,

    /// Where ring membership is persisted.
    #[arg(long, default_value = "vnodes-table.dat")]
    vnodes_table: PathBuf,

    /// Also persist ring membership every this many seconds.
    #[arg(long)]
    hibernate_secs: Option<u64>,
}

impl From<Args> for DhtConfig {
    fn from(args: Args) -> Self {
        DhtConfig {
            bind_addr: args.bind,
            num_vnodes: args.vnodes,
            successor_list_len: args.successor_list_len,
            stabilize_period: Duration::from_millis(args.stabilize_ms),
            rpc_timeout: Duration::from_millis(args.rpc_timeout_ms),
            bootstrap: args.bootstrap,
            self_bootstrap: args.self_bootstrap,
            vnodes_table_file: args.vnodes_table,
            hibernate_period: args.hibernate_secs.map(Duration::from_secs),
            ..DhtConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config: DhtConfig = Args::parse().into();
    let transport = UdpTransport::bind(config.bind_addr, config.rpc_timeout).await?;
    let peer = PeerNode::new(config, Arc::new(transport.clone()));
    peer.boot().await?;
    info!(addr = %peer.addr(), vnodes = peer.vnodes().await.len(), "peer running");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    peer.stop().await?;
    transport.close();
    Ok(())
}
