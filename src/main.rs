use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use grapnel::{Dht, DhtConfig, Keypair, MemoryValueStore};

#[derive(Parser, Debug)]
#[command(name = "grapnel")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Address of a node already in the overlay.
    #[arg(short = 'B', long = "bootstrap", value_name = "IP:PORT")]
    bootstrap: Option<SocketAddr>,

    /// Hex-encoded 32-byte Ed25519 secret key; generated fresh when absent.
    #[arg(short, long, value_name = "HEX")]
    secret_key: Option<String>,

    /// Seconds between status log lines.
    #[arg(short, long, default_value = "300")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let keypair = match &args.secret_key {
        Some(hex_key) => {
            let bytes = hex::decode(hex_key).context("invalid hex secret key")?;
            let bytes: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("secret key must be 64 hex characters (32 bytes)"))?;
            Keypair::from_secret_key_bytes(&bytes)
        }
        None => Keypair::generate(),
    };

    let config = DhtConfig {
        bind_addr: args.bind,
        bootstrap: args.bootstrap,
        ..DhtConfig::default()
    };
    let dht = Dht::bootstrap(keypair, Arc::new(MemoryValueStore::new()), config)
        .await
        .context("failed to start dht node")?;

    info!(
        node = %dht.node_id(),
        addr = %dht.local_addr(),
        "grapnel node running"
    );

    let mut interval = time::interval(Duration::from_secs(args.status_interval));
    interval.tick().await;

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                info!(known_peers = dht.rpc().node_count().await, "status");
            }
        }
    }

    dht.shutdown().await;
    Ok(())
}
