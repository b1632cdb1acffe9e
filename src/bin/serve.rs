use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use blockhouse::server::{Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "blockhouse-serve", about = "Run the cluster metadata server")]
struct Args {
    /// Metadata block device or image file
    #[arg(long)]
    device: PathBuf,

    /// Address to accept client connections on
    #[arg(long, default_value = "0.0.0.0:12021")]
    bind: SocketAddr,

    /// Election term of this server instance
    #[arg(long, default_value_t = 1)]
    term: u64,

    /// Seconds to wait for previously mounted clients to reconnect before
    /// fencing them
    #[arg(long, default_value_t = 30)]
    recovery_timeout_secs: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut cfg = ServerConfig::new(&args.device, args.bind);
    cfg.term = args.term;
    cfg.recovery_timeout = Duration::from_secs(args.recovery_timeout_secs);

    let server = Server::start(cfg)
        .with_context(|| format!("starting server on {}", args.device.display()))?;
    info!(addr = %server.local_addr(), "serving");

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })?;
    let _ = stop_rx.recv();

    server.stop()?;
    Ok(())
}
