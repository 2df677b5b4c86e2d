//! Chatmux chat server
//!
//! Runs the single-threaded reactor on its own thread and stops it on Ctrl-C.
//!
//! Usage:
//!   cargo run --                           # Listen on 0.0.0.0:8080
//!   cargo run -- --port 5000               # Run on specific port
//!   RUST_LOG=debug cargo run --            # Verbose routing logs

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chatmux::server::{ChatServer, ServerConfig};
use chatmux::store::DiskFileStore;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "chatmux")]
#[command(version)]
#[command(about = "Length-prefixed TCP chat server with groups and file transfer")]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "CHATMUX_BIND", default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Port to listen on
    #[arg(long, env = "CHATMUX_PORT", default_value_t = 8080)]
    port: u16,

    /// Maximum concurrent connections
    #[arg(long = "max-conn", default_value_t = 1024)]
    max_connections: usize,

    /// Directory transferred files are written under
    #[arg(long, env = "CHATMUX_STORAGE_DIR", default_value = "server_files")]
    storage_dir: PathBuf,

    /// Upper bound on one readiness wait, in milliseconds
    #[arg(long = "poll-timeout-ms", default_value_t = 1000)]
    poll_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = ServerConfig {
        bind_addr: SocketAddr::new(cli.bind, cli.port),
        max_connections: cli.max_connections,
        poll_timeout: Duration::from_millis(cli.poll_timeout_ms),
        ..ServerConfig::default()
    };

    info!("Configuration:");
    info!("  - Bind address: {}", config.bind_addr);
    info!("  - Max connections: {}", config.max_connections);
    info!("  - Storage directory: {}", cli.storage_dir.display());
    info!("  - Max frame size: {} bytes", config.max_frame_size);

    let store = Arc::new(DiskFileStore::new(cli.storage_dir));
    let mut server = ChatServer::bind(config, store).context("Failed to start server")?;
    let shutdown = server.shutdown_handle();

    let reactor = thread::Builder::new()
        .name("chatmux-reactor".to_string())
        .spawn(move || server.run())
        .context("Failed to spawn reactor thread")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down...");
    shutdown.stop()?;

    match reactor.join() {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("Server error: {}", e);
            Err(e.into())
        }
        Err(_) => anyhow::bail!("Reactor thread panicked"),
    }
}
