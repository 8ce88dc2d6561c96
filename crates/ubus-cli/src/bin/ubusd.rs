//! ubusd - message bus broker daemon.
//!
//! Listens on a Unix socket and routes calls and events between clients
//! until interrupted.

use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use ubus_core::{resolve_socket_path, Broker};

#[derive(Parser, Debug)]
#[command(name = "ubusd")]
#[command(about = "Message bus broker daemon")]
struct Args {
    /// Socket path (defaults to $UBUS_SOCKET, then /var/run/ubus/ubus.sock)
    #[arg(short, long)]
    socket: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let path = resolve_socket_path(args.socket.as_deref());
    info!("Starting ubusd on {}", path);

    let handle = Broker::start(&path).await?;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    handle.join().await;
    Ok(())
}
