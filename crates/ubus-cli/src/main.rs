//! ubus - command-line client for the ubus message bus.
//!
//! Lists objects, calls methods, publishes events and prints events as they
//! arrive. Failures exit with the bus status code of the error.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing::{debug, error, Level};
use tracing_subscriber::FmtSubscriber;
use ubus_core::{BusError, Connection};

#[derive(Parser, Debug)]
#[command(name = "ubus")]
#[command(about = "Command-line client for the ubus message bus")]
struct Args {
    /// Socket path (defaults to $UBUS_SOCKET, then /var/run/ubus/ubus.sock)
    #[arg(short, long)]
    socket: Option<String>,

    /// Call timeout in seconds
    #[arg(short, long, default_value = "30")]
    timeout: u64,

    /// Show method signatures in `list`
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List objects matching PATH (default: all)
    List { path: Option<String> },
    /// Call a method and print its replies
    Call {
        object: String,
        method: String,
        /// Arguments as a JSON object
        message: Option<String>,
    },
    /// Publish an event
    Send {
        event: String,
        /// Event data as a JSON object
        message: Option<String>,
    },
    /// Print events matching the patterns (default: all) until interrupted
    Listen { patterns: Vec<String> },
}

fn run(args: &Args) -> ubus_core::Result<()> {
    let mut conn = Connection::new();
    conn.connect(args.socket.as_deref())?;
    debug!("Using socket {}", conn.socket_path().unwrap_or_default());

    match &args.command {
        Command::List { path } => {
            for line in commands::list(&mut conn, path.as_deref(), args.verbose)? {
                println!("{}", line);
            }
        }
        Command::Call {
            object,
            method,
            message,
        } => {
            let timeout = Duration::from_secs(args.timeout);
            for line in commands::call(&mut conn, object, method, message.as_deref(), timeout)? {
                println!("{}", line);
            }
        }
        Command::Send { event, message } => {
            commands::send(&mut conn, event, message.as_deref())?;
        }
        Command::Listen { patterns } => {
            let token = conn.stop_token();
            ctrlc::set_handler(move || token.cancel()).map_err(|e| BusError::InternalError {
                message: format!("Failed to install Ctrl-C handler: {}", e),
            })?;
            commands::listen(&mut conn, patterns)?;
        }
    }

    conn.disconnect(false)
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::WARN };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    if let Err(err) = run(&args) {
        error!("Command failed: {}", err);
        std::process::exit(err.status().code() as i32);
    }
    Ok(())
}
