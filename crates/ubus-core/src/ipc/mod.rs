//! Unix socket transport.
//!
//! A broker daemon routes between clients over length-prefixed JSON frames
//! on a filesystem socket.
//!
//! # Architecture
//!
//! - **Server**: The broker. Owns the routing table, one task pair per client
//! - **Client**: A blocking `Reactor` for `Connection`, opened by `SocketConnector`
//! - **Protocol**: Shared framing and message types used by both

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{SocketConnector, SocketReactor};
pub use protocol::{BrokerMessage, ClientMessage};
pub use server::{Broker, BrokerHandle};
