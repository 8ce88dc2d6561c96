//! ubus-core - Client engine for a local object/event message bus.
//!
//! Processes publish named objects with typed methods, call methods on other
//! processes' objects, and publish or subscribe to named events. A
//! `Connection` owns every registry it creates, validates inbound arguments
//! against method signatures, and dispatches requests and events from a
//! single-threaded run loop.
//!
//! The transport sits behind the `Reactor` and `Connector` traits. The
//! default connector talks to a broker daemon over a Unix socket (see
//! [`ipc`]); [`LocalHub`] routes between connections inside one process.
//!
//! # Example
//!
//! ```rust,ignore
//! use ubus_core::{Connection, LocalHub, Method, Signature, Value, ValueKind};
//!
//! fn main() -> ubus_core::Result<()> {
//!     let hub = LocalHub::new("/tmp/ubus.sock");
//!     let mut conn = Connection::builder().connector(hub.clone()).build();
//!     conn.connect(Some(hub.path()))?;
//!
//!     let signature = Signature::new()
//!         .arg("a", ValueKind::Int32)
//!         .arg("b", ValueKind::Int32);
//!     conn.register(
//!         "calc",
//!         vec![Method::new("add", signature, |conn, response, args| {
//!             let sum = args.get("a").and_then(Value::as_i64).unwrap_or(0)
//!                 + args.get("b").and_then(Value::as_i64).unwrap_or(0);
//!             response.reply(conn, &Value::table([("sum", Value::from(sum))]))?;
//!             Ok(())
//!         })],
//!     )?;
//!
//!     let args = Value::table([("a", Value::Int32(2)), ("b", Value::Int32(3))]);
//!     let replies = conn.call("calc", "add", &args, 1000)?;
//!     println!("{}", replies[0]);
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod codec;
pub mod config;
pub mod error;
pub mod ipc;
pub mod policy;
pub mod reactor;
pub mod value;

mod builder;
mod call;
mod connection;
mod dispatch;
mod events;
mod local;
mod registry;
mod router;

// Re-export commonly used types
pub use builder::ConnectionBuilder;
pub use cancel::CancellationToken;
pub use codec::{Attribute, BlobCodec, Codec, CodecError};
pub use config::{resolve_socket_path, BrokerConfig, BusConfig};
pub use connection::Connection;
pub use dispatch::{HandlerResult, MethodHandler, ResponseHandle};
pub use error::{BusError, Result};
pub use events::{listener_fn, EventListener, ListenerHandle};
pub use ipc::{Broker, BrokerHandle, SocketConnector, SocketReactor};
pub use local::{LocalHub, LocalReactor};
pub use policy::{validate, ArgumentPolicy, Signature};
pub use reactor::{
    wildcard_match, BusEvent, CallId, Connector, InboundRequest, ListenerId, MethodInfo,
    ObjectDescriptor, ObjectId, ObjectInfo, Reactor, RequestId, Status,
};
pub use registry::{Method, ObjectHandle};
pub use value::{Value, ValueKind};
