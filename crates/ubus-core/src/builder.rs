//! Builder for configuring a `Connection`.

use crate::codec::{BlobCodec, Codec};
use crate::connection::Connection;
use crate::ipc::SocketConnector;
use crate::reactor::Connector;

/// Builder for configuring a `Connection`.
///
/// # Example
///
/// ```
/// use ubus_core::{BlobCodec, Connection, LocalHub};
///
/// let hub = LocalHub::new("/tmp/bus.sock");
/// let conn = Connection::builder()
///     .connector(hub)
///     .codec(BlobCodec::with_max_size(64 * 1024))
///     .build();
/// assert!(!conn.is_connected());
/// ```
#[derive(Default)]
pub struct ConnectionBuilder {
    connector: Option<Box<dyn Connector>>,
    codec: Option<Box<dyn Codec>>,
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the transport.
    ///
    /// Default: the Unix socket transport.
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Box::new(connector));
        self
    }

    /// Select the value codec.
    ///
    /// Default: `BlobCodec` with the standard message size limit.
    pub fn codec(mut self, codec: impl Codec + 'static) -> Self {
        self.codec = Some(Box::new(codec));
        self
    }

    /// Build a disconnected `Connection`.
    pub fn build(self) -> Connection {
        let connector = self
            .connector
            .unwrap_or_else(|| Box::new(SocketConnector::new()));
        let codec = self.codec.unwrap_or_else(|| Box::new(BlobCodec::new()));
        Connection::from_parts(connector, codec)
    }
}
