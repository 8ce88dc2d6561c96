//! Connection lifecycle and the client run loop.
//!
//! A `Connection` is either disconnected or holds one `Session`. Everything
//! the engine registers lives in the session, so dropping it (on disconnect
//! or when the transport is replaced) invalidates every object, listener and
//! pending call of that epoch at once.

use crate::builder::ConnectionBuilder;
use crate::call::PendingCall;
use crate::cancel::CancellationToken;
use crate::codec::Codec;
use crate::config::{resolve_socket_path, BusConfig};
use crate::error::{BusError, Result};
use crate::events::Listener;
use crate::reactor::{BusEvent, CallId, Connector, ListenerId, ObjectId, ObjectInfo, Reactor, Status};
use crate::registry::RegisteredObject;
use crate::value::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

/// State that exists only while connected.
pub(crate) struct Session {
    pub(crate) epoch: u64,
    pub(crate) socket_path: String,
    pub(crate) reactor: Box<dyn Reactor>,
    pub(crate) objects: BTreeMap<ObjectId, RegisteredObject>,
    pub(crate) listeners: BTreeMap<ListenerId, Listener>,
    pub(crate) pending: HashMap<CallId, PendingCall>,
}

/// A client connection to the bus.
///
/// All registries are owned by the connection; there is no process-wide
/// state, so several independent connections can coexist.
pub struct Connection {
    connector: Box<dyn Connector>,
    pub(crate) codec: Box<dyn Codec>,
    pub(crate) session: Option<Session>,
    stop: CancellationToken,
}

impl Connection {
    /// Create a disconnected connection using the Unix socket transport.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder to select the transport and codec.
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    pub(crate) fn from_parts(connector: Box<dyn Connector>, codec: Box<dyn Codec>) -> Self {
        Self {
            connector,
            codec,
            session: None,
            stop: CancellationToken::new(),
        }
    }

    /// Connect to the bus.
    ///
    /// `path` defaults to `$UBUS_SOCKET`, then to the system socket.
    pub fn connect(&mut self, path: Option<&str>) -> Result<()> {
        if self.session.is_some() {
            return Err(BusError::AlreadyConnected);
        }

        let socket_path = resolve_socket_path(path);
        let reactor = self.connector.open(&socket_path).map_err(|e| match e {
            e @ BusError::ConnectionFailed { .. } => e,
            other => BusError::ConnectionFailed {
                path: socket_path.clone(),
                reason: other.to_string(),
            },
        })?;

        let epoch = NEXT_EPOCH.fetch_add(1, Ordering::Relaxed);
        info!("Connected to ubus at {} (epoch {})", socket_path, epoch);
        self.session = Some(Session {
            epoch,
            socket_path,
            reactor,
            objects: BTreeMap::new(),
            listeners: BTreeMap::new(),
            pending: HashMap::new(),
        });
        Ok(())
    }

    /// Disconnect from the bus.
    ///
    /// With `deregister`, every object and listener is removed from the bus
    /// first; individual failures are logged and do not stop the teardown.
    pub fn disconnect(&mut self, deregister: bool) -> Result<()> {
        let mut session = self.session.take().ok_or(BusError::NotConnected)?;

        if deregister {
            for (id, object) in &session.objects {
                if let Err(status) = session.reactor.remove_object(*id) {
                    warn!("Failed to remove object '{}': {}", object.name, status);
                }
            }
            for (id, listener) in &session.listeners {
                if let Err(status) = session.reactor.unregister_event_handler(*id) {
                    warn!("Failed to remove listener for '{}': {}", listener.pattern, status);
                }
            }
        }

        if !session.pending.is_empty() {
            debug!("Discarding {} pending calls", session.pending.len());
        }
        session.reactor.close();
        info!("Disconnected from ubus at {}", session.socket_path);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Socket path of the current session.
    pub fn socket_path(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.socket_path.as_str())
    }

    /// Run the event loop.
    ///
    /// `None` runs until `stop` is requested, `Some(Duration::ZERO)` handles
    /// whatever is already pending, any other duration runs for that long.
    /// A stop requested while no loop is running ends the next one.
    pub fn run(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.session_mut()?;

        if timeout == Some(Duration::ZERO) {
            while let Some(event) = self.poll_event(Some(Duration::ZERO))? {
                self.handle_event(event);
            }
            return Ok(());
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.stop.take() {
                debug!("Run loop stopped");
                break;
            }
            let wait = match deadline {
                None => BusConfig::LOOP_TICK,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    (deadline - now).min(BusConfig::LOOP_TICK)
                }
            };
            if let Some(event) = self.poll_event(Some(wait))? {
                self.handle_event(event);
            }
        }
        Ok(())
    }

    /// Ask the running loop to return.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// A thread-safe token that stops the run loop when cancelled.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// List objects on the bus whose path matches `path` (default `*`).
    pub fn objects(&mut self, path: Option<&str>) -> Result<Vec<ObjectInfo>> {
        let session = self.session_mut()?;
        match session.reactor.lookup(path.unwrap_or("*")) {
            Ok(objects) => Ok(objects),
            Err(Status::NotFound) => Ok(Vec::new()),
            Err(status) => Err(BusError::transport("lookup", status)),
        }
    }

    /// Publish an event.
    ///
    /// Success means the bus accepted the event, not that anyone received it.
    pub fn send(&mut self, event: &str, data: &Value) -> Result<()> {
        self.session_mut()?;
        if event.is_empty() {
            return Err(BusError::usage("Event name must not be empty"));
        }
        let encoded = self.codec.encode(data).map_err(|e| BusError::EncodingFailed {
            message: e.to_string(),
        })?;
        let session = self.session_mut()?;
        session
            .reactor
            .publish(event, encoded)
            .map_err(|status| BusError::transport("publish", status))?;
        debug!("Published event '{}'", event);
        Ok(())
    }

    pub(crate) fn session_mut(&mut self) -> Result<&mut Session> {
        self.session.as_mut().ok_or(BusError::NotConnected)
    }

    /// Epoch of the current session, if connected.
    pub(crate) fn epoch(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.epoch)
    }

    pub(crate) fn poll_event(&mut self, timeout: Option<Duration>) -> Result<Option<BusEvent>> {
        let session = self.session_mut()?;
        session
            .reactor
            .poll(timeout)
            .map_err(|status| BusError::ConnectionFailed {
                path: session.socket_path.clone(),
                reason: status.to_string(),
            })
    }

    /// Route one inbound event to the component that owns it.
    pub(crate) fn handle_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::Request(request) => self.dispatch_request(request),
            BusEvent::Event {
                listener,
                event,
                data,
            } => self.deliver_event(listener, &event, &data),
            BusEvent::Data { call, data } => self.record_fragment(call, &data),
            BusEvent::Complete { call, status } => self.record_completion(call, status),
        }
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.session.is_some() {
            let _ = self.disconnect(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalHub;

    fn hub_connection(hub: &LocalHub) -> Connection {
        Connection::builder().connector(hub.clone()).build()
    }

    #[test]
    fn test_connect_lifecycle() {
        let hub = LocalHub::new("/tmp/lifecycle.sock");
        let mut conn = hub_connection(&hub);
        assert!(!conn.is_connected());
        assert_eq!(conn.socket_path(), None);

        conn.connect(Some("/tmp/lifecycle.sock")).unwrap();
        assert!(conn.is_connected());
        assert_eq!(conn.socket_path(), Some("/tmp/lifecycle.sock"));

        assert!(matches!(
            conn.connect(Some("/tmp/lifecycle.sock")),
            Err(BusError::AlreadyConnected)
        ));

        conn.disconnect(true).unwrap();
        assert!(!conn.is_connected());
        assert!(matches!(conn.disconnect(true), Err(BusError::NotConnected)));
    }

    #[test]
    fn test_connect_failure_leaves_disconnected() {
        let hub = LocalHub::new("/tmp/present.sock");
        let mut conn = hub_connection(&hub);
        let err = conn.connect(Some("/tmp/absent.sock")).unwrap_err();
        assert!(matches!(err, BusError::ConnectionFailed { ref path, .. } if path == "/tmp/absent.sock"));
        assert!(!conn.is_connected());
    }

    #[test]
    fn test_operations_require_connection() {
        let hub = LocalHub::new("hub");
        let mut conn = hub_connection(&hub);
        assert!(matches!(conn.run(Some(Duration::ZERO)), Err(BusError::NotConnected)));
        assert!(matches!(conn.objects(None), Err(BusError::NotConnected)));
        assert!(matches!(
            conn.send("net.up", &Value::empty_table()),
            Err(BusError::NotConnected)
        ));
    }

    #[test]
    fn test_run_zero_returns_immediately() {
        let hub = LocalHub::new("hub");
        let mut conn = hub_connection(&hub);
        conn.connect(Some("hub")).unwrap();
        let started = Instant::now();
        conn.run(Some(Duration::ZERO)).unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_run_timeout_and_stop() {
        let hub = LocalHub::new("hub");
        let mut conn = hub_connection(&hub);
        conn.connect(Some("hub")).unwrap();

        let started = Instant::now();
        conn.run(Some(Duration::from_millis(50))).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));

        conn.stop();
        let started = Instant::now();
        conn.run(None).unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_send_rejects_non_table() {
        let hub = LocalHub::new("hub");
        let mut conn = hub_connection(&hub);
        conn.connect(Some("hub")).unwrap();
        assert!(matches!(
            conn.send("net.up", &Value::from("eth0")),
            Err(BusError::EncodingFailed { .. })
        ));
    }

    #[test]
    fn test_objects_empty_bus() {
        let hub = LocalHub::new("hub");
        let mut conn = hub_connection(&hub);
        conn.connect(Some("hub")).unwrap();
        assert!(conn.objects(None).unwrap().is_empty());
    }

    #[test]
    fn test_drop_deregisters() {
        let hub = LocalHub::new("hub");
        {
            let mut conn = hub_connection(&hub);
            conn.connect(Some("hub")).unwrap();
            conn.register("dropped", vec![]).unwrap();
            assert_eq!(hub.object_count(), 1);
        }
        assert_eq!(hub.object_count(), 0);
    }
}
