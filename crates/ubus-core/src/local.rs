//! In-process bus hub.
//!
//! `LocalHub` routes traffic between connections inside one process, possibly
//! on different threads, with the same routing table the broker daemon uses.
//! The test suite drives the engine through it, and it lets an application
//! run the engine without a daemon.

use crate::error::BusError;
use crate::reactor::{
    BusEvent, CallId, Connector, ListenerId, ObjectDescriptor, ObjectId, ObjectInfo, Reactor, RequestId,
    Status,
};
use crate::router::{Delivery, PeerId, Router};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Default)]
struct PeerQueue {
    events: Mutex<VecDeque<BusEvent>>,
    ready: Condvar,
}

#[derive(Default)]
struct HubState {
    next_peer: PeerId,
    peers: HashMap<PeerId, Arc<PeerQueue>>,
    router: Router,
}

impl HubState {
    /// Queue events for their peers. Lock order is state, then queue.
    fn deliver(&self, deliveries: impl IntoIterator<Item = Delivery>) {
        for (peer, event) in deliveries {
            let Some(queue) = self.peers.get(&peer) else {
                debug!("Dropping event for departed peer {}", peer);
                continue;
            };
            if let Ok(mut events) = queue.events.lock() {
                events.push_back(event);
                queue.ready.notify_all();
            }
        }
    }
}

struct HubInner {
    path: String,
    state: Mutex<HubState>,
}

/// A thread-safe in-process bus.
///
/// Cloning yields another handle to the same hub.
///
/// ```
/// use ubus_core::{Connection, LocalHub};
///
/// let hub = LocalHub::new("/tmp/demo.sock");
/// let mut conn = Connection::builder().connector(hub.clone()).build();
/// conn.connect(Some("/tmp/demo.sock")).unwrap();
/// assert!(conn.is_connected());
/// ```
#[derive(Clone)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

impl LocalHub {
    /// Create a hub reachable under `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                path: path.into(),
                state: Mutex::new(HubState::default()),
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Number of objects currently published on the hub.
    pub fn object_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .map(|state| state.router.object_count())
            .unwrap_or(0)
    }

    /// Number of event subscriptions currently held on the hub.
    pub fn listener_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .map(|state| state.router.listener_count())
            .unwrap_or(0)
    }

    /// Attach a new peer.
    pub fn attach(&self) -> LocalReactor {
        let queue = Arc::new(PeerQueue::default());
        let peer = match self.inner.state.lock() {
            Ok(mut state) => {
                state.next_peer += 1;
                let peer = state.next_peer;
                state.peers.insert(peer, queue.clone());
                peer
            }
            Err(_) => 0,
        };
        debug!("Peer {} attached to {}", peer, self.inner.path);
        LocalReactor {
            hub: self.inner.clone(),
            peer,
            queue,
            next_call: 0,
            closed: peer == 0,
        }
    }
}

impl Connector for LocalHub {
    fn open(&self, path: &str) -> crate::Result<Box<dyn Reactor>> {
        if path != self.inner.path {
            return Err(BusError::ConnectionFailed {
                path: path.to_string(),
                reason: "No such file or directory".into(),
            });
        }
        Ok(Box::new(self.attach()))
    }
}

/// One peer's session on a `LocalHub`.
pub struct LocalReactor {
    hub: Arc<HubInner>,
    peer: PeerId,
    queue: Arc<PeerQueue>,
    next_call: u64,
    closed: bool,
}

impl LocalReactor {
    fn state(&self) -> Result<MutexGuard<'_, HubState>, Status> {
        if self.closed {
            return Err(Status::ConnectionFailed);
        }
        self.hub.state.lock().map_err(|_| Status::UnknownError)
    }
}

impl Reactor for LocalReactor {
    fn add_object(&mut self, descriptor: &ObjectDescriptor) -> Result<ObjectId, Status> {
        let id = self.state()?.router.add_object(self.peer, descriptor)?;
        debug!("Peer {} published '{}' as {}", self.peer, descriptor.name, id);
        Ok(id)
    }

    fn remove_object(&mut self, id: ObjectId) -> Result<(), Status> {
        self.state()?.router.remove_object(self.peer, id)
    }

    fn register_event_handler(&mut self, pattern: &str) -> Result<ListenerId, Status> {
        Ok(self.state()?.router.subscribe(self.peer, pattern))
    }

    fn unregister_event_handler(&mut self, id: ListenerId) -> Result<(), Status> {
        self.state()?.router.unsubscribe(self.peer, id)
    }

    fn lookup(&mut self, path: &str) -> Result<Vec<ObjectInfo>, Status> {
        self.state()?.router.lookup(path)
    }

    fn lookup_id(&mut self, path: &str) -> Result<ObjectId, Status> {
        self.state()?.router.lookup_id(path)
    }

    fn invoke(&mut self, object: ObjectId, method: &str, args: Bytes) -> Result<CallId, Status> {
        self.next_call += 1;
        let call = CallId(self.next_call);
        let mut state = self.state()?;
        let delivery = state.router.invoke(self.peer, call, object, method, args)?;
        debug!("Routing {}.{} from peer {} to peer {}", object, method, self.peer, delivery.0);
        state.deliver([delivery]);
        Ok(call)
    }

    fn abandon(&mut self, call: CallId) {
        if let Ok(mut events) = self.queue.events.lock() {
            events.retain(|event| {
                !matches!(event,
                    BusEvent::Data { call: c, .. } | BusEvent::Complete { call: c, .. } if *c == call)
            });
        }
    }

    fn reply(&mut self, request: RequestId, data: Bytes) -> Result<(), Status> {
        let state = self.state()?;
        let delivery = state.router.reply(self.peer, request, data)?;
        state.deliver([delivery]);
        Ok(())
    }

    fn complete(&mut self, request: RequestId, status: Status) -> Result<(), Status> {
        let mut state = self.state()?;
        let delivery = state.router.complete(self.peer, request, status)?;
        state.deliver([delivery]);
        Ok(())
    }

    fn publish(&mut self, event: &str, data: Bytes) -> Result<(), Status> {
        let state = self.state()?;
        let deliveries = state.router.publish(event, &data);
        state.deliver(deliveries);
        Ok(())
    }

    fn poll(&mut self, timeout: Option<Duration>) -> Result<Option<BusEvent>, Status> {
        if self.closed {
            return Err(Status::ConnectionFailed);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut events = self.queue.events.lock().map_err(|_| Status::UnknownError)?;
        loop {
            if let Some(event) = events.pop_front() {
                return Ok(Some(event));
            }
            match deadline {
                None => {
                    events = self.queue.ready.wait(events).map_err(|_| Status::UnknownError)?;
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    let (guard, _) = self
                        .queue
                        .ready
                        .wait_timeout(events, deadline - now)
                        .map_err(|_| Status::UnknownError)?;
                    events = guard;
                }
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let Ok(mut state) = self.hub.state.lock() else {
            return;
        };
        state.peers.remove(&self.peer);
        let deliveries = state.router.remove_peer(self.peer);
        state.deliver(deliveries);
        debug!("Peer {} detached from {}", self.peer, self.hub.path);
    }
}

impl Drop for LocalReactor {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Signature;
    use crate::reactor::MethodInfo;
    use crate::value::ValueKind;

    fn descriptor(name: &str) -> ObjectDescriptor {
        ObjectDescriptor {
            name: name.to_string(),
            methods: vec![MethodInfo {
                name: "add".into(),
                signature: Signature::new().arg("a", ValueKind::Int32),
            }],
        }
    }

    fn next(reactor: &mut LocalReactor) -> BusEvent {
        reactor
            .poll(Some(Duration::from_millis(100)))
            .unwrap()
            .expect("event expected")
    }

    #[test]
    fn test_open_wrong_path() {
        let hub = LocalHub::new("/tmp/hub.sock");
        assert!(hub.open("/tmp/other.sock").is_err());
        assert!(hub.open("/tmp/hub.sock").is_ok());
    }

    #[test]
    fn test_duplicate_object_rejected() {
        let hub = LocalHub::new("hub");
        let mut a = hub.attach();
        let mut b = hub.attach();
        a.add_object(&descriptor("calc")).unwrap();
        assert_eq!(b.add_object(&descriptor("calc")), Err(Status::InvalidArgument));
        assert_eq!(hub.object_count(), 1);
    }

    #[test]
    fn test_invoke_routes_request_and_reply() {
        let hub = LocalHub::new("hub");
        let mut server = hub.attach();
        let mut client = hub.attach();
        let id = server.add_object(&descriptor("calc")).unwrap();

        assert_eq!(client.lookup_id("calc"), Ok(id));
        let call = client.invoke(id, "add", Bytes::from_static(b"args")).unwrap();

        let request = match next(&mut server) {
            BusEvent::Request(req) => req,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(request.method, "add");
        assert_eq!(&request.args[..], b"args");

        server.reply(request.id, Bytes::from_static(b"one")).unwrap();
        server.complete(request.id, Status::Ok).unwrap();

        assert_eq!(
            next(&mut client),
            BusEvent::Data {
                call,
                data: Bytes::from_static(b"one")
            }
        );
        assert_eq!(
            next(&mut client),
            BusEvent::Complete {
                call,
                status: Status::Ok
            }
        );
    }

    #[test]
    fn test_publish_fans_out_by_pattern() {
        let hub = LocalHub::new("hub");
        let mut a = hub.attach();
        let mut b = hub.attach();
        let exact = a.register_event_handler("net.up").unwrap();
        let prefix = b.register_event_handler("net.*").unwrap();
        b.register_event_handler("disk.*").unwrap();

        a.publish("net.up", Bytes::new()).unwrap();

        assert!(matches!(next(&mut a), BusEvent::Event { listener, .. } if listener == exact));
        assert!(matches!(next(&mut b), BusEvent::Event { listener, .. } if listener == prefix));
        assert_eq!(b.poll(Some(Duration::ZERO)), Ok(None));
    }

    #[test]
    fn test_close_fails_waiting_callers() {
        let hub = LocalHub::new("hub");
        let mut server = hub.attach();
        let mut client = hub.attach();
        let id = server.add_object(&descriptor("calc")).unwrap();
        server.register_event_handler("*").unwrap();
        let call = client.invoke(id, "add", Bytes::new()).unwrap();

        server.close();

        assert_eq!(hub.object_count(), 0);
        assert_eq!(hub.listener_count(), 0);
        assert_eq!(
            next(&mut client),
            BusEvent::Complete {
                call,
                status: Status::ConnectionFailed
            }
        );
        assert_eq!(server.lookup("*"), Err(Status::ConnectionFailed));
    }

    #[test]
    fn test_abandon_purges_queued_fragments() {
        let hub = LocalHub::new("hub");
        let mut peer = hub.attach();
        let id = peer.add_object(&descriptor("self")).unwrap();
        let call = peer.invoke(id, "add", Bytes::new()).unwrap();
        let request = match next(&mut peer) {
            BusEvent::Request(req) => req.id,
            other => panic!("unexpected {:?}", other),
        };
        peer.reply(request, Bytes::new()).unwrap();
        peer.complete(request, Status::Ok).unwrap();

        peer.abandon(call);
        assert_eq!(peer.poll(Some(Duration::ZERO)), Ok(None));
    }

    #[test]
    fn test_poll_blocks_until_another_thread_publishes() {
        let hub = LocalHub::new("hub");
        let mut listener = hub.attach();
        listener.register_event_handler("wake").unwrap();
        let mut publisher = hub.attach();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            publisher.publish("wake", Bytes::new()).unwrap();
        });
        let event = listener.poll(None).unwrap();
        assert!(matches!(event, Some(BusEvent::Event { ref event, .. }) if event == "wake"));
        handle.join().unwrap();
    }
}
