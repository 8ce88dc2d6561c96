//! Unix socket reactor for connecting to a running broker.
//!
//! The reactor speaks the framed JSON protocol over a blocking
//! `UnixStream`. Operations that need an answer send a sequenced request and
//! wait for the matching acknowledgment; traffic that arrives meanwhile is
//! queued in arrival order and handed out by `poll`.

use super::protocol::{encode_frame, BrokerMessage, ClientMessage, FrameReader};
use crate::config::BusConfig;
use crate::error::BusError;
use crate::reactor::{
    BusEvent, CallId, Connector, ListenerId, ObjectDescriptor, ObjectId, ObjectInfo, Reactor, RequestId,
    Status,
};
use bytes::Bytes;
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const READ_CHUNK: usize = 8192;

/// Opens `SocketReactor`s.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketConnector;

impl SocketConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for SocketConnector {
    fn open(&self, path: &str) -> crate::Result<Box<dyn Reactor>> {
        Ok(Box::new(SocketReactor::connect(path)?))
    }
}

/// A session with the broker over a Unix-domain socket.
#[derive(Debug)]
pub struct SocketReactor {
    stream: UnixStream,
    path: String,
    reader: FrameReader,
    backlog: VecDeque<BusEvent>,
    next_seq: u64,
    ack_timeout: Duration,
    closed: bool,
}

impl SocketReactor {
    /// Connect to the broker listening on `path`.
    pub fn connect(path: &str) -> crate::Result<Self> {
        let stream = UnixStream::connect(path).map_err(|e| BusError::ConnectionFailed {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        debug!("Connected to broker at {}", path);
        Ok(Self {
            stream,
            path: path.to_string(),
            reader: FrameReader::new(),
            backlog: VecDeque::new(),
            next_seq: 0,
            ack_timeout: BusConfig::SYNC_REQUEST_TIMEOUT,
            closed: false,
        })
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn fail(&mut self, reason: impl std::fmt::Display) -> Status {
        if !self.closed {
            warn!("Lost connection to broker at {}: {}", self.path, reason);
            self.closed = true;
        }
        Status::ConnectionFailed
    }

    fn send(&mut self, message: &ClientMessage) -> Result<(), Status> {
        if self.closed {
            return Err(Status::ConnectionFailed);
        }
        let frame = encode_frame(message).map_err(|e| {
            warn!("Refusing to send message: {}", e);
            Status::InvalidArgument
        })?;
        if let Err(e) = self.stream.set_nonblocking(false) {
            return Err(self.fail(e));
        }
        match self.stream.write_all(&frame) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Read one broker message, waiting until `deadline` (`None` blocks).
    fn read_message(&mut self, deadline: Option<Instant>) -> Result<Option<BrokerMessage>, Status> {
        loop {
            match self.reader.next_frame() {
                Ok(Some(frame)) => {
                    return match serde_json::from_slice(&frame) {
                        Ok(message) => Ok(Some(message)),
                        Err(e) => Err(self.fail(format!("malformed frame: {}", e))),
                    };
                }
                Ok(None) => {}
                Err(e) => return Err(self.fail(e)),
            }
            if self.closed {
                return Err(Status::ConnectionFailed);
            }

            let configured = match deadline {
                None => self
                    .stream
                    .set_nonblocking(false)
                    .and_then(|_| self.stream.set_read_timeout(None)),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        self.stream.set_nonblocking(true)
                    } else {
                        self.stream
                            .set_nonblocking(false)
                            .and_then(|_| self.stream.set_read_timeout(Some(remaining)))
                    }
                }
            };
            if let Err(e) = configured {
                return Err(self.fail(e));
            }

            let mut chunk = [0u8; READ_CHUNK];
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(self.fail("broker closed the connection")),
                Ok(n) => self.reader.extend(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(None)
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    /// Send a sequenced request and wait for its acknowledgment.
    ///
    /// A missing acknowledgment closes the session: the broker may still
    /// apply the request, and dropping the connection makes it discard
    /// everything this peer owned.
    fn request(&mut self, message: ClientMessage, seq: u64) -> Result<BrokerMessage, Status> {
        self.send(&message)?;
        let deadline = Instant::now() + self.ack_timeout;
        loop {
            let Some(reply) = self.read_message(Some(deadline))? else {
                warn!("Broker did not acknowledge request {} in time", seq);
                self.close();
                return Err(Status::Timeout);
            };
            if reply.seq() == Some(seq) {
                return Ok(reply);
            }
            match reply.into_event() {
                Some(event) => self.backlog.push_back(event),
                None => debug!("Ignoring stray acknowledgment while waiting for {}", seq),
            }
        }
    }

    fn request_status(&mut self, message: ClientMessage, seq: u64) -> Result<Option<u32>, Status> {
        match self.request(message, seq)? {
            BrokerMessage::Status {
                status: Status::Ok,
                id,
                ..
            } => Ok(id),
            BrokerMessage::Status { status, .. } => Err(status),
            _ => Err(Status::UnknownError),
        }
    }
}

impl Reactor for SocketReactor {
    fn add_object(&mut self, descriptor: &ObjectDescriptor) -> Result<ObjectId, Status> {
        let seq = self.next_seq();
        let message = ClientMessage::AddObject {
            seq,
            name: descriptor.name.clone(),
            methods: descriptor.methods.clone(),
        };
        self.request_status(message, seq)?
            .map(ObjectId)
            .ok_or(Status::UnknownError)
    }

    fn remove_object(&mut self, object: ObjectId) -> Result<(), Status> {
        let seq = self.next_seq();
        self.request_status(ClientMessage::RemoveObject { seq, object }, seq)
            .map(|_| ())
    }

    fn register_event_handler(&mut self, pattern: &str) -> Result<ListenerId, Status> {
        let seq = self.next_seq();
        let message = ClientMessage::Subscribe {
            seq,
            pattern: pattern.to_string(),
        };
        self.request_status(message, seq)?
            .map(ListenerId)
            .ok_or(Status::UnknownError)
    }

    fn unregister_event_handler(&mut self, listener: ListenerId) -> Result<(), Status> {
        let seq = self.next_seq();
        self.request_status(ClientMessage::Unsubscribe { seq, listener }, seq)
            .map(|_| ())
    }

    fn lookup(&mut self, path: &str) -> Result<Vec<ObjectInfo>, Status> {
        let seq = self.next_seq();
        let message = ClientMessage::Lookup {
            seq,
            path: path.to_string(),
        };
        match self.request(message, seq)? {
            BrokerMessage::Objects { objects, .. } => Ok(objects),
            BrokerMessage::Status { status, .. } if !status.is_ok() => Err(status),
            _ => Err(Status::UnknownError),
        }
    }

    fn lookup_id(&mut self, path: &str) -> Result<ObjectId, Status> {
        self.lookup(path)?
            .into_iter()
            .find(|object| object.path == path)
            .map(|object| object.id)
            .ok_or(Status::NotFound)
    }

    fn invoke(&mut self, object: ObjectId, method: &str, args: Bytes) -> Result<CallId, Status> {
        let seq = self.next_seq();
        let message = ClientMessage::Invoke {
            seq,
            object,
            method: method.to_string(),
            args,
        };
        self.request_status(message, seq)?;
        Ok(CallId(seq))
    }

    fn abandon(&mut self, call: CallId) {
        self.backlog.retain(|event| {
            !matches!(event,
                BusEvent::Data { call: c, .. } | BusEvent::Complete { call: c, .. } if *c == call)
        });
    }

    fn reply(&mut self, request: RequestId, data: Bytes) -> Result<(), Status> {
        self.send(&ClientMessage::Reply { request, data })
    }

    fn complete(&mut self, request: RequestId, status: Status) -> Result<(), Status> {
        self.send(&ClientMessage::Complete { request, status })
    }

    fn publish(&mut self, event: &str, data: Bytes) -> Result<(), Status> {
        let seq = self.next_seq();
        let message = ClientMessage::Publish {
            seq,
            event: event.to_string(),
            data,
        };
        self.request_status(message, seq).map(|_| ())
    }

    fn poll(&mut self, timeout: Option<Duration>) -> Result<Option<BusEvent>, Status> {
        if let Some(event) = self.backlog.pop_front() {
            return Ok(Some(event));
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match self.read_message(deadline)? {
                Some(message) => match message.into_event() {
                    Some(event) => return Ok(Some(event)),
                    None => debug!("Ignoring stray acknowledgment"),
                },
                None => return Ok(None),
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.stream.shutdown(Shutdown::Both);
        debug!("Closed connection to broker at {}", self.path);
    }
}

impl Drop for SocketReactor {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::write_frame_sync;

    #[test]
    fn test_connect_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.sock");
        let err = SocketReactor::connect(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, BusError::ConnectionFailed { .. }));
    }

    fn pair() -> (SocketReactor, UnixStream) {
        let (client, server) = UnixStream::pair().unwrap();
        let reactor = SocketReactor {
            stream: client,
            path: "pair".into(),
            reader: FrameReader::new(),
            backlog: VecDeque::new(),
            next_seq: 0,
            ack_timeout: Duration::from_secs(5),
            closed: false,
        };
        (reactor, server)
    }

    fn push(server: &mut UnixStream, message: &BrokerMessage) {
        let payload = serde_json::to_vec(message).unwrap();
        write_frame_sync(server, &payload).unwrap();
    }

    #[test]
    fn test_poll_zero_without_traffic() {
        let (mut reactor, _server) = pair();
        assert_eq!(reactor.poll(Some(Duration::ZERO)), Ok(None));
    }

    #[test]
    fn test_poll_with_timeout_elapses() {
        let (mut reactor, _server) = pair();
        let started = Instant::now();
        assert_eq!(reactor.poll(Some(Duration::from_millis(30))), Ok(None));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_pushed_traffic_is_queued_during_request() {
        let (mut reactor, mut server) = pair();
        let event = BrokerMessage::Event {
            listener: ListenerId(1),
            event: "net.up".into(),
            data: Bytes::new(),
        };
        push(&mut server, &event);
        push(&mut server, &BrokerMessage::ack(1, Ok(Some(5))));

        assert_eq!(reactor.register_event_handler("net.*"), Ok(ListenerId(5)));
        assert_eq!(reactor.poll(Some(Duration::ZERO)), Ok(event.into_event()));
    }

    #[test]
    fn test_failed_ack_maps_to_status() {
        let (mut reactor, mut server) = pair();
        push(&mut server, &BrokerMessage::ack(1, Err(Status::InvalidArgument)));
        let descriptor = ObjectDescriptor {
            name: "calc".into(),
            methods: vec![],
        };
        assert_eq!(reactor.add_object(&descriptor), Err(Status::InvalidArgument));
    }

    #[test]
    fn test_missing_ack_closes_session() {
        let (mut reactor, mut server) = pair();
        reactor.ack_timeout = Duration::from_millis(50);
        let descriptor = ObjectDescriptor {
            name: "calc".into(),
            methods: vec![],
        };
        assert_eq!(reactor.add_object(&descriptor), Err(Status::Timeout));

        assert_eq!(reactor.poll(Some(Duration::ZERO)), Err(Status::ConnectionFailed));

        // The broker side observes the hangup and drops the peer's objects.
        let mut sent = Vec::new();
        server.read_to_end(&mut sent).unwrap();
        let mut reader = FrameReader::new();
        reader.extend(&sent);
        let frame = reader.next_frame().unwrap().unwrap();
        let request: ClientMessage = serde_json::from_slice(&frame).unwrap();
        assert!(matches!(request, ClientMessage::AddObject { seq: 1, .. }));
    }

    #[test]
    fn test_peer_hangup_is_connection_failure() {
        let (mut reactor, server) = pair();
        drop(server);
        assert_eq!(reactor.poll(None), Err(Status::ConnectionFailed));
        assert_eq!(
            reactor.publish("x", Bytes::new()),
            Err(Status::ConnectionFailed)
        );
    }
}
