//! The seam between the engine and the transport.
//!
//! A `Reactor` owns one transport session. It publishes objects and
//! listeners, forwards invocations, and hands inbound traffic back to the
//! engine as `BusEvent`s from `poll`, in the order the transport observed it.
//! The engine never gives the reactor a callback into itself, so handlers can
//! re-enter the engine while an event is being processed.

use crate::policy::Signature;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Wire status codes shared by every peer on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum Status {
    Ok = 0,
    InvalidCommand = 1,
    InvalidArgument = 2,
    MethodNotFound = 3,
    NotFound = 4,
    NoData = 5,
    PermissionDenied = 6,
    Timeout = 7,
    NotSupported = 8,
    UnknownError = 9,
    ConnectionFailed = 10,
}

impl Status {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        let status = match code {
            0 => Status::Ok,
            1 => Status::InvalidCommand,
            2 => Status::InvalidArgument,
            3 => Status::MethodNotFound,
            4 => Status::NotFound,
            5 => Status::NoData,
            6 => Status::PermissionDenied,
            7 => Status::Timeout,
            8 => Status::NotSupported,
            9 => Status::UnknownError,
            10 => Status::ConnectionFailed,
            _ => return None,
        };
        Some(status)
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    pub fn message(self) -> &'static str {
        match self {
            Status::Ok => "Success",
            Status::InvalidCommand => "Invalid command",
            Status::InvalidArgument => "Invalid argument",
            Status::MethodNotFound => "Method not found",
            Status::NotFound => "Not found",
            Status::NoData => "No response",
            Status::PermissionDenied => "Permission denied",
            Status::Timeout => "Request timed out",
            Status::NotSupported => "Operation not supported",
            Status::UnknownError => "Unknown error",
            Status::ConnectionFailed => "Connection failed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl From<Status> for u32 {
    fn from(status: Status) -> Self {
        status.code()
    }
}

impl TryFrom<u32> for Status {
    type Error = String;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        Status::from_code(code).ok_or_else(|| format!("unknown status code {}", code))
    }
}

/// Bus-assigned identifier of a published object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub u32);

/// Reactor-assigned identifier of an event subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenerId(pub u32);

/// Identifier of an outbound invocation issued by this peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub u64);

/// Identifier of an inbound invocation addressed to this peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Name and argument schema of one method, as seen by the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodInfo {
    pub name: String,
    pub signature: Signature,
}

/// What the bus needs to know to publish an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    pub name: String,
    pub methods: Vec<MethodInfo>,
}

/// One entry of a bus-wide object listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub path: String,
    pub id: ObjectId,
    pub methods: Vec<MethodInfo>,
}

/// An invocation of one of this peer's objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRequest {
    pub id: RequestId,
    pub object: ObjectId,
    pub method: String,
    pub args: Bytes,
}

/// Inbound work returned by `Reactor::poll`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// A peer invoked one of our objects.
    Request(InboundRequest),
    /// An event matched one of our subscriptions.
    Event {
        listener: ListenerId,
        event: String,
        data: Bytes,
    },
    /// A reply fragment for one of our calls.
    Data { call: CallId, data: Bytes },
    /// One of our calls finished.
    Complete { call: CallId, status: Status },
}

/// A single transport session.
///
/// Fallible operations fail with the status the bus reported.
pub trait Reactor {
    fn add_object(&mut self, descriptor: &ObjectDescriptor) -> Result<ObjectId, Status>;
    fn remove_object(&mut self, id: ObjectId) -> Result<(), Status>;

    fn register_event_handler(&mut self, pattern: &str) -> Result<ListenerId, Status>;
    fn unregister_event_handler(&mut self, id: ListenerId) -> Result<(), Status>;

    /// List objects whose path matches `path` (`*` patterns allowed).
    fn lookup(&mut self, path: &str) -> Result<Vec<ObjectInfo>, Status>;
    /// Resolve one exact object path.
    fn lookup_id(&mut self, path: &str) -> Result<ObjectId, Status>;

    /// Issue an invocation. Fragments and completion arrive via `poll`.
    fn invoke(&mut self, object: ObjectId, method: &str, args: Bytes) -> Result<CallId, Status>;
    /// Forget an invocation; anything that still arrives for it may be dropped.
    fn abandon(&mut self, call: CallId);

    fn reply(&mut self, request: RequestId, data: Bytes) -> Result<(), Status>;
    fn complete(&mut self, request: RequestId, status: Status) -> Result<(), Status>;

    fn publish(&mut self, event: &str, data: Bytes) -> Result<(), Status>;

    /// Wait for the next inbound event.
    ///
    /// `None` blocks until something arrives, `Some(Duration::ZERO)` never
    /// blocks. Returns `Ok(None)` when the wait elapsed without traffic.
    fn poll(&mut self, timeout: Option<Duration>) -> Result<Option<BusEvent>, Status>;

    /// Release the transport. Further operations fail with `ConnectionFailed`.
    fn close(&mut self);
}

/// Opens reactors for socket paths.
pub trait Connector {
    fn open(&self, path: &str) -> crate::Result<Box<dyn Reactor>>;
}

/// Match an event name against a subscription pattern.
///
/// `*` matches everything, a trailing `*` matches by prefix, anything else
/// must match exactly.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}
