//! Method dispatch for inbound invocations.
//!
//! Each request is looked up, validated against the method's signature,
//! decoded and handed to the user handler together with a `ResponseHandle`
//! that is only usable until the handler returns. Handler errors and panics
//! stop here; the bus only ever sees a status code.

use crate::connection::Connection;
use crate::error::{BusError, Result};
use crate::policy::validate;
use crate::reactor::{InboundRequest, RequestId, Status};
use crate::value::Value;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use tracing::{debug, error, warn};

/// Result returned by method handlers and event listeners.
pub type HandlerResult = anyhow::Result<()>;

/// A method implementation.
///
/// Implemented for every `Fn(&mut Connection, &ResponseHandle, Value)`
/// closure. The handler gets the connection back so it can reply, call other
/// objects, or register more objects while it runs.
pub trait MethodHandler {
    fn call(&self, conn: &mut Connection, response: &ResponseHandle, args: Value) -> HandlerResult;
}

impl<F> MethodHandler for F
where
    F: Fn(&mut Connection, &ResponseHandle, Value) -> HandlerResult,
{
    fn call(&self, conn: &mut Connection, response: &ResponseHandle, args: Value) -> HandlerResult {
        self(conn, response, args)
    }
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    epoch: u64,
    request: RequestId,
}

/// Capability to reply to one inbound invocation.
///
/// A clone that outlives the handler stays harmless: once dispatch returns,
/// `reply` fails with a usage error.
#[derive(Debug, Clone)]
pub struct ResponseHandle {
    binding: Rc<RefCell<Option<Binding>>>,
    sent: Rc<Cell<usize>>,
}

impl ResponseHandle {
    fn bind(epoch: u64, request: RequestId) -> Self {
        Self {
            binding: Rc::new(RefCell::new(Some(Binding { epoch, request }))),
            sent: Rc::new(Cell::new(0)),
        }
    }

    fn invalidate(&self) {
        self.binding.borrow_mut().take();
    }

    /// Send one reply fragment. May be called any number of times while the
    /// handler runs.
    pub fn reply(&self, conn: &mut Connection, data: &Value) -> Result<()> {
        let epoch = conn.epoch().ok_or(BusError::NotConnected)?;
        let encoded = conn.codec.encode(data).map_err(|e| BusError::EncodingFailed {
            message: e.to_string(),
        })?;

        let request = match *self.binding.borrow() {
            Some(binding) if binding.epoch == epoch => binding.request,
            _ => return Err(BusError::usage("Response handle is not linked to a call")),
        };

        conn.session_mut()?
            .reactor
            .reply(request, encoded)
            .map_err(|status| BusError::transport("reply", status))?;
        self.sent.set(self.sent.get() + 1);
        Ok(())
    }

    /// Whether the originating dispatch is still running.
    pub fn is_active(&self) -> bool {
        self.binding.borrow().is_some()
    }

    /// Number of fragments sent through this handle.
    pub fn replies_sent(&self) -> usize {
        self.sent.get()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Connection {
    pub(crate) fn dispatch_request(&mut self, request: InboundRequest) {
        let Some(epoch) = self.epoch() else {
            return;
        };
        let status = self.run_method(epoch, &request);

        match self.session.as_mut() {
            Some(session) if session.epoch == epoch => {
                if let Err(err) = session.reactor.complete(request.id, status) {
                    warn!("Failed to complete request for '{}': {}", request.method, err);
                }
            }
            _ => debug!("Session ended while '{}' was running", request.method),
        }
    }

    fn run_method(&mut self, epoch: u64, request: &InboundRequest) -> Status {
        let (object_name, method) = {
            let Some(session) = self.session.as_ref() else {
                return Status::UnknownError;
            };
            let Some(object) = session.objects.get(&request.object) else {
                warn!("Request for unknown object {}", request.object);
                return Status::NotFound;
            };
            let Some(method) = object.method(&request.method) else {
                debug!("Object '{}' has no method '{}'", object.name, request.method);
                return Status::MethodNotFound;
            };
            (object.name.clone(), method.clone())
        };

        let attrs = match self.codec.attributes(&request.args) {
            Ok(attrs) => attrs,
            Err(e) => {
                warn!("Malformed arguments for {}.{}: {}", object_name, method.name, e);
                return Status::InvalidArgument;
            }
        };
        if !validate(method.signature.policies(), &attrs) {
            debug!("Arguments for {}.{} do not match its signature", object_name, method.name);
            return Status::InvalidArgument;
        }
        let args = match self.codec.decode(&request.args) {
            Ok(args) => args,
            Err(e) => {
                error!("Failed to decode arguments for {}.{}: {}", object_name, method.name, e);
                return Status::UnknownError;
            }
        };

        let response = ResponseHandle::bind(epoch, request.id);
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            method.handler.call(self, &response, args)
        }));
        response.invalidate();

        let failure = match outcome {
            Ok(Ok(())) => return Status::Ok,
            Ok(Err(err)) => format!("{:#}", err),
            Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
        };
        error!("Handler for {}.{} failed: {}", object_name, method.name, failure);
        if response.replies_sent() > 0 {
            Status::Ok
        } else {
            Status::UnknownError
        }
    }
}
