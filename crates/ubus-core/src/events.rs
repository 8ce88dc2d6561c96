//! Event subscriptions and publication.
//!
//! Unlike object registration, `listen` keeps whatever subset of its pairs
//! the bus accepted: a failed subscription is logged and skipped, and the
//! ones registered before it stay in place.

use crate::connection::Connection;
use crate::dispatch::{panic_message, HandlerResult};
use crate::error::{BusError, Result};
use crate::reactor::ListenerId;
use crate::value::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use tracing::{debug, error, info, warn};

/// Receives events matching a subscription.
pub trait EventListener {
    fn on_event(&self, conn: &mut Connection, event: &str, data: &Value) -> HandlerResult;
}

impl<F> EventListener for F
where
    F: Fn(&mut Connection, &str, &Value) -> HandlerResult,
{
    fn on_event(&self, conn: &mut Connection, event: &str, data: &Value) -> HandlerResult {
        self(conn, event, data)
    }
}

/// Wrap a closure as a shareable listener.
pub fn listener_fn<F>(f: F) -> Rc<dyn EventListener>
where
    F: Fn(&mut Connection, &str, &Value) -> HandlerResult + 'static,
{
    Rc::new(f)
}

pub(crate) struct Listener {
    pub(crate) pattern: String,
    callback: Rc<dyn EventListener>,
}

/// Handle to an active subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerHandle {
    id: ListenerId,
    epoch: u64,
    pattern: String,
}

impl ListenerHandle {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

impl Connection {
    /// Subscribe listeners to event patterns.
    ///
    /// Patterns are exact names, `*`, or a prefix ending in `*`. Returns the
    /// handles of the subscriptions the bus accepted, in input order.
    pub fn listen<I, S>(&mut self, pairs: I) -> Result<Vec<ListenerHandle>>
    where
        I: IntoIterator<Item = (S, Rc<dyn EventListener>)>,
        S: Into<String>,
    {
        let session = self.session_mut()?;
        let pairs: Vec<(String, Rc<dyn EventListener>)> =
            pairs.into_iter().map(|(p, l)| (p.into(), l)).collect();
        if pairs.is_empty() {
            return Err(BusError::usage(
                "listen requires at least one (event, listener) pair",
            ));
        }
        if let Some((pattern, _)) = pairs.iter().find(|(p, _)| p.is_empty()) {
            return Err(BusError::usage(format!("Invalid event pattern '{}'", pattern)));
        }

        let mut handles = Vec::with_capacity(pairs.len());
        for (pattern, callback) in pairs {
            match session.reactor.register_event_handler(&pattern) {
                Ok(id) => {
                    info!("Listening for '{}'", pattern);
                    session.listeners.insert(
                        id,
                        Listener {
                            pattern: pattern.clone(),
                            callback,
                        },
                    );
                    handles.push(ListenerHandle {
                        id,
                        epoch: session.epoch,
                        pattern,
                    });
                }
                Err(status) => warn!("Failed to listen for '{}': {}", pattern, status),
            }
        }
        Ok(handles)
    }

    /// Cancel a subscription.
    pub fn unlisten(&mut self, handle: &ListenerHandle) -> Result<()> {
        let session = self.session_mut()?;
        if session.epoch != handle.epoch || session.listeners.remove(&handle.id).is_none() {
            return Err(BusError::usage(format!(
                "No active listener for '{}'",
                handle.pattern
            )));
        }
        session
            .reactor
            .unregister_event_handler(handle.id)
            .map_err(|status| BusError::transport("unregister_event_handler", status))
    }

    /// Number of active subscriptions on this connection.
    pub fn listener_count(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.listeners.len())
    }

    pub(crate) fn deliver_event(&mut self, listener: ListenerId, event: &str, data: &[u8]) {
        let callback = match self.session.as_ref().and_then(|s| s.listeners.get(&listener)) {
            Some(entry) => entry.callback.clone(),
            None => {
                debug!("Dropping '{}' for inactive listener {:?}", event, listener);
                return;
            }
        };
        let value = match self.codec.decode(data) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to decode event '{}': {}", event, e);
                return;
            }
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| callback.on_event(self, event, &value)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!("Listener for '{}' failed: {:#}", event, err),
            Err(payload) => error!(
                "Listener for '{}' panicked: {}",
                event,
                panic_message(payload.as_ref())
            ),
        }
    }
}
