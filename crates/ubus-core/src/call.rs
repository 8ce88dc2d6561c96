//! Outbound invocations.
//!
//! `call` drives the reactor itself while it waits, so inbound requests and
//! events that arrive in the meantime are dispatched in arrival order. That
//! is what makes calling from inside a handler safe.

use crate::connection::Connection;
use crate::error::{BusError, Result};
use crate::reactor::{CallId, Status};
use crate::value::Value;
use std::time::{Duration, Instant};
use tracing::debug;

/// Reply state of one in-flight call.
#[derive(Debug, Default)]
pub(crate) struct PendingCall {
    fragments: Vec<Value>,
    failure: Option<String>,
    status: Option<Status>,
}

impl PendingCall {
    fn is_complete(&self) -> bool {
        self.status.is_some()
    }

    fn finish(self, object: &str, method: &str) -> Result<Vec<Value>> {
        match self.status {
            Some(Status::Ok) => match self.failure {
                Some(message) => Err(BusError::DecodingFailed { message }),
                None => Ok(self.fragments),
            },
            Some(status) => Err(BusError::from_call_status(object, method, status)),
            None => Err(BusError::InternalError {
                message: format!("call to {}.{} finished without a status", object, method),
            }),
        }
    }
}

impl Connection {
    /// Invoke `method` on a remote object and collect its replies.
    ///
    /// Blocks until the callee completes or `timeout_ms` elapses; `0` waits
    /// forever. Every reply fragment is returned, in arrival order, and an
    /// empty vector is a successful call that sent no data.
    pub fn call(
        &mut self,
        object: &str,
        method: &str,
        args: &Value,
        timeout_ms: i64,
    ) -> Result<Vec<Value>> {
        let epoch = self.epoch().ok_or(BusError::NotConnected)?;
        if timeout_ms < 0 {
            return Err(BusError::usage(format!(
                "timeout must be a non-negative number of milliseconds, got {}",
                timeout_ms
            )));
        }

        let id = match self.session_mut()?.reactor.lookup_id(object) {
            Ok(id) => id,
            Err(Status::NotFound) => {
                return Err(BusError::ObjectNotFound {
                    object: object.to_string(),
                })
            }
            Err(status) => return Err(BusError::transport("lookup", status)),
        };
        let encoded = self.codec.encode(args).map_err(|e| BusError::EncodingFailed {
            message: e.to_string(),
        })?;

        let session = self.session_mut()?;
        let call = session
            .reactor
            .invoke(id, method, encoded)
            .map_err(|status| BusError::from_call_status(object, method, status))?;
        session.pending.insert(call, PendingCall::default());
        debug!("Invoked {}.{} as {:?}", object, method, call);

        let deadline = u64::try_from(timeout_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map(|ms| Instant::now() + Duration::from_millis(ms));

        loop {
            match self.session.as_mut() {
                Some(session) if session.epoch == epoch => {
                    if session.pending.get(&call).is_some_and(PendingCall::is_complete) {
                        if let Some(pending) = session.pending.remove(&call) {
                            return pending.finish(object, method);
                        }
                    }
                }
                _ => return Err(BusError::NotConnected),
            }

            let wait = match deadline {
                None => None,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.forget_call(call);
                        debug!("Call to {}.{} timed out", object, method);
                        return Err(BusError::InvocationFailed {
                            object: object.to_string(),
                            method: method.to_string(),
                            status: Status::Timeout,
                        });
                    }
                    Some(deadline - now)
                }
            };

            match self.poll_event(wait) {
                Ok(Some(event)) => self.handle_event(event),
                Ok(None) => {}
                Err(err) => {
                    debug!("Transport failed during {}.{}: {}", object, method, err);
                    self.forget_call(call);
                    return Err(BusError::InvocationFailed {
                        object: object.to_string(),
                        method: method.to_string(),
                        status: Status::ConnectionFailed,
                    });
                }
            }
        }
    }

    fn forget_call(&mut self, call: CallId) {
        if let Some(session) = self.session.as_mut() {
            session.pending.remove(&call);
            session.reactor.abandon(call);
        }
    }

    pub(crate) fn record_fragment(&mut self, call: CallId, data: &[u8]) {
        let Some(pending) = self
            .session
            .as_mut()
            .and_then(|s| s.pending.get_mut(&call))
        else {
            debug!("Dropping reply fragment for unknown {:?}", call);
            return;
        };
        if pending.failure.is_some() || pending.is_complete() {
            return;
        }
        match self.codec.decode(data) {
            Ok(value) => pending.fragments.push(value),
            Err(e) => pending.failure = Some(e.to_string()),
        }
    }

    pub(crate) fn record_completion(&mut self, call: CallId, status: Status) {
        match self
            .session
            .as_mut()
            .and_then(|s| s.pending.get_mut(&call))
        {
            Some(pending) if !pending.is_complete() => pending.status = Some(status),
            _ => debug!("Dropping completion for unknown {:?}", call),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{BlobCodec, Codec};
    use crate::local::{LocalHub, LocalReactor};
    use crate::policy::Signature;
    use crate::reactor::{BusEvent, InboundRequest, MethodInfo, ObjectDescriptor, Reactor};
    use crate::registry::Method;
    use bytes::Bytes;
    use std::thread;

    fn connected(hub: &LocalHub) -> Connection {
        let mut conn = Connection::builder().connector(hub.clone()).build();
        conn.connect(Some(hub.path())).unwrap();
        conn
    }

    /// Publish `name` from a raw peer thread and answer one request with `serve`.
    fn raw_server<F>(hub: &LocalHub, name: &str, serve: F) -> thread::JoinHandle<()>
    where
        F: FnOnce(&mut LocalReactor, InboundRequest) + Send + 'static,
    {
        let mut peer = hub.attach();
        peer.add_object(&ObjectDescriptor {
            name: name.to_string(),
            methods: vec![MethodInfo {
                name: "get".into(),
                signature: Signature::new(),
            }],
        })
        .unwrap();
        thread::spawn(move || {
            if let Ok(Some(BusEvent::Request(request))) = peer.poll(Some(Duration::from_secs(5))) {
                serve(&mut peer, request);
            }
        })
    }

    #[test]
    fn test_negative_timeout_is_usage_error() {
        let hub = LocalHub::new("hub");
        let mut conn = connected(&hub);
        assert!(matches!(
            conn.call("calc", "add", &Value::empty_table(), -1),
            Err(BusError::UsageError { .. })
        ));
    }

    #[test]
    fn test_missing_object() {
        let hub = LocalHub::new("hub");
        let mut conn = connected(&hub);
        let err = conn.call("nope", "x", &Value::empty_table(), 0).unwrap_err();
        assert_eq!(err.to_string(), "Object 'nope' was not found.");
    }

    #[test]
    fn test_self_call_collects_fragments_in_order() {
        let hub = LocalHub::new("hub");
        let mut conn = connected(&hub);
        conn.register(
            "counter",
            vec![Method::new("count", Signature::new(), |conn, response, _| {
                for n in 0..3 {
                    response.reply(conn, &Value::table([("n", Value::Int32(n))]))?;
                }
                Ok(())
            })],
        )
        .unwrap();

        let replies = conn.call("counter", "count", &Value::empty_table(), 1000).unwrap();
        let ns: Vec<i64> = replies
            .iter()
            .filter_map(|r| r.get("n").and_then(Value::as_i64))
            .collect();
        assert_eq!(ns, vec![0, 1, 2]);
    }

    #[test]
    fn test_empty_reply_is_success() {
        let hub = LocalHub::new("hub");
        let mut conn = connected(&hub);
        conn.register("quiet", vec![Method::new("ping", Signature::new(), |_, _, _| Ok(()))])
            .unwrap();
        assert!(conn.call("quiet", "ping", &Value::empty_table(), 0).unwrap().is_empty());
    }

    #[test]
    fn test_timeout() {
        let hub = LocalHub::new("hub");
        let mut conn = connected(&hub);
        let mut silent = hub.attach();
        silent
            .add_object(&ObjectDescriptor {
                name: "silent".into(),
                methods: vec![],
            })
            .unwrap();

        let started = Instant::now();
        let err = conn.call("silent", "wait", &Value::empty_table(), 50).unwrap_err();
        assert!(matches!(
            err,
            BusError::InvocationFailed {
                status: Status::Timeout,
                ..
            }
        ));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_late_reply_after_timeout_is_dropped() {
        let hub = LocalHub::new("hub");
        let mut conn = connected(&hub);
        let server = raw_server(&hub, "slow", |peer, request| {
            thread::sleep(Duration::from_millis(200));
            let codec = BlobCodec::new();
            let stale = Value::table([("n", Value::Int32(99))]);
            let _ = peer.reply(request.id, codec.encode(&stale).unwrap());
            let _ = peer.complete(request.id, Status::Ok);
        });
        let err = conn.call("slow", "get", &Value::empty_table(), 50).unwrap_err();
        assert!(matches!(
            err,
            BusError::InvocationFailed {
                status: Status::Timeout,
                ..
            }
        ));
        server.join().unwrap();
        conn.run(Some(Duration::ZERO)).unwrap();

        conn.register(
            "counter",
            vec![Method::new("count", Signature::new(), |conn, response, _| {
                for n in 0..3 {
                    response.reply(conn, &Value::table([("n", Value::Int32(n))]))?;
                }
                Ok(())
            })],
        )
        .unwrap();
        let replies = conn.call("counter", "count", &Value::empty_table(), 1000).unwrap();
        let ns: Vec<i64> = replies
            .iter()
            .filter_map(|r| r.get("n").and_then(Value::as_i64))
            .collect();
        assert_eq!(ns, vec![0, 1, 2]);
    }

    #[test]
    fn test_remote_status_mapping() {
        let hub = LocalHub::new("hub");
        let mut conn = connected(&hub);
        let server = raw_server(&hub, "remote", |peer, request| {
            peer.complete(request.id, Status::MethodNotFound).unwrap();
        });
        let err = conn.call("remote", "missing", &Value::empty_table(), 5000).unwrap_err();
        assert!(matches!(err, BusError::UnknownMethod { ref method, .. } if method == "missing"));
        server.join().unwrap();
    }

    #[test]
    fn test_bad_fragment_fails_call() {
        let hub = LocalHub::new("hub");
        let mut conn = connected(&hub);
        let server = raw_server(&hub, "garbled", |peer, request| {
            let codec = BlobCodec::new();
            peer.reply(request.id, Bytes::from_static(&[0xff, 0, 0, 6, 0, 0, 0, 0]))
                .unwrap();
            peer.reply(request.id, codec.encode(&Value::empty_table()).unwrap())
                .unwrap();
            peer.complete(request.id, Status::Ok).unwrap();
        });
        let err = conn.call("garbled", "get", &Value::empty_table(), 5000).unwrap_err();
        assert!(matches!(err, BusError::DecodingFailed { .. }));
        server.join().unwrap();
    }

    #[test]
    fn test_callee_disconnect_fails_call() {
        let hub = LocalHub::new("hub");
        let mut conn = connected(&hub);
        let server = raw_server(&hub, "flaky", |peer, _request| {
            peer.close();
        });
        let err = conn.call("flaky", "get", &Value::empty_table(), 5000).unwrap_err();
        assert!(matches!(
            err,
            BusError::InvocationFailed {
                status: Status::ConnectionFailed,
                ..
            }
        ));
        server.join().unwrap();
    }
}
