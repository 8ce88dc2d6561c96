//! Integration tests over the Unix socket transport.
//!
//! A broker runs on a background tokio runtime; clients are ordinary
//! blocking `Connection`s on their own threads.

use std::cell::Cell;
use std::path::Path;
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use tokio::runtime::Runtime;
use ubus_core::{
    listener_fn, Broker, BrokerHandle, BusError, CancellationToken, Connection, Method, Signature,
    Value, ValueKind,
};

struct TestBus {
    _dir: TempDir,
    path: String,
    handle: Option<BrokerHandle>,
    runtime: Runtime,
}

impl TestBus {
    fn start() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("ubus.sock");
        let runtime = Runtime::new().expect("tokio runtime");
        let handle = runtime
            .block_on(Broker::start(&path))
            .expect("start broker");
        Self {
            path: path.to_string_lossy().into_owned(),
            _dir: dir,
            handle: Some(handle),
            runtime,
        }
    }

    fn connect(&self) -> Connection {
        let mut conn = Connection::new();
        conn.connect(Some(&self.path)).expect("connect to broker");
        conn
    }
}

impl Drop for TestBus {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.runtime.block_on(handle.join());
        }
    }
}

fn spawn_echo_server(path: &str) -> (CancellationToken, thread::JoinHandle<()>) {
    let path = path.to_string();
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let mut conn = Connection::new();
        conn.connect(Some(&path)).expect("server connect");
        conn.register(
            "echo",
            vec![Method::new(
                "say",
                Signature::new().arg("text", ValueKind::String),
                |conn, response, args| {
                    for _ in 0..2 {
                        response.reply(conn, &args)?;
                    }
                    Ok(())
                },
            )],
        )
        .expect("register echo");
        tx.send(conn.stop_token()).expect("hand over stop token");
        conn.run(None).expect("server loop");
    });
    let token = rx.recv().expect("server ready");
    (token, handle)
}

#[test]
fn test_call_through_broker() {
    let bus = TestBus::start();
    let (token, server) = spawn_echo_server(&bus.path);
    let mut client = bus.connect();

    let args = Value::table([("text", Value::from("hello"))]);
    let replies = client.call("echo", "say", &args, 5000).unwrap();
    assert_eq!(replies, vec![args.clone(), args]);

    let objects = client.objects(None).unwrap();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].path, "echo");
    assert_eq!(objects[0].methods[0].name, "say");

    assert!(matches!(
        client.call("echo", "say", &Value::empty_table(), 5000),
        Err(BusError::InvalidArgument { .. })
    ));

    token.cancel();
    server.join().unwrap();
}

#[test]
fn test_self_call_through_broker() {
    let bus = TestBus::start();
    let mut conn = bus.connect();
    conn.register(
        "clock",
        vec![Method::new("now", Signature::new(), |conn, response, _| {
            response.reply(conn, &Value::table([("ticks", Value::Int64(7))]))?;
            Ok(())
        })],
    )
    .unwrap();

    let replies = conn.call("clock", "now", &Value::empty_table(), 5000).unwrap();
    assert_eq!(replies[0].get("ticks").and_then(Value::as_i64), Some(7));
}

#[test]
fn test_events_through_broker() {
    let bus = TestBus::start();
    let mut listener = bus.connect();
    listener
        .listen([(
            "net.*",
            listener_fn(|conn, event, _| {
                assert_eq!(event, "net.up");
                conn.stop();
                Ok(())
            }),
        )])
        .unwrap();

    let mut sender = bus.connect();
    sender.send("net.up", &Value::empty_table()).unwrap();

    // Ends early once the listener stops the loop.
    listener.run(Some(Duration::from_secs(5))).unwrap();
}

#[test]
fn test_large_payloads_through_broker() {
    let bus = TestBus::start();
    let (token, server) = spawn_echo_server(&bus.path);
    let mut client = bus.connect();

    // Hex encoding on the wire makes these frames larger than the message limit.
    let text = "x".repeat(600 * 1024);
    let args = Value::table([("text", Value::from(text.as_str()))]);
    let replies = client.call("echo", "say", &args, 5000).unwrap();
    assert_eq!(replies, vec![args.clone(), args.clone()]);

    let received = Rc::new(Cell::new(0));
    let sink = received.clone();
    client
        .listen([(
            "bulk",
            listener_fn(move |conn, _, data| {
                let len = data.get("text").and_then(Value::as_str).map_or(0, str::len);
                sink.set(len);
                conn.stop();
                Ok(())
            }),
        )])
        .unwrap();
    let mut sender = bus.connect();
    sender.send("bulk", &args).unwrap();
    client.run(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(received.get(), 600 * 1024);

    token.cancel();
    server.join().unwrap();
}

#[test]
fn test_duplicate_object_name_rejected() {
    let bus = TestBus::start();
    let mut first = bus.connect();
    let mut second = bus.connect();
    first.register("calc", vec![]).unwrap();
    assert!(matches!(
        second.register("calc", vec![]),
        Err(BusError::RegistrationFailed { .. })
    ));
    assert!(second.registered_objects().is_empty());
}

#[test]
fn test_server_disconnect_removes_objects() {
    let bus = TestBus::start();
    let (token, server) = spawn_echo_server(&bus.path);
    token.cancel();
    server.join().unwrap();

    let mut client = bus.connect();
    assert!(client.objects(Some("echo")).unwrap().is_empty());
    assert!(matches!(
        client.call("echo", "say", &Value::empty_table(), 1000),
        Err(BusError::ObjectNotFound { .. })
    ));
}

#[test]
fn test_connect_without_broker() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent.sock");
    let mut conn = Connection::new();
    assert!(!Path::new(&path).exists());
    assert!(matches!(
        conn.connect(path.to_str()),
        Err(BusError::ConnectionFailed { .. })
    ));
}
