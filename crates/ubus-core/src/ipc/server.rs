//! Unix socket broker daemon.
//!
//! Listens on a filesystem socket, accepts client sessions and routes
//! object calls, replies and events between them.
//!
//! # Thread Safety
//!
//! The broker runs on the tokio runtime. Each client is served by a reader
//! task and a writer task. The routing table lives behind a single async
//! mutex, and every message a routing step produces is queued to the
//! clients' writers while that lock is held, so per-client ordering always
//! matches routing order.

use super::protocol::{encode_frame, read_frame, BrokerMessage, ClientMessage};
use crate::config::BrokerConfig;
use crate::error::{BusError, Result};
use crate::reactor::{CallId, ObjectDescriptor, Status};
use crate::router::{Delivery, PeerId, Router};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Handle to a running broker. Dropping shuts it down.
pub struct BrokerHandle {
    path: PathBuf,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl BrokerHandle {
    /// Socket path the broker is listening on.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting clients, close every session and remove the socket.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
            if let Err(e) = std::fs::remove_file(&self.path) {
                debug!("Could not remove socket {}: {}", self.path.display(), e);
            }
        }
        let _ = self.conn_shutdown_tx.send(true);
    }

    /// Shut down and wait for the accept loop to finish.
    pub async fn join(mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            if tokio::time::timeout(BrokerConfig::SHUTDOWN_GRACE, handle).await.is_err() {
                warn!("Broker did not stop within {:?}", BrokerConfig::SHUTDOWN_GRACE);
            }
        }
    }
}

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

#[derive(Default)]
struct BrokerState {
    next_client: PeerId,
    clients: HashMap<PeerId, mpsc::UnboundedSender<BrokerMessage>>,
    router: Router,
}

impl BrokerState {
    fn add_client(&mut self, tx: mpsc::UnboundedSender<BrokerMessage>) -> PeerId {
        self.next_client += 1;
        self.clients.insert(self.next_client, tx);
        self.next_client
    }

    fn remove_client(&mut self, client: PeerId) {
        self.clients.remove(&client);
        let deliveries = self.router.remove_peer(client);
        self.deliver(deliveries.into_iter().map(|(peer, event)| (peer, event.into())));
    }

    fn deliver(&self, messages: impl IntoIterator<Item = (PeerId, BrokerMessage)>) {
        for (peer, message) in messages {
            match self.clients.get(&peer) {
                Some(tx) => {
                    if tx.send(message).is_err() {
                        debug!("Client {} went away before delivery", peer);
                    }
                }
                None => debug!("Dropping message for departed client {}", peer),
            }
        }
    }

    /// Apply one client message to the routing table.
    ///
    /// The acknowledgment to the sender, if any, comes first.
    fn route(&mut self, client: PeerId, message: ClientMessage) -> Vec<(PeerId, BrokerMessage)> {
        fn forward(deliveries: Vec<Delivery>) -> impl Iterator<Item = (PeerId, BrokerMessage)> {
            deliveries.into_iter().map(|(peer, event)| (peer, event.into()))
        }

        let mut out = Vec::new();
        match message {
            ClientMessage::AddObject { seq, name, methods } => {
                let descriptor = ObjectDescriptor { name, methods };
                let result = self.router.add_object(client, &descriptor);
                match result {
                    Ok(id) => debug!("Client {} added object {} as {}", client, descriptor.name, id),
                    Err(status) => debug!("Client {} failed to add {}: {}", client, descriptor.name, status),
                }
                out.push((client, BrokerMessage::ack(seq, result.map(|id| Some(id.0)))));
            }
            ClientMessage::RemoveObject { seq, object } => {
                let result = self.router.remove_object(client, object);
                out.push((client, BrokerMessage::ack(seq, result.map(|_| None))));
            }
            ClientMessage::Subscribe { seq, pattern } => {
                let id = self.router.subscribe(client, &pattern);
                out.push((client, BrokerMessage::ack(seq, Ok(Some(id.0)))));
            }
            ClientMessage::Unsubscribe { seq, listener } => {
                let result = self.router.unsubscribe(client, listener);
                out.push((client, BrokerMessage::ack(seq, result.map(|_| None))));
            }
            ClientMessage::Lookup { seq, path } => {
                let reply = match self.router.lookup(&path) {
                    Ok(objects) => BrokerMessage::Objects { seq, objects },
                    Err(status) => BrokerMessage::ack(seq, Err(status)),
                };
                out.push((client, reply));
            }
            ClientMessage::Invoke {
                seq,
                object,
                method,
                args,
            } => match self.router.invoke(client, CallId(seq), object, &method, args) {
                Ok((callee, event)) => {
                    out.push((client, BrokerMessage::ack(seq, Ok(None))));
                    out.push((callee, event.into()));
                }
                Err(status) => out.push((client, BrokerMessage::ack(seq, Err(status)))),
            },
            ClientMessage::Reply { request, data } => match self.router.reply(client, request, data) {
                Ok((caller, event)) => out.push((caller, event.into())),
                Err(status) => debug!("Client {} reply to {:?} rejected: {}", client, request, status),
            },
            ClientMessage::Complete { request, status } => {
                match self.router.complete(client, request, status) {
                    Ok((caller, event)) => out.push((caller, event.into())),
                    Err(err) => debug!("Client {} completion of {:?} rejected: {}", client, request, err),
                }
            }
            ClientMessage::Publish { seq, event, data } => {
                let deliveries = self.router.publish(&event, &data);
                debug!("Event {} fanned out to {} listeners", event, deliveries.len());
                out.push((client, BrokerMessage::ack(seq, Ok(None))));
                out.extend(forward(deliveries));
            }
        }
        out
    }
}

/// Broker daemon that clients connect to.
pub struct Broker;

impl Broker {
    /// Start listening on `path`.
    ///
    /// A stale socket file left by a dead broker is replaced; a socket that
    /// still accepts connections is an error.
    pub async fn start(path: impl AsRef<Path>) -> Result<BrokerHandle> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            if UnixStream::connect(&path).await.is_ok() {
                return Err(BusError::ConnectionFailed {
                    path: path.display().to_string(),
                    reason: "another broker is already listening".to_string(),
                });
            }
            debug!("Removing stale socket {}", path.display());
            std::fs::remove_file(&path)?;
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&path)?;
        info!("Broker listening on {}", path.display());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let state = Arc::new(Mutex::new(BrokerState::default()));
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            state,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections,
        ));

        Ok(BrokerHandle {
            path,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: UnixListener,
        state: Arc<Mutex<BrokerState>>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Broker shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= BrokerConfig::MAX_CLIENTS {
                                warn!(
                                    "Rejecting client: at max capacity ({})",
                                    BrokerConfig::MAX_CLIENTS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let state = state.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, &state, &mut conn_shutdown).await {
                                    debug!("Client session ended: {}", e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Broker accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        stream: UnixStream,
        state: &Mutex<BrokerState>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let client = state.lock().await.add_client(tx);
        debug!("Client {} connected", client);
        let writer_task = tokio::spawn(Self::write_loop(client, writer, rx));

        let result = loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
                _ = shutdown_rx.changed() => break Ok(()),
            };

            let message: ClientMessage = match serde_json::from_slice(&frame) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Client {} sent a malformed message: {}", client, e);
                    continue;
                }
            };

            let mut guard = state.lock().await;
            let out = guard.route(client, message);
            guard.deliver(out);
        };

        state.lock().await.remove_client(client);
        debug!("Client {} disconnected", client);
        if writer_task.await.is_err() {
            debug!("Writer for client {} was cancelled", client);
        }
        result
    }

    async fn write_loop(
        client: PeerId,
        mut writer: OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<BrokerMessage>,
    ) {
        while let Some(message) = rx.recv().await {
            let frame = match encode_frame(&message) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Dropping message for client {}: {}", client, e);
                    match Self::failed_ack(&message) {
                        Some(frame) => frame,
                        None => continue,
                    }
                }
            };
            if let Err(e) = writer.write_all(&frame).await {
                debug!("Write to client {} failed: {}", client, e);
                break;
            }
        }
        let _ = writer.shutdown().await;
    }

    /// Frame an error acknowledgment in place of an unsendable answer, so the
    /// requester does not wait out its acknowledgment timeout.
    fn failed_ack(message: &BrokerMessage) -> Option<Vec<u8>> {
        let seq = message.seq()?;
        encode_frame(&BrokerMessage::ack(seq, Err(Status::UnknownError))).ok()
    }
}
