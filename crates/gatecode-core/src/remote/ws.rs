//! WebSocket remote store client
//!
//! Maintains a long-lived WebSocket connection to the remote store.
//! Handles reconnection automatically with exponential backoff.
//!
//! ## Protocol
//!
//! 1. Connect via WebSocket
//! 2. Re-send every live subscription
//! 3. Exchange CBOR request/reply messages correlated by request id
//! 4. Forward `event` messages to matching subscribers
//!
//! While disconnected, requests fail immediately with
//! [`RemoteError::Unavailable`] instead of queueing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::error::{RemoteError, RemoteResult};
use super::message::{decode_value, ClientMessage, RequestId, ServerMessage};
use super::transport::{matches_prefix, RemoteEvent, RemoteTransport};

/// Connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Not connected, waiting to retry or shut down
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Connected and serving requests
    Connected,
}

/// Configuration for the WebSocket transport
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// WebSocket URL
    pub url: String,
    /// Deadline for a single request
    pub request_timeout: Duration,
    /// Initial reconnect delay
    pub initial_reconnect_delay: Duration,
    /// Maximum reconnect delay
    pub max_reconnect_delay: Duration,
}

impl WsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout: Duration::from_secs(10),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }
}

type Reply = oneshot::Sender<RemoteResult<ServerMessage>>;
type Subscriber = (String, mpsc::UnboundedSender<RemoteEvent>);

/// Commands sent to the connection task
enum Command {
    Request {
        message: ClientMessage,
        reply: Reply,
        subscriber: Option<Subscriber>,
    },
    Shutdown,
}

/// Remote store reached over a WebSocket
pub struct WsTransport {
    command_tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<ConnectionStatus>,
    next_id: Arc<AtomicU64>,
    request_timeout: Duration,
}

impl WsTransport {
    /// Spawn the connection task
    ///
    /// Must be called from within a tokio runtime. The task keeps
    /// reconnecting until the transport is dropped.
    pub fn spawn(config: WsConfig) -> Self {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let next_id = Arc::new(AtomicU64::new(1));
        let request_timeout = config.request_timeout;

        tokio::spawn(connection_loop(
            config,
            next_id.clone(),
            command_rx,
            status_tx,
        ));

        Self {
            command_tx,
            status_rx,
            next_id,
            request_timeout,
        }
    }

    /// Current connection status
    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    async fn request<F>(
        &self,
        build: F,
        subscriber: Option<Subscriber>,
    ) -> RemoteResult<ServerMessage>
    where
        F: FnOnce(RequestId) -> RemoteResult<ClientMessage>,
    {
        let message = build(self.next_id.fetch_add(1, Ordering::SeqCst))?;
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(Command::Request {
                message,
                reply: reply_tx,
                subscriber,
            })
            .await
            .map_err(|_| RemoteError::Closed)?;

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Err(_) => Err(RemoteError::Timeout(self.request_timeout)),
            Ok(Err(_)) => Err(RemoteError::Closed),
            Ok(Ok(reply)) => match reply? {
                ServerMessage::Error { message, .. } => Err(RemoteError::Server(message)),
                other => Ok(other),
            },
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        let _ = self.command_tx.try_send(Command::Shutdown);
    }
}

fn unexpected(reply: ServerMessage) -> RemoteError {
    RemoteError::Server(format!("Unexpected reply: {:?}", reply))
}

#[async_trait]
impl RemoteTransport for WsTransport {
    async fn set(&self, path: &str, value: Value) -> RemoteResult<()> {
        match self
            .request(|id| ClientMessage::set(id, path, &value), None)
            .await?
        {
            ServerMessage::Ack { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn get(&self, path: &str) -> RemoteResult<Option<Value>> {
        match self
            .request(|id| Ok(ClientMessage::get(id, path)), None)
            .await?
        {
            ServerMessage::Value { data: None, .. } => Ok(None),
            ServerMessage::Value {
                data: Some(data), ..
            } => Ok(Some(decode_value(&data)?)),
            other => Err(unexpected(other)),
        }
    }

    async fn list(&self, prefix: &str) -> RemoteResult<Vec<(String, Value)>> {
        match self
            .request(|id| Ok(ClientMessage::list(id, prefix)), None)
            .await?
        {
            ServerMessage::Entries { entries, .. } => entries
                .into_iter()
                .map(|entry| Ok((entry.path, decode_value(&entry.data)?)))
                .collect(),
            other => Err(unexpected(other)),
        }
    }

    async fn subscribe(&self, prefix: &str) -> RemoteResult<mpsc::UnboundedReceiver<RemoteEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self
            .request(
                |id| Ok(ClientMessage::subscribe(id, prefix)),
                Some((prefix.to_string(), tx)),
            )
            .await?
        {
            ServerMessage::Ack { .. } => Ok(rx),
            other => Err(unexpected(other)),
        }
    }
}

/// Main connection loop with reconnection
async fn connection_loop(
    config: WsConfig,
    next_id: Arc<AtomicU64>,
    mut command_rx: mpsc::Receiver<Command>,
    status_tx: watch::Sender<ConnectionStatus>,
) {
    let mut subscribers: Vec<Subscriber> = Vec::new();
    let mut reconnect_delay = config.initial_reconnect_delay;

    loop {
        let _ = status_tx.send(ConnectionStatus::Connecting);

        match connect_and_serve(
            &config,
            &next_id,
            &mut command_rx,
            &mut subscribers,
            &status_tx,
        )
        .await
        {
            Ok(true) => {
                let _ = status_tx.send(ConnectionStatus::Disconnected);
                debug!("Remote connection task shut down");
                return;
            }
            Ok(false) => {
                // Connection closed normally, reset backoff
                reconnect_delay = config.initial_reconnect_delay;
            }
            Err(e) => {
                warn!("Remote connection error: {}", e);
            }
        }

        let _ = status_tx.send(ConnectionStatus::Disconnected);

        // Wait before reconnecting, refusing requests in the meantime
        let sleep = tokio::time::sleep(reconnect_delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = command_rx.recv() => match cmd {
                    Some(Command::Request { reply, .. }) => {
                        let _ = reply.send(Err(RemoteError::Unavailable(
                            "not connected to remote store".into(),
                        )));
                    }
                    Some(Command::Shutdown) | None => {
                        debug!("Remote connection task shut down");
                        return;
                    }
                },
            }
        }

        // Exponential backoff
        reconnect_delay = (reconnect_delay * 2).min(config.max_reconnect_delay);
    }
}

/// Connect and serve requests until disconnection or shutdown
///
/// Returns `Ok(true)` on shutdown.
async fn connect_and_serve(
    config: &WsConfig,
    next_id: &AtomicU64,
    command_rx: &mut mpsc::Receiver<Command>,
    subscribers: &mut Vec<Subscriber>,
    status_tx: &watch::Sender<ConnectionStatus>,
) -> RemoteResult<bool> {
    let (ws_stream, _) = connect_async(&config.url)
        .await
        .map_err(|e| RemoteError::Unavailable(e.to_string()))?;
    let (mut write, mut read) = ws_stream.split();

    // Restore subscriptions lost with the previous connection
    subscribers.retain(|(_, tx)| !tx.is_closed());
    for (prefix, _) in subscribers.iter() {
        let id = next_id.fetch_add(1, Ordering::SeqCst);
        let bytes = ClientMessage::subscribe(id, prefix).encode()?;
        write
            .send(Message::Binary(bytes))
            .await
            .map_err(|e| RemoteError::Unavailable(e.to_string()))?;
    }

    info!("Connected to remote store at {}", config.url);
    let _ = status_tx.send(ConnectionStatus::Connected);

    let mut pending: HashMap<RequestId, Reply> = HashMap::new();

    loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                match cmd {
                    Some(Command::Request { message, reply, subscriber }) => {
                        let bytes = match message.encode() {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                let _ = reply.send(Err(e));
                                continue;
                            }
                        };
                        if let Err(e) = write.send(Message::Binary(bytes)).await {
                            let _ = reply.send(Err(RemoteError::Unavailable(e.to_string())));
                            fail_pending(&mut pending);
                            return Err(RemoteError::Unavailable(e.to_string()));
                        }
                        if let Some(subscriber) = subscriber {
                            subscribers.push(subscriber);
                        }
                        // Requesters that timed out are gone
                        pending.retain(|_, reply| !reply.is_closed());
                        pending.insert(message.request_id(), reply);
                    }
                    Some(Command::Shutdown) | None => {
                        write.close().await.ok();
                        fail_pending(&mut pending);
                        return Ok(true);
                    }
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => match ServerMessage::decode(&data) {
                        Ok(message) => dispatch(message, &mut pending, subscribers),
                        Err(e) => warn!("Ignoring undecodable remote message: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Remote store closed the connection");
                        fail_pending(&mut pending);
                        return Ok(false);
                    }
                    Some(Err(e)) => {
                        fail_pending(&mut pending);
                        return Err(RemoteError::Unavailable(e.to_string()));
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Route a server message to its requester or subscribers
fn dispatch(
    message: ServerMessage,
    pending: &mut HashMap<RequestId, Reply>,
    subscribers: &mut Vec<Subscriber>,
) {
    match message {
        ServerMessage::Event { path, data } => {
            let value = match decode_value(&data) {
                Ok(value) => value,
                Err(e) => {
                    warn!("Ignoring event for {} with invalid payload: {}", path, e);
                    return;
                }
            };
            subscribers.retain(|(prefix, tx)| {
                if !matches_prefix(&path, prefix) {
                    return !tx.is_closed();
                }
                tx.send(RemoteEvent {
                    path: path.clone(),
                    value: value.clone(),
                })
                .is_ok()
            });
        }
        ServerMessage::Error {
            request_id: None,
            message,
        } => warn!("Remote store error: {}", message),
        other => {
            let Some(id) = other.request_id() else {
                return;
            };
            match pending.remove(&id) {
                Some(reply) => {
                    let _ = reply.send(Ok(other));
                }
                // Replies to re-sent subscriptions have no requester
                None => debug!("Unclaimed reply for request {}", id),
            }
        }
    }
}

fn fail_pending(pending: &mut HashMap<RequestId, Reply>) {
    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(RemoteError::Closed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::message::WireEntry;
    use serde_bytes::ByteBuf;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tokio::net::TcpListener;

    fn encode(msg: &ServerMessage) -> Vec<u8> {
        let mut bytes = Vec::new();
        ciborium::into_writer(msg, &mut bytes).unwrap();
        bytes
    }

    /// Minimal single-connection store speaking the wire protocol
    async fn spawn_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut store: BTreeMap<String, Vec<u8>> = BTreeMap::new();
            let mut prefixes: Vec<String> = Vec::new();

            while let Some(Ok(msg)) = ws.next().await {
                let Message::Binary(bytes) = msg else {
                    continue;
                };
                let request: ClientMessage = ciborium::from_reader(bytes.as_slice()).unwrap();
                let mut replies = Vec::new();
                match request {
                    ClientMessage::Set {
                        request_id,
                        path,
                        data,
                    } => {
                        if path.starts_with("forbidden/") {
                            replies.push(ServerMessage::Error {
                                request_id: Some(request_id),
                                message: "permission denied".into(),
                            });
                        } else {
                            store.insert(path.clone(), data.to_vec());
                            replies.push(ServerMessage::Ack { request_id });
                            if prefixes.iter().any(|p| path.starts_with(p.as_str())) {
                                replies.push(ServerMessage::Event { path, data });
                            }
                        }
                    }
                    ClientMessage::Get { request_id, path } => {
                        replies.push(ServerMessage::Value {
                            request_id,
                            data: store.get(&path).cloned().map(ByteBuf::from),
                        });
                    }
                    ClientMessage::List { request_id, prefix } => {
                        replies.push(ServerMessage::Entries {
                            request_id,
                            entries: store
                                .iter()
                                .filter(|(p, _)| p.starts_with(prefix.as_str()))
                                .map(|(p, d)| WireEntry {
                                    path: p.clone(),
                                    data: ByteBuf::from(d.clone()),
                                })
                                .collect(),
                        });
                    }
                    ClientMessage::Subscribe { request_id, prefix } => {
                        prefixes.push(prefix);
                        replies.push(ServerMessage::Ack { request_id });
                    }
                }
                for reply in replies {
                    ws.send(Message::Binary(encode(&reply))).await.unwrap();
                }
            }
        });

        format!("ws://{}", addr)
    }

    async fn wait_connected(transport: &WsTransport) {
        let mut status = transport.status_rx.clone();
        while *status.borrow_and_update() != ConnectionStatus::Connected {
            status.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_request_reply_and_events() {
        let url = spawn_server().await;
        let transport = WsTransport::spawn(WsConfig::new(url));
        wait_connected(&transport).await;

        let mut events = transport.subscribe("snapshots/").await.unwrap();

        transport
            .set("snapshots/gate-1", json!({"codes": []}))
            .await
            .unwrap();
        transport
            .set("last_sync", json!("2024-01-01T00:00:00.000Z"))
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.path, "snapshots/gate-1");
        assert_eq!(event.value, json!({"codes": []}));

        assert_eq!(
            transport.get("last_sync").await.unwrap(),
            Some(json!("2024-01-01T00:00:00.000Z"))
        );
        assert_eq!(transport.get("devices/none").await.unwrap(), None);

        let listed = transport.list("snapshots/").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, "snapshots/gate-1");
    }

    #[tokio::test]
    async fn test_server_error_is_reported() {
        let url = spawn_server().await;
        let transport = WsTransport::spawn(WsConfig::new(url));
        wait_connected(&transport).await;

        let result = transport.set("forbidden/x", json!(1)).await;
        assert_eq!(
            result,
            Err(RemoteError::Server("permission denied".into()))
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_fast() {
        // Grab a free port and release it so nothing is listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = WsTransport::spawn(WsConfig::new(format!("ws://{}", addr)));
        let result = transport.get("last_sync").await;
        assert!(matches!(result, Err(RemoteError::Unavailable(_))));
        assert_ne!(transport.status(), ConnectionStatus::Connected);
    }
}
