//! WebSocket Transport Layer
//!
//! Single responsibility: carry msgpack-rpc messages over a WebSocket.
//! No knowledge of authentication, reconnection, or observers.
//!
//! Each dial opens a socket and spawns one reader task. The reader routes
//! responses to waiting callers by msgid, serves server-initiated calls
//! through the [`LocalServer`], and fires the channel's closed signal when
//! the socket ends.

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use rmpv::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{http::Request, protocol::Message as WsMessage},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info};

use super::protocol::Message;
use super::{GenericClient, LocalServer};
use crate::config::Config;
use crate::connection::{ConnectionTransport, RawChannel};
use crate::error::MdServerError;

/// Type alias for the WebSocket send half
pub type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, WsMessage>;

/// Type alias for the WebSocket receive half
pub type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

type SharedSink = Arc<AsyncMutex<WsSink>>;
type PendingMap = Arc<Mutex<HashMap<u32, oneshot::Sender<Result<Value, MdServerError>>>>>;

/// The socket currently owned by a [`WsTransport`].
struct ActiveLink {
    connected: Arc<AtomicBool>,
    pending: PendingMap,
    sink: SharedSink,
    reader: JoinHandle<()>,
}

/// Dialable WebSocket transport for the metadata server.
pub struct WsTransport {
    url: String,
    dial_timeout: Duration,
    request_timeout: Duration,
    current: Mutex<Option<ActiveLink>>,
}

impl WsTransport {
    pub fn new(url: impl Into<String>, dial_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            dial_timeout,
            request_timeout,
            current: Mutex::new(None),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.server_url.clone(),
            config.dial_timeout(),
            config.request_timeout(),
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ConnectionTransport for WsTransport {
    async fn dial(&self, server: Arc<LocalServer>) -> Result<RawChannel, MdServerError> {
        self.close();

        let (sink, stream) = tokio::time::timeout(self.dial_timeout, open_socket(&self.url))
            .await
            .map_err(|_| MdServerError::Connection(format!("Dial timeout: {}", self.url)))??;

        let sink: SharedSink = Arc::new(AsyncMutex::new(sink));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let (closed_tx, closed_rx) = oneshot::channel();

        let reader = tokio::spawn(receiver_loop(
            stream,
            Arc::clone(&sink),
            Arc::clone(&pending),
            server,
            Arc::clone(&connected),
            closed_tx,
        ));

        let client = WsClient {
            sink: Arc::clone(&sink),
            pending: Arc::clone(&pending),
            connected: Arc::clone(&connected),
            next_id: AtomicU32::new(1),
            request_timeout: self.request_timeout,
        };

        if let Ok(mut current) = self.current.lock() {
            *current = Some(ActiveLink {
                connected,
                pending,
                sink,
                reader,
            });
        }

        Ok(RawChannel {
            client: Arc::new(client),
            closed: closed_rx,
        })
    }

    fn is_connected(&self) -> bool {
        self.current
            .lock()
            .ok()
            .and_then(|current| {
                current
                    .as_ref()
                    .map(|link| link.connected.load(Ordering::SeqCst))
            })
            .unwrap_or(false)
    }

    fn close(&self) {
        let link = self.current.lock().ok().and_then(|mut current| current.take());
        let Some(link) = link else {
            return;
        };

        link.connected.store(false, Ordering::SeqCst);
        link.reader.abort();
        fail_pending(&link.pending, "connection closed");

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let sink = link.sink;
            handle.spawn(async move {
                let _ = sink.lock().await.close().await;
            });
        }
        debug!(url = %self.url, "WebSocket closed");
    }

    fn finalize(&self) {
        self.close();
    }
}

/// Client half of one dialed socket.
struct WsClient {
    sink: SharedSink,
    pending: PendingMap,
    connected: Arc<AtomicBool>,
    next_id: AtomicU32,
    request_timeout: Duration,
}

/// Drops a request's waiter from the pending map when its call ends, even
/// when the caller abandons the call mid-flight.
struct PendingCall<'a> {
    pending: &'a PendingMap,
    msgid: u32,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.msgid);
        }
    }
}

#[async_trait]
impl GenericClient for WsClient {
    async fn call(&self, method: &str, arg: Value) -> Result<Value, MdServerError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(MdServerError::Connection("Not connected".into()));
        }

        let msgid = self.next_id.fetch_add(1, Ordering::SeqCst);
        let bytes = Message::Request {
            msgid,
            method: method.to_string(),
            arg,
        }
        .encode()?;

        let (response_tx, response_rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| MdServerError::Protocol("Pending map lock poisoned".into()))?
            .insert(msgid, response_tx);
        let _pending = PendingCall {
            pending: &self.pending,
            msgid,
        };

        let sent = self.sink.lock().await.send(WsMessage::Binary(bytes)).await;
        if let Err(e) = sent {
            self.connected.store(false, Ordering::SeqCst);
            return Err(MdServerError::Connection(format!("Failed to send: {}", e)));
        }

        match tokio::time::timeout(self.request_timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MdServerError::Connection("Response channel closed".into())),
            Err(_) => Err(MdServerError::Timeout(method.to_string())),
        }
    }
}

/// Open a WebSocket with the headers the server expects.
async fn open_socket(url: &str) -> Result<(WsSink, WsStream), MdServerError> {
    debug!(url = %url, "Connecting to WebSocket");

    let request = Request::builder()
        .uri(url)
        .header("Host", extract_host(url))
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tokio_tungstenite::tungstenite::handshake::client::generate_key(),
        )
        .body(())
        .map_err(|e| MdServerError::Connection(format!("Failed to build request: {}", e)))?;

    let (ws, _) = connect_async_with_config(request, None, false)
        .await
        .map_err(|e| MdServerError::Connection(format!("WebSocket connect failed: {}", e)))?;

    info!(url = %url, "WebSocket connected");
    Ok(ws.split())
}

/// Receiver loop - runs in a spawned task, one per socket.
async fn receiver_loop(
    mut stream: WsStream,
    sink: SharedSink,
    pending: PendingMap,
    server: Arc<LocalServer>,
    connected: Arc<AtomicBool>,
    closed_tx: oneshot::Sender<String>,
) {
    debug!("Receiver loop started");

    let reason = loop {
        match stream.next().await {
            Some(Ok(WsMessage::Binary(data))) => {
                handle_frame(&data, &sink, &pending, &server).await;
            }
            Some(Ok(WsMessage::Close(frame))) => {
                info!(frame = ?frame, "Metadata server closed connection");
                break "server closed connection".to_string();
            }
            Some(Ok(_)) => {
                // Pong is handled automatically by tungstenite
                continue;
            }
            Some(Err(e)) => {
                error!(error = %e, "WebSocket error");
                break format!("WebSocket error: {}", e);
            }
            None => break "stream ended".to_string(),
        }
    };

    connected.store(false, Ordering::SeqCst);
    fail_pending(&pending, &reason);
    let _ = closed_tx.send(reason);

    debug!("Receiver loop ended");
}

async fn handle_frame(data: &[u8], sink: &SharedSink, pending: &PendingMap, server: &LocalServer) {
    let message = match Message::decode(data) {
        Ok(message) => message,
        Err(e) => {
            error!(error = %e, "Failed to decode message");
            return;
        }
    };

    match message {
        Message::Response { msgid, error, result } => {
            let waiter = pending.lock().ok().and_then(|mut pending| pending.remove(&msgid));
            let Some(waiter) = waiter else {
                debug!(msgid = msgid, "Response for unknown request");
                return;
            };
            let outcome = if error.is_nil() {
                Ok(result)
            } else {
                Err(MdServerError::from_status(&error))
            };
            let _ = waiter.send(outcome);
        }
        Message::Request { msgid, method, arg } => {
            let reply = match server.dispatch(&method, arg).await {
                Ok(result) => Message::Response {
                    msgid,
                    error: Value::Nil,
                    result,
                },
                Err(e) => {
                    debug!(method = %method, error = %e, "Served call failed");
                    Message::Response {
                        msgid,
                        error: e.to_status(),
                        result: Value::Nil,
                    }
                }
            };
            match reply.encode() {
                Ok(bytes) => {
                    if let Err(e) = sink.lock().await.send(WsMessage::Binary(bytes)).await {
                        debug!(error = %e, "Failed to send reply");
                    }
                }
                Err(e) => error!(error = %e, "Failed to encode reply"),
            }
        }
        Message::Notify { method, arg } => {
            if let Err(e) = server.dispatch(&method, arg).await {
                debug!(method = %method, error = %e, "Served notification failed");
            }
        }
    }
}

fn fail_pending(pending: &PendingMap, reason: &str) {
    let drained: Vec<_> = match pending.lock() {
        Ok(mut pending) => pending.drain().collect(),
        Err(_) => return,
    };
    for (msgid, waiter) in drained {
        debug!(msgid = msgid, "Cleaning up pending request");
        let _ = waiter.send(Err(MdServerError::Connection(reason.to_string())));
    }
}

/// Extract host from URL for Host header
fn extract_host(url: &str) -> &str {
    url.split("//")
        .nth(1)
        .and_then(|s| s.split('/').next())
        .unwrap_or("localhost")
}
