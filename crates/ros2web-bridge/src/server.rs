//! WebSocket transport.
//!
//! [`BridgeServer`] runs the gateway in one of two modes:
//!
//! * **server** – [`listen`][BridgeServer::listen] accepts WebSocket clients on
//!   a TCP address, one [`Bridge`] per connection, up to `max_connections`.
//! * **client** – [`connect`][BridgeServer::connect] dials a remote WebSocket
//!   endpoint and serves it as a single connection, reconnecting with capped
//!   exponential backoff whenever it drops.
//!
//! Either way a connection is driven by [`BridgeServer::serve_connection`]:
//! a writer task drains the bridge's outbound channel into the socket while
//! the connection task selects between socket frames and bridge events.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use ros2web_middleware::Node;
use ros2web_types::{BridgeError, ServerMessage};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{WebSocketStream, accept_async, connect_async};
use tracing::{debug, error, info, warn};

use crate::bridge::{Bridge, BridgeOptions, ConnectionEvent};
use crate::registry::SubscriptionRegistry;

/// Backoff exponent stops growing after this many failed attempts.
const MAX_BACKOFF_ATTEMPT: u32 = 10;

/// How long a closing connection may spend flushing queued replies.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Transport settings for a [`BridgeServer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    /// Settings every connection starts with.
    pub bridge: BridgeOptions,
    /// Connections served at once.  Clients beyond this are closed right
    /// after the handshake.
    pub max_connections: usize,
    /// Upper bound of the client-mode reconnect delay.
    pub reconnect_max_delay: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bridge: BridgeOptions::default(),
            max_connections: 100,
            reconnect_max_delay: Duration::from_secs(60),
        }
    }
}

/// Delay before reconnect attempt number `attempt`: `1.5^attempt` seconds,
/// capped at `max`.
pub fn reconnect_delay(attempt: u32, max: Duration) -> Duration {
    let exponent = attempt.min(MAX_BACKOFF_ATTEMPT) as i32;
    Duration::from_secs_f64(1.5f64.powi(exponent)).min(max)
}

/// Close frame sent once a connection's task finishes with `result`.
fn close_frame(result: &Result<(), BridgeError>) -> CloseFrame {
    match result {
        Ok(()) => CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        },
        Err(BridgeError::FrameOverflow { .. }) => CloseFrame {
            code: CloseCode::Size,
            reason: "frame too large".into(),
        },
        Err(_) => CloseFrame {
            code: CloseCode::Error,
            reason: "connection error".into(),
        },
    }
}

/// Decrements the live connection count when the connection ends.
struct ConnectionSlot(Arc<AtomicUsize>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Serves rosbridge connections over WebSocket.
///
/// Cheap to clone: clones share the node, the registry and the connection
/// count, so one clone can accept while another shuts down.
#[derive(Clone)]
pub struct BridgeServer {
    node: Arc<dyn Node>,
    registry: Arc<SubscriptionRegistry>,
    options: ServerOptions,
    connections: Arc<AtomicUsize>,
}

impl BridgeServer {
    /// Create a server over `node`, with a fresh subscription registry.
    pub fn new(node: Arc<dyn Node>, options: ServerOptions) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new(Arc::clone(&node)));
        Self {
            node,
            registry,
            options,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The subscription registry shared by all connections.
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Number of connections currently being served.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    // ───────────────────────────────────────────────────────────────────────
    // Server mode
    // ───────────────────────────────────────────────────────────────────────

    /// Bind `addr` and serve WebSocket clients until a fatal error.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] if the TCP listener cannot be bound.
    pub async fn listen(self, addr: SocketAddr) -> Result<(), BridgeError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::Transport(format!("bind error on {addr}: {e}")))?;
        self.serve(listener).await
    }

    /// Accept clients on an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), BridgeError> {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "rosbridge server listening");
        }
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_client(stream, peer).await {
                            error!(peer = %peer, error = %e, "ws client error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "ws accept error");
                }
            }
        }
    }

    async fn handle_client(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), BridgeError> {
        let mut ws = accept_async(stream)
            .await
            .map_err(|e| BridgeError::Transport(format!("ws handshake from {peer}: {e}")))?;

        let live = self.connections.fetch_add(1, Ordering::SeqCst);
        let _slot = ConnectionSlot(Arc::clone(&self.connections));
        if live >= self.options.max_connections {
            warn!(
                peer = %peer,
                max = self.options.max_connections,
                "connection limit reached, refusing client"
            );
            let frame = CloseFrame {
                code: CloseCode::Again,
                reason: "too many connections".into(),
            };
            let _ = ws.close(Some(frame)).await;
            return Ok(());
        }

        self.serve_connection(ws, peer.to_string()).await
    }

    // ───────────────────────────────────────────────────────────────────────
    // Client mode
    // ───────────────────────────────────────────────────────────────────────

    /// Dial `url` and serve it, reconnecting forever.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] if `url` is not a `ws://` or `wss://`
    /// address.  Otherwise never returns.
    pub async fn connect(&self, url: &str) -> Result<(), BridgeError> {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(BridgeError::Config(format!(
                "'{url}' is not a ws:// or wss:// address"
            )));
        }

        let mut attempt: u32 = 0;
        loop {
            match connect_async(url).await {
                Ok((ws, _response)) => {
                    attempt = 0;
                    info!(url, "connected to remote endpoint");
                    match self.serve_connection(ws, url.to_string()).await {
                        Ok(()) => info!(url, "remote endpoint closed the connection"),
                        Err(e) => warn!(url, error = %e, "connection to remote endpoint failed"),
                    }
                }
                Err(e) => warn!(url, error = %e, "could not connect to remote endpoint"),
            }

            attempt = (attempt + 1).min(MAX_BACKOFF_ATTEMPT);
            let delay = reconnect_delay(attempt, self.options.reconnect_max_delay);
            warn!(url, attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
            tokio::time::sleep(delay).await;
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Connection
    // ───────────────────────────────────────────────────────────────────────

    /// Run one connection to completion, then release everything it owned.
    pub async fn serve_connection<S>(
        &self,
        ws: WebSocketStream<S>,
        peer: String,
    ) -> Result<(), BridgeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ConnectionEvent>();

        let mut bridge = Bridge::new(
            Arc::clone(&self.node),
            Arc::clone(&self.registry),
            out_tx,
            event_tx,
            self.options.bridge.clone(),
        );
        let connection = bridge.id().to_string();
        info!(connection = %connection, peer = %peer, "connection opened");

        // The writer ends once every outbound sender is gone and hands the
        // sink back so the close frame goes out after the last reply.
        let writer_id = connection.clone();
        let mut writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            debug!(connection = %writer_id, "ws send failed, closing writer");
                            break;
                        }
                    }
                    Err(e) => {
                        error!(connection = %writer_id, error = %e, "failed to serialize reply");
                    }
                }
            }
            ws_tx
        });

        let result = loop {
            tokio::select! {
                frame = ws_rx.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = bridge.receive(text.as_str()) {
                            break Err(e);
                        }
                    }
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => {
                            if let Err(e) = bridge.receive(text) {
                                break Err(e);
                            }
                        }
                        Err(e) => {
                            warn!(connection = %connection, error = %e, "dropping non-UTF-8 binary frame");
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(BridgeError::Transport(e.to_string())),
                },
                Some(event) = event_rx.recv() => bridge.handle_event(event),
            }
        };

        // Closing releases the subscription callbacks; dropping the bridge
        // releases the last outbound sender.
        bridge.close();
        drop(bridge);

        match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await {
            Ok(Ok(mut ws_tx)) => {
                let frame = close_frame(&result);
                if let Err(e) = ws_tx.send(Message::Close(Some(frame))).await {
                    debug!(connection = %connection, error = %e, "close frame not delivered");
                }
            }
            Ok(Err(e)) => warn!(connection = %connection, error = %e, "writer task failed"),
            Err(_) => {
                warn!(connection = %connection, "timed out flushing replies");
                writer.abort();
            }
        }

        if let Err(e) = &result {
            error!(connection = %connection, error = %e, "connection terminated");
        }
        result
    }

    /// Tear down every shared subscription and shut the node down.
    pub fn shutdown(&self) {
        info!(
            connections = self.connection_count(),
            "shutting down rosbridge server"
        );
        self.registry.shutdown();
        self.node.shutdown();
    }
}
