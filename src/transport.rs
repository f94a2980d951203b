//! Real-time transport module
//!
//! This module owns the single socket connection of a session:
//! - Socket.IO handshake over WebSocket, then `join` of the tenant room
//! - Heartbeat answers and idle detection
//! - Dispatch of validated events to registered handlers
//! - Automatic reconnection with exponential backoff
//!
//! Events missed while disconnected are not replayed; consumers close that
//! gap with their next REST refresh.

use crate::config::Settings;
use crate::protocol::{self, EnginePacket, ServerEvent, SocketPacket};
use crate::{Error, Result};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Callback invoked for every event of the kind it was registered for
pub type EventHandler = Arc<dyn Fn(ServerEvent) + Send + Sync>;

/// Idle limit used until the server announces its heartbeat settings
const DEFAULT_IDLE_LIMIT: Duration = Duration::from_secs(60);

/// Reconnect backoff bounds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    /// First delay after a drop
    pub initial: Duration,
    /// Maximum delay between attempts
    pub max: Duration,
}

impl ReconnectPolicy {
    /// Double the delay, capped at `max`
    pub fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }

    /// Add up to 25% random jitter so reconnecting clients spread out
    fn jittered(&self, delay: Duration) -> Duration {
        let spread = (delay.as_millis() as u64) / 4;
        if spread == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

/// Why a connected session ended
enum SessionEnd {
    Cancelled,
    Lost(String),
}

/// Running connection task and the token that stops it
struct Connection {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Real-time transport layer
#[derive(Clone)]
pub struct Transport {
    /// WebSocket endpoint including the Socket.IO path
    endpoint: String,
    /// Backoff used after connection loss
    policy: ReconnectPolicy,
    /// Handlers by event name
    handlers: Arc<Mutex<HashMap<String, Vec<EventHandler>>>>,
    /// Set while a connection task exists (connecting or connected)
    initialized: Arc<AtomicBool>,
    /// Whether the room is currently joined
    connected: Arc<watch::Sender<bool>>,
    /// Active connection task
    connection: Arc<Mutex<Option<Connection>>>,
}

impl Transport {
    /// Create a transport for a Socket.IO server base URL
    pub fn new(base_url: &str, policy: ReconnectPolicy) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            endpoint: protocol::socket_endpoint(base_url),
            policy,
            handlers: Arc::new(Mutex::new(HashMap::new())),
            initialized: Arc::new(AtomicBool::new(false)),
            connected: Arc::new(connected),
            connection: Arc::new(Mutex::new(None)),
        }
    }

    /// Create a transport from client settings
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            &settings.socket_url,
            ReconnectPolicy {
                initial: Duration::from_millis(settings.reconnect_initial_ms),
                max: Duration::from_millis(settings.reconnect_max_ms),
            },
        )
    }

    /// WebSocket endpoint this transport dials
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Register a handler for an event name
    ///
    /// Several handlers may be registered for the same name; they run in
    /// registration order on the connection task.
    pub async fn on<F>(&self, event: &str, handler: F)
    where
        F: Fn(ServerEvent) + Send + Sync + 'static,
    {
        let mut guard = self.handlers.lock().await;
        guard.entry(event.to_string()).or_default().push(Arc::new(handler));
    }

    /// Open the connection and join the tenant's room once the handshake completes
    ///
    /// Returns immediately; the handshake runs on a background task. Calling
    /// this while a connection already exists is a no-op.
    pub async fn connect(&self, tenant_id: &str) -> Result<()> {
        if tenant_id.trim().is_empty() {
            return Err(Error::Transport("tenant id is required to join a room".to_string()));
        }
        if self.initialized.swap(true, Ordering::SeqCst) {
            debug!("Transport already initialized, ignoring connect");
            return Ok(());
        }

        info!("Connecting to {} for tenant {}", self.endpoint, tenant_id);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(connection_loop(
            self.endpoint.clone(),
            tenant_id.to_string(),
            self.policy,
            self.handlers.clone(),
            self.connected.clone(),
            cancel.clone(),
        ));

        *self.connection.lock().await = Some(Connection { cancel, task });
        Ok(())
    }

    /// Close the connection and stop reconnecting
    pub async fn disconnect(&self) {
        let connection = self.connection.lock().await.take();
        if let Some(connection) = connection {
            connection.cancel.cancel();
            if let Err(e) = connection.task.await {
                error!("Transport task ended abnormally: {}", e);
            }
            info!("Transport disconnected");
        }
        self.connected.send_replace(false);
        self.initialized.store(false, Ordering::SeqCst);
    }

    /// Whether the tenant room is currently joined
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Observe connection status changes
    pub fn connection_status(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    /// Wait until the room is joined, up to `timeout`
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut status = self.connection_status();
        tokio::time::timeout(timeout, status.wait_for(|connected| *connected))
            .await
            .map_err(|_| Error::Transport(format!("not connected after {:?}", timeout)))?
            .map_err(|_| Error::Transport("transport dropped".to_string()))?;
        Ok(())
    }
}

/// Connect, run a session, and reconnect with backoff until cancelled
async fn connection_loop(
    endpoint: String,
    tenant_id: String,
    policy: ReconnectPolicy,
    handlers: Arc<Mutex<HashMap<String, Vec<EventHandler>>>>,
    connected: Arc<watch::Sender<bool>>,
    cancel: CancellationToken,
) {
    let mut backoff = policy.initial;

    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => break,
            result = connect_async(endpoint.as_str()) => result,
        };

        match attempt {
            Ok((ws, _)) => {
                debug!("WebSocket open to {}", endpoint);
                backoff = policy.initial;
                match run_session(ws, &tenant_id, &handlers, &connected, &cancel).await {
                    SessionEnd::Cancelled => break,
                    SessionEnd::Lost(reason) => {
                        warn!("Connection lost: {}. Reconnecting in {:?}", reason, backoff);
                    }
                }
            }
            Err(e) => {
                warn!("Failed to connect to {}: {}. Retrying in {:?}", endpoint, e, backoff);
            }
        }

        connected.send_replace(false);

        let delay = policy.jittered(backoff);
        backoff = policy.next(backoff);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    connected.send_replace(false);
}

/// Drive one WebSocket connection from handshake to close
async fn run_session(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    tenant_id: &str,
    handlers: &Mutex<HashMap<String, Vec<EventHandler>>>,
    connected: &watch::Sender<bool>,
    cancel: &CancellationToken,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();
    let mut idle_limit = DEFAULT_IDLE_LIMIT;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                // Leave the namespace, then close the socket
                let _ = sink.send(WsMessage::text("41")).await;
                let _ = sink.close().await;
                return SessionEnd::Cancelled;
            }
            next = tokio::time::timeout(idle_limit, stream.next()) => next,
        };

        let frame = match next {
            Err(_) => return SessionEnd::Lost(format!("no traffic for {:?}", idle_limit)),
            Ok(None) => return SessionEnd::Lost("stream ended".to_string()),
            Ok(Some(Err(e))) => return SessionEnd::Lost(e.to_string()),
            Ok(Some(Ok(WsMessage::Text(text)))) => text,
            Ok(Some(Ok(WsMessage::Close(_)))) => return SessionEnd::Lost("closed by server".to_string()),
            Ok(Some(Ok(_))) => continue,
        };

        let packet = match EnginePacket::decode(frame.as_str()) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Ignoring undecodable frame: {}", e);
                continue;
            }
        };

        let reply = match packet {
            EnginePacket::Open(handshake) => {
                idle_limit = Duration::from_millis(handshake.ping_interval + handshake.ping_timeout);
                debug!("Engine session {} opened", handshake.sid);
                Some(EnginePacket::Message(SocketPacket::Connect(None)).encode())
            }
            EnginePacket::Ping => Some(EnginePacket::Pong.encode()),
            EnginePacket::Message(SocketPacket::Connect(_)) => {
                info!("Socket connected, joining room {}", tenant_id);
                connected.send_replace(true);
                Some(protocol::join_frame(tenant_id))
            }
            EnginePacket::Message(SocketPacket::Event { name, payload }) => {
                match ServerEvent::decode(&name, payload) {
                    Ok(event) => dispatch(handlers, event).await,
                    Err(e) => warn!("Dropping event: {}", e),
                }
                None
            }
            EnginePacket::Message(SocketPacket::ConnectError(reason)) => {
                return SessionEnd::Lost(format!("namespace connect refused: {}", reason));
            }
            EnginePacket::Message(SocketPacket::Disconnect) | EnginePacket::Close => {
                return SessionEnd::Lost("disconnected by server".to_string());
            }
            EnginePacket::Pong | EnginePacket::Noop => None,
        };

        if let Some(reply) = reply {
            let frame = match reply {
                Ok(frame) => frame,
                Err(e) => {
                    error!("Failed to encode reply: {}", e);
                    continue;
                }
            };
            if let Err(e) = sink.send(WsMessage::text(frame)).await {
                return SessionEnd::Lost(format!("send failed: {}", e));
            }
        }
    }
}

/// Call every handler registered for the event's name
async fn dispatch(handlers: &Mutex<HashMap<String, Vec<EventHandler>>>, event: ServerEvent) {
    let targets = {
        let guard = handlers.lock().await;
        guard.get(event.name()).cloned().unwrap_or_default()
    };

    if targets.is_empty() {
        debug!("No handler for {}, event dropped", event.name());
        return;
    }
    for handler in targets {
        handler(event.clone());
    }
}
