//! WebSocket broadcast server with room-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (schema_id) ── Hub ── per-connection mpsc
//! Client B ──┘                        │
//!                          ┌──────────┼───────────┐
//!                          ▼          ▼           ▼
//!                       Client A   Client B    Client C
//! ```
//!
//! One task per accepted socket; each task owns its WebSocket split halves
//! and drains the connection's outbound channel. The [`Hub`] is the only
//! shared state. A periodic sweep reclaims dead connections and empty rooms.
//!
//! A frame that fails to parse as an envelope earns an `error` reply and the
//! connection stays open; an unknown message type is logged and dropped with
//! no reply. No fault in a single connection is fatal to the server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::protocol::{Message, ProtocolError};
use crate::registry::Hub;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Interval between sweep passes, in seconds
    pub sweep_interval_secs: u64,
    /// Maximum concurrent connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9464".to_string(),
            sweep_interval_secs: 30,
            max_connections: 1000,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub active_rooms: usize,
}

/// The collaboration broadcast server.
pub struct CollabServer {
    config: ServerConfig,
    hub: Arc<Hub>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            hub: Arc::new(Hub::new()),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("collab server listening on {}", self.config.bind_addr);

        // Periodic sweep takes the same hub lock as dispatch.
        let hub = self.hub.clone();
        let stats = self.stats.clone();
        let sweep_interval = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                hub.sweep().await;
                let mut s = stats.write().await;
                s.active_rooms = hub.room_count().await;
            }
        });

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            if self.hub.connection_count().await >= self.config.max_connections {
                log::warn!("connection limit reached; rejecting {addr}");
                continue;
            }

            let hub = self.hub.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, stats).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection until it closes.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<Hub>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let conn_id = hub.register(tx).await;
        log::info!("websocket connection {conn_id} established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        loop {
            tokio::select! {
                // Inbound WebSocket frame
                frame = ws_receiver.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                            }
                            match Message::decode(text.as_str()) {
                                Ok(msg) => hub.handle_message(conn_id, msg).await,
                                Err(ProtocolError::UnknownType(tag)) => {
                                    // Dropped without a reply; only malformed
                                    // envelopes earn an error message.
                                    log::warn!("unknown message type {tag} from {addr}; dropped");
                                }
                                Err(e) => {
                                    log::warn!("malformed message from {addr}: {e}");
                                    let reply = Message::error(e.to_string());
                                    if let Ok(encoded) = reply.encode() {
                                        ws_sender.send(WsMessage::Text(encoded.into())).await?;
                                    }
                                }
                            }
                        }

                        Some(Ok(WsMessage::Ping(payload))) => {
                            ws_sender.send(WsMessage::Pong(payload)).await?;
                        }

                        Some(Ok(WsMessage::Close(frame))) => {
                            // Echo the close frame so the peer sees a clean
                            // handshake instead of a connection reset.
                            let _ = ws_sender.send(WsMessage::Close(frame)).await;
                            log::info!("connection {conn_id} closed from {addr}");
                            break;
                        }

                        None => {
                            log::info!("connection {conn_id} dropped from {addr}");
                            break;
                        }

                        Some(Err(e)) => {
                            log::error!("websocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outbound message routed to this connection by the hub
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(msg) => match msg.encode() {
                            Ok(encoded) => {
                                ws_sender.send(WsMessage::Text(encoded.into())).await?;
                            }
                            Err(e) => log::error!("dropping unencodable outbound frame: {e}"),
                        },
                        None => break,
                    }
                }
            }
        }

        hub.handle_close(conn_id).await;
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = hub.room_count().await;
        }

        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the hub (rooms, users, sweep).
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }
}
