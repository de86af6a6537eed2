//! Reconnecting WebSocket transport.
//!
//! Presents one logical socket that survives transient drops without caller
//! intervention. The lifecycle is an explicit state machine:
//!
//! ```text
//! Idle ── connect() ──► Connecting ──► Open ──► Closing ──► Idle
//!   ▲                        │           │
//!   │                        ▼           ▼ (remote close)
//!   └──────────────── WaitingToRetry ◄───┘
//! ```
//!
//! A remote close schedules exactly one retry after a fixed interval, up to
//! a configured attempt budget; a manual `disconnect()` suppresses any
//! pending or future retry. Socket errors are surfaced through the event
//! channel but do not themselves trigger reconnection — the close that
//! follows does. All results are delivered via [`TransportEvent`]s; no call
//! here blocks beyond the socket boundary.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::protocol::{Message, ProtocolError};

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// WebSocket endpoint, including the schema sub-path
    pub url: String,
    /// Maximum automatic reconnect attempts before giving up
    pub max_retries: u32,
    /// Fixed delay between automatic reconnect attempts
    pub retry_interval: Duration,
    /// Delay before the connect inside a manual `reconnect()`
    pub reconnect_delay: Duration,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_retries: 5,
            retry_interval: Duration::from_secs(3),
            reconnect_delay: Duration::from_millis(250),
        }
    }
}

/// Transport lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Connecting,
    Open,
    Closing,
    WaitingToRetry,
}

/// Events emitted by the transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Connection established
    Opened,
    /// Connection lost or closed
    Closed,
    /// Socket-level error (reconnection is driven by the close, not this)
    Errored(String),
    /// Decoded inbound protocol message
    Message(Message),
}

struct TransportInner {
    config: TransportConfig,
    state: RwLock<TransportState>,
    retries: AtomicU32,
    /// Set by a manual disconnect; blocks any scheduled or future retry.
    suppress_retry: AtomicBool,
    /// Bumped per successful connect so a stale socket's teardown cannot
    /// clobber the state of its replacement.
    epoch: AtomicU64,
    outbound: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    last_error: RwLock<Option<String>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    retry_task: Mutex<Option<JoinHandle<()>>>,
}

impl TransportInner {
    /// Boxed so the retry task can await a fresh `connect` without the
    /// future type recursing through itself.
    fn connect(self: Arc<Self>) -> BoxFuture<'static, Result<(), ProtocolError>> {
        Box::pin(self.connect_inner())
    }

    async fn connect_inner(self: Arc<Self>) -> Result<(), ProtocolError> {
        {
            let mut state = self.state.write().await;
            // Re-entrancy guard: a connect racing an in-flight attempt or an
            // open socket is a no-op.
            if matches!(*state, TransportState::Connecting | TransportState::Open) {
                log::debug!("connect ignored in state {:?}", *state);
                return Ok(());
            }
            *state = TransportState::Connecting;
        }

        match tokio_tungstenite::connect_async(&self.config.url).await {
            Ok((ws_stream, _)) => {
                let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                self.retries.store(0, Ordering::SeqCst);

                let (mut ws_sink, mut ws_source) = ws_stream.split();
                let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
                *self.outbound.write().await = Some(out_tx);
                *self.state.write().await = TransportState::Open;
                let _ = self.event_tx.send(TransportEvent::Opened);
                log::info!("transport connected to {}", self.config.url);

                // Writer: drain the outbound channel into the socket. The
                // channel closing (disconnect) sends the close handshake.
                tokio::spawn(async move {
                    while let Some(msg) = out_rx.recv().await {
                        match msg.encode() {
                            Ok(encoded) => {
                                if ws_sink.send(WsMessage::Text(encoded.into())).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::error!("dropping unencodable frame: {e}"),
                        }
                    }
                    let _ = ws_sink.close().await;
                });

                // Reader: decode inbound frames until the socket dies.
                let inner = self.clone();
                tokio::spawn(async move {
                    while let Some(frame) = ws_source.next().await {
                        match frame {
                            Ok(WsMessage::Text(text)) => match Message::decode(text.as_str()) {
                                Ok(msg) => {
                                    let _ = inner.event_tx.send(TransportEvent::Message(msg));
                                }
                                Err(e) => log::warn!("dropping undecodable frame: {e}"),
                            },
                            Ok(WsMessage::Close(_)) => break,
                            Err(e) => {
                                let error = format!("connection error: {e}");
                                *inner.last_error.write().await = Some(error.clone());
                                let _ = inner.event_tx.send(TransportEvent::Errored(error));
                                break;
                            }
                            _ => {}
                        }
                    }
                    inner.finish_closed(epoch).await;
                });

                Ok(())
            }
            Err(e) => {
                let error = format!("connection error: {e}");
                log::warn!("connect to {} failed: {e}", self.config.url);
                *self.last_error.write().await = Some(error.clone());
                *self.state.write().await = TransportState::Idle;
                let _ = self.event_tx.send(TransportEvent::Errored(error.clone()));
                let _ = self.event_tx.send(TransportEvent::Closed);
                self.schedule_retry().await;
                Err(ProtocolError::Connection(error))
            }
        }
    }

    /// Socket teardown: emit `Closed` and schedule a retry unless the close
    /// was manual. Stale epochs (a replaced socket finishing late) only get
    /// to emit their close.
    async fn finish_closed(self: &Arc<Self>, epoch: u64) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            let _ = self.event_tx.send(TransportEvent::Closed);
            return;
        }

        *self.outbound.write().await = None;
        let manual = {
            let mut state = self.state.write().await;
            let manual = *state == TransportState::Closing;
            *state = TransportState::Idle;
            manual
        };
        let _ = self.event_tx.send(TransportEvent::Closed);

        if !manual {
            self.schedule_retry().await;
        }
    }

    /// Schedule exactly one retry after the fixed interval, respecting the
    /// attempt budget. Exhausting the budget stops silently; the error and
    /// close events already fired.
    async fn schedule_retry(self: &Arc<Self>) {
        if self.suppress_retry.load(Ordering::SeqCst) {
            return;
        }
        let attempt = self.retries.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.config.max_retries {
            log::warn!(
                "giving up on {} after {} attempts",
                self.config.url,
                self.config.max_retries
            );
            return;
        }
        *self.state.write().await = TransportState::WaitingToRetry;
        log::info!(
            "reconnect attempt {attempt}/{} in {:?}",
            self.config.max_retries,
            self.config.retry_interval
        );

        let inner = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(inner.config.retry_interval).await;
            if inner.suppress_retry.load(Ordering::SeqCst) {
                return;
            }
            let _ = inner.clone().connect().await;
        });
        let mut slot = self.retry_task.lock().await;
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    async fn disconnect(self: &Arc<Self>) {
        self.suppress_retry.store(true, Ordering::SeqCst);
        if let Some(task) = self.retry_task.lock().await.take() {
            task.abort();
        }
        let was_open = self.outbound.write().await.take().is_some();
        let mut state = self.state.write().await;
        if was_open && *state == TransportState::Open {
            // The writer drains out and closes the socket; the reader's
            // teardown sees Closing and skips the retry.
            *state = TransportState::Closing;
        } else if *state != TransportState::Open {
            *state = TransportState::Idle;
        }
    }

    async fn send(&self, msg: &Message) -> bool {
        if *self.state.read().await != TransportState::Open {
            return false;
        }
        match self.outbound.read().await.as_ref() {
            Some(tx) => tx.send(msg.clone()).is_ok(),
            None => false,
        }
    }
}

/// The reconnecting transport.
pub struct Transport {
    inner: Arc<TransportInner>,
    event_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl Transport {
    /// Create a new transport. It does not connect until [`connect`](Self::connect).
    pub fn new(config: TransportConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(TransportInner {
                config,
                state: RwLock::new(TransportState::Idle),
                retries: AtomicU32::new(0),
                suppress_retry: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                outbound: RwLock::new(None),
                last_error: RwLock::new(None),
                event_tx,
                retry_task: Mutex::new(None),
            }),
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.event_rx.take()
    }

    /// A cheap handle for sending and state checks from other tasks.
    pub fn handle(&self) -> TransportHandle {
        TransportHandle {
            inner: self.inner.clone(),
        }
    }

    /// Open the underlying socket. A no-op while connecting or connected.
    /// A failed dial behaves like a remote close: error and close events,
    /// then a scheduled retry.
    pub async fn connect(&self) -> Result<(), ProtocolError> {
        self.inner.clone().connect().await
    }

    /// Serialize and send. Returns `false` without error when the transport
    /// is not open or the write fails.
    pub async fn send(&self, msg: &Message) -> bool {
        self.inner.send(msg).await
    }

    /// Close the socket and prevent any scheduled reconnect. Idempotent.
    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    /// Operator-forced resync: disconnect, clear the retry budget and the
    /// no-reconnect flag, then connect after a short delay.
    pub async fn reconnect(&self) -> Result<(), ProtocolError> {
        self.inner.disconnect().await;
        self.inner.suppress_retry.store(false, Ordering::SeqCst);
        self.inner.retries.store(0, Ordering::SeqCst);
        tokio::time::sleep(self.inner.config.reconnect_delay).await;
        self.inner.clone().connect().await
    }

    pub async fn state(&self) -> TransportState {
        *self.inner.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        *self.inner.state.read().await == TransportState::Open
    }

    /// The most recent connection error, if any.
    pub async fn last_error(&self) -> Option<String> {
        self.inner.last_error.read().await.clone()
    }

    /// Automatic reconnect attempts since the last successful connect.
    pub fn retries(&self) -> u32 {
        self.inner.retries.load(Ordering::SeqCst)
    }

    /// The configured endpoint.
    pub fn url(&self) -> &str {
        &self.inner.config.url
    }
}

/// Cloneable sending handle detached from the event receiver.
#[derive(Clone)]
pub struct TransportHandle {
    inner: Arc<TransportInner>,
}

impl TransportHandle {
    pub async fn send(&self, msg: &Message) -> bool {
        self.inner.send(msg).await
    }

    pub async fn is_connected(&self) -> bool {
        *self.inner.state.read().await == TransportState::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = TransportConfig::new("ws://localhost:9464/s1");
        assert_eq!(config.url, "ws://localhost:9464/s1");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_interval, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_initial_state() {
        let transport = Transport::new(TransportConfig::new("ws://localhost:9464/s1"));
        assert_eq!(transport.state().await, TransportState::Idle);
        assert!(!transport.is_connected().await);
        assert!(transport.last_error().await.is_none());
        assert_eq!(transport.retries(), 0);
    }

    #[tokio::test]
    async fn test_send_returns_false_when_not_connected() {
        let transport = Transport::new(TransportConfig::new("ws://localhost:9464/s1"));
        assert!(!transport.send(&Message::Ping).await);

        let handle = transport.handle();
        assert!(!handle.send(&Message::Ping).await);
        assert!(!handle.is_connected().await);
    }

    #[tokio::test]
    async fn test_take_event_rx_once() {
        let mut transport = Transport::new(TransportConfig::new("ws://localhost:9464/s1"));
        assert!(transport.take_event_rx().is_some());
        assert!(transport.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_when_idle() {
        let transport = Transport::new(TransportConfig::new("ws://localhost:9464/s1"));
        transport.disconnect().await;
        transport.disconnect().await;
        assert_eq!(transport.state().await, TransportState::Idle);
    }

    #[tokio::test]
    async fn test_failed_dial_emits_error_then_closed_and_retries() {
        // Nothing listens on this port; dial fails immediately.
        let mut config = TransportConfig::new("ws://127.0.0.1:1/s1");
        config.max_retries = 1;
        config.retry_interval = Duration::from_millis(10);
        let mut transport = Transport::new(config);
        let mut events = transport.take_event_rx().unwrap();

        assert!(transport.connect().await.is_err());
        assert!(matches!(events.recv().await, Some(TransportEvent::Errored(_))));
        assert!(matches!(events.recv().await, Some(TransportEvent::Closed)));
        assert!(transport.last_error().await.is_some());

        // The single budgeted retry also fails, then the transport goes quiet.
        assert!(matches!(
            tokio::time::timeout(Duration::from_secs(2), events.recv()).await,
            Ok(Some(TransportEvent::Errored(_)))
        ));
        assert!(matches!(
            tokio::time::timeout(Duration::from_secs(2), events.recv()).await,
            Ok(Some(TransportEvent::Closed))
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.state().await, TransportState::Idle);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_retry() {
        let mut config = TransportConfig::new("ws://127.0.0.1:1/s1");
        config.max_retries = 5;
        config.retry_interval = Duration::from_secs(30);
        let mut transport = Transport::new(config);
        let mut events = transport.take_event_rx().unwrap();

        let _ = transport.connect().await;
        let _ = events.recv().await; // Errored
        let _ = events.recv().await; // Closed
        assert_eq!(transport.state().await, TransportState::WaitingToRetry);

        transport.disconnect().await;
        assert_eq!(transport.state().await, TransportState::Idle);
    }
}
