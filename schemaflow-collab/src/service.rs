//! Schema-aware collaboration service on top of the transport.
//!
//! Owns one logical connection per instance (no global singleton — the host
//! composition root constructs one and passes it around), joins the room on
//! connect, stamps outbound payloads with the local user id and an ISO
//! timestamp, and re-emits inbound traffic on the typed event bus.
//!
//! Conflict handling is intentionally weak: `transform_operation` does a
//! shallow field-level merge of concurrent updates to the same table, and
//! `resolve_conflict` prefers the incoming change by arrival order,
//! regardless of embedded timestamps.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::client::{Transport, TransportConfig, TransportEvent};
use crate::events::{CollabEvent, EventBus, EventKind, HandlerId};
use crate::presence::{CursorPosition, PresenceStatus, UserPresence};
use crate::protocol::{
    ChangeKind, CursorFrame, JoinRequest, Message, SchemaChange, SelectionFrame, User,
};

/// Service configuration. The schema id is appended to `server_url` as a
/// sub-path at connect time.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub server_url: String,
    pub max_retries: u32,
    pub retry_interval: std::time::Duration,
    pub reconnect_delay: std::time::Duration,
}

impl ServiceConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        let defaults = TransportConfig::new("");
        Self {
            server_url: server_url.into(),
            max_retries: defaults.max_retries,
            retry_interval: defaults.retry_interval,
            reconnect_delay: defaults.reconnect_delay,
        }
    }
}

/// Service errors. Initialization errors fail fast at the call site.
#[derive(Debug, Clone)]
pub enum ServiceError {
    /// `initialize` was not called before the operation
    NotInitialized,
    /// The transport could not be set up
    Transport(String),
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "Service not initialized; call initialize first"),
            Self::Transport(e) => write!(f, "Transport error: {e}"),
        }
    }
}

impl std::error::Error for ServiceError {}

/// The collaboration protocol service.
pub struct CollabService {
    config: ServiceConfig,
    bus: Arc<EventBus>,
    identity: Option<(User, String)>,
    transport: Option<Transport>,
    pump: Option<JoinHandle<()>>,
}

impl CollabService {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            bus: Arc::new(EventBus::new()),
            identity: None,
            transport: None,
            pump: None,
        }
    }

    /// Bind the local user and target schema. Must precede [`connect`](Self::connect).
    pub fn initialize(&mut self, user: User, schema_id: impl Into<String>) {
        self.identity = Some((user, schema_id.into()));
    }

    pub fn is_initialized(&self) -> bool {
        self.identity.is_some()
    }

    /// The event bus for UI subscribers.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Subscribe to an event kind. See [`EventBus::on`].
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&CollabEvent) + Send + Sync + 'static,
    {
        self.bus.on(kind, handler)
    }

    /// Unsubscribe a handler. See [`EventBus::off`].
    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        self.bus.off(kind, id)
    }

    /// Open the transport to the endpoint derived from the schema id. On
    /// transport open the service sends `user_join` and emits `Connected`;
    /// dial failures are surfaced through the bus like any other transport
    /// error, and the transport keeps retrying on its own.
    pub async fn connect(&mut self) -> Result<(), ServiceError> {
        let (user, schema_id) = self
            .identity
            .clone()
            .ok_or(ServiceError::NotInitialized)?;

        let url = format!(
            "{}/{}",
            self.config.server_url.trim_end_matches('/'),
            schema_id
        );
        let mut transport = Transport::new(TransportConfig {
            url,
            max_retries: self.config.max_retries,
            retry_interval: self.config.retry_interval,
            reconnect_delay: self.config.reconnect_delay,
        });
        let mut events = transport
            .take_event_rx()
            .ok_or_else(|| ServiceError::Transport("event channel already taken".into()))?;

        let handle = transport.handle();
        let bus = self.bus.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Opened => {
                        let join = Message::UserJoin(JoinRequest {
                            user: user.clone(),
                            schema_id: schema_id.clone(),
                        });
                        if !handle.send(&join).await {
                            log::warn!("failed to send user_join for schema {schema_id}");
                        }
                        bus.emit(&CollabEvent::Connected);
                    }
                    TransportEvent::Closed => bus.emit(&CollabEvent::Disconnected),
                    TransportEvent::Errored(error) => bus.emit(&CollabEvent::Error(error)),
                    TransportEvent::Message(msg) => match msg {
                        Message::UserJoined(p) => bus.emit(&CollabEvent::UserJoined(p)),
                        Message::UserLeft(p) => bus.emit(&CollabEvent::UserLeft(p)),
                        Message::CursorUpdate(p) => bus.emit(&CollabEvent::CursorUpdate(p)),
                        Message::SchemaChange(p) => bus.emit(&CollabEvent::SchemaChange(p)),
                        Message::UserSelection(p) => bus.emit(&CollabEvent::UserSelection(p)),
                        Message::PresenceUpdate(p) => bus.emit(&CollabEvent::PresenceUpdate(p)),
                        Message::SchemaShared(p) => bus.emit(&CollabEvent::SchemaShared(p)),
                        Message::AccessRevoked(p) => bus.emit(&CollabEvent::AccessRevoked(p)),
                        Message::Pong => bus.emit(&CollabEvent::Pong),
                        Message::Error(p) => bus.emit(&CollabEvent::Error(p.message)),
                        other => log::debug!("dropping inbound {}", other.tag()),
                    },
                }
            }
        });

        if let Err(e) = transport.connect().await {
            // The transport already emitted the error and scheduled a retry.
            log::warn!("initial connect failed: {e}");
        }

        if let Some(stale) = self.pump.replace(pump) {
            stale.abort();
        }
        self.transport = Some(transport);
        Ok(())
    }

    /// Close the connection and suppress automatic reconnects. Idempotent.
    pub async fn disconnect(&mut self) {
        if let Some(transport) = &self.transport {
            transport.disconnect().await;
        }
    }

    /// Operator-forced resync of the underlying transport.
    pub async fn reconnect(&mut self) -> Result<(), ServiceError> {
        match &self.transport {
            Some(transport) => transport
                .reconnect()
                .await
                .map_err(|e| ServiceError::Transport(e.to_string())),
            None => Err(ServiceError::NotInitialized),
        }
    }

    pub async fn is_connected(&self) -> bool {
        match &self.transport {
            Some(transport) => transport.is_connected().await,
            None => false,
        }
    }

    /// Send a cursor position, stamped with the local user and timestamp.
    /// `Ok(false)` means the transport is not currently connected.
    pub async fn send_cursor_update(&self, position: CursorPosition) -> Result<bool, ServiceError> {
        let user = self.local_user()?;
        let frame = CursorFrame {
            user_id: user.id.clone(),
            position,
            timestamp: Utc::now(),
        };
        Ok(self.send(Message::CursorUpdate(frame)).await)
    }

    /// Broadcast a schema mutation to the room.
    pub async fn send_schema_change(
        &self,
        kind: ChangeKind,
        data: Value,
    ) -> Result<bool, ServiceError> {
        let user = self.local_user()?;
        let change = SchemaChange {
            kind,
            data,
            user_id: user.id.clone(),
            timestamp: Utc::now(),
        };
        Ok(self.send(Message::SchemaChange(change)).await)
    }

    /// Broadcast the local selection (ids of selected objects).
    pub async fn send_user_selection(&self, selection: Vec<String>) -> Result<bool, ServiceError> {
        let user = self.local_user()?;
        let frame = SelectionFrame {
            user_id: user.id.clone(),
            selection,
            timestamp: Utc::now(),
        };
        Ok(self.send(Message::UserSelection(frame)).await)
    }

    /// Broadcast a presence update.
    pub async fn update_presence(
        &self,
        status: PresenceStatus,
        current_action: Option<String>,
    ) -> Result<bool, ServiceError> {
        let user = self.local_user()?;
        let presence = UserPresence {
            user_id: user.id.clone(),
            status,
            current_action,
            timestamp: Utc::now(),
        };
        Ok(self.send(Message::PresenceUpdate(presence)).await)
    }

    fn local_user(&self) -> Result<&User, ServiceError> {
        self.identity
            .as_ref()
            .map(|(user, _)| user)
            .ok_or(ServiceError::NotInitialized)
    }

    async fn send(&self, msg: Message) -> bool {
        match &self.transport {
            Some(transport) => transport.send(&msg).await,
            None => false,
        }
    }
}

impl Drop for CollabService {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Merge two concurrent operations. When both are `table_updated` against
/// the same `data.tableId`, the result carries the union of both field sets
/// (`b` wins collisions) plus a `lastModified` field set to the later of the
/// two timestamps; anything else returns `a` unchanged.
///
/// This is a shallow field-level merge, not operational transformation: two
/// edits to the *same* field still collapse to "later field wins".
pub fn transform_operation(a: &SchemaChange, b: &SchemaChange) -> SchemaChange {
    let same_table = a.kind == ChangeKind::TableUpdated
        && b.kind == ChangeKind::TableUpdated
        && matches!((table_id(a), table_id(b)), (Some(ta), Some(tb)) if ta == tb);
    if !same_table {
        return a.clone();
    }

    let mut merged = match &a.data {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    if let Value::Object(map) = &b.data {
        for (key, value) in map {
            merged.insert(key.clone(), value.clone());
        }
    }
    let last_modified = a.timestamp.max(b.timestamp);
    merged.insert(
        "lastModified".to_string(),
        Value::String(last_modified.to_rfc3339()),
    );

    SchemaChange {
        kind: a.kind,
        data: Value::Object(merged),
        user_id: a.user_id.clone(),
        timestamp: last_modified,
    }
}

/// Arrival-order last-write-wins: the incoming change replaces the local
/// one, unconditionally. Embedded timestamps are deliberately ignored.
pub fn resolve_conflict(_local: SchemaChange, remote: SchemaChange) -> SchemaChange {
    remote
}

fn table_id(change: &SchemaChange) -> Option<&str> {
    change.data.get("tableId").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap()
    }

    fn update(table: &str, data: Value, minute: u32) -> SchemaChange {
        let mut data = data;
        if let Value::Object(map) = &mut data {
            map.insert("tableId".into(), json!(table));
        }
        SchemaChange {
            kind: ChangeKind::TableUpdated,
            data,
            user_id: "u1".into(),
            timestamp: ts(minute),
        }
    }

    #[test]
    fn test_transform_merges_disjoint_fields() {
        let a = update("t1", json!({"name": "orders"}), 1);
        let b = update("t1", json!({"color": "blue"}), 5);

        let merged = transform_operation(&a, &b);
        assert_eq!(merged.data["name"], "orders");
        assert_eq!(merged.data["color"], "blue");
        assert_eq!(merged.data["tableId"], "t1");
        assert_eq!(
            merged.data["lastModified"],
            json!(ts(5).to_rfc3339())
        );
        assert_eq!(merged.timestamp, ts(5));
    }

    #[test]
    fn test_transform_later_field_wins_on_collision() {
        let a = update("t1", json!({"name": "orders"}), 9);
        let b = update("t1", json!({"name": "invoices"}), 2);

        let merged = transform_operation(&a, &b);
        // b's fields win the merge even when a's timestamp is later...
        assert_eq!(merged.data["name"], "invoices");
        // ...but lastModified is still the max of the two timestamps.
        assert_eq!(merged.data["lastModified"], json!(ts(9).to_rfc3339()));
    }

    #[test]
    fn test_transform_different_tables_returns_first() {
        let a = update("t1", json!({"name": "orders"}), 1);
        let b = update("t2", json!({"name": "users"}), 2);
        assert_eq!(transform_operation(&a, &b), a);
    }

    #[test]
    fn test_transform_non_update_kinds_returns_first() {
        let a = SchemaChange {
            kind: ChangeKind::TableCreated,
            data: json!({"tableId": "t1"}),
            user_id: "u1".into(),
            timestamp: ts(1),
        };
        let b = update("t1", json!({"name": "orders"}), 2);
        assert_eq!(transform_operation(&a, &b), a);
    }

    #[test]
    fn test_resolve_conflict_always_remote() {
        // Remote wins regardless of timestamp ordering, both ways.
        let older = update("t1", json!({"name": "a"}), 1);
        let newer = update("t1", json!({"name": "b"}), 9);

        assert_eq!(resolve_conflict(older.clone(), newer.clone()), newer);
        assert_eq!(resolve_conflict(newer.clone(), older.clone()), older);
    }

    #[tokio::test]
    async fn test_connect_requires_initialize() {
        let mut service = CollabService::new(ServiceConfig::new("ws://127.0.0.1:1"));
        let err = service.connect().await.unwrap_err();
        assert!(matches!(err, ServiceError::NotInitialized));
    }

    #[tokio::test]
    async fn test_send_helpers_require_initialize() {
        let service = CollabService::new(ServiceConfig::new("ws://127.0.0.1:1"));
        assert!(matches!(
            service.send_cursor_update(CursorPosition::new(0.0, 0.0)).await,
            Err(ServiceError::NotInitialized)
        ));
        assert!(matches!(
            service
                .send_schema_change(ChangeKind::TableCreated, json!({}))
                .await,
            Err(ServiceError::NotInitialized)
        ));
        assert!(matches!(
            service.update_presence(PresenceStatus::Online, None).await,
            Err(ServiceError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_send_before_connect_reports_not_sent() {
        let mut service = CollabService::new(ServiceConfig::new("ws://127.0.0.1:1"));
        service.initialize(User::new("u1", "alice", "editor"), "s1");

        let sent = service
            .send_cursor_update(CursorPosition::new(1.0, 2.0))
            .await
            .unwrap();
        assert!(!sent);
        assert!(!service.is_connected().await);
    }

    #[tokio::test]
    async fn test_reconnect_before_connect_fails() {
        let mut service = CollabService::new(ServiceConfig::new("ws://127.0.0.1:1"));
        service.initialize(User::new("u1", "alice", "editor"), "s1");
        assert!(service.reconnect().await.is_err());
    }
}
