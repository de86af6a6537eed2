//! Typed event bus for UI consumers of the collaboration service.
//!
//! A closed union of event kinds with a dispatch table keyed by kind.
//! Handlers run synchronously in registration order; duplicates are allowed;
//! removal is by the [`HandlerId`] returned at registration. A panicking
//! handler propagates and aborts delivery to later handlers — callers that
//! need isolation must catch at their own boundary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::presence::UserPresence;
use crate::protocol::{
    AccessRevoked, CursorFrame, SchemaChange, SchemaShared, SelectionFrame, UserJoined, UserLeft,
};

/// The kinds of event the service emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    Error,
    UserJoined,
    UserLeft,
    CursorUpdate,
    SchemaChange,
    UserSelection,
    PresenceUpdate,
    SchemaShared,
    AccessRevoked,
    Pong,
}

/// An event with its payload.
#[derive(Debug, Clone)]
pub enum CollabEvent {
    Connected,
    Disconnected,
    Error(String),
    UserJoined(UserJoined),
    UserLeft(UserLeft),
    CursorUpdate(CursorFrame),
    SchemaChange(SchemaChange),
    UserSelection(SelectionFrame),
    PresenceUpdate(UserPresence),
    SchemaShared(SchemaShared),
    AccessRevoked(AccessRevoked),
    Pong,
}

impl CollabEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CollabEvent::Connected => EventKind::Connected,
            CollabEvent::Disconnected => EventKind::Disconnected,
            CollabEvent::Error(_) => EventKind::Error,
            CollabEvent::UserJoined(_) => EventKind::UserJoined,
            CollabEvent::UserLeft(_) => EventKind::UserLeft,
            CollabEvent::CursorUpdate(_) => EventKind::CursorUpdate,
            CollabEvent::SchemaChange(_) => EventKind::SchemaChange,
            CollabEvent::UserSelection(_) => EventKind::UserSelection,
            CollabEvent::PresenceUpdate(_) => EventKind::PresenceUpdate,
            CollabEvent::SchemaShared(_) => EventKind::SchemaShared,
            CollabEvent::AccessRevoked(_) => EventKind::AccessRevoked,
            CollabEvent::Pong => EventKind::Pong,
        }
    }
}

/// Opaque registration handle; pass it to [`EventBus::off`] to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&CollabEvent) + Send + Sync>;

/// Dispatch table: event kind → ordered handler list.
pub struct EventBus {
    handlers: Mutex<HashMap<EventKind, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler for an event kind. Handlers fire in registration
    /// order; registering the same closure twice yields two invocations.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&CollabEvent) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove the first registration matching `id`. Returns whether a
    /// handler was removed.
    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = handlers.get_mut(&kind) {
            if let Some(pos) = list.iter().position(|(hid, _)| *hid == id) {
                list.remove(pos);
                if list.is_empty() {
                    handlers.remove(&kind);
                }
                return true;
            }
        }
        false
    }

    /// Invoke every handler currently registered for the event's kind,
    /// synchronously, in registration order. Handlers registered during
    /// dispatch are not invoked for this event.
    pub fn emit(&self, event: &CollabEvent) {
        let snapshot: Vec<Handler> = {
            let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            handlers
                .get(&event.kind())
                .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };
        for handler in snapshot {
            handler(event);
        }
    }

    /// Number of handlers registered for a kind.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.get(&kind).map_or(0, Vec::len)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
