//! # schemaflow-collab — Real-time collaboration layer for SchemaFlow
//!
//! Provides WebSocket-based multiplayer schema editing: room-scoped
//! broadcast on the server, a reconnecting client transport, and a typed
//! event surface for the designer UI.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐     WebSocket      ┌───────────────┐
//! │ CollabService │ ◄─────────────────► │ CollabServer  │
//! │  (per user)   │    JSON frames      │   (central)   │
//! └──────┬────────┘                     └──────┬────────┘
//!        │                                     │
//!        ▼                                     ▼
//! ┌───────────────┐                     ┌───────────────┐
//! │ EventBus      │                     │ Hub           │
//! │ (UI handlers) │                     │ (rooms/users) │
//! └───────────────┘                     └──────┬────────┘
//!                                              │
//!                                      ┌───────┴───────┐
//!                                      │ Room fan-out  │
//!                                      │ (excl. sender)│
//!                                      └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON envelope codec and the message catalog
//! - [`registry`] — Connection/room/user registry with broadcast fan-out
//! - [`server`] — WebSocket broadcast server with periodic sweep
//! - [`client`] — Reconnecting WebSocket transport
//! - [`service`] — Schema-aware protocol service and merge helpers
//! - [`presence`] — Remote peer roster, cursors, idle cleanup
//! - [`events`] — Typed pub/sub event bus
//!
//! Delivery is at-most-once per receiver: frames from a live peer arrive in
//! send order, but nothing is replayed across a reconnect. Persistence and
//! authorization live in the host application, not here.

pub mod client;
pub mod events;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod service;

// Re-exports for convenience
pub use client::{Transport, TransportConfig, TransportEvent, TransportHandle, TransportState};
pub use events::{CollabEvent, EventBus, EventKind, HandlerId};
pub use presence::{CursorPosition, PresenceRoster, PresenceStatus, UserPresence};
pub use protocol::{
    AccessRevoked, ChangeKind, CursorFrame, ErrorReply, JoinRequest, Message, ProtocolError,
    SchemaChange, SchemaShared, SelectionFrame, User, UserJoined, UserLeft,
};
pub use registry::Hub;
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use service::{
    resolve_conflict, transform_operation, CollabService, ServiceConfig, ServiceError,
};
