//! Ephemeral presence: who is in the room, what they are doing, and where
//! their cursor is.
//!
//! Nothing here is persisted. Each update fully replaces the previous value
//! for that user; the server relays presence frames without retaining them,
//! and the [`PresenceRoster`] is purely client-side bookkeeping for UI
//! rendering.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::{CursorFrame, Message, UserJoined, UserLeft};

/// A user's availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
}

/// `presence_update` payload: status plus a free-text activity line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresence {
    pub user_id: String,
    pub status: PresenceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_action: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Cursor location on the schema canvas, optionally anchored to a table or
/// column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_id: Option<String>,
}

impl CursorPosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            table_id: None,
            column_id: None,
        }
    }
}

/// The latest known state of one remote peer.
#[derive(Debug, Clone)]
pub struct PeerState {
    pub user_id: String,
    pub username: Option<String>,
    pub presence: Option<UserPresence>,
    pub cursor: Option<CursorPosition>,
    last_seen: Instant,
}

impl PeerState {
    fn new(user_id: String) -> Self {
        Self {
            user_id,
            username: None,
            presence: None,
            cursor: None,
            last_seen: Instant::now(),
        }
    }

    /// Time since this peer was last heard from.
    pub fn time_since_update(&self) -> Duration {
        self.last_seen.elapsed()
    }

    fn touch(&mut self) {
        self.last_seen = Instant::now();
    }
}

/// Tracks the latest presence and cursor state per remote peer.
///
/// Last write overwrites; the local user's own echoes are ignored. Peers
/// that stay silent past the idle timeout are reclaimed by
/// [`cleanup_idle`](PresenceRoster::cleanup_idle).
pub struct PresenceRoster {
    local_user_id: String,
    peers: HashMap<String, PeerState>,
    idle_timeout: Duration,
}

impl PresenceRoster {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            peers: HashMap::new(),
            idle_timeout: Duration::from_secs(30),
        }
    }

    /// Create with a custom idle timeout (for testing).
    pub fn with_idle_timeout(local_user_id: impl Into<String>, timeout: Duration) -> Self {
        let mut roster = Self::new(local_user_id);
        roster.idle_timeout = timeout;
        roster
    }

    /// Route a relayed protocol message into the roster. Messages that carry
    /// no presence information are ignored.
    pub fn observe(&mut self, msg: &Message) {
        match msg {
            Message::UserJoined(joined) => self.handle_joined(joined),
            Message::UserLeft(left) => self.handle_left(left),
            Message::PresenceUpdate(presence) => self.handle_presence(presence.clone()),
            Message::CursorUpdate(frame) => self.handle_cursor(frame),
            _ => {}
        }
    }

    pub fn handle_joined(&mut self, joined: &UserJoined) {
        if joined.user_id == self.local_user_id {
            return;
        }
        let peer = self
            .peers
            .entry(joined.user_id.clone())
            .or_insert_with(|| PeerState::new(joined.user_id.clone()));
        peer.username = Some(joined.username.clone());
        peer.touch();
    }

    pub fn handle_left(&mut self, left: &UserLeft) {
        self.peers.remove(&left.user_id);
    }

    pub fn handle_presence(&mut self, presence: UserPresence) {
        if presence.user_id == self.local_user_id {
            return;
        }
        let peer = self
            .peers
            .entry(presence.user_id.clone())
            .or_insert_with(|| PeerState::new(presence.user_id.clone()));
        peer.presence = Some(presence);
        peer.touch();
    }

    pub fn handle_cursor(&mut self, frame: &CursorFrame) {
        if frame.user_id == self.local_user_id {
            return;
        }
        // A cursor from an unknown peer means they joined before we
        // connected; create a placeholder entry.
        let peer = self
            .peers
            .entry(frame.user_id.clone())
            .or_insert_with(|| PeerState::new(frame.user_id.clone()));
        peer.cursor = Some(frame.position.clone());
        peer.touch();
    }

    pub fn peer(&self, user_id: &str) -> Option<&PeerState> {
        self.peers.get(user_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerState> {
        self.peers.values()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    /// Remove peers that have been silent past the idle timeout; returns the
    /// evicted user ids.
    pub fn cleanup_idle(&mut self) -> Vec<String> {
        let timeout = self.idle_timeout;
        let stale: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, p)| p.time_since_update() > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }
}
