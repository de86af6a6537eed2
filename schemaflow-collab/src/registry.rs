//! Room and user registry for the broadcast hub.
//!
//! The hub owns the only shared mutable state on the server: the connection
//! table, the room map (`schema_id → members`) and the user map
//! (`user_id → connection`). All of it lives behind one `RwLock`; message
//! dispatch, close handling and the periodic sweep all take that same lock,
//! so a close can never race a broadcast.
//!
//! Delivery is per-connection: every connection registers an unbounded mpsc
//! sender that its socket task drains. Broadcast walks the room's member set
//! and skips the sender; `schema_shared` and `access_revoked` address a
//! single connection directly.

use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::{
    AccessRevoked, JoinRequest, Message, SchemaShared, UserJoined, UserLeft,
};

/// Opaque handle for a server-side connection.
pub type ConnId = Uuid;

/// Identity a connection acquires on `user_join`.
#[derive(Debug, Clone)]
struct RoomTag {
    user_id: String,
    username: String,
    schema_id: String,
}

struct ConnHandle {
    tx: mpsc::UnboundedSender<Message>,
    tag: Option<RoomTag>,
}

impl ConnHandle {
    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

#[derive(Default)]
struct Registry {
    conns: HashMap<ConnId, ConnHandle>,
    rooms: HashMap<String, HashSet<ConnId>>,
    users: HashMap<String, ConnId>,
}

impl Registry {
    /// Send to every open member of a room except `exclude`. Returns the
    /// delivery count.
    fn broadcast(&self, schema_id: &str, exclude: ConnId, msg: &Message) -> usize {
        let Some(members) = self.rooms.get(schema_id) else {
            return 0;
        };
        let mut delivered = 0;
        for conn_id in members {
            if *conn_id == exclude {
                continue;
            }
            if let Some(handle) = self.conns.get(conn_id) {
                if handle.tx.send(msg.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    fn send_direct(&self, conn_id: ConnId, msg: Message) -> bool {
        match self.conns.get(&conn_id) {
            Some(handle) if handle.is_open() => handle.tx.send(msg).is_ok(),
            _ => false,
        }
    }
}

/// The registry & broadcast hub.
pub struct Hub {
    inner: RwLock<Registry>,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Registry::default()),
        }
    }

    /// Register a freshly accepted connection in an unassigned state. The
    /// returned id tags all later calls for this socket.
    pub async fn register(&self, tx: mpsc::UnboundedSender<Message>) -> ConnId {
        let conn_id = Uuid::new_v4();
        let mut registry = self.inner.write().await;
        registry.conns.insert(conn_id, ConnHandle { tx, tag: None });
        log::debug!("connection {conn_id} registered");
        conn_id
    }

    /// Dispatch an inbound protocol message. Handler faults never close the
    /// socket; anything unexpected is logged and dropped.
    pub async fn handle_message(&self, conn_id: ConnId, msg: Message) {
        match msg {
            Message::UserJoin(req) => self.join(conn_id, req).await,
            Message::SchemaChange(change) => {
                self.relay(conn_id, Message::SchemaChange(change)).await;
            }
            Message::CursorUpdate(frame) => {
                self.relay(conn_id, Message::CursorUpdate(frame)).await;
            }
            Message::UserSelection(frame) => {
                self.relay(conn_id, Message::UserSelection(frame)).await;
            }
            Message::PresenceUpdate(presence) => {
                self.relay(conn_id, Message::PresenceUpdate(presence)).await;
            }
            Message::SchemaShared(share) => self.share(conn_id, share).await,
            Message::AccessRevoked(revoke) => self.revoke(conn_id, revoke).await,
            Message::Ping => {
                let registry = self.inner.read().await;
                registry.send_direct(conn_id, Message::Pong);
            }
            other => {
                log::debug!("ignoring {} from connection {conn_id}", other.tag());
            }
        }
    }

    /// Insert the connection into the room for `schema_id`, superseding any
    /// prior room membership and any prior connection mapped to this user.
    async fn join(&self, conn_id: ConnId, req: JoinRequest) {
        let mut registry = self.inner.write().await;
        if !registry.conns.contains_key(&conn_id) {
            return;
        }

        // A connection belongs to at most one room; a second join replaces
        // the previous membership. The emptied room is left for the sweep.
        if let Some(tag) = registry
            .conns
            .get(&conn_id)
            .and_then(|h| h.tag.clone())
        {
            // A retried join (same user, same room) changes nothing; peers
            // must not see a second user_joined.
            if tag.user_id == req.user.id && tag.schema_id == req.schema_id {
                registry.users.insert(req.user.id.clone(), conn_id);
                log::debug!(
                    "retried join by {} for schema {} ignored",
                    req.user.id,
                    req.schema_id
                );
                return;
            }
            if let Some(members) = registry.rooms.get_mut(&tag.schema_id) {
                members.remove(&conn_id);
            }
        }

        registry
            .rooms
            .entry(req.schema_id.clone())
            .or_default()
            .insert(conn_id);

        // Last join wins; a superseded device's socket stays open.
        if let Some(prev) = registry.users.insert(req.user.id.clone(), conn_id) {
            if prev != conn_id {
                log::info!(
                    "user {} superseded connection {prev} with {conn_id}",
                    req.user.id
                );
            }
        }

        if let Some(handle) = registry.conns.get_mut(&conn_id) {
            handle.tag = Some(RoomTag {
                user_id: req.user.id.clone(),
                username: req.user.username.clone(),
                schema_id: req.schema_id.clone(),
            });
        }

        let joined = Message::UserJoined(UserJoined {
            user_id: req.user.id.clone(),
            username: req.user.username.clone(),
        });
        let delivered = registry.broadcast(&req.schema_id, conn_id, &joined);
        log::info!(
            "user {} ({}) joined schema {} ({delivered} peers notified)",
            req.user.username,
            req.user.id,
            req.schema_id
        );
    }

    /// Broadcast to the sender's room, excluding the sender. A connection
    /// that has not joined a room is a no-op, not an error.
    async fn relay(&self, conn_id: ConnId, msg: Message) {
        let registry = self.inner.read().await;
        let Some(tag) = registry.conns.get(&conn_id).and_then(|h| h.tag.as_ref()) else {
            log::debug!("dropping {} from untagged connection {conn_id}", msg.tag());
            return;
        };
        let delivered = registry.broadcast(&tag.schema_id, conn_id, &msg);
        log::trace!(
            "relayed {} from {} to {delivered} peers in {}",
            msg.tag(),
            tag.user_id,
            tag.schema_id
        );
    }

    /// Point-to-point share notification. The inbound payload names the
    /// invitee by username, so the lookup scans the joined connections.
    async fn share(&self, conn_id: ConnId, share: SchemaShared) {
        let Some(invitee) = share.invitee_username else {
            log::debug!("schema_shared from {conn_id} without invitee; dropped");
            return;
        };
        let registry = self.inner.read().await;
        let target = registry
            .conns
            .iter()
            .find(|(_, h)| h.tag.as_ref().is_some_and(|t| t.username == invitee))
            .map(|(id, _)| *id);
        match target {
            Some(target) => {
                let notice = Message::SchemaShared(SchemaShared {
                    invitee_username: None,
                    schema_id: share.schema_id.clone(),
                });
                if registry.send_direct(target, notice) {
                    log::info!("schema {} shared with {invitee}", share.schema_id);
                }
            }
            None => log::debug!("schema_shared invitee {invitee} not connected"),
        }
    }

    /// Notify the revoked user directly and soft-evict their connection from
    /// the room's member set. Their socket is not closed.
    async fn revoke(&self, _conn_id: ConnId, revoke: AccessRevoked) {
        let mut registry = self.inner.write().await;
        let Some(&target) = registry.users.get(&revoke.user_id) else {
            log::debug!("access_revoked for unknown user {}", revoke.user_id);
            return;
        };
        registry.send_direct(target, Message::AccessRevoked(revoke.clone()));
        if let Some(members) = registry.rooms.get_mut(&revoke.schema_id) {
            if members.remove(&target) {
                log::info!(
                    "user {} evicted from schema {}",
                    revoke.user_id,
                    revoke.schema_id
                );
            }
        }
    }

    /// Remove a closed connection from every map and broadcast `user_left`
    /// to its former room.
    pub async fn handle_close(&self, conn_id: ConnId) {
        let mut registry = self.inner.write().await;
        let Some(handle) = registry.conns.remove(&conn_id) else {
            return;
        };
        let Some(tag) = handle.tag else {
            log::debug!("untagged connection {conn_id} closed");
            return;
        };

        if let Some(members) = registry.rooms.get_mut(&tag.schema_id) {
            members.remove(&conn_id);
        }
        // A superseded device closing late must not unmap its successor, and
        // the user has not left while the successor connection is live — so
        // no user_left either.
        if registry.users.get(&tag.user_id) != Some(&conn_id) {
            log::debug!(
                "superseded connection {conn_id} for user {} closed quietly",
                tag.user_id
            );
            return;
        }
        registry.users.remove(&tag.user_id);

        let left = Message::UserLeft(UserLeft {
            user_id: tag.user_id.clone(),
        });
        let delivered = registry.broadcast(&tag.schema_id, conn_id, &left);
        log::info!(
            "user {} left schema {} ({delivered} peers notified)",
            tag.user_id,
            tag.schema_id
        );
    }

    /// Reclaim dead connections and empty rooms. Runs periodically from the
    /// server, under the same lock as dispatch.
    pub async fn sweep(&self) {
        let mut registry = self.inner.write().await;

        let dead: Vec<ConnId> = registry
            .conns
            .iter()
            .filter(|(_, h)| !h.is_open())
            .map(|(id, _)| *id)
            .collect();
        for conn_id in &dead {
            registry.conns.remove(conn_id);
        }

        let live: HashSet<ConnId> = registry.conns.keys().copied().collect();
        registry
            .rooms
            .values_mut()
            .for_each(|members| members.retain(|id| live.contains(id)));
        let before = registry.rooms.len();
        registry.rooms.retain(|_, members| !members.is_empty());
        let removed_rooms = before - registry.rooms.len();

        registry.users.retain(|_, conn_id| live.contains(conn_id));

        if !dead.is_empty() || removed_rooms > 0 {
            log::info!(
                "sweep reclaimed {} connections and {removed_rooms} rooms",
                dead.len()
            );
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.conns.len()
    }

    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.len()
    }

    /// Member count of a room, or `None` if the room does not exist.
    pub async fn room_size(&self, schema_id: &str) -> Option<usize> {
        self.inner.read().await.rooms.get(schema_id).map(HashSet::len)
    }

    pub async fn user_count(&self) -> usize {
        self.inner.read().await.users.len()
    }

    /// The room a connection currently belongs to.
    pub async fn room_of(&self, conn_id: ConnId) -> Option<String> {
        self.inner
            .read()
            .await
            .conns
            .get(&conn_id)
            .and_then(|h| h.tag.as_ref().map(|t| t.schema_id.clone()))
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}
