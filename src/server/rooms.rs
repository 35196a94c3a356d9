use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::common::protocol::ServerEvent;

pub type ConnId = Uuid;

/// Identity a connection acquires when it joins a room. A connection without
/// a profile has not joined yet, so typing and leave are safe no-ops for it.
#[derive(Debug, Clone)]
pub struct Profile {
    pub user_id: String,
    pub is_support: bool,
    pub room_id: String,
}

struct ConnectionEntry {
    sender: mpsc::UnboundedSender<Message>,
    profile: Option<Profile>,
}

#[derive(Default)]
struct Inner {
    rooms: HashMap<String, HashSet<ConnId>>,
    connections: HashMap<ConnId, ConnectionEntry>,
}

/// Map from room key to the connections currently in it. Membership is a
/// function of open connections only; a restart drops everything and clients
/// rebuild it by re-joining.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly accepted connection before it joins any room.
    pub async fn register(&self, conn: ConnId, sender: mpsc::UnboundedSender<Message>) {
        let mut inner = self.inner.lock().await;
        inner.connections.insert(conn, ConnectionEntry { sender, profile: None });
    }

    /// Bind a connection into a room. Idempotent; a connection already in a
    /// different room is moved there, no explicit leave required.
    pub async fn join(&self, conn: ConnId, room: &str, user_id: &str, is_support: bool) {
        let mut inner = self.inner.lock().await;

        let previous = inner
            .connections
            .get(&conn)
            .and_then(|entry| entry.profile.as_ref().map(|p| p.room_id.clone()));
        if let Some(previous) = previous {
            if previous != room {
                remove_member(&mut inner.rooms, &previous, conn);
            }
        }

        inner.rooms.entry(room.to_string()).or_default().insert(conn);
        if let Some(entry) = inner.connections.get_mut(&conn) {
            entry.profile = Some(Profile {
                user_id: user_id.to_string(),
                is_support,
                room_id: room.to_string(),
            });
        }
        log::info!(
            "[ROOMS] Connection {} joined room {} (members={})",
            conn,
            room,
            inner.rooms.get(room).map(|m| m.len()).unwrap_or(0)
        );
    }

    /// Unbind a connection from a room. Calling it for a connection that is
    /// not a member is a no-op.
    pub async fn leave(&self, conn: ConnId, room: &str) {
        let mut inner = self.inner.lock().await;
        remove_member(&mut inner.rooms, room, conn);
        if let Some(entry) = inner.connections.get_mut(&conn) {
            if entry.profile.as_ref().map(|p| p.room_id.as_str()) == Some(room) {
                entry.profile = None;
            }
        }
        log::info!("[ROOMS] Connection {} left room {}", conn, room);
    }

    /// Deliver an event to every member of a room, the sender included when
    /// it is a member itself. Senders observe their own messages through this
    /// same path, never through a direct echo.
    pub async fn broadcast(&self, room: &str, event: &ServerEvent) {
        self.fan_out(room, None, event).await;
    }

    /// Deliver an event to every member of a room except one connection.
    pub async fn broadcast_except(&self, room: &str, skip: ConnId, event: &ServerEvent) {
        self.fan_out(room, Some(skip), event).await;
    }

    async fn fan_out(&self, room: &str, skip: Option<ConnId>, event: &ServerEvent) {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                log::warn!("[ROOMS] Failed to serialize event for room {}: {}", room, e);
                return;
            }
        };
        let inner = self.inner.lock().await;
        let Some(members) = inner.rooms.get(room) else {
            return;
        };
        for conn in members {
            if skip == Some(*conn) {
                continue;
            }
            if let Some(entry) = inner.connections.get(conn) {
                let _ = entry.sender.send(Message::Text(json.clone()));
            }
        }
    }

    /// Deliver an event to a single connection, member or not. Used for
    /// sender-directed validation errors.
    pub async fn send_to(&self, conn: ConnId, event: &ServerEvent) {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                log::warn!("[ROOMS] Failed to serialize event for {}: {}", conn, e);
                return;
            }
        };
        let inner = self.inner.lock().await;
        if let Some(entry) = inner.connections.get(&conn) {
            let _ = entry.sender.send(Message::Text(json));
        }
    }

    pub async fn profile_of(&self, conn: ConnId) -> Option<Profile> {
        let inner = self.inner.lock().await;
        inner.connections.get(&conn).and_then(|e| e.profile.clone())
    }

    /// Drop a closed connection; its room membership lapses with it.
    pub async fn remove(&self, conn: ConnId) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.connections.remove(&conn) {
            if let Some(profile) = entry.profile {
                remove_member(&mut inner.rooms, &profile.room_id, conn);
                log::info!(
                    "[ROOMS] Connection {} for user {} removed from room {}",
                    conn,
                    profile.user_id,
                    profile.room_id
                );
            }
        }
    }

    /// (connections, rooms) currently tracked, for the stats logger.
    pub async fn stats(&self) -> (usize, usize) {
        let inner = self.inner.lock().await;
        (inner.connections.len(), inner.rooms.len())
    }
}

fn remove_member(rooms: &mut HashMap<String, HashSet<ConnId>>, room: &str, conn: ConnId) {
    if let Some(members) = rooms.get_mut(room) {
        members.remove(&conn);
        if members.is_empty() {
            rooms.remove(room);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::Message;

    fn make_conn() -> (ConnId, mpsc::UnboundedReceiver<Message>, mpsc::UnboundedSender<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Uuid::new_v4(), rx, tx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(Message::Text(text)) = rx.try_recv() {
            out.push(text);
        }
        out
    }

    #[tokio::test]
    async fn broadcast_reaches_only_room_members() {
        let registry = RoomRegistry::new();
        let (a, mut rx_a, tx_a) = make_conn();
        let (b, mut rx_b, tx_b) = make_conn();
        registry.register(a, tx_a).await;
        registry.register(b, tx_b).await;
        registry.join(a, "42", "7", false).await;
        registry.join(b, "99", "8", false).await;

        registry.broadcast("42", &ServerEvent::error("ping")).await;

        assert_eq!(drain(&mut rx_a).len(), 1);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn join_moves_a_connection_between_rooms() {
        let registry = RoomRegistry::new();
        let (a, mut rx_a, tx_a) = make_conn();
        registry.register(a, tx_a).await;
        registry.join(a, "42", "7", false).await;
        registry.join(a, "99", "7", false).await;

        registry.broadcast("42", &ServerEvent::error("old room")).await;
        assert!(drain(&mut rx_a).is_empty());

        registry.broadcast("99", &ServerEvent::error("new room")).await;
        assert_eq!(drain(&mut rx_a).len(), 1);
    }

    #[tokio::test]
    async fn broadcast_except_skips_the_sender() {
        let registry = RoomRegistry::new();
        let (a, mut rx_a, tx_a) = make_conn();
        let (b, mut rx_b, tx_b) = make_conn();
        registry.register(a, tx_a).await;
        registry.register(b, tx_b).await;
        registry.join(a, "42", "7", false).await;
        registry.join(b, "42", "8", true).await;

        let event = ServerEvent::Typing { user_id: "7".into(), is_typing: true };
        registry.broadcast_except("42", a, &event).await;

        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[tokio::test]
    async fn leave_is_a_noop_for_non_members() {
        let registry = RoomRegistry::new();
        let (a, mut rx_a, tx_a) = make_conn();
        registry.register(a, tx_a).await;

        registry.leave(a, "42").await;

        registry.join(a, "42", "7", false).await;
        registry.leave(a, "42").await;
        registry.broadcast("42", &ServerEvent::error("gone")).await;
        assert!(drain(&mut rx_a).is_empty());

        let (connections, rooms) = registry.stats().await;
        assert_eq!(connections, 1);
        assert_eq!(rooms, 0);
    }

    #[tokio::test]
    async fn remove_drops_membership() {
        let registry = RoomRegistry::new();
        let (a, _rx_a, tx_a) = make_conn();
        registry.register(a, tx_a).await;
        registry.join(a, "42", "7", false).await;

        registry.remove(a).await;

        let (connections, rooms) = registry.stats().await;
        assert_eq!(connections, 0);
        assert_eq!(rooms, 0);
        assert!(registry.profile_of(a).await.is_none());
    }
}
