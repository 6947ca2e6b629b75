//! Connection registry: rooms, user channels, and outbound senders.
//!
//! The registry is the only shared mutable state in the relay. It owns three
//! maps: connection id -> entry (outbound sender plus back-references to every
//! room the connection joined, so teardown is an indexed lookup rather than a
//! scan), room name -> members, and user id -> channel members. Rooms and
//! channels come into existence on first join and are dropped once emptied.
//!
//! Delivery is non-blocking: frames are pushed with `try_send` and dropped
//! with a log line when a receiver's bounded queue is full or closed, so a
//! stalled peer can never wedge another connection's dispatch. Lock
//! discipline: a guard from one map is never held while locking another;
//! targets are collected first and sends happen after all guards are dropped.

use std::collections::HashSet;

use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::types::{ConnectionId, ServerMessage};

/// Size of the per-connection send buffer.
const CONNECTION_BUFFER_SIZE: usize = 64;

struct ConnectionEntry {
    sender: mpsc::Sender<ServerMessage>,
    rooms: HashSet<String>,
    identity: Option<String>,
}

/// In-memory membership table shared by all connection handlers.
pub struct RelayRegistry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    rooms: DashMap<String, HashSet<ConnectionId>>,
    channels: DashMap<String, HashSet<ConnectionId>>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
            channels: DashMap::new(),
        }
    }

    /// Admit a new transport connection.
    ///
    /// Returns the assigned id and the receive half of its outbound queue.
    pub fn connect(&self) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        let id = ConnectionId::new();
        self.connections.insert(
            id,
            ConnectionEntry {
                sender: tx,
                rooms: HashSet::new(),
                identity: None,
            },
        );
        info!("connection {id} established");
        (id, rx)
    }

    /// Join the connection to the per-user channel named by `user_id`.
    ///
    /// Repeating the same registration is a no-op. Registering a different
    /// identity moves the connection: at most one channel per connection.
    /// Several connections (browser tabs) may share one identity.
    pub fn register_identity(&self, conn: ConnectionId, user_id: &str) {
        let previous = {
            let Some(mut entry) = self.connections.get_mut(&conn) else {
                return;
            };
            if entry.identity.as_deref() == Some(user_id) {
                debug!("connection {conn} already registered as {user_id}");
                return;
            }
            entry.identity.replace(user_id.to_string())
        };
        if let Some(old) = previous {
            self.remove_channel_member(&old, conn);
        }
        self.channels
            .entry(user_id.to_string())
            .or_default()
            .insert(conn);
        info!("connection {conn} registered as user {user_id}");
    }

    /// Add the connection to a session room.
    ///
    /// Existing members are told about the arrival (`peer-joined`) and the
    /// joiner gets the prior membership back (`current-members`), so the
    /// first arrival waits and later arrivals trigger offer initiation.
    /// The joiner never appears in its own view, including on a re-join.
    pub fn join_room(&self, conn: ConnectionId, session_id: &str) {
        let existing: Vec<ConnectionId> = {
            let mut members = self.rooms.entry(session_id.to_string()).or_default();
            let existing = members
                .iter()
                .copied()
                .filter(|id| *id != conn)
                .collect();
            members.insert(conn);
            existing
        };
        if let Some(mut entry) = self.connections.get_mut(&conn) {
            entry.rooms.insert(session_id.to_string());
        }
        info!(
            "connection {conn} joined room {session_id} ({} already present)",
            existing.len()
        );
        for peer in &existing {
            self.send_to(*peer, ServerMessage::PeerJoined { peer_id: conn });
        }
        self.send_to(conn, ServerMessage::CurrentMembers { members: existing });
    }

    /// Forward a message to every other member of a room.
    ///
    /// Unknown or empty rooms are a no-op, not an error. The sender never
    /// hears its own broadcast.
    pub fn broadcast_room(&self, from: ConnectionId, session_id: &str, msg: ServerMessage) {
        let targets: Vec<ConnectionId> = match self.rooms.get(session_id) {
            Some(members) => members.iter().copied().filter(|id| *id != from).collect(),
            None => return,
        };
        for peer in targets {
            self.send_to(peer, msg.clone());
        }
    }

    /// Deliver a message to every connection registered for `user_id`,
    /// excluding the sender. No registered connections means the message is
    /// dropped silently (at-most-once, best-effort).
    pub fn send_to_user(&self, from: ConnectionId, user_id: &str, msg: ServerMessage) {
        let targets: Vec<ConnectionId> = match self.channels.get(user_id) {
            Some(members) => members.iter().copied().filter(|id| *id != from).collect(),
            None => {
                debug!("no connections registered for user {user_id}, dropping message");
                return;
            }
        };
        for peer in targets {
            self.send_to(peer, msg.clone());
        }
    }

    /// Deliver a message to one connection. Never blocks: a full or closed
    /// queue drops the frame with a log line.
    pub fn send_to(&self, conn: ConnectionId, msg: ServerMessage) {
        let sender = self.connections.get(&conn).map(|e| e.sender.clone());
        let Some(sender) = sender else { return };
        match sender.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("send queue full for connection {conn}, dropping frame");
            }
            Err(TrySendError::Closed(_)) => {
                warn!("dropping message for closed connection {conn}");
            }
        }
    }

    /// Tear down a connection: leave every room and channel it belonged to,
    /// notifying each room's remaining members exactly once.
    pub fn disconnect(&self, conn: ConnectionId) {
        let Some((_, entry)) = self.connections.remove(&conn) else {
            return;
        };
        for room in &entry.rooms {
            let remaining: Vec<ConnectionId> = {
                let Some(mut members) = self.rooms.get_mut(room) else {
                    continue;
                };
                members.remove(&conn);
                members.iter().copied().collect()
            };
            self.rooms.remove_if(room, |_, members| members.is_empty());
            for peer in remaining {
                self.send_to(peer, ServerMessage::PeerLeft { peer_id: conn });
            }
        }
        if let Some(identity) = entry.identity {
            self.remove_channel_member(&identity, conn);
        }
        info!("connection {conn} disconnected");
    }

    /// Current members of a room, if any.
    pub fn room_members(&self, session_id: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(session_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Connections currently registered for a user identity.
    pub fn channel_members(&self, user_id: &str) -> Vec<ConnectionId> {
        self.channels
            .get(user_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn remove_channel_member(&self, user_id: &str, conn: ConnectionId) {
        if let Some(mut members) = self.channels.get_mut(user_id) {
            members.remove(&conn);
        }
        self.channels
            .remove_if(user_id, |_, members| members.is_empty());
    }
}

impl Default for RelayRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use tokio::sync::mpsc::Receiver;

    use crate::relay::types::SignalBody;

    fn drain(rx: &mut Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn join_order_is_symmetric() {
        let registry = RelayRegistry::new();
        let (a, mut rx_a) = registry.connect();
        let (b, mut rx_b) = registry.connect();

        registry.join_room(a, "sess-1");
        registry.join_room(b, "sess-1");

        let to_a = drain(&mut rx_a);
        assert!(matches!(
            to_a[0],
            ServerMessage::CurrentMembers { ref members } if members.is_empty()
        ));
        assert!(matches!(
            to_a[1],
            ServerMessage::PeerJoined { peer_id } if peer_id == b
        ));

        let to_b = drain(&mut rx_b);
        assert_eq!(to_b.len(), 1);
        assert!(matches!(
            to_b[0],
            ServerMessage::CurrentMembers { ref members } if members == &vec![a]
        ));

        let mut members = registry.room_members("sess-1");
        members.sort_by_key(|id| id.to_string());
        let mut expected = vec![a, b];
        expected.sort_by_key(|id| id.to_string());
        assert_eq!(members, expected);
    }

    #[test]
    fn rejoining_never_shows_a_connection_its_own_id() {
        let registry = RelayRegistry::new();
        let (a, mut rx_a) = registry.connect();
        let (b, _rx_b) = registry.connect();

        registry.join_room(a, "sess-1");
        registry.join_room(b, "sess-1");
        drain(&mut rx_a);

        // Rejoining an already-joined room (e.g. after a client retry) must
        // still exclude the connection from its own membership view.
        registry.join_room(a, "sess-1");

        for msg in drain(&mut rx_a) {
            match msg {
                ServerMessage::CurrentMembers { members } => {
                    assert!(!members.contains(&a), "own id leaked into members view");
                    assert_eq!(members, vec![b]);
                }
                ServerMessage::PeerJoined { peer_id } => {
                    assert_ne!(peer_id, a, "connection told its own id joined");
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert_eq!(registry.room_members("sess-1").len(), 2);
    }

    #[test]
    fn disconnect_notifies_each_room_once() {
        let registry = RelayRegistry::new();
        let (a, mut rx_a) = registry.connect();
        let (b, _rx_b) = registry.connect();

        registry.join_room(a, "sess-1");
        registry.join_room(a, "sess-2");
        registry.join_room(b, "sess-1");
        registry.join_room(b, "sess-2");
        drain(&mut rx_a);

        registry.disconnect(b);

        let left: Vec<_> = drain(&mut rx_a)
            .into_iter()
            .filter(|msg| matches!(msg, ServerMessage::PeerLeft { peer_id } if *peer_id == b))
            .collect();
        assert_eq!(left.len(), 2, "one peer-left per shared room");

        assert_eq!(registry.room_members("sess-1"), vec![a]);
        assert_eq!(registry.room_members("sess-2"), vec![a]);
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn empty_rooms_are_dropped() {
        let registry = RelayRegistry::new();
        let (a, _rx_a) = registry.connect();
        registry.join_room(a, "sess-1");
        registry.disconnect(a);
        assert!(registry.room_members("sess-1").is_empty());
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn register_identity_is_idempotent() {
        let registry = RelayRegistry::new();
        let (a, mut rx_a) = registry.connect();
        let (b, _rx_b) = registry.connect();

        registry.register_identity(a, "student-1");
        registry.register_identity(a, "student-1");
        assert_eq!(registry.channel_members("student-1"), vec![a]);

        registry.send_to_user(b, "student-1", ServerMessage::CallEnded {
            session_id: "sess-1".into(),
        });
        assert_eq!(drain(&mut rx_a).len(), 1, "delivered exactly once");
    }

    #[test]
    fn reregistering_moves_the_channel() {
        let registry = RelayRegistry::new();
        let (a, _rx_a) = registry.connect();

        registry.register_identity(a, "student-1");
        registry.register_identity(a, "student-2");

        assert!(registry.channel_members("student-1").is_empty());
        assert_eq!(registry.channel_members("student-2"), vec![a]);
    }

    #[test]
    fn send_to_user_excludes_sender_and_tolerates_unknown() {
        let registry = RelayRegistry::new();
        let (a, mut rx_a) = registry.connect();
        registry.register_identity(a, "student-1");

        // A sender registered under the target identity does not echo itself.
        registry.send_to_user(a, "student-1", ServerMessage::CallEnded {
            session_id: "sess-1".into(),
        });
        assert!(drain(&mut rx_a).is_empty());

        // Unknown target: silent no-op.
        registry.send_to_user(a, "nobody", ServerMessage::CallEnded {
            session_id: "sess-1".into(),
        });
    }

    #[test]
    fn broadcasts_stay_inside_the_room() {
        let registry = RelayRegistry::new();
        let (a, _rx_a) = registry.connect();
        let (b, mut rx_b) = registry.connect();
        let (c, mut rx_c) = registry.connect();

        registry.join_room(a, "sess-1");
        registry.join_room(b, "sess-1");
        registry.join_room(c, "sess-2");
        drain(&mut rx_b);
        drain(&mut rx_c);

        let mut rest = Map::new();
        rest.insert("sdp".into(), "v=0 fake".into());
        registry.broadcast_room(
            a,
            "sess-1",
            ServerMessage::Offer(SignalBody {
                session_id: "sess-1".into(),
                rest: rest.clone(),
            }),
        );

        let to_b = drain(&mut rx_b);
        assert_eq!(to_b.len(), 1);
        let ServerMessage::Offer(body) = &to_b[0] else {
            panic!("expected offer");
        };
        assert_eq!(body.rest, rest, "payload forwarded unchanged");
        assert!(drain(&mut rx_c).is_empty(), "other room must see nothing");

        // Unknown room: no-op.
        registry.broadcast_room(a, "sess-404", ServerMessage::CallEnded {
            session_id: "sess-404".into(),
        });
    }

    #[test]
    fn slow_receiver_is_skipped_not_awaited() {
        let registry = RelayRegistry::new();
        let (a, _rx_a) = registry.connect();
        let (b, mut rx_b) = registry.connect();

        registry.join_room(a, "sess-1");
        registry.join_room(b, "sess-1");
        drain(&mut rx_b);

        // b never drains its queue; pushing well past the buffer must
        // complete and shed the overflow instead of parking the sender.
        for i in 0..(CONNECTION_BUFFER_SIZE + 10) {
            let mut rest = Map::new();
            rest.insert("seq".into(), i.into());
            registry.broadcast_room(
                a,
                "sess-1",
                ServerMessage::Offer(SignalBody {
                    session_id: "sess-1".into(),
                    rest,
                }),
            );
        }

        assert_eq!(drain(&mut rx_b).len(), CONNECTION_BUFFER_SIZE);
    }
}
