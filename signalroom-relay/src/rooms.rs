//! Room directory for the relay server.
//!
//! Maps room identifiers to their ordered member lists and every connection
//! to the single room it is in. Rooms are created on first join and removed
//! as soon as their last member leaves, so the directory never holds an empty
//! room.
//!
//! Every operation takes the directory lock once and returns a snapshot of
//! the connections to notify; callers deliver to that snapshot after the lock
//! is released.

use std::collections::HashMap;
use std::fmt;

use tokio::sync::RwLock;
use uuid::Uuid;

/// Server-assigned identity of one WebSocket session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Allocates a fresh, time-ordered connection id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of removing a connection from its room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    /// The room that was left.
    pub room: String,
    /// Members still in the room, in join order. Each gets a `peer-left`.
    pub remaining: Vec<ConnectionId>,
}

impl Departure {
    /// Whether the departing connection was the last member, so the room
    /// has been deleted.
    #[must_use]
    pub fn room_closed(&self) -> bool {
        self.remaining.is_empty()
    }
}

/// Result of adding a connection to a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// The room the connection was in before, if any. A connection is never
    /// in two rooms: joining implicitly leaves the previous one.
    pub previous: Option<Departure>,
    /// Members that were already in the room, in join order. Each gets a
    /// `ready`; the joiner itself is not included.
    pub peers: Vec<ConnectionId>,
}

/// The connections a negotiation message from one member fans out to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fanout {
    /// The sender's room.
    pub room: String,
    /// Every other member of that room, in join order.
    pub peers: Vec<ConnectionId>,
}

#[derive(Debug, Default)]
struct Directory {
    rooms: HashMap<String, Vec<ConnectionId>>,
    memberships: HashMap<ConnectionId, String>,
}

impl Directory {
    fn remove(&mut self, conn_id: ConnectionId) -> Option<Departure> {
        let room = self.memberships.remove(&conn_id)?;
        let remaining = self.rooms.get_mut(&room).map_or_else(Vec::new, |members| {
            members.retain(|member| *member != conn_id);
            members.clone()
        });
        if remaining.is_empty() {
            self.rooms.remove(&room);
        }
        Some(Departure { room, remaining })
    }
}

/// In-memory directory of active rooms.
///
/// Thread-safe via [`RwLock`]. Membership changes and fan-out snapshots are
/// each atomic with respect to one another.
#[derive(Debug, Default)]
pub struct RoomDirectory {
    inner: RwLock<Directory>,
}

impl RoomDirectory {
    /// Creates a new, empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `conn_id` to `room`, creating the room if it does not exist.
    ///
    /// If the connection is already in a room (including this one) it is
    /// removed from that room first and the departure is reported in
    /// [`JoinOutcome::previous`].
    pub async fn join(&self, conn_id: ConnectionId, room: &str) -> JoinOutcome {
        let mut dir = self.inner.write().await;
        let previous = dir.remove(conn_id);

        let members = dir.rooms.entry(room.to_string()).or_default();
        let peers = members.clone();
        members.push(conn_id);
        dir.memberships.insert(conn_id, room.to_string());
        drop(dir);

        JoinOutcome { previous, peers }
    }

    /// Removes `conn_id` from its room, deleting the room if it is now empty.
    ///
    /// Returns `None` if the connection was not in any room. Calling this
    /// twice is harmless.
    pub async fn leave(&self, conn_id: ConnectionId) -> Option<Departure> {
        let mut dir = self.inner.write().await;
        dir.remove(conn_id)
    }

    /// Snapshots the other members of the sender's room.
    ///
    /// Returns `None` if the sender has not joined a room.
    pub async fn peers_of(&self, conn_id: ConnectionId) -> Option<Fanout> {
        let dir = self.inner.read().await;
        let room = dir.memberships.get(&conn_id)?;
        let peers = dir
            .rooms
            .get(room)
            .map(|members| {
                members
                    .iter()
                    .copied()
                    .filter(|member| *member != conn_id)
                    .collect()
            })
            .unwrap_or_default();
        Some(Fanout {
            room: room.clone(),
            peers,
        })
    }

    /// Returns the members of `room` in join order, or `None` if the room
    /// does not exist.
    pub async fn members(&self, room: &str) -> Option<Vec<ConnectionId>> {
        let dir = self.inner.read().await;
        dir.rooms.get(room).cloned()
    }

    /// Returns the room `conn_id` is currently in.
    pub async fn room_of(&self, conn_id: ConnectionId) -> Option<String> {
        let dir = self.inner.read().await;
        dir.memberships.get(&conn_id).cloned()
    }

    /// Whether `room` currently exists.
    pub async fn contains(&self, room: &str) -> bool {
        let dir = self.inner.read().await;
        dir.rooms.contains_key(room)
    }

    /// Number of rooms currently in the directory.
    pub async fn room_count(&self) -> usize {
        let dir = self.inner.read().await;
        dir.rooms.len()
    }
}
