//! Room-based fan-out.
//!
//! Every attached connection owns a bounded outbox. Rooms are named groups
//! of connections; a broadcast snapshots the room's membership and pushes the
//! message into each member's outbox without waiting on any of them.

use crate::protocol::ServerMessage;
use crate::session::registry::ConnectionId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;

/// Named broadcast groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Room {
    Producers,
    Observers,
    AlertSubscribers,
}

impl Room {
    pub const ALL: [Room; 3] = [Room::Producers, Room::Observers, Room::AlertSubscribers];

    pub fn as_str(&self) -> &'static str {
        match self {
            Room::Producers => "producers",
            Room::Observers => "observers",
            Room::AlertSubscribers => "alert-subscribers",
        }
    }

    fn index(&self) -> usize {
        match self {
            Room::Producers => 0,
            Room::Observers => 1,
            Room::AlertSubscribers => 2,
        }
    }
}

impl std::fmt::Display for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages queued for one connection.
pub type Outbox = mpsc::Receiver<Arc<ServerMessage>>;

/// Routes messages to rooms and to single connections.
///
/// Lock order is always room before outboxes.
#[derive(Debug)]
pub struct RoomRouter {
    rooms: [RwLock<HashSet<ConnectionId>>; 3],
    outboxes: RwLock<HashMap<ConnectionId, mpsc::Sender<Arc<ServerMessage>>>>,
    outbox_capacity: usize,
}

impl RoomRouter {
    /// Create a router whose outboxes hold at most `outbox_capacity` messages.
    pub fn new(outbox_capacity: usize) -> Self {
        Self {
            rooms: Default::default(),
            outboxes: RwLock::new(HashMap::new()),
            outbox_capacity: outbox_capacity.max(1),
        }
    }

    /// Attach a connection and hand back the receiving end of its outbox.
    pub async fn attach(&self, id: ConnectionId) -> Outbox {
        let (tx, rx) = mpsc::channel(self.outbox_capacity);
        self.outboxes.write().await.insert(id, tx);
        rx
    }

    /// Remove a connection from every room and drop its outbox.
    pub async fn detach(&self, id: ConnectionId) {
        for room in Room::ALL {
            self.rooms[room.index()].write().await.remove(&id);
        }
        self.outboxes.write().await.remove(&id);
    }

    /// Add a connection to a room. Returns `true` if membership changed.
    ///
    /// Joining twice is the same as joining once; a detached connection
    /// cannot join.
    pub async fn join(&self, id: ConnectionId, room: Room) -> bool {
        let mut members = self.rooms[room.index()].write().await;
        if !self.outboxes.read().await.contains_key(&id) {
            return false;
        }
        members.insert(id)
    }

    /// Remove a connection from a room. Leaving a room one is not in is a no-op.
    pub async fn leave(&self, id: ConnectionId, room: Room) -> bool {
        self.rooms[room.index()].write().await.remove(&id)
    }

    pub async fn is_member(&self, id: ConnectionId, room: Room) -> bool {
        self.rooms[room.index()].read().await.contains(&id)
    }

    pub async fn members(&self, room: Room) -> Vec<ConnectionId> {
        self.rooms[room.index()].read().await.iter().copied().collect()
    }

    /// Deliver a message to every current member of `room`.
    ///
    /// Returns the number of members the message was queued for.
    pub async fn broadcast(&self, room: Room, message: ServerMessage) -> usize {
        let targets: Vec<(ConnectionId, mpsc::Sender<Arc<ServerMessage>>)> = {
            let members = self.rooms[room.index()].read().await;
            if members.is_empty() {
                return 0;
            }
            let outboxes = self.outboxes.read().await;
            members
                .iter()
                .filter_map(|id| outboxes.get(id).map(|tx| (*id, tx.clone())))
                .collect()
        };

        let message = Arc::new(message);
        let delivered = targets
            .iter()
            .filter(|(id, tx)| deliver(*id, tx, Arc::clone(&message)))
            .count();

        tracing::debug!(
            "Broadcast '{}' to {}/{} members of {}",
            message.event,
            delivered,
            targets.len(),
            room
        );
        delivered
    }

    /// Deliver a message to one connection. Sending to a connection that is
    /// already gone returns `false`.
    pub async fn send_to(&self, id: ConnectionId, message: ServerMessage) -> bool {
        let tx = self.outboxes.read().await.get(&id).cloned();
        match tx {
            Some(tx) => deliver(id, &tx, Arc::new(message)),
            None => {
                tracing::debug!("Dropping '{}' for departed connection {}", message.event, id);
                false
            }
        }
    }
}

fn deliver(
    id: ConnectionId,
    tx: &mpsc::Sender<Arc<ServerMessage>>,
    message: Arc<ServerMessage>,
) -> bool {
    match tx.try_send(message) {
        Ok(()) => true,
        Err(TrySendError::Full(message)) => {
            tracing::warn!(
                "Outbox full for connection {}, dropping '{}'",
                id,
                message.event
            );
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}
