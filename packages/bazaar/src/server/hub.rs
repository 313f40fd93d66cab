//! Connection and room registry.
//!
//! Every authenticated socket gets a [`ConnectionId`] and an outbound frame
//! channel. Rooms are conversation ids; a connection is in a room between
//! its join and its leave (or disconnect).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use bazaar_chat::protocol::ServerFrame;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

pub type ConnectionId = u64;

struct Connection {
    user_id: String,
    tx: mpsc::Sender<ServerFrame>,
    rooms: HashSet<String>,
    /// Rooms where this connection last reported typing.
    typing: HashSet<String>,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<String, HashSet<ConnectionId>>,
}

/// Result of a fan-out: frames queued, and frames dropped on full buffers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub sent: u64,
    pub dropped: u64,
}

#[derive(Default)]
pub struct Hub {
    state: RwLock<HubState>,
    next_id: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, user_id: &str, tx: mpsc::Sender<ServerFrame>) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.state.write().await.connections.insert(
            id,
            Connection {
                user_id: user_id.to_string(),
                tx,
                rooms: HashSet::new(),
                typing: HashSet::new(),
            },
        );
        debug!(conn = id, user = %user_id, "connection registered");
        id
    }

    /// Forget the connection and every room membership it held. Returns the
    /// rooms where it was still typing, so peers can be told it stopped.
    pub async fn unregister(&self, id: ConnectionId) -> Vec<String> {
        let mut state = self.state.write().await;
        let Some(connection) = state.connections.remove(&id) else {
            return Vec::new();
        };
        for room in &connection.rooms {
            remove_member(&mut state.rooms, room, id);
        }
        debug!(conn = id, "connection unregistered");
        connection
            .typing
            .into_iter()
            .filter(|room| connection.rooms.contains(room))
            .collect()
    }

    /// Record the typing state a member last announced in `room`.
    pub async fn set_typing(&self, id: ConnectionId, room: &str, is_typing: bool) {
        let mut state = self.state.write().await;
        let Some(connection) = state.connections.get_mut(&id) else {
            return;
        };
        if is_typing {
            connection.typing.insert(room.to_string());
        } else {
            connection.typing.remove(room);
        }
    }

    pub async fn join(&self, id: ConnectionId, room: &str) {
        let mut state = self.state.write().await;
        let Some(connection) = state.connections.get_mut(&id) else {
            return;
        };
        connection.rooms.insert(room.to_string());
        state.rooms.entry(room.to_string()).or_default().insert(id);
    }

    pub async fn leave(&self, id: ConnectionId, room: &str) {
        let mut state = self.state.write().await;
        if let Some(connection) = state.connections.get_mut(&id) {
            connection.rooms.remove(room);
            connection.typing.remove(room);
        }
        remove_member(&mut state.rooms, room, id);
    }

    pub async fn is_joined(&self, id: ConnectionId, room: &str) -> bool {
        self.state
            .read()
            .await
            .rooms
            .get(room)
            .is_some_and(|members| members.contains(&id))
    }

    #[cfg(test)]
    pub async fn room_size(&self, room: &str) -> usize {
        self.state
            .read()
            .await
            .rooms
            .get(room)
            .map_or(0, HashSet::len)
    }

    #[cfg(test)]
    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    /// Queue `frame` for every connection in `room`, optionally skipping one.
    pub async fn broadcast_room(
        &self,
        room: &str,
        frame: &ServerFrame,
        except: Option<ConnectionId>,
    ) -> Delivery {
        let state = self.state.read().await;
        let Some(members) = state.rooms.get(room) else {
            return Delivery::default();
        };
        let targets = members
            .iter()
            .filter(|id| Some(**id) != except)
            .filter_map(|id| state.connections.get(id).map(|c| (*id, c)));
        deliver(targets, frame)
    }

    /// Queue `frame` for `user_id`'s connections that are not in `room`.
    pub async fn notify_user_outside_room(
        &self,
        user_id: &str,
        room: &str,
        frame: &ServerFrame,
    ) -> Delivery {
        let state = self.state.read().await;
        let targets = state
            .connections
            .iter()
            .filter(|(_, c)| c.user_id == user_id && !c.rooms.contains(room))
            .map(|(id, c)| (*id, c));
        deliver(targets, frame)
    }
}

fn remove_member(rooms: &mut HashMap<String, HashSet<ConnectionId>>, room: &str, id: ConnectionId) {
    if let Some(members) = rooms.get_mut(room) {
        members.remove(&id);
        if members.is_empty() {
            rooms.remove(room);
        }
    }
}

fn deliver<'a>(
    targets: impl Iterator<Item = (ConnectionId, &'a Connection)>,
    frame: &ServerFrame,
) -> Delivery {
    let mut delivery = Delivery::default();
    for (id, connection) in targets {
        match connection.tx.try_send(frame.clone()) {
            Ok(()) => delivery.sent += 1,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn = id, "outbound buffer full, frame dropped");
                delivery.dropped += 1;
            }
            // Socket is closing; unregister follows.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
    delivery
}
