// Room membership and fan-out for open connections.
//
// Every connection registers its outbound sender once; rooms only hold
// connection ids. Emitting to a room clones the event into each member's
// queue, and a member whose socket loop is gone is skipped.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use atelier_common::protocol::events::ServerEvent;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Room {
    Tenant(Uuid),
    User(Uuid),
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tenant(id) => write!(f, "tenant:{id}"),
            Self::User(id) => write!(f, "user:{id}"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoomRegistry {
    inner: Arc<RwLock<RoomState>>,
}

#[derive(Debug, Default)]
struct RoomState {
    connections: HashMap<Uuid, ConnectionEntry>,
    rooms: HashMap<Room, HashSet<Uuid>>,
}

#[derive(Debug)]
struct ConnectionEntry {
    outbound: mpsc::UnboundedSender<ServerEvent>,
    rooms: HashSet<Room>,
}

impl RoomRegistry {
    pub async fn register(
        &self,
        connection_id: Uuid,
        outbound: mpsc::UnboundedSender<ServerEvent>,
    ) {
        self.inner
            .write()
            .await
            .connections
            .insert(connection_id, ConnectionEntry { outbound, rooms: HashSet::new() });
    }

    /// Returns false for unknown connections.
    pub async fn join(&self, connection_id: Uuid, room: Room) -> bool {
        let mut state = self.inner.write().await;
        let Some(entry) = state.connections.get_mut(&connection_id) else {
            return false;
        };
        entry.rooms.insert(room);
        state.rooms.entry(room).or_default().insert(connection_id);
        true
    }

    /// Queues `event` for every member of `room`, returning how many
    /// connections accepted it.
    pub async fn emit_to_room(&self, room: Room, event: &ServerEvent) -> usize {
        self.emit(room, None, event).await
    }

    /// Like [`Self::emit_to_room`], restricted to members that also joined
    /// `scope`.
    pub async fn emit_to_room_within(
        &self,
        room: Room,
        scope: Room,
        event: &ServerEvent,
    ) -> usize {
        self.emit(room, Some(scope), event).await
    }

    async fn emit(&self, room: Room, scope: Option<Room>, event: &ServerEvent) -> usize {
        let state = self.inner.read().await;
        let Some(members) = state.rooms.get(&room) else {
            return 0;
        };

        members
            .iter()
            .filter_map(|connection_id| state.connections.get(connection_id))
            .filter(|entry| scope.map_or(true, |scope| entry.rooms.contains(&scope)))
            .filter(|entry| entry.outbound.send(event.clone()).is_ok())
            .count()
    }

    pub async fn remove(&self, connection_id: Uuid) {
        let mut state = self.inner.write().await;
        let Some(entry) = state.connections.remove(&connection_id) else {
            return;
        };

        for room in entry.rooms {
            if let Some(members) = state.rooms.get_mut(&room) {
                members.remove(&connection_id);
                if members.is_empty() {
                    state.rooms.remove(&room);
                }
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn member_count(&self, room: Room) -> usize {
        self.inner.read().await.rooms.get(&room).map_or(0, HashSet::len)
    }
}
