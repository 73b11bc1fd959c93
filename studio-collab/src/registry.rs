//! Session registry: the set of active rooms and everything they own.
//!
//! A room is created lazily the first time its id is seen (join, update or
//! content replace) and owns exactly one [`MergeableDocument`], its live
//! connection set and its presence store. Rooms are only ever deleted by
//! [`SessionRegistry::reap_idle_rooms`], which the idle reaper calls on a
//! fixed interval; join and leave never remove documents.
//!
//! Lock order is `rooms → document → connections → presence`. Every path
//! that takes more than one of them takes them in that order.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{Mutex, RwLock};

use crate::broadcast::{
    BroadcastGroup, BroadcastReport, Connection, ConnectionId, Frame, MessageSink,
};
use crate::document::MergeableDocument;
use crate::error::CollabError;
use crate::presence::{CursorPosition, PresenceEntry, PresenceStore, SelectionRange};
use crate::protocol::{SyncMessage, SyncPayload, UserInfo};

/// Per-room numbers exposed to operators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub connection_count: usize,
    /// Encoded size of the full document state
    pub document_byte_size: usize,
    /// Frames fanned out to the room
    pub messages_sent: u64,
    /// Per-connection enqueues that failed and pruned the connection
    pub delivery_failures: u64,
}

/// Registry-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub active_rooms: usize,
    pub rooms_created: u64,
    pub rooms_reaped: u64,
    pub joins: u64,
    pub updates_merged: u64,
    pub updates_rejected: u64,
}

struct AtomicRegistryStats {
    rooms_created: AtomicU64,
    rooms_reaped: AtomicU64,
    joins: AtomicU64,
    updates_merged: AtomicU64,
    updates_rejected: AtomicU64,
}

impl AtomicRegistryStats {
    fn new() -> Self {
        Self {
            rooms_created: AtomicU64::new(0),
            rooms_reaped: AtomicU64::new(0),
            joins: AtomicU64::new(0),
            updates_merged: AtomicU64::new(0),
            updates_rejected: AtomicU64::new(0),
        }
    }
}

/// One collaborative room.
///
/// Callers outside the registry can observe a room but not mutate it.
pub struct Room {
    id: String,
    document: Mutex<MergeableDocument>,
    group: BroadcastGroup,
    presence: RwLock<PresenceStore>,
}

impl Room {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            document: Mutex::new(MergeableDocument::new()),
            group: BroadcastGroup::new(),
            presence: RwLock::new(PresenceStore::new()),
        }
    }

    /// Room identifier as given by the first client that used it.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current text of the room's document.
    pub async fn text(&self) -> String {
        self.document.lock().await.text()
    }

    /// Full document state as a single update, as sent in `Sync`.
    pub async fn snapshot(&self) -> Vec<u8> {
        self.document.lock().await.snapshot()
    }

    /// Live connections in the room.
    pub async fn connection_count(&self) -> usize {
        self.group.connection_count().await
    }

    /// Distinct users with at least one connection, ordered by user id.
    pub async fn users(&self) -> Vec<UserInfo> {
        self.group.users().await
    }

    /// Latest cursor/selection of every user, ordered by user id.
    pub async fn presence(&self) -> Vec<PresenceEntry> {
        self.presence.read().await.entries()
    }

    /// Connection count, document size and fan-out counters.
    pub async fn stats(&self) -> RoomStats {
        let document_byte_size = self.document.lock().await.byte_size();
        let broadcast = self.group.stats().await;
        RoomStats {
            connection_count: broadcast.active_connections,
            document_byte_size,
            messages_sent: broadcast.messages_sent,
            delivery_failures: broadcast.delivery_failures,
        }
    }
}

/// Owns all active rooms. Shared between connection tasks via `Arc`.
pub struct SessionRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    stats: AtomicRegistryStats,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            stats: AtomicRegistryStats::new(),
        }
    }

    /// Return the room for `room_id`, creating it on first access.
    pub async fn get_or_create_room(&self, room_id: &str) -> Arc<Room> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        self.entry_locked(&mut rooms, room_id)
    }

    fn entry_locked(&self, rooms: &mut HashMap<String, Arc<Room>>, room_id: &str) -> Arc<Room> {
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }
        info!("Creating room {}", room_id);
        self.stats.rooms_created.fetch_add(1, Ordering::Relaxed);
        let room = Arc::new(Room::new(room_id));
        rooms.insert(room_id.to_string(), room.clone());
        room
    }

    async fn existing_room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Register a connection in a room and send it the initial state.
    ///
    /// The `Sync` frame is enqueued on `sink` before any update merged after
    /// the snapshot was taken. Other participants receive `UserJoined` when
    /// this is the user's first connection in the room. The returned payload
    /// lists the other users and their presence, never the joiner's own.
    pub async fn join(
        &self,
        room_id: &str,
        id: ConnectionId,
        user: UserInfo,
        sink: Arc<dyn MessageSink>,
    ) -> Result<SyncPayload, CollabError> {
        let connection = Connection::new(id, user.clone(), sink);

        // The rooms lock keeps the reaper away until the connection is
        // registered. The admission guard keeps every broadcast (updates,
        // presence, departures) from reaching the joiner ahead of its Sync
        // frame or slipping between the snapshot and registration.
        let mut rooms = self.rooms.write().await;
        let room = self.entry_locked(&mut rooms, room_id);
        let document = room.document.lock().await;
        let admission = room.group.admission().await;

        let first_for_user = !admission.has_user(&user.user_id);
        let mut users = admission.users();
        users.retain(|u| u.user_id != user.user_id);
        let presence = room.presence.read().await.entries_except(&user.user_id);
        let payload = SyncPayload {
            room_id: room_id.to_string(),
            snapshot: document.snapshot(),
            users,
            presence,
        };

        let frame = SyncMessage::Sync(payload.clone()).encode()?;
        admission.admit(connection, Arc::new(frame))?;
        drop(document);
        drop(rooms);

        self.stats.joins.fetch_add(1, Ordering::Relaxed);
        info!(
            "User {} ({}) joined room {} on connection {}",
            user.user_name, user.user_id, room_id, id
        );

        if first_for_user {
            let frame = SyncMessage::UserJoined(user).encode()?;
            self.broadcast_in(&room, Arc::new(frame), Some(id)).await;
        }

        Ok(payload)
    }

    /// Remove a connection from a room.
    ///
    /// On the user's last connection their presence is cleared and the
    /// remaining participants receive `UserLeft`. The room itself stays until
    /// the reaper finds it empty. Returns false if the connection was not in
    /// the room.
    pub async fn leave(&self, room_id: &str, id: ConnectionId) -> bool {
        let Some(room) = self.existing_room(room_id).await else {
            return false;
        };
        let Some(connection) = room.group.remove(id).await else {
            return false;
        };
        debug!("Connection {} left room {}", id, room_id);
        self.depart(&room, vec![connection]).await;
        true
    }

    /// Merge a remote update and relay the same bytes to every other
    /// connection in the room.
    ///
    /// A malformed update is rejected before it reaches anyone else.
    pub async fn apply_remote_update(
        &self,
        room_id: &str,
        update: Vec<u8>,
        origin: Option<ConnectionId>,
    ) -> Result<BroadcastReport, CollabError> {
        let room = self.get_or_create_room(room_id).await;
        let document = room.document.lock().await;
        if let Err(e) = document.apply(&update) {
            self.stats.updates_rejected.fetch_add(1, Ordering::Relaxed);
            warn!("Rejected update for room {}: {}", room_id, e);
            return Err(e);
        }
        self.stats.updates_merged.fetch_add(1, Ordering::Relaxed);

        let frame = SyncMessage::update(room_id, update).encode()?;
        let report = self.broadcast_in(&room, Arc::new(frame), origin).await;
        drop(document);
        Ok(report)
    }

    /// Replace the whole text of a room's document.
    ///
    /// The replacement is a regular update, relayed to every connection so
    /// open replicas follow it.
    pub async fn set_document_content(
        &self,
        room_id: &str,
        content: &str,
    ) -> Result<BroadcastReport, CollabError> {
        let room = self.get_or_create_room(room_id).await;
        let document = room.document.lock().await;
        let update = document.set_content(content);
        self.stats.updates_merged.fetch_add(1, Ordering::Relaxed);
        debug!("Replaced content of room {} ({} bytes)", room_id, content.len());

        let frame = SyncMessage::update(room_id, update).encode()?;
        let report = self.broadcast_in(&room, Arc::new(frame), None).await;
        drop(document);
        Ok(report)
    }

    /// Store a cursor for the user behind `origin` and relay it.
    pub async fn set_cursor(
        &self,
        room_id: &str,
        origin: ConnectionId,
        mut cursor: CursorPosition,
    ) -> Result<BroadcastReport, CollabError> {
        let room = self.joined_room(room_id, origin).await?;
        let Some(user) = room.group.user_of(origin).await else {
            return Err(not_joined(room_id, origin));
        };
        cursor.user_id = user.user_id;
        room.presence.write().await.set_cursor(cursor.clone());

        let frame = SyncMessage::Cursor(cursor).encode()?;
        Ok(self.broadcast_in(&room, Arc::new(frame), Some(origin)).await)
    }

    /// Store a selection for the user behind `origin` and relay it.
    pub async fn set_selection(
        &self,
        room_id: &str,
        origin: ConnectionId,
        mut selection: SelectionRange,
    ) -> Result<BroadcastReport, CollabError> {
        let room = self.joined_room(room_id, origin).await?;
        let Some(user) = room.group.user_of(origin).await else {
            return Err(not_joined(room_id, origin));
        };
        selection.user_id = user.user_id;
        room.presence.write().await.set_selection(selection.clone());

        let frame = SyncMessage::Selection(selection).encode()?;
        Ok(self.broadcast_in(&room, Arc::new(frame), Some(origin)).await)
    }

    async fn joined_room(&self, room_id: &str, origin: ConnectionId) -> Result<Arc<Room>, CollabError> {
        self.existing_room(room_id)
            .await
            .ok_or_else(|| not_joined(room_id, origin))
    }

    /// Encode `message` and deliver it to the room, optionally skipping one
    /// connection. Unknown rooms are a no-op.
    pub async fn broadcast(
        &self,
        room_id: &str,
        message: &SyncMessage,
        exclude: Option<ConnectionId>,
    ) -> Result<BroadcastReport, CollabError> {
        let Some(room) = self.existing_room(room_id).await else {
            return Ok(BroadcastReport::default());
        };
        let frame = message.encode()?;
        Ok(self.broadcast_in(&room, Arc::new(frame), exclude).await)
    }

    async fn broadcast_in(
        &self,
        room: &Room,
        frame: Frame,
        exclude: Option<ConnectionId>,
    ) -> BroadcastReport {
        let mut report = room.group.broadcast(frame, exclude).await;
        if !report.pruned.is_empty() {
            let further = self.depart(room, report.pruned.clone()).await;
            report.pruned.extend(further);
        }
        report
    }

    /// Announce departures for connections already removed from the room.
    ///
    /// Returns any further connections pruned while announcing.
    async fn depart(&self, room: &Room, mut departed: Vec<Connection>) -> Vec<Connection> {
        let mut announced = HashSet::new();
        let mut pruned = Vec::new();
        while let Some(connection) = departed.pop() {
            let user = &connection.user;
            if announced.contains(&user.user_id) || room.group.has_user(&user.user_id).await {
                continue;
            }
            announced.insert(user.user_id.clone());
            room.presence.write().await.clear_user(&user.user_id);
            info!("User {} ({}) left room {}", user.user_name, user.user_id, room.id);

            let frame = match SyncMessage::user_left(user).encode() {
                Ok(frame) => Arc::new(frame),
                Err(e) => {
                    warn!("Failed to encode user-left for {}: {}", user.user_id, e);
                    continue;
                }
            };
            let report = room.group.broadcast(frame, None).await;
            pruned.extend(report.pruned.iter().cloned());
            departed.extend(report.pruned);
        }
        pruned
    }

    /// Current text of a room. Unknown rooms read as empty and are not
    /// created.
    pub async fn content(&self, room_id: &str) -> String {
        match self.existing_room(room_id).await {
            Some(room) => room.text().await,
            None => String::new(),
        }
    }

    /// Connection count and encoded size of a room; zeros if unknown.
    pub async fn stats(&self, room_id: &str) -> RoomStats {
        match self.existing_room(room_id).await {
            Some(room) => room.stats().await,
            None => RoomStats::default(),
        }
    }

    /// Remove every room without connections. Returns the removed ids.
    pub async fn reap_idle_rooms(&self) -> Vec<String> {
        let mut rooms = self.rooms.write().await;
        let mut idle = Vec::new();
        for (id, room) in rooms.iter() {
            if room.group.is_empty().await {
                idle.push(id.clone());
            }
        }
        for id in &idle {
            rooms.remove(id);
            info!("Reclaimed idle room {}", id);
        }
        self.stats
            .rooms_reaped
            .fetch_add(idle.len() as u64, Ordering::Relaxed);
        idle
    }

    /// Ids of all active rooms, sorted.
    pub async fn active_rooms(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of rooms currently held, empty ones included.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn contains_room(&self, room_id: &str) -> bool {
        self.rooms.read().await.contains_key(room_id)
    }

    /// Registry-wide counters since startup.
    pub async fn registry_stats(&self) -> RegistryStats {
        RegistryStats {
            active_rooms: self.room_count().await,
            rooms_created: self.stats.rooms_created.load(Ordering::Relaxed),
            rooms_reaped: self.stats.rooms_reaped.load(Ordering::Relaxed),
            joins: self.stats.joins.load(Ordering::Relaxed),
            updates_merged: self.stats.updates_merged.load(Ordering::Relaxed),
            updates_rejected: self.stats.updates_rejected.load(Ordering::Relaxed),
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn not_joined(room_id: &str, connection: ConnectionId) -> CollabError {
    CollabError::NotJoined {
        room_id: room_id.to_string(),
        connection: connection.to_string(),
    }
}
