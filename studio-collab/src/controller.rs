//! Client-side session state machine.
//!
//! [`SessionController`] holds everything a client knows about its room
//! (local replica, other users, their presence, edits not yet sent) and
//! turns inputs into outgoing messages and [`SyncEvent`]s. It performs no
//! I/O; [`crate::client::SyncClient`] drives it over a WebSocket.
//!
//! ```text
//! Disconnected ──begin_connect──▶ Connecting ──Sync──▶ Connected
//!      ▲                              │                    │
//!      └────── teardown / transport_closed ────────────────┘
//! ```

use std::collections::VecDeque;

use log::{debug, info, warn};

use crate::document::MergeableDocument;
use crate::error::CollabError;
use crate::presence::{CursorPosition, Position, RemotePresence, SelectionRange};
use crate::protocol::{SyncMessage, SyncPayload, UserInfo};

/// Default number of local updates kept while not connected.
pub const DEFAULT_PENDING_CAPACITY: usize = 10_000;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Initial sync completed; the session is live
    Connected,
    /// Session ended (teardown or transport loss)
    Disconnected,
    /// Local replica seeded from the room snapshot
    StateSynced { text: String },
    /// A remote update was merged into the local replica
    RemoteUpdate { update: Vec<u8> },
    CursorChanged(CursorPosition),
    SelectionChanged(SelectionRange),
    UserJoined(UserInfo),
    UserLeft { user_id: String, user_name: String },
    /// Other participants present at sync time
    UsersList(Vec<UserInfo>),
    Pong,
    Error(String),
}

/// Local updates produced while not connected, replayed after sync.
pub struct OfflineQueue {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update for later replay. Returns false when full.
    pub fn enqueue(&mut self, update: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(update);
        true
    }

    /// Drain all queued updates in the order they were made.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|u| u.len()).sum()
    }
}

/// Result of feeding one server message to the controller.
#[derive(Debug, Default)]
pub struct Outcome {
    pub events: Vec<SyncEvent>,
    pub outgoing: Vec<SyncMessage>,
}

pub struct SessionController {
    user: UserInfo,
    room_id: String,
    state: ConnectionState,
    document: MergeableDocument,
    users: Vec<UserInfo>,
    presence: RemotePresence,
    pending: OfflineQueue,
    /// Send the whole local state after the next sync instead of the queue.
    resend_full_state: bool,
    last_error: Option<String>,
}

impl SessionController {
    pub fn new(user: UserInfo, room_id: impl Into<String>) -> Self {
        Self::with_pending_capacity(user, room_id, DEFAULT_PENDING_CAPACITY)
    }

    pub fn with_pending_capacity(user: UserInfo, room_id: impl Into<String>, capacity: usize) -> Self {
        let presence = RemotePresence::new(user.user_id.clone());
        Self {
            user,
            room_id: room_id.into(),
            state: ConnectionState::Disconnected,
            document: MergeableDocument::new(),
            users: Vec::new(),
            presence,
            pending: OfflineQueue::new(capacity),
            resend_full_state: false,
            last_error: None,
        }
    }

    /// Move to `Connecting` and produce the join request.
    pub fn begin_connect(&mut self) -> Result<SyncMessage, CollabError> {
        if self.state != ConnectionState::Disconnected {
            return Err(CollabError::AlreadyConnected);
        }
        self.state = ConnectionState::Connecting;
        self.last_error = None;
        Ok(SyncMessage::join(self.room_id.clone(), self.user.clone()))
    }

    /// The transport could not be opened (or the attempt was cancelled).
    pub fn connect_failed(&mut self, error: &CollabError) {
        self.state = ConnectionState::Disconnected;
        self.last_error = Some(error.to_string());
    }

    /// Apply one message received from the server.
    pub fn handle_message(&mut self, message: SyncMessage) -> Outcome {
        let mut outcome = Outcome::default();
        if self.state == ConnectionState::Disconnected {
            debug!("Ignoring {} while disconnected", message.msg_type());
            return outcome;
        }

        match message {
            SyncMessage::Sync(payload) => self.handle_sync(payload, &mut outcome),

            SyncMessage::Update { room_id, update } => {
                if room_id != self.room_id {
                    warn!("Dropping update for foreign room {}", room_id);
                    return outcome;
                }
                match self.document.apply(&update) {
                    Ok(()) => outcome.events.push(SyncEvent::RemoteUpdate { update }),
                    Err(e) => self.record_error(e.to_string(), &mut outcome),
                }
            }

            SyncMessage::Cursor(cursor) => {
                if self.presence.apply_cursor(cursor.clone()) {
                    outcome.events.push(SyncEvent::CursorChanged(cursor));
                }
            }

            SyncMessage::Selection(selection) => {
                if self.presence.apply_selection(selection.clone()) {
                    outcome.events.push(SyncEvent::SelectionChanged(selection));
                }
            }

            SyncMessage::UserJoined(user) => {
                if user.user_id == self.user.user_id {
                    return outcome;
                }
                self.users.retain(|u| u.user_id != user.user_id);
                self.users.push(user.clone());
                outcome.events.push(SyncEvent::UserJoined(user));
            }

            SyncMessage::UserLeft { user_id, user_name } => {
                self.users.retain(|u| u.user_id != user_id);
                self.presence.remove_user(&user_id);
                outcome.events.push(SyncEvent::UserLeft { user_id, user_name });
            }

            SyncMessage::Ping => outcome.outgoing.push(SyncMessage::Pong),
            SyncMessage::Pong => outcome.events.push(SyncEvent::Pong),

            other => debug!("Ignoring unexpected {} from server", other.msg_type()),
        }
        outcome
    }

    fn handle_sync(&mut self, payload: SyncPayload, outcome: &mut Outcome) {
        if payload.room_id != self.room_id {
            warn!("Dropping sync for foreign room {}", payload.room_id);
            return;
        }
        if let Err(e) = self.document.apply(&payload.snapshot) {
            self.record_error(e.to_string(), outcome);
            return;
        }

        self.state = ConnectionState::Connected;
        self.users = payload
            .users
            .into_iter()
            .filter(|u| u.user_id != self.user.user_id)
            .collect();
        self.presence.replace_all(payload.presence);
        info!(
            "Synced room {} ({} other user(s))",
            self.room_id,
            self.users.len()
        );

        outcome.events.push(SyncEvent::Connected);
        outcome.events.push(SyncEvent::StateSynced {
            text: self.document.text(),
        });
        outcome.events.push(SyncEvent::UsersList(self.users.clone()));
        outcome.outgoing.extend(self.flush_pending());
        outcome.outgoing.extend(self.republish_presence());
    }

    /// The local cursor and selection last set, so peers see them again
    /// after a rejoin without waiting for the next move.
    fn republish_presence(&self) -> Vec<SyncMessage> {
        let mut messages = Vec::new();
        if let Some(position) = self.presence.local_cursor() {
            messages.push(SyncMessage::Cursor(CursorPosition {
                user_id: self.user.user_id.clone(),
                position,
            }));
        }
        if let Some((start, end)) = self.presence.local_selection() {
            messages.push(SyncMessage::Selection(SelectionRange::new(
                self.user.user_id.clone(),
                start,
                end,
            )));
        }
        messages
    }

    fn flush_pending(&mut self) -> Vec<SyncMessage> {
        if self.resend_full_state {
            self.resend_full_state = false;
            self.pending.clear();
            return vec![SyncMessage::update(self.room_id.clone(), self.document.snapshot())];
        }
        let queued = self.pending.drain();
        if !queued.is_empty() {
            info!("Replaying {} queued update(s)", queued.len());
        }
        queued
            .into_iter()
            .map(|update| SyncMessage::update(self.room_id.clone(), update))
            .collect()
    }

    fn record_error(&mut self, error: String, outcome: &mut Outcome) {
        warn!("Session error in room {}: {}", self.room_id, error);
        self.last_error = Some(error.clone());
        outcome.events.push(SyncEvent::Error(error));
    }

    fn route_local(&mut self, update: Vec<u8>) -> Option<SyncMessage> {
        if self.state == ConnectionState::Connected {
            return Some(SyncMessage::update(self.room_id.clone(), update));
        }
        if !self.resend_full_state && !self.pending.enqueue(update) {
            debug!("Pending queue full, full state will be sent after sync");
            self.resend_full_state = true;
        }
        None
    }

    /// Insert locally; returns the message to send if connected.
    pub fn local_insert(&mut self, index: u32, chunk: &str) -> Option<SyncMessage> {
        let update = self.document.insert(index, chunk);
        self.route_local(update)
    }

    /// Delete locally; returns the message to send if connected.
    pub fn local_delete(&mut self, index: u32, len: u32) -> Option<SyncMessage> {
        let update = self.document.remove(index, len);
        self.route_local(update)
    }

    /// Replace the whole local text; returns the message to send if connected.
    pub fn local_replace(&mut self, content: &str) -> Option<SyncMessage> {
        let update = self.document.set_content(content);
        self.route_local(update)
    }

    /// Record the local cursor; returns the message to send if connected.
    pub fn update_cursor(&mut self, line: u32, column: u32) -> Option<SyncMessage> {
        let cursor = self.presence.set_local_cursor(Position::new(line, column));
        (self.state == ConnectionState::Connected).then_some(SyncMessage::Cursor(cursor))
    }

    /// Record the local selection; returns the message to send if connected.
    pub fn update_selection(&mut self, start: Position, end: Position) -> Option<SyncMessage> {
        let selection = self.presence.set_local_selection(start, end);
        (self.state == ConnectionState::Connected).then_some(SyncMessage::Selection(selection))
    }

    /// End the session and release local state.
    ///
    /// Returns the leave message to send if a session was active. A later
    /// connect starts from an empty replica and resyncs fully.
    pub fn teardown(&mut self) -> Option<SyncMessage> {
        let leave = (self.state != ConnectionState::Disconnected).then(|| SyncMessage::Leave {
            room_id: self.room_id.clone(),
        });
        self.state = ConnectionState::Disconnected;
        self.document = MergeableDocument::new();
        self.users.clear();
        self.presence = RemotePresence::new(self.user.user_id.clone());
        self.pending.clear();
        self.resend_full_state = false;
        leave
    }

    /// The transport went away without a teardown.
    ///
    /// Presence and the user list are dropped. The local replica is kept and
    /// its full state is sent after the next sync, so edits in flight when
    /// the transport died are not lost.
    pub fn transport_closed(&mut self, error: Option<String>) -> Vec<SyncEvent> {
        if self.state == ConnectionState::Disconnected {
            return Vec::new();
        }
        self.state = ConnectionState::Disconnected;
        self.users.clear();
        self.presence.clear();
        self.resend_full_state = true;
        let mut events = Vec::new();
        if let Some(error) = error {
            self.last_error = Some(error.clone());
            events.push(SyncEvent::Error(error));
        }
        events.push(SyncEvent::Disconnected);
        events
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn user(&self) -> &UserInfo {
        &self.user
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn text(&self) -> String {
        self.document.text()
    }

    pub fn document(&self) -> &MergeableDocument {
        &self.document
    }

    /// Other participants in the room.
    pub fn users(&self) -> &[UserInfo] {
        &self.users
    }

    pub fn presence(&self) -> &RemotePresence {
        &self.presence
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
