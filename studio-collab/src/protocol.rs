//! Binary wire protocol between session clients and the sync server.
//!
//! Every message is one bincode-encoded [`SyncMessage`] carried in a single
//! binary WebSocket frame:
//!
//! ```text
//! client ── Join ───────────────▶ server
//! client ◀────────────── Sync ── server   (snapshot + users + presence)
//! client ── Update ─────────────▶ server ── Update ──▶ other clients
//! client ── Cursor / Selection ─▶ server ── relay ───▶ other clients
//!                                 server ── UserJoined / UserLeft ──▶ room
//! ```
//!
//! `Update` payloads are opaque Yrs v1 updates; the server relays the bytes
//! it received without re-encoding them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::{CursorPosition, PresenceEntry, SelectionRange};

/// Cursor colors handed out to participants.
pub const USER_COLORS: [&str; 10] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#FFA07A", "#98D8C8", "#F7DC6F", "#BB8FCE", "#85C1E2",
    "#F8B88B", "#A2D9CE",
];

/// Participant identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct UserInfo {
    pub user_id: String,
    pub user_name: String,
    /// CSS hex color for cursor/selection rendering
    pub color: String,
}

impl UserInfo {
    /// Create an identity with a freshly generated id.
    pub fn new(user_name: impl Into<String>) -> Self {
        Self::with_id(generate_user_id(), user_name)
    }

    /// Create with an explicit id. The color is derived from the id.
    pub fn with_id(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let color = color_for(&user_id).to_string();
        Self {
            user_id,
            user_name: user_name.into(),
            color,
        }
    }
}

/// Generate a session-scoped user id.
pub fn generate_user_id() -> String {
    format!("user-{}", Uuid::new_v4().simple())
}

/// Stable palette color for a user id.
pub fn color_for(user_id: &str) -> &'static str {
    let hash = user_id
        .bytes()
        .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(b as u32));
    USER_COLORS[hash as usize % USER_COLORS.len()]
}

/// Everything a joining client needs to seed its replica.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncPayload {
    pub room_id: String,
    /// Full Yrs state of the room document
    pub snapshot: Vec<u8>,
    /// Other participants currently in the room
    pub users: Vec<UserInfo>,
    /// Presence of the other participants
    pub presence: Vec<PresenceEntry>,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SyncMessage {
    Join { room_id: String, user: UserInfo },
    Sync(SyncPayload),
    Update { room_id: String, update: Vec<u8> },
    Cursor(CursorPosition),
    Selection(SelectionRange),
    UserJoined(UserInfo),
    UserLeft { user_id: String, user_name: String },
    Leave { room_id: String },
    Ping,
    Pong,
}

/// Message kinds, used for dispatch and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Join,
    Sync,
    Update,
    Cursor,
    Selection,
    UserJoined,
    UserLeft,
    Leave,
    Ping,
    Pong,
}

impl MessageType {
    /// Wire name of the message type, as used in logs and stats.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Join => "join",
            MessageType::Sync => "sync",
            MessageType::Update => "update",
            MessageType::Cursor => "cursor",
            MessageType::Selection => "selection",
            MessageType::UserJoined => "user-joined",
            MessageType::UserLeft => "user-left",
            MessageType::Leave => "leave",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SyncMessage {
    /// Create a join request.
    pub fn join(room_id: impl Into<String>, user: UserInfo) -> Self {
        SyncMessage::Join {
            room_id: room_id.into(),
            user,
        }
    }

    /// Create a delta update message.
    pub fn update(room_id: impl Into<String>, update: Vec<u8>) -> Self {
        SyncMessage::Update {
            room_id: room_id.into(),
            update,
        }
    }

    /// Create a departure notice for `user`.
    pub fn user_left(user: &UserInfo) -> Self {
        SyncMessage::UserLeft {
            user_id: user.user_id.clone(),
            user_name: user.user_name.clone(),
        }
    }

    pub fn msg_type(&self) -> MessageType {
        match self {
            SyncMessage::Join { .. } => MessageType::Join,
            SyncMessage::Sync(_) => MessageType::Sync,
            SyncMessage::Update { .. } => MessageType::Update,
            SyncMessage::Cursor(_) => MessageType::Cursor,
            SyncMessage::Selection(_) => MessageType::Selection,
            SyncMessage::UserJoined(_) => MessageType::UserJoined,
            SyncMessage::UserLeft { .. } => MessageType::UserLeft,
            SyncMessage::Leave { .. } => MessageType::Leave,
            SyncMessage::Ping => MessageType::Ping,
            SyncMessage::Pong => MessageType::Pong,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
