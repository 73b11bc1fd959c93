//! # studio-collab: Real-time collaborative prompt editing
//!
//! Several participants edit one shared text per room over WebSockets.
//! Every replica holds a Yrs document; edits travel as binary updates and
//! merge without locks or a single writer, so all replicas converge.
//! Cursor and selection presence travels alongside but never touches the
//! document.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────┐     WebSocket      ┌──────────────────┐
//! │ SyncClient        │ ◄────────────────► │ SyncServer       │
//! │  SessionController│    Binary Proto    │  SessionRegistry │
//! └─────────┬─────────┘                    └────────┬─────────┘
//!           │                                       │  per room
//!           ▼                                       ▼
//! ┌───────────────────┐                    ┌──────────────────┐
//! │ MergeableDocument │                    │ MergeableDocument│
//! │ RemotePresence    │                    │ BroadcastGroup   │
//! └───────────────────┘                    │ PresenceStore    │
//!                                          └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`document`]: Yrs-backed mergeable text
//! - [`presence`]: Cursor/selection stores (server and client side)
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`]: Per-room fan-out with failure isolation
//! - [`registry`]: Rooms, join/leave, merge-and-relay
//! - [`reaper`]: Periodic reclamation of empty rooms
//! - [`controller`]: Client session state machine
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client

pub mod broadcast;
pub mod client;
pub mod controller;
pub mod document;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod reaper;
pub mod registry;
pub mod server;

// Re-exports for convenience
pub use broadcast::{
    BroadcastGroup, BroadcastReport, BroadcastStats, Connection, ConnectionId, Frame, MessageSink,
};
pub use client::SyncClient;
pub use controller::{ConnectionState, OfflineQueue, Outcome, SessionController, SyncEvent};
pub use document::MergeableDocument;
pub use error::CollabError;
pub use presence::{
    CursorPosition, Position, PresenceEntry, PresenceStore, RemotePresence, SelectionRange,
};
pub use protocol::{MessageType, ProtocolError, SyncMessage, SyncPayload, UserInfo};
pub use reaper::IdleReaper;
pub use registry::{RegistryStats, Room, RoomStats, SessionRegistry};
pub use server::{ServerConfig, ServerStats, SyncServer};
