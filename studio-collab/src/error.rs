//! Error type shared by the registry, controller, client and server.

use thiserror::Error;

use crate::protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// An update or snapshot that the document could not decode or merge.
    #[error("malformed update: {0}")]
    MalformedUpdate(String),

    #[error("connection {connection} has not joined room {room_id}")]
    NotJoined { room_id: String, connection: String },

    #[error("connection closed")]
    ConnectionClosed,

    /// The connection's outbound queue is full.
    #[error("outbound queue full")]
    Backpressure,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connect attempt cancelled")]
    Cancelled,

    #[error("client is already connected or connecting")]
    AlreadyConnected,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for CollabError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        CollabError::Transport(e.to_string())
    }
}
