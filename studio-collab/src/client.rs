//! WebSocket sync client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (cancellable connect, disconnect, fresh rejoin)
//! - Local edits applied to the replica and sent as Yrs updates
//! - Cursor/selection presence in both directions
//! - Edits made before the room state arrives are queued and replayed
//!
//! All session state lives in a [`SessionController`]; this type only moves
//! bytes between it and the socket and forwards its events.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::Message;

use crate::controller::{ConnectionState, SessionController, SyncEvent};
use crate::error::CollabError;
use crate::presence::{CursorPosition, Position, SelectionRange};
use crate::protocol::{SyncMessage, UserInfo};

const OUTGOING_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 256;

type OutgoingSlot = Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>;

/// The sync client.
///
/// Methods take `&self`, so one client can be shared behind an `Arc` by the
/// editor and whatever drives reconnection.
pub struct SyncClient {
    user: UserInfo,
    room_id: String,
    server_url: String,
    controller: Arc<Mutex<SessionController>>,
    /// Channel to the WebSocket writer task while a transport is open
    outgoing: OutgoingSlot,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    /// Bumped on every disconnect; in-flight connects and readers watch it.
    cancel_tx: watch::Sender<u64>,
}

impl SyncClient {
    /// Create a new sync client for `room_id` on the server at `server_url`.
    pub fn new(user: UserInfo, room_id: impl Into<String>, server_url: impl Into<String>) -> Self {
        let room_id = room_id.into();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let (cancel_tx, _) = watch::channel(0);
        Self {
            controller: Arc::new(Mutex::new(SessionController::new(user.clone(), room_id.clone()))),
            user,
            room_id,
            server_url: server_url.into(),
            outgoing: Arc::new(Mutex::new(None)),
            event_tx,
            event_rx: Some(event_rx),
            cancel_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Open the transport and request the room.
    ///
    /// Returns once the join request is on its way; [`SyncEvent::Connected`]
    /// follows when the room state has been received. A concurrent
    /// [`SyncClient::disconnect`] aborts the attempt with
    /// [`CollabError::Cancelled`].
    pub async fn connect(&self) -> Result<(), CollabError> {
        // disconnect() bumps the generation under the controller lock, so
        // the generation read here belongs to this attempt.
        let (join, generation, mut cancel_rx) = {
            let mut controller = self.controller.lock().await;
            let join = controller.begin_connect()?;
            let generation = *self.cancel_tx.borrow();
            (join, generation, self.cancel_tx.subscribe())
        };

        let join = match join.encode() {
            Ok(encoded) => encoded,
            Err(e) => return Err(self.fail_connect(generation, e.into()).await),
        };

        let ws_stream = tokio::select! {
            result = tokio_tungstenite::connect_async(self.server_url.as_str()) => {
                match result {
                    Ok((ws_stream, _)) => ws_stream,
                    Err(e) => return Err(self.fail_connect(generation, e.into()).await),
                }
            }
            _ = cancel_rx.changed() => return Err(cancelled()),
        };

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(OUTGOING_CAPACITY);
        {
            // disconnect() bumps the generation before it empties this slot,
            // so either it takes the sender installed here or this sees the
            // new generation.
            let mut slot = self.outgoing.lock().await;
            if *self.cancel_tx.borrow() != generation {
                // Dropping the stream closes the transport.
                return Err(cancelled());
            }
            // A fresh queue has room; the join goes out first.
            if out_tx.try_send(join).is_err() {
                drop(slot);
                return Err(self.fail_connect(generation, CollabError::ConnectionClosed).await);
            }
            *slot = Some(out_tx.clone());
        }
        info!("Connected to {} for room {}", self.server_url, self.room_id);

        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: feed incoming messages to the controller
        let controller = self.controller.clone();
        let outgoing = self.outgoing.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let mut close_reason = None;
            loop {
                tokio::select! {
                    msg = ws_reader.next() => match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let message = match SyncMessage::decode(&bytes) {
                                Ok(message) => message,
                                Err(e) => {
                                    warn!("Failed to decode server message: {e}");
                                    continue;
                                }
                            };
                            let outcome = controller.lock().await.handle_message(message);
                            for reply in outcome.outgoing {
                                match reply.encode() {
                                    Ok(encoded) => {
                                        let _ = out_tx.send(encoded).await;
                                    }
                                    Err(e) => warn!("Failed to encode {}: {e}", reply.msg_type()),
                                }
                            }
                            for event in outcome.events {
                                emit(&event_tx, event);
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            close_reason = Some(e.to_string());
                            break;
                        }
                        _ => {}
                    },
                    // Torn down locally; disconnect() already reported it
                    _ = cancel_rx.changed() => return,
                }
            }

            // Connection lost
            outgoing.lock().await.take();
            let events = controller.lock().await.transport_closed(close_reason);
            for event in events {
                emit(&event_tx, event);
            }
        });

        Ok(())
    }

    /// Record a failed attempt, unless a disconnect already superseded it.
    async fn fail_connect(&self, generation: u64, error: CollabError) -> CollabError {
        let mut controller = self.controller.lock().await;
        if *self.cancel_tx.borrow() != generation {
            return cancelled();
        }
        warn!("Connect to {} failed: {error}", self.server_url);
        controller.connect_failed(&error);
        error
    }

    async fn send_message(&self, message: SyncMessage) -> Result<(), CollabError> {
        let encoded = message.encode()?;
        let tx = self.outgoing.lock().await.clone();
        match tx {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| CollabError::ConnectionClosed),
            None => Err(CollabError::ConnectionClosed),
        }
    }

    async fn send_optional(&self, message: Option<SyncMessage>) -> Result<(), CollabError> {
        match message {
            Some(message) => self.send_message(message).await,
            None => Ok(()),
        }
    }

    /// Insert text locally and propagate it.
    ///
    /// While not connected the edit is kept and sent after the next sync.
    pub async fn insert_text(&self, index: u32, chunk: &str) -> Result<(), CollabError> {
        let mut controller = self.controller.lock().await;
        let message = controller.local_insert(index, chunk);
        self.send_optional(message).await
    }

    /// Delete text locally and propagate it.
    pub async fn delete_text(&self, index: u32, len: u32) -> Result<(), CollabError> {
        let mut controller = self.controller.lock().await;
        let message = controller.local_delete(index, len);
        self.send_optional(message).await
    }

    /// Replace the whole text locally and propagate it.
    pub async fn set_text(&self, content: &str) -> Result<(), CollabError> {
        let mut controller = self.controller.lock().await;
        let message = controller.local_replace(content);
        self.send_optional(message).await
    }

    /// Publish the local cursor. While offline it is remembered and sent
    /// after the next sync.
    pub async fn update_cursor(&self, line: u32, column: u32) -> Result<(), CollabError> {
        let message = self.controller.lock().await.update_cursor(line, column);
        self.send_optional(message).await
    }

    /// Publish the local selection. While offline it is remembered and sent
    /// after the next sync.
    pub async fn update_selection(&self, start: Position, end: Position) -> Result<(), CollabError> {
        let message = self.controller.lock().await.update_selection(start, end);
        self.send_optional(message).await
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), CollabError> {
        self.send_message(SyncMessage::Ping).await
    }

    /// Leave the room, close the transport and release local state.
    ///
    /// Also cancels a connect that is still in progress.
    pub async fn disconnect(&self) {
        let leave = {
            let mut controller = self.controller.lock().await;
            self.cancel_tx.send_modify(|generation| *generation += 1);
            controller.teardown()
        };
        let tx = self.outgoing.lock().await.take();
        // Nothing to report if the session had already ended.
        let Some(leave) = leave else {
            return;
        };
        if let Some(tx) = tx {
            match leave.encode() {
                Ok(encoded) => {
                    let _ = tx.send(encoded).await;
                }
                Err(e) => debug!("Failed to encode leave: {e}"),
            }
        }
        emit(&self.event_tx, SyncEvent::Disconnected);
        info!("Disconnected from room {}", self.room_id);
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        self.controller.lock().await.state()
    }

    pub async fn is_connected(&self) -> bool {
        self.controller.lock().await.is_connected()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.controller.lock().await.last_error().map(str::to_string)
    }

    /// Current text of the local replica.
    pub async fn text(&self) -> String {
        self.controller.lock().await.text()
    }

    /// Other participants in the room.
    pub async fn users(&self) -> Vec<UserInfo> {
        self.controller.lock().await.users().to_vec()
    }

    pub async fn cursors(&self) -> HashMap<String, CursorPosition> {
        self.controller.lock().await.presence().cursors().clone()
    }

    pub async fn selections(&self) -> HashMap<String, SelectionRange> {
        self.controller.lock().await.presence().selections().clone()
    }

    /// Number of local edits waiting for the next sync.
    pub async fn pending_len(&self) -> usize {
        self.controller.lock().await.pending_len()
    }

    /// Get our user identity.
    pub fn user(&self) -> &UserInfo {
        &self.user
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

fn cancelled() -> CollabError {
    debug!("Connect cancelled by disconnect");
    CollabError::Cancelled
}

/// Forward an event without blocking the socket on a slow consumer.
fn emit(event_tx: &mpsc::Sender<SyncEvent>, event: SyncEvent) {
    if let Err(e) = event_tx.try_send(event) {
        debug!("Dropping client event: {e}");
    }
}
