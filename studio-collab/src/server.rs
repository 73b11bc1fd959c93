//! WebSocket sync server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── Room "r1" ── MergeableDocument
//!             ├── SessionRegistry ──┤               ├── BroadcastGroup
//! Client B ──┘         │            │               └── PresenceStore
//!                      │            └── Room "r2" ── …
//!                      └── IdleReaper (every reap_interval)
//! ```
//!
//! Each accepted socket runs its own task. Inbound frames are decoded and
//! dispatched by message type; outbound frames arrive on the connection's
//! bounded queue and are written in order. Whatever ends the loop, the
//! connection leaves its room before the task exits.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{ConnectionId, Frame};
use crate::error::CollabError;
use crate::protocol::SyncMessage;
use crate::reaper::DEFAULT_REAP_INTERVAL;
use crate::registry::SessionRegistry;

pub const ENV_BIND_ADDR: &str = "STUDIO_COLLAB_BIND";
pub const ENV_OUTBOUND_CAPACITY: &str = "STUDIO_COLLAB_OUTBOUND_CAPACITY";
pub const ENV_REAP_INTERVAL_SECS: &str = "STUDIO_COLLAB_REAP_INTERVAL_SECS";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection before it is considered stuck
    pub outbound_capacity: usize,
    /// How often empty rooms are reclaimed
    pub reap_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbound_capacity: 256,
            reap_interval: DEFAULT_REAP_INTERVAL,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `STUDIO_COLLAB_*` environment variables.
    pub fn from_env() -> Result<Self, CollabError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CollabError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(addr) = lookup(ENV_BIND_ADDR) {
            config.bind_addr = addr;
        }
        if let Some(raw) = lookup(ENV_OUTBOUND_CAPACITY) {
            config.outbound_capacity = parse_positive(ENV_OUTBOUND_CAPACITY, &raw)? as usize;
        }
        if let Some(raw) = lookup(ENV_REAP_INTERVAL_SECS) {
            config.reap_interval = Duration::from_secs(parse_positive(ENV_REAP_INTERVAL_SECS, &raw)?);
        }
        Ok(config)
    }
}

fn parse_positive(key: &str, raw: &str) -> Result<u64, CollabError> {
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(CollabError::Config(format!("{key} must be greater than zero"))),
        Ok(value) => Ok(value),
        Err(e) => Err(CollabError::Config(format!("{key}={raw:?}: {e}"))),
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

/// Per-socket state: the room it joined and that room's outbound queue.
struct PeerSession {
    id: ConnectionId,
    addr: SocketAddr,
    room_id: Option<String>,
    outbound: Option<mpsc::Receiver<Frame>>,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_registry(config, Arc::new(SessionRegistry::new()))
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Create a server around an existing registry.
    pub fn with_registry(config: ServerConfig, registry: Arc<SessionRegistry>) -> Self {
        Self {
            config,
            registry,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Bind to the configured address and serve forever.
    pub async fn run(&self) -> Result<(), CollabError> {
        self.run_until(std::future::pending()).await
    }

    /// Bind to the configured address and serve until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), CollabError>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Sync server listening on {}", self.config.bind_addr);
        self.serve_with_shutdown(listener, shutdown).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), CollabError> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Serve connections until `shutdown` resolves.
    ///
    /// The idle reaper runs for exactly as long as this call.
    pub async fn serve_with_shutdown<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), CollabError>
    where
        F: Future<Output = ()>,
    {
        let reaper = self.registry.spawn_reaper(self.config.reap_interval);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    debug!("New TCP connection from {addr}");

                    let registry = self.registry.clone();
                    let stats = self.stats.clone();
                    let capacity = self.config.outbound_capacity;
                    tokio::spawn(async move {
                        if let Err(e) =
                            Self::handle_connection(stream, addr, registry, stats, capacity).await
                        {
                            error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = &mut shutdown => {
                    info!("Sync server shutting down");
                    break;
                }
            }
        }

        reaper.shutdown().await;
        Ok(())
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<SessionRegistry>,
        stats: Arc<AtomicServerStats>,
        outbound_capacity: usize,
    ) -> Result<(), CollabError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        info!("WebSocket connection established from {addr}");

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let mut session = PeerSession {
            id: ConnectionId::new(),
            addr,
            room_id: None,
            outbound: None,
        };
        let result =
            Self::connection_loop(ws_stream, &mut session, &registry, &stats, outbound_capacity).await;

        // Cleanup: leave the room whatever ended the loop
        if let Some(room_id) = session.room_id.take() {
            registry.leave(&room_id, session.id).await;
        }
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        result
    }

    async fn connection_loop(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        session: &mut PeerSession,
        registry: &SessionRegistry,
        stats: &AtomicServerStats,
        outbound_capacity: usize,
    ) -> Result<(), CollabError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            stats.total_messages.fetch_add(1, Ordering::Relaxed);
                            stats.total_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);

                            match SyncMessage::decode(&bytes) {
                                Ok(sync_msg) => {
                                    let reply =
                                        Self::dispatch(sync_msg, session, registry, outbound_capacity).await;
                                    if let Some(reply) = reply {
                                        let encoded = reply.encode()?;
                                        ws_sender.send(Message::Binary(encoded.into())).await?;
                                    }
                                }
                                Err(e) => {
                                    warn!("Failed to decode message from {}: {e}", session.addr);
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            info!("Connection closed from {}", session.addr);
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            warn!("WebSocket error from {}: {e}", session.addr);
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing frames for this connection
                frame = async {
                    match session.outbound.as_mut() {
                        Some(rx) => rx.recv().await,
                        // Not in a room yet, wait forever
                        None => std::future::pending().await,
                    }
                } => {
                    match frame {
                        Some(frame) => {
                            ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                        }
                        None => {
                            // The room dropped our queue after a failed delivery.
                            warn!("Connection {} pruned from its room, closing", session.id);
                            session.outbound = None;
                            break;
                        }
                    }
                }
            }
        }

        let _ = ws_sender.close().await;
        Ok(())
    }

    /// Route one decoded message. Returns a direct reply, if any.
    async fn dispatch(
        msg: SyncMessage,
        session: &mut PeerSession,
        registry: &SessionRegistry,
        outbound_capacity: usize,
    ) -> Option<SyncMessage> {
        debug!("Dispatch {} from {}", msg.msg_type(), session.addr);

        match msg {
            SyncMessage::Join { room_id, user } => {
                if let Some(previous) = session.room_id.take() {
                    registry.leave(&previous, session.id).await;
                }
                session.outbound = None;

                let (tx, rx) = mpsc::channel::<Frame>(outbound_capacity);
                match registry.join(&room_id, session.id, user, Arc::new(tx)).await {
                    Ok(_) => {
                        session.room_id = Some(room_id);
                        session.outbound = Some(rx);
                    }
                    Err(e) => warn!("Join of room {room_id} from {} failed: {e}", session.addr),
                }
                None
            }

            SyncMessage::Update { room_id, update } => {
                if session.room_id.as_deref() != Some(room_id.as_str()) {
                    warn!(
                        "Dropping update for room {room_id} from {} (not joined)",
                        session.addr
                    );
                    return None;
                }
                if let Err(e) = registry
                    .apply_remote_update(&room_id, update, Some(session.id))
                    .await
                {
                    warn!("Dropping update from {}: {e}", session.addr);
                }
                None
            }

            SyncMessage::Cursor(cursor) => {
                if let Some(room_id) = session.room_id.as_deref() {
                    trace!("Presence: cursor update in room {room_id}");
                    if let Err(e) = registry.set_cursor(room_id, session.id, cursor).await {
                        warn!("Dropping cursor from {}: {e}", session.addr);
                    }
                }
                None
            }

            SyncMessage::Selection(selection) => {
                if let Some(room_id) = session.room_id.as_deref() {
                    trace!("Presence: selection update in room {room_id}");
                    if let Err(e) = registry.set_selection(room_id, session.id, selection).await {
                        warn!("Dropping selection from {}: {e}", session.addr);
                    }
                }
                None
            }

            SyncMessage::Leave { room_id } => {
                if session.room_id.as_deref() == Some(room_id.as_str()) {
                    registry.leave(&room_id, session.id).await;
                    session.room_id = None;
                    session.outbound = None;
                }
                None
            }

            SyncMessage::Ping => Some(SyncMessage::Pong),

            SyncMessage::Pong => {
                trace!("Pong from {}", session.addr);
                None
            }

            other => {
                debug!("Unhandled message type from client: {}", other.msg_type());
                None
            }
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            active_rooms: self.registry.room_count().await,
        }
    }

    /// The registry shared by every connection of this server.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}
