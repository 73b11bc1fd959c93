//! Fan-out of encoded frames to the live connections of one room.
//!
//! Each connection owns an outbound sink (normally the bounded queue drained
//! by its WebSocket writer). A broadcast enqueues one shared frame per
//! connection without awaiting, so a slow or dead peer never blocks delivery
//! to the rest. Connections whose sink is closed or full are pruned from the
//! group and handed back to the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::{mpsc, RwLock, RwLockWriteGuard};
use uuid::Uuid;

use crate::error::CollabError;
use crate::protocol::UserInfo;

/// One pre-encoded message, shared by every recipient.
pub type Frame = Arc<Vec<u8>>;

/// Outbound side of a connection.
pub trait MessageSink: Send + Sync {
    /// Whether the peer can still accept frames.
    fn is_open(&self) -> bool;

    /// Enqueue a frame without waiting.
    fn send(&self, frame: Frame) -> Result<(), CollabError>;
}

impl MessageSink for mpsc::Sender<Frame> {
    fn is_open(&self) -> bool {
        !self.is_closed()
    }

    fn send(&self, frame: Frame) -> Result<(), CollabError> {
        self.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => CollabError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => CollabError::ConnectionClosed,
        })
    }
}

/// Transport-level connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// A connection registered in a room: who it is and where frames go.
#[derive(Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub user: UserInfo,
    sink: Arc<dyn MessageSink>,
}

impl Connection {
    /// Wrap an outbound sink for the user behind connection `id`.
    pub fn new(id: ConnectionId, user: UserInfo, sink: Arc<dyn MessageSink>) -> Self {
        Self { id, user, sink }
    }

    /// False once the receiving side of the sink is gone.
    pub fn is_open(&self) -> bool {
        self.sink.is_open()
    }

    /// Enqueue a frame without waiting.
    ///
    /// A full queue is reported as [`CollabError::Backpressure`] and a closed
    /// one as [`CollabError::ConnectionClosed`]. The frame is dropped in
    /// both cases.
    pub fn send(&self, frame: Frame) -> Result<(), CollabError> {
        self.sink.send(frame)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user.user_id)
            .finish()
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub deliveries: u64,
    pub delivery_failures: u64,
    pub active_connections: usize,
}

/// Lock-free counters updated on every broadcast.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
        }
    }
}

/// Outcome of one broadcast.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Connections the frame was enqueued on.
    pub delivered: usize,
    /// Connections removed because delivery failed.
    pub pruned: Vec<Connection>,
}

/// The live connection set of one room.
pub struct BroadcastGroup {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    /// Register a connection. Replaces any previous entry with the same id.
    pub async fn add(&self, connection: Connection) {
        let mut connections = self.connections.write().await;
        connections.insert(connection.id, connection);
    }

    /// Take the connection set exclusively to admit a new member.
    ///
    /// No broadcast can run while the returned guard is alive, so whatever
    /// the caller reads under it and sends through [`Admission::admit`] is
    /// delivered before any later broadcast reaches the newcomer.
    pub async fn admission(&self) -> Admission<'_> {
        Admission {
            connections: self.connections.write().await,
        }
    }

    /// Remove a connection, returning it if it was registered.
    pub async fn remove(&self, id: ConnectionId) -> Option<Connection> {
        let mut connections = self.connections.write().await;
        connections.remove(&id)
    }

    /// Whether any connection belongs to `user_id`.
    pub async fn has_user(&self, user_id: &str) -> bool {
        let connections = self.connections.read().await;
        connections.values().any(|c| c.user.user_id == user_id)
    }

    /// The user behind a connection.
    pub async fn user_of(&self, id: ConnectionId) -> Option<UserInfo> {
        let connections = self.connections.read().await;
        connections.get(&id).map(|c| c.user.clone())
    }

    /// Distinct users with at least one connection, ordered by user id.
    pub async fn users(&self) -> Vec<UserInfo> {
        let connections = self.connections.read().await;
        distinct_users(connections.values())
    }

    /// Number of live connections (a user may hold several).
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Deliver `frame` to every connection except `exclude`.
    ///
    /// Never fails: a connection that is closed or whose queue is full is
    /// logged, skipped and pruned. The remaining connections still receive
    /// the frame.
    pub async fn broadcast(&self, frame: Frame, exclude: Option<ConnectionId>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();
        {
            let connections = self.connections.read().await;
            for (id, connection) in connections.iter() {
                if Some(*id) == exclude {
                    continue;
                }
                if !connection.is_open() {
                    debug!("Connection {} not open, pruning", id);
                    failed.push(*id);
                    continue;
                }
                match connection.send(frame.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(e) => {
                        warn!(
                            "Delivery to connection {} (user {}) failed: {}",
                            id, connection.user.user_id, e
                        );
                        failed.push(*id);
                    }
                }
            }
        }

        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.atomic_stats
            .deliveries
            .fetch_add(report.delivered as u64, Ordering::Relaxed);

        if !failed.is_empty() {
            self.atomic_stats
                .delivery_failures
                .fetch_add(failed.len() as u64, Ordering::Relaxed);
            let mut connections = self.connections.write().await;
            for id in failed {
                if let Some(connection) = connections.remove(&id) {
                    report.pruned.push(connection);
                }
            }
        }

        report
    }

    /// Totals since the group was created.
    pub async fn stats(&self) -> BroadcastStats {
        let connections = self.connections.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            deliveries: self.atomic_stats.deliveries.load(Ordering::Relaxed),
            delivery_failures: self.atomic_stats.delivery_failures.load(Ordering::Relaxed),
            active_connections: connections.len(),
        }
    }
}

impl Default for BroadcastGroup {
    fn default() -> Self {
        Self::new()
    }
}

fn distinct_users<'a>(connections: impl Iterator<Item = &'a Connection>) -> Vec<UserInfo> {
    let mut users: Vec<UserInfo> = Vec::new();
    for connection in connections {
        if !users.iter().any(|u| u.user_id == connection.user.user_id) {
            users.push(connection.user.clone());
        }
    }
    users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
    users
}

/// Exclusive hold on a group's connection set while one connection joins.
pub struct Admission<'a> {
    connections: RwLockWriteGuard<'a, HashMap<ConnectionId, Connection>>,
}

impl Admission<'_> {
    /// Whether any admitted connection belongs to `user_id`.
    pub fn has_user(&self, user_id: &str) -> bool {
        self.connections.values().any(|c| c.user.user_id == user_id)
    }

    /// Distinct users already in the group, ordered by user id.
    pub fn users(&self) -> Vec<UserInfo> {
        distinct_users(self.connections.values())
    }

    /// Send `first` to the connection, then register it.
    ///
    /// If the frame cannot be enqueued the connection is not added.
    pub fn admit(mut self, connection: Connection, first: Frame) -> Result<(), CollabError> {
        connection.send(first)?;
        self.connections.insert(connection.id, connection);
        Ok(())
    }
}
