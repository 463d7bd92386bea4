//! Connection registry: live transport connections and the sessions each
//! one has joined.
//!
//! Every connection owns a bounded outbound queue of pre-serialized frames.
//! The router looks queues up here; the connection task drains its own
//! queue into the WebSocket sink.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::{ConnectionId, SessionId};

/// Sending half of a connection's outbound queue.
pub type Outbound = mpsc::Sender<Arc<String>>;

struct ConnectionEntry {
    established_at: DateTime<Utc>,
    outbound: Outbound,
    sessions: HashSet<SessionId>,
}

/// Point-in-time view of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub established_at: DateTime<Utc>,
    pub sessions: HashSet<SessionId>,
}

/// Tracks live connections.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
    /// Mirrors `connections.len()` so counts never take the lock
    active_count: AtomicUsize,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            active_count: AtomicUsize::new(0),
        }
    }

    /// Allocate a fresh identity for a new transport connection.
    pub async fn register(&self, outbound: Outbound) -> ConnectionId {
        let connection_id = Uuid::new_v4();
        let entry = ConnectionEntry {
            established_at: Utc::now(),
            outbound,
            sessions: HashSet::new(),
        };
        self.connections.write().await.insert(connection_id, entry);
        self.active_count.fetch_add(1, Ordering::Relaxed);
        log::debug!("Registered connection {connection_id}");
        connection_id
    }

    /// Record that `connection_id` joined `session_id`.
    ///
    /// Returns `false` if the connection is not registered.
    pub async fn record_join(&self, connection_id: ConnectionId, session_id: &str) -> bool {
        let mut conns = self.connections.write().await;
        match conns.get_mut(&connection_id) {
            Some(entry) => {
                entry.sessions.insert(session_id.to_owned());
                true
            }
            None => false,
        }
    }

    /// Record that `connection_id` no longer participates in `session_id`.
    pub async fn record_leave(&self, connection_id: ConnectionId, session_id: &str) -> bool {
        let mut conns = self.connections.write().await;
        match conns.get_mut(&connection_id) {
            Some(entry) => entry.sessions.remove(session_id),
            None => false,
        }
    }

    /// Remove the connection, returning every session it still had joined.
    ///
    /// A second call for the same id returns an empty set.
    pub async fn unregister(&self, connection_id: ConnectionId) -> HashSet<SessionId> {
        let removed = self.connections.write().await.remove(&connection_id);
        match removed {
            Some(entry) => {
                self.active_count.fetch_sub(1, Ordering::Relaxed);
                log::debug!(
                    "Unregistered connection {connection_id} ({} sessions to clean up)",
                    entry.sessions.len()
                );
                entry.sessions
            }
            None => HashSet::new(),
        }
    }

    pub async fn contains(&self, connection_id: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&connection_id)
    }

    /// Sessions currently recorded for the connection.
    pub async fn sessions(&self, connection_id: ConnectionId) -> Option<HashSet<SessionId>> {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .map(|e| e.sessions.clone())
    }

    pub async fn info(&self, connection_id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.read().await.get(&connection_id).map(|e| ConnectionInfo {
            connection_id,
            established_at: e.established_at,
            sessions: e.sessions.clone(),
        })
    }

    /// Outbound queues for the given connections. Unknown ids are skipped.
    pub async fn outbound_for(&self, ids: &[ConnectionId]) -> Vec<(ConnectionId, Outbound)> {
        let conns = self.connections.read().await;
        ids.iter()
            .filter_map(|id| conns.get(id).map(|e| (*id, e.outbound.clone())))
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
