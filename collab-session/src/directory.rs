//! Session directory and presence tracking.
//!
//! ```text
//! SessionDirectory
//!   RwLock<HashMap<session_id, Arc<Mutex<Session>>>>
//!                                  │
//!                                  └── roster: [Participant] (join order)
//! ```
//!
//! The outer map lock is only held to look up, create or delete a session
//! handle. Roster mutation happens under the per-session mutex, so unrelated
//! sessions never contend. A session is created on first join and deleted
//! the moment its roster becomes empty; the `closed` flag stops a join that
//! raced the deletion from writing into the orphaned handle.
//!
//! When built [`with_registry`](SessionDirectory::with_registry), every
//! roster change is mirrored into the [`ConnectionRegistry`] before the
//! session mutex is released. A connection has an entry in a roster exactly
//! when the registry records that session for it.
//!
//! Lock order: session mutex, then registry or directory map. Nothing takes
//! a session mutex while holding either of those.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::protocol::{ConnectionId, Participant, SessionId};
use crate::registry::ConnectionRegistry;

#[derive(Debug, Default)]
struct Session {
    roster: Vec<Participant>,
    closed: bool,
}

/// Result of a successful join.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// Roster after the join
    pub roster: Vec<Participant>,
    /// Stale entry for the same participant that the join replaced
    pub replaced: Option<Participant>,
    /// Connection of the replaced entry, if it has no other entry left in the session
    pub orphaned_connection: Option<ConnectionId>,
    /// True when this join created the session
    pub created: bool,
}

/// Result of a leave that removed at least one entry.
#[derive(Debug, Clone)]
pub struct LeaveOutcome {
    pub removed: Vec<Participant>,
    /// Roster after the leave (empty when the session was deleted)
    pub roster: Vec<Participant>,
    /// Connections that no longer have any entry in the session
    pub departed_connections: Vec<ConnectionId>,
    pub session_closed: bool,
}

/// Errors from session membership changes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid join request: missing {0}")]
    InvalidJoinRequest(&'static str),

    #[error("Session {session_id} is full ({limit} participants)")]
    SessionFull { session_id: SessionId, limit: usize },

    #[error("Connection {0} is not registered")]
    UnknownConnection(ConnectionId),

    #[error("Connection is authenticated as {verified}, cannot act as {claimed}")]
    IdentityMismatch { verified: String, claimed: String },
}

/// Maps session ids to rosters.
pub struct SessionDirectory {
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<Session>>>>,
    max_participants: usize,
    registry: Option<Arc<ConnectionRegistry>>,
}

impl SessionDirectory {
    /// Standalone directory; connection ids are not checked.
    pub fn new(max_participants: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_participants,
            registry: None,
        }
    }

    /// Directory that keeps `registry` in step with every roster change.
    ///
    /// Joins from connections the registry does not know fail with
    /// [`SessionError::UnknownConnection`].
    pub fn with_registry(max_participants: usize, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry: Some(registry),
            ..Self::new(max_participants)
        }
    }

    /// Get or lazily create the handle for a session.
    async fn get_or_create(&self, session_id: &str) -> Arc<Mutex<Session>> {
        {
            let sessions = self.sessions.read().await;
            if let Some(handle) = sessions.get(session_id) {
                return handle.clone();
            }
        }

        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(Session::default())))
            .clone()
    }

    async fn get(&self, session_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Add a participant to a session, replacing any stale entry with the
    /// same participant id.
    pub async fn join(
        &self,
        session_id: &str,
        participant_id: &str,
        display_name: &str,
        connection_id: ConnectionId,
    ) -> Result<JoinOutcome, SessionError> {
        if session_id.is_empty() {
            return Err(SessionError::InvalidJoinRequest("session_id"));
        }
        if participant_id.is_empty() {
            return Err(SessionError::InvalidJoinRequest("participant_id"));
        }
        if display_name.is_empty() {
            return Err(SessionError::InvalidJoinRequest("display_name"));
        }
        if connection_id.is_nil() {
            return Err(SessionError::InvalidJoinRequest("connection_id"));
        }

        loop {
            let handle = self.get_or_create(session_id).await;
            let mut session = handle.lock().await;
            if session.closed {
                // Deleted between lookup and lock; retry against a fresh handle.
                continue;
            }

            let existing = session
                .roster
                .iter()
                .position(|p| p.participant_id == participant_id);

            if existing.is_none() && session.roster.len() >= self.max_participants {
                return Err(SessionError::SessionFull {
                    session_id: session_id.to_owned(),
                    limit: self.max_participants,
                });
            }

            if let Some(registry) = &self.registry {
                if !registry.record_join(connection_id, session_id).await {
                    if session.roster.is_empty() {
                        self.discard(session_id, &handle, &mut session).await;
                    }
                    return Err(SessionError::UnknownConnection(connection_id));
                }
            }

            let created = session.roster.is_empty();
            let replaced = existing.map(|idx| session.roster.remove(idx));
            session
                .roster
                .push(Participant::new(participant_id, display_name, connection_id));

            let orphaned_connection = replaced
                .as_ref()
                .map(|stale| stale.connection_id)
                .filter(|&stale_conn| {
                    stale_conn != connection_id
                        && !session.roster.iter().any(|p| p.connection_id == stale_conn)
                });
            if let (Some(registry), Some(stale_conn)) = (&self.registry, orphaned_connection) {
                registry.record_leave(stale_conn, session_id).await;
            }

            return Ok(JoinOutcome {
                roster: session.roster.clone(),
                replaced,
                orphaned_connection,
                created,
            });
        }
    }

    /// Remove a participant by id. `None` when the session or participant
    /// is unknown.
    pub async fn leave(&self, session_id: &str, participant_id: &str) -> Option<LeaveOutcome> {
        self.remove_where(session_id, |p| p.participant_id == participant_id)
            .await
    }

    /// Remove every entry bound to a connection.
    pub async fn leave_connection(
        &self,
        session_id: &str,
        connection_id: ConnectionId,
    ) -> Option<LeaveOutcome> {
        self.remove_where(session_id, |p| p.connection_id == connection_id)
            .await
    }

    async fn remove_where<F>(&self, session_id: &str, matches: F) -> Option<LeaveOutcome>
    where
        F: Fn(&Participant) -> bool,
    {
        let handle = self.get(session_id).await?;
        let mut session = handle.lock().await;
        if session.closed {
            return None;
        }

        let (removed, kept): (Vec<_>, Vec<_>) = session.roster.drain(..).partition(|p| matches(p));
        session.roster = kept;
        if removed.is_empty() {
            return None;
        }

        let mut departed_connections: Vec<ConnectionId> = Vec::new();
        for p in &removed {
            let still_present = session.roster.iter().any(|r| r.connection_id == p.connection_id);
            if !still_present && !departed_connections.contains(&p.connection_id) {
                departed_connections.push(p.connection_id);
            }
        }

        if let Some(registry) = &self.registry {
            for conn in &departed_connections {
                registry.record_leave(*conn, session_id).await;
            }
        }

        let session_closed = session.roster.is_empty();
        if session_closed {
            self.discard(session_id, &handle, &mut session).await;
        }

        Some(LeaveOutcome {
            removed,
            roster: session.roster.clone(),
            departed_connections,
            session_closed,
        })
    }

    /// Close an empty session and drop its handle, unless a newer handle
    /// already took its place. Caller holds the session lock.
    async fn discard(&self, session_id: &str, handle: &Arc<Mutex<Session>>, session: &mut Session) {
        session.closed = true;
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current, handle))
        {
            sessions.remove(session_id);
        }
    }

    /// Current roster; empty when the session does not exist.
    pub async fn roster(&self, session_id: &str) -> Vec<Participant> {
        self.snapshot(session_id).await.0
    }

    /// Roster plus the distinct connections it is bound to, taken under one lock.
    pub async fn snapshot(&self, session_id: &str) -> (Vec<Participant>, Vec<ConnectionId>) {
        let Some(handle) = self.get(session_id).await else {
            return (Vec::new(), Vec::new());
        };
        let session = handle.lock().await;
        if session.closed {
            return (Vec::new(), Vec::new());
        }
        let mut connections: Vec<ConnectionId> = Vec::with_capacity(session.roster.len());
        for p in &session.roster {
            if !connections.contains(&p.connection_id) {
                connections.push(p.connection_id);
            }
        }
        (session.roster.clone(), connections)
    }

    /// Distinct connections currently in the session.
    pub async fn connections(&self, session_id: &str) -> Vec<ConnectionId> {
        self.snapshot(session_id).await.1
    }

    /// The participant a connection is joined as, if any.
    pub async fn participant_for_connection(
        &self,
        session_id: &str,
        connection_id: ConnectionId,
    ) -> Option<Participant> {
        let handle = self.get(session_id).await?;
        let session = handle.lock().await;
        session
            .roster
            .iter()
            .find(|p| p.connection_id == connection_id)
            .cloned()
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn active_sessions(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub fn max_participants(&self) -> usize {
        self.max_participants
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn directory() -> SessionDirectory {
        SessionDirectory::new(100)
    }

    fn tracked() -> (Arc<ConnectionRegistry>, SessionDirectory) {
        let registry = Arc::new(ConnectionRegistry::new());
        let dir = SessionDirectory::with_registry(100, registry.clone());
        (registry, dir)
    }

    async fn connection(registry: &ConnectionRegistry) -> ConnectionId {
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        registry.register(tx).await
    }

    /// Unregister the connection and drop it from every roster it was in.
    async fn teardown(registry: &ConnectionRegistry, dir: &SessionDirectory, conn: ConnectionId) {
        for session_id in registry.unregister(conn).await {
            dir.leave_connection(&session_id, conn).await;
        }
    }

    async fn recorded(registry: &ConnectionRegistry, conn: ConnectionId, session: &str) -> bool {
        registry
            .sessions(conn)
            .await
            .is_some_and(|sessions| sessions.contains(session))
    }

    #[tokio::test]
    async fn test_first_join_creates_session() {
        let dir = directory();
        let conn = Uuid::new_v4();

        let outcome = dir.join("doc-42", "alice", "Alice", conn).await.unwrap();
        assert!(outcome.created);
        assert!(outcome.replaced.is_none());
        assert_eq!(outcome.roster, vec![Participant::new("alice", "Alice", conn)]);
        assert!(dir.contains("doc-42").await);
        assert_eq!(dir.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_rejoin_replaces_stale_entry() {
        let dir = directory();
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();

        dir.join("s", "p", "Alice", c1).await.unwrap();
        let outcome = dir.join("s", "p", "Alice", c2).await.unwrap();

        assert_eq!(outcome.roster.len(), 1);
        assert_eq!(outcome.roster[0].connection_id, c2);
        assert_eq!(outcome.replaced.unwrap().connection_id, c1);
        assert_eq!(outcome.orphaned_connection, Some(c1));
        assert!(!outcome.created);
    }

    #[tokio::test]
    async fn test_rejoin_same_connection_not_orphaned() {
        let dir = directory();
        let conn = Uuid::new_v4();

        dir.join("s", "p", "Alice", conn).await.unwrap();
        let outcome = dir.join("s", "p", "Alice (renamed)", conn).await.unwrap();

        assert_eq!(outcome.roster.len(), 1);
        assert_eq!(outcome.roster[0].display_name, "Alice (renamed)");
        assert!(outcome.orphaned_connection.is_none());
    }

    #[tokio::test]
    async fn test_rejoin_moves_to_end_of_roster() {
        let dir = directory();
        dir.join("s", "alice", "Alice", Uuid::new_v4()).await.unwrap();
        dir.join("s", "bob", "Bob", Uuid::new_v4()).await.unwrap();
        let outcome = dir.join("s", "alice", "Alice", Uuid::new_v4()).await.unwrap();

        let ids: Vec<&str> = outcome.roster.iter().map(|p| p.participant_id.as_str()).collect();
        assert_eq!(ids, vec!["bob", "alice"]);
    }

    #[tokio::test]
    async fn test_join_rejects_empty_fields() {
        let dir = directory();
        let conn = Uuid::new_v4();

        assert_eq!(
            dir.join("", "p", "P", conn).await.unwrap_err(),
            SessionError::InvalidJoinRequest("session_id")
        );
        assert_eq!(
            dir.join("s", "", "P", conn).await.unwrap_err(),
            SessionError::InvalidJoinRequest("participant_id")
        );
        assert_eq!(
            dir.join("s", "p", "", conn).await.unwrap_err(),
            SessionError::InvalidJoinRequest("display_name")
        );
        assert_eq!(
            dir.join("s", "p", "P", Uuid::nil()).await.unwrap_err(),
            SessionError::InvalidJoinRequest("connection_id")
        );
        assert_eq!(dir.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_leave_unknown_is_noop() {
        let dir = directory();
        assert!(dir.leave("missing", "p").await.is_none());

        dir.join("s", "alice", "Alice", Uuid::new_v4()).await.unwrap();
        assert!(dir.leave("s", "nobody").await.is_none());
        assert_eq!(dir.roster("s").await.len(), 1);
    }

    #[tokio::test]
    async fn test_last_leave_deletes_session_and_rejoin_recreates() {
        let dir = directory();
        let conn = Uuid::new_v4();
        dir.join("s", "p", "P", conn).await.unwrap();

        let outcome = dir.leave("s", "p").await.unwrap();
        assert!(outcome.session_closed);
        assert!(outcome.roster.is_empty());
        assert_eq!(outcome.departed_connections, vec![conn]);
        assert!(!dir.contains("s").await);
        assert!(dir.roster("s").await.is_empty());

        let again = dir.join("s", "p", "P", conn).await.unwrap();
        assert!(again.created);
        assert_eq!(dir.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_leave_connection_spares_fresh_entry() {
        let dir = directory();
        let stale = Uuid::new_v4();
        let fresh = Uuid::new_v4();

        dir.join("s", "p", "P", stale).await.unwrap();
        dir.join("s", "p", "P", fresh).await.unwrap();

        assert!(dir.leave_connection("s", stale).await.is_none());
        assert_eq!(dir.roster("s").await[0].connection_id, fresh);
    }

    #[tokio::test]
    async fn test_leave_connection_removes_all_its_entries() {
        let dir = directory();
        let shared = Uuid::new_v4();
        let other = Uuid::new_v4();
        dir.join("s", "p1", "P1", shared).await.unwrap();
        dir.join("s", "p2", "P2", shared).await.unwrap();
        dir.join("s", "p3", "P3", other).await.unwrap();

        let outcome = dir.leave_connection("s", shared).await.unwrap();
        assert_eq!(outcome.removed.len(), 2);
        assert_eq!(outcome.departed_connections, vec![shared]);
        assert_eq!(outcome.roster.len(), 1);
        assert!(!outcome.session_closed);
    }

    #[tokio::test]
    async fn test_session_full() {
        let dir = SessionDirectory::new(2);
        dir.join("s", "a", "A", Uuid::new_v4()).await.unwrap();
        dir.join("s", "b", "B", Uuid::new_v4()).await.unwrap();

        let err = dir.join("s", "c", "C", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, SessionError::SessionFull { limit: 2, .. }));

        // Rejoin of an existing participant is always allowed.
        assert!(dir.join("s", "a", "A", Uuid::new_v4()).await.is_ok());
        assert_eq!(dir.roster("s").await.len(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_dedups_connections() {
        let dir = directory();
        let conn = Uuid::new_v4();
        dir.join("s", "p1", "P1", conn).await.unwrap();
        dir.join("s", "p2", "P2", conn).await.unwrap();

        let (roster, connections) = dir.snapshot("s").await;
        assert_eq!(roster.len(), 2);
        assert_eq!(connections, vec![conn]);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let dir = directory();
        dir.join("a", "p", "P", Uuid::new_v4()).await.unwrap();
        dir.join("b", "q", "Q", Uuid::new_v4()).await.unwrap();

        dir.leave("a", "p").await.unwrap();
        assert!(!dir.contains("a").await);
        assert_eq!(dir.roster("b").await.len(), 1);

        let active = dir.active_sessions().await;
        assert_eq!(active, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_join_leave_never_duplicates() {
        let dir = Arc::new(directory());
        let mut handles = Vec::new();
        for i in 0..64 {
            let dir = dir.clone();
            handles.push(tokio::spawn(async move {
                let conn = Uuid::new_v4();
                dir.join("s", "p", "P", conn).await.unwrap();
                if i % 2 == 0 {
                    dir.leave("s", "p").await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let roster = dir.roster("s").await;
        assert!(roster.len() <= 1);
        assert_eq!(dir.contains("s").await, !roster.is_empty());
    }

    #[tokio::test]
    async fn test_interleaved_rejoins_keep_registry_in_step() {
        let (registry, dir) = tracked();
        let c1 = connection(&registry).await;
        let c2 = connection(&registry).await;

        // The second connection's join lands first, then the first one replaces it.
        dir.join("s", "p", "P", c2).await.unwrap();
        let outcome = dir.join("s", "p", "P", c1).await.unwrap();
        assert_eq!(outcome.orphaned_connection, Some(c2));

        assert_eq!(dir.roster("s").await[0].connection_id, c1);
        assert!(recorded(&registry, c1, "s").await);
        assert!(!recorded(&registry, c2, "s").await);

        teardown(&registry, &dir, c2).await;
        assert_eq!(dir.roster("s").await.len(), 1);
        teardown(&registry, &dir, c1).await;
        assert!(dir.roster("s").await.is_empty());
        assert!(!dir.contains("s").await);
    }

    #[tokio::test]
    async fn test_leave_clears_registry_record() {
        let (registry, dir) = tracked();
        let shared = connection(&registry).await;
        dir.join("s", "p1", "P1", shared).await.unwrap();
        dir.join("s", "p2", "P2", shared).await.unwrap();

        dir.leave("s", "p1").await.unwrap();
        assert!(recorded(&registry, shared, "s").await);
        dir.leave("s", "p2").await.unwrap();
        assert!(!recorded(&registry, shared, "s").await);
    }

    #[tokio::test]
    async fn test_join_from_unknown_connection() {
        let (_registry, dir) = tracked();
        let err = dir.join("s", "p", "P", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, SessionError::UnknownConnection(_)));
        assert!(!dir.contains("s").await);
        assert_eq!(dir.session_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_rejoins_leave_no_ghost_after_teardown() {
        for _ in 0..20 {
            let (registry, dir) = tracked();
            let dir = Arc::new(dir);

            let mut conns = Vec::new();
            for _ in 0..8 {
                conns.push(connection(&registry).await);
            }

            let mut handles = Vec::new();
            for &conn in &conns {
                let dir = dir.clone();
                handles.push(tokio::spawn(async move {
                    for _ in 0..10 {
                        dir.join("s", "p", "P", conn).await.unwrap();
                        tokio::task::yield_now().await;
                    }
                }));
            }
            for h in handles {
                h.await.unwrap();
            }

            let roster = dir.roster("s").await;
            assert_eq!(roster.len(), 1);
            for &conn in &conns {
                assert_eq!(
                    recorded(&registry, conn, "s").await,
                    conn == roster[0].connection_id
                );
            }

            for &conn in &conns {
                teardown(&registry, &dir, conn).await;
            }
            assert!(!dir.contains("s").await);
        }
    }
}
