//! Session lifecycle: join, leave, relay and disconnect cascade.
//!
//! ```text
//! connection task ──► SessionManager::dispatch(conn, ClientEvent)
//!                          │
//!          ┌───────────────┼──────────────────┐
//!          ▼               ▼                  ▼
//!   ConnectionRegistry  SessionDirectory  BroadcastRouter ──► outbound queues
//!                                             │
//!                                   (spawned) ChatStore / DocumentStore
//! ```
//!
//! One `SessionManager` is created per server and shared by reference with
//! every connection handler. Each connection dispatches its own events
//! sequentially, so per-sender ordering holds; events from different senders
//! interleave freely.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::directory::{LeaveOutcome, SessionDirectory, SessionError};
use crate::identity::Identity;
use crate::protocol::{ClientEvent, ConnectionId, FanOut, Participant, ServerEvent};
use crate::registry::{ConnectionRegistry, Outbound};
use crate::router::BroadcastRouter;
use crate::store::{ChatKind, ChatRecord, ChatStore, DocumentStore, VersionRecord};

/// Shared session state for one server.
pub struct SessionManager {
    registry: Arc<ConnectionRegistry>,
    directory: Arc<SessionDirectory>,
    router: BroadcastRouter,
    documents: Option<Arc<dyn DocumentStore>>,
    chat: Option<Arc<dyn ChatStore>>,
}

impl SessionManager {
    pub fn new(max_participants_per_session: usize) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let directory = Arc::new(SessionDirectory::with_registry(
            max_participants_per_session,
            registry.clone(),
        ));
        let router = BroadcastRouter::new(registry.clone(), directory.clone());
        Self {
            registry,
            directory,
            router,
            documents: None,
            chat: None,
        }
    }

    /// Persist saved versions to `store`.
    pub fn with_document_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.documents = Some(store);
        self
    }

    /// Persist relayed chat messages to `store`.
    pub fn with_chat_store(mut self, store: Arc<dyn ChatStore>) -> Self {
        self.chat = Some(store);
        self
    }

    /// Register a new transport connection.
    pub async fn connect(&self, outbound: Outbound) -> ConnectionId {
        self.registry.register(outbound).await
    }

    /// Join `participant_id` to a session on behalf of `connection_id`.
    ///
    /// Sends `joined-session` to the joiner, `user-joined` to the rest of
    /// the room and a fresh `presence` to everyone. Returns the post-join
    /// roster. On error nothing is mutated and nothing is broadcast.
    ///
    /// The directory updates the registry under the session lock, so racing
    /// rejoins of one participant always leave the roster entry and the
    /// registry record on the same connection.
    pub async fn join(
        &self,
        session_id: &str,
        participant_id: &str,
        display_name: &str,
        connection_id: ConnectionId,
    ) -> Result<Vec<Participant>, SessionError> {
        let outcome = self
            .directory
            .join(session_id, participant_id, display_name, connection_id)
            .await?;

        if outcome.created {
            log::info!("Session {session_id} created");
        }
        if let Some(stale) = &outcome.replaced {
            log::debug!(
                "Replaced stale entry for {participant_id} in {session_id} (was {})",
                stale.connection_id
            );
        }
        log::info!("Participant {display_name} ({participant_id}) joined session {session_id}");

        self.router
            .to_connection(
                connection_id,
                &ServerEvent::JoinedSession {
                    session_id: session_id.to_owned(),
                    participants: outcome.roster.clone(),
                },
            )
            .await;
        self.router
            .to_others(
                session_id,
                connection_id,
                &ServerEvent::UserJoined {
                    session_id: session_id.to_owned(),
                    participant_id: participant_id.to_owned(),
                    display_name: display_name.to_owned(),
                },
            )
            .await;
        self.router.presence(session_id).await;

        Ok(outcome.roster)
    }

    /// Remove a participant from a session.
    ///
    /// Unknown sessions or participants are a no-op and return `false`.
    pub async fn leave(&self, session_id: &str, participant_id: &str) -> bool {
        match self.directory.leave(session_id, participant_id).await {
            Some(outcome) => {
                self.finish_leave(session_id, outcome).await;
                true
            }
            None => {
                log::debug!("Ignoring leave of {participant_id} from {session_id}: not joined");
                false
            }
        }
    }

    /// Tear down a connection: unregister it and leave every session it
    /// had joined, notifying the remaining members.
    ///
    /// Returns the number of sessions the connection was removed from.
    pub async fn disconnect_cascade(&self, connection_id: ConnectionId) -> usize {
        let sessions = self.registry.unregister(connection_id).await;
        let mut cleaned = 0;
        for session_id in sessions {
            if let Some(outcome) = self.directory.leave_connection(&session_id, connection_id).await
            {
                for p in &outcome.removed {
                    log::info!(
                        "Participant {} ({}) disconnected from session {session_id}",
                        p.display_name,
                        p.participant_id
                    );
                }
                self.finish_leave(&session_id, outcome).await;
                cleaned += 1;
            }
        }
        cleaned
    }

    async fn finish_leave(&self, session_id: &str, outcome: LeaveOutcome) {
        for p in &outcome.removed {
            log::info!("Participant {} left session {session_id}", p.participant_id);
            self.router
                .to_room(
                    session_id,
                    &ServerEvent::UserLeft {
                        session_id: session_id.to_owned(),
                        participant_id: p.participant_id.clone(),
                    },
                )
                .await;
        }
        self.router.presence(session_id).await;
        if outcome.session_closed {
            log::info!("Session {session_id} removed (empty)");
        }
    }

    /// Apply one validated inbound event from `connection_id`.
    ///
    /// `identity` is the verified identity of the connection, when the
    /// server requires credentials. An authenticated connection can only
    /// join or leave as itself, and its cursor, selection and typing events
    /// carry its verified id. Failures are reported to the sender as an
    /// `error` event; nothing here terminates the connection.
    pub async fn dispatch(
        &self,
        connection_id: ConnectionId,
        mut event: ClientEvent,
        identity: Option<&Identity>,
    ) {
        if let Some(identity) = identity {
            if let Err(err) = Self::authorize(&mut event, identity) {
                self.reject(connection_id, err).await;
                return;
            }
        }

        match event {
            ClientEvent::JoinSession { session_id, participant_id, display_name } => {
                if let Err(err) = self
                    .join(&session_id, &participant_id, &display_name, connection_id)
                    .await
                {
                    self.reject(connection_id, err).await;
                }
            }
            ClientEvent::LeaveSession { session_id, participant_id } => {
                self.leave(&session_id, &participant_id).await;
            }
            relayed => self.relay(connection_id, relayed).await,
        }
    }

    /// Bind an event to the verified participant.
    fn authorize(event: &mut ClientEvent, identity: &Identity) -> Result<(), SessionError> {
        match event {
            ClientEvent::JoinSession { participant_id, .. }
            | ClientEvent::LeaveSession { participant_id, .. } => {
                if *participant_id != identity.participant_id {
                    return Err(SessionError::IdentityMismatch {
                        verified: identity.participant_id.clone(),
                        claimed: participant_id.clone(),
                    });
                }
            }
            ClientEvent::Cursor { participant_id, .. }
            | ClientEvent::Selection { participant_id, .. }
            | ClientEvent::Typing { participant_id, .. } => {
                participant_id.clone_from(&identity.participant_id);
            }
            ClientEvent::Operation { .. }
            | ClientEvent::Chat { .. }
            | ClientEvent::VersionSaved { .. } => {}
        }
        Ok(())
    }

    async fn relay(&self, connection_id: ConnectionId, event: ClientEvent) {
        let fan_out = event.fan_out();
        let session_id = event.session_id().to_owned();
        let Some(outbound) = event.into_relay() else {
            return;
        };

        let delivered = match fan_out {
            FanOut::Room => self.router.to_room(&session_id, &outbound).await,
            FanOut::Others => self.router.to_others(&session_id, connection_id, &outbound).await,
        };
        log::trace!("{} in {session_id} delivered to {delivered}", outbound.name());

        match outbound {
            ServerEvent::Chat { message, .. } => {
                self.persist_chat(connection_id, session_id, message).await
            }
            ServerEvent::VersionSaved { version, .. } => {
                self.persist_version(connection_id, session_id, version).await
            }
            _ => {}
        }
    }

    /// Name to attribute a stored record to: the sender's participant id in
    /// the session, or the `author` field the client supplied.
    async fn author_of(&self, connection_id: ConnectionId, session_id: &str, body: &Value) -> Option<String> {
        if let Some(p) = self
            .directory
            .participant_for_connection(session_id, connection_id)
            .await
        {
            return Some(p.participant_id);
        }
        body.get("author").and_then(Value::as_str).map(str::to_owned)
    }

    async fn persist_chat(&self, connection_id: ConnectionId, session_id: String, message: Value) {
        let Some(store) = self.chat.clone() else {
            return;
        };
        let Some(content) = message.get("content").and_then(Value::as_str) else {
            log::debug!("Chat in {session_id} has no text content, not persisted");
            return;
        };
        let Some(author) = self.author_of(connection_id, &session_id, &message).await else {
            log::debug!("Chat in {session_id} has no author, not persisted");
            return;
        };
        let kind = match message.get("type").and_then(Value::as_str) {
            Some("system") => ChatKind::System,
            _ => ChatKind::Message,
        };
        let record = ChatRecord {
            session_id,
            author,
            content: content.to_owned(),
            kind,
            timestamp: Utc::now(),
        };
        tokio::spawn(async move {
            let session_id = record.session_id.clone();
            if let Err(e) = store.append(record).await {
                log::error!("Failed to persist chat message for session {session_id}: {e}");
            }
        });
    }

    async fn persist_version(&self, connection_id: ConnectionId, session_id: String, version: Value) {
        let Some(store) = self.documents.clone() else {
            return;
        };
        let Some(content) = version.get("content").and_then(Value::as_str) else {
            log::debug!("Version in {session_id} has no content, not persisted");
            return;
        };
        let Some(author) = self.author_of(connection_id, &session_id, &version).await else {
            log::debug!("Version in {session_id} has no author, not persisted");
            return;
        };
        let record = VersionRecord {
            content: content.to_owned(),
            author,
            message: version
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            timestamp: Utc::now(),
        };
        tokio::spawn(async move {
            if let Err(e) = store.append_version(&session_id, record).await {
                log::error!("Failed to persist version for document {session_id}: {e}");
            }
        });
    }

    /// Report a failure to a single connection as an `error` event.
    pub async fn reject(&self, connection_id: ConnectionId, err: impl std::fmt::Display) {
        let message = err.to_string();
        log::warn!("Rejecting request from {connection_id}: {message}");
        self.router
            .to_connection(connection_id, &ServerEvent::error(message))
            .await;
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn directory(&self) -> &Arc<SessionDirectory> {
        &self.directory
    }

    pub fn router(&self) -> &BroadcastRouter {
        &self.router
    }
}
