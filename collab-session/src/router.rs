//! Room-scoped fan-out.
//!
//! Recipients are snapshotted from the directory (under the session lock),
//! outbound queues are looked up in the registry (under the registry read
//! lock), and only then is the event pushed into each queue. No lock is held
//! while delivering. Events are fire-and-forget: nothing is buffered for
//! connections that join later.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;

use crate::directory::SessionDirectory;
use crate::protocol::{ConnectionId, ServerEvent};
use crate::registry::ConnectionRegistry;

/// Delivery counters.
#[derive(Debug, Clone, Default)]
pub struct RouterStats {
    pub events_routed: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
}

#[derive(Default)]
struct AtomicRouterStats {
    events_routed: AtomicU64,
    frames_delivered: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Fans events out to the connections of a session.
pub struct BroadcastRouter {
    registry: Arc<ConnectionRegistry>,
    directory: Arc<SessionDirectory>,
    stats: AtomicRouterStats,
}

impl BroadcastRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, directory: Arc<SessionDirectory>) -> Self {
        Self {
            registry,
            directory,
            stats: AtomicRouterStats::default(),
        }
    }

    /// Deliver to every connection in the session, originator included.
    pub async fn to_room(&self, session_id: &str, event: &ServerEvent) -> usize {
        let recipients = self.directory.connections(session_id).await;
        log::debug!(
            "Routing {} to room {session_id} ({} connections)",
            event.name(),
            recipients.len()
        );
        self.deliver(&recipients, event).await
    }

    /// Deliver to every connection in the session except `sender`.
    pub async fn to_others(
        &self,
        session_id: &str,
        sender: ConnectionId,
        event: &ServerEvent,
    ) -> usize {
        let mut recipients = self.directory.connections(session_id).await;
        recipients.retain(|c| *c != sender);
        log::trace!(
            "Routing {} from {sender} to {} others in {session_id}",
            event.name(),
            recipients.len()
        );
        self.deliver(&recipients, event).await
    }

    /// Deliver to a single connection.
    pub async fn to_connection(&self, connection_id: ConnectionId, event: &ServerEvent) -> bool {
        self.deliver(&[connection_id], event).await == 1
    }

    /// Broadcast the current roster to the whole session.
    ///
    /// Roster and recipients come from the same snapshot, so the payload
    /// always matches the membership at the moment of broadcast.
    pub async fn presence(&self, session_id: &str) -> usize {
        let (participants, recipients) = self.directory.snapshot(session_id).await;
        let event = ServerEvent::Presence {
            session_id: session_id.to_owned(),
            participants,
        };
        self.deliver(&recipients, &event).await
    }

    /// Serialize once and push into each recipient's outbound queue.
    ///
    /// Returns the number of queues that accepted the frame. A full queue
    /// drops the frame for that recipient only.
    pub async fn deliver(&self, recipients: &[ConnectionId], event: &ServerEvent) -> usize {
        if recipients.is_empty() {
            return 0;
        }
        let frame = match event.encode() {
            Ok(text) => Arc::new(text),
            Err(e) => {
                log::warn!("Failed to serialize {} event: {e}", event.name());
                return 0;
            }
        };
        self.stats.events_routed.fetch_add(1, Ordering::Relaxed);

        let queues = self.registry.outbound_for(recipients).await;
        let mut delivered = 0;
        for (connection_id, outbound) in queues {
            match outbound.try_send(Arc::clone(&frame)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "Outbound queue full for {connection_id}, dropped {} event",
                        event.name()
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Connection {connection_id} closing, dropped {}", event.name());
                }
            }
        }
        self.stats
            .frames_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            events_routed: self.stats.events_routed.load(Ordering::Relaxed),
            frames_delivered: self.stats.frames_delivered.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}
