//! # collab-session: Real-time session manager for collaborative editing
//!
//! Tracks which participants are present in which document session, relays
//! editing, chat and presence events to the right connections, and cleans
//! up when participants leave or their connection drops.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   JSON over WebSocket   ┌───────────────┐
//! │ Client      │ ◄─────────────────────► │ CollabServer  │
//! │ (per user)  │                         │ (task/socket) │
//! └─────────────┘                         └───────┬───────┘
//!                                                 │
//!                                         ┌───────┴────────┐
//!                                         │ SessionManager │
//!                                         └───────┬────────┘
//!                    ┌────────────────────────────┼──────────────────┐
//!                    ▼                            ▼                  ▼
//!           ┌──────────────────┐      ┌──────────────────┐  ┌────────────────┐
//!           │ConnectionRegistry│      │ SessionDirectory │  │BroadcastRouter │
//!           │ conn → sessions  │      │ session → roster │  │ room / others  │
//!           └──────────────────┘      └──────────────────┘  └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Event vocabulary and JSON wire format
//! - [`registry`]: Live connections and their joined sessions
//! - [`directory`]: Session rosters (presence), one lock per session
//! - [`router`]: Room-scoped fan-out without history
//! - [`manager`]: Join/leave/relay and disconnect cascade
//! - [`store`]: Document, version and chat persistence collaborators
//! - [`identity`]: Bearer credential resolution
//! - [`server`]: WebSocket server
//!
//! Concurrent edits are not merged: `operation` events carry whole-document
//! snapshots and the last one relayed wins.

pub mod protocol;
pub mod registry;
pub mod directory;
pub mod router;
pub mod manager;
pub mod store;
pub mod identity;
pub mod server;

// Re-exports for convenience
pub use protocol::{
    ClientEvent, ConnectionId, FanOut, Participant, ParticipantId, ProtocolError, ServerEvent,
    SessionId,
};
pub use registry::{ConnectionInfo, ConnectionRegistry, Outbound};
pub use directory::{JoinOutcome, LeaveOutcome, SessionDirectory, SessionError};
pub use router::{BroadcastRouter, RouterStats};
pub use manager::SessionManager;
pub use store::{
    ChatKind, ChatRecord, ChatStore, DocumentSnapshot, DocumentStore, MemoryChatStore,
    MemoryDocumentStore, StoreError, VersionRecord,
};
pub use identity::{Identity, IdentityError, IdentityVerifier, StaticIdentityVerifier};
pub use server::{CollabServer, ConfigError, ServerConfig, ServerStats};
