//! JSON event protocol for session collaboration.
//!
//! Wire format (one JSON text frame per event):
//! ```text
//! { "event": "join-session", "data": { "session_id": "doc-42", ... } }
//! ```
//!
//! Inbound frames are decoded in two steps. First into [`InboundFrame`],
//! where every field is optional, then validated into the closed
//! [`ClientEvent`] enum. Missing fields surface as
//! [`ProtocolError::MissingField`] so the caller can decide between
//! answering with an `error` event (join) and silently dropping (all others).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Document identifier; also the room name.
pub type SessionId = String;

/// Client-supplied (or identity-verified) participant identifier.
pub type ParticipantId = String;

/// Registry-allocated identity of one transport connection.
pub type ConnectionId = Uuid;

/// Roster entry for one participant in one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub connection_id: ConnectionId,
}

impl Participant {
    pub fn new(
        participant_id: impl Into<ParticipantId>,
        display_name: impl Into<String>,
        connection_id: ConnectionId,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            display_name: display_name.into(),
            connection_id,
        }
    }
}

/// Which recipients an inbound event is relayed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOut {
    /// Everyone in the session, sender included
    Room,
    /// Everyone in the session except the sending connection
    Others,
}

/// Raw inbound fields before validation.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawFields {
    session_id: Option<String>,
    participant_id: Option<String>,
    display_name: Option<String>,
    payload: Option<Value>,
    position: Option<Value>,
    selection: Option<Value>,
    message: Option<Value>,
    version: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
enum InboundFrame {
    JoinSession(RawFields),
    LeaveSession(RawFields),
    Operation(RawFields),
    Cursor(RawFields),
    Selection(RawFields),
    Typing(RawFields),
    Chat(RawFields),
    VersionSaved(RawFields),
}

/// Validated inbound event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinSession {
        session_id: SessionId,
        participant_id: ParticipantId,
        display_name: String,
    },
    LeaveSession {
        session_id: SessionId,
        participant_id: ParticipantId,
    },
    /// Whole-document edit snapshot; relayed as-is, last relay wins
    Operation {
        session_id: SessionId,
        payload: Value,
    },
    Cursor {
        session_id: SessionId,
        participant_id: ParticipantId,
        position: Value,
    },
    Selection {
        session_id: SessionId,
        participant_id: ParticipantId,
        selection: Value,
    },
    Typing {
        session_id: SessionId,
        participant_id: ParticipantId,
    },
    Chat {
        session_id: SessionId,
        message: Value,
    },
    VersionSaved {
        session_id: SessionId,
        version: Value,
    },
}

fn require_str(
    value: Option<String>,
    event: &'static str,
    field: &'static str,
) -> Result<String, ProtocolError> {
    match value {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(ProtocolError::MissingField { event, field }),
    }
}

fn require_value(
    value: Option<Value>,
    event: &'static str,
    field: &'static str,
) -> Result<Value, ProtocolError> {
    match value {
        Some(Value::Null) | None => Err(ProtocolError::MissingField { event, field }),
        Some(Value::String(s)) if s.is_empty() => {
            Err(ProtocolError::MissingField { event, field })
        }
        Some(v) => Ok(v),
    }
}

impl ClientEvent {
    /// Decode and validate a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let frame: InboundFrame = serde_json::from_str(text)?;
        Self::validate(frame)
    }

    fn validate(frame: InboundFrame) -> Result<Self, ProtocolError> {
        Ok(match frame {
            InboundFrame::JoinSession(f) => {
                const EV: &str = "join-session";
                ClientEvent::JoinSession {
                    session_id: require_str(f.session_id, EV, "session_id")?,
                    participant_id: require_str(f.participant_id, EV, "participant_id")?,
                    display_name: require_str(f.display_name, EV, "display_name")?,
                }
            }
            InboundFrame::LeaveSession(f) => {
                const EV: &str = "leave-session";
                ClientEvent::LeaveSession {
                    session_id: require_str(f.session_id, EV, "session_id")?,
                    participant_id: require_str(f.participant_id, EV, "participant_id")?,
                }
            }
            InboundFrame::Operation(f) => {
                const EV: &str = "operation";
                ClientEvent::Operation {
                    session_id: require_str(f.session_id, EV, "session_id")?,
                    payload: require_value(f.payload, EV, "payload")?,
                }
            }
            InboundFrame::Cursor(f) => {
                const EV: &str = "cursor";
                ClientEvent::Cursor {
                    session_id: require_str(f.session_id, EV, "session_id")?,
                    participant_id: require_str(f.participant_id, EV, "participant_id")?,
                    position: require_value(f.position, EV, "position")?,
                }
            }
            InboundFrame::Selection(f) => {
                const EV: &str = "selection";
                ClientEvent::Selection {
                    session_id: require_str(f.session_id, EV, "session_id")?,
                    participant_id: require_str(f.participant_id, EV, "participant_id")?,
                    selection: require_value(f.selection, EV, "selection")?,
                }
            }
            InboundFrame::Typing(f) => {
                const EV: &str = "typing";
                ClientEvent::Typing {
                    session_id: require_str(f.session_id, EV, "session_id")?,
                    participant_id: require_str(f.participant_id, EV, "participant_id")?,
                }
            }
            InboundFrame::Chat(f) => {
                const EV: &str = "chat";
                ClientEvent::Chat {
                    session_id: require_str(f.session_id, EV, "session_id")?,
                    message: require_value(f.message, EV, "message")?,
                }
            }
            InboundFrame::VersionSaved(f) => {
                const EV: &str = "version-saved";
                ClientEvent::VersionSaved {
                    session_id: require_str(f.session_id, EV, "session_id")?,
                    version: require_value(f.version, EV, "version")?,
                }
            }
        })
    }

    /// Serialize to a text frame (client side and tests).
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Serialization)
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinSession { .. } => "join-session",
            Self::LeaveSession { .. } => "leave-session",
            Self::Operation { .. } => "operation",
            Self::Cursor { .. } => "cursor",
            Self::Selection { .. } => "selection",
            Self::Typing { .. } => "typing",
            Self::Chat { .. } => "chat",
            Self::VersionSaved { .. } => "version-saved",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::JoinSession { session_id, .. }
            | Self::LeaveSession { session_id, .. }
            | Self::Operation { session_id, .. }
            | Self::Cursor { session_id, .. }
            | Self::Selection { session_id, .. }
            | Self::Typing { session_id, .. }
            | Self::Chat { session_id, .. }
            | Self::VersionSaved { session_id, .. } => session_id,
        }
    }

    /// Delivery policy for the event and its notifications.
    pub fn fan_out(&self) -> FanOut {
        match self {
            Self::Operation { .. }
            | Self::Cursor { .. }
            | Self::Selection { .. }
            | Self::Typing { .. } => FanOut::Others,
            Self::JoinSession { .. }
            | Self::LeaveSession { .. }
            | Self::Chat { .. }
            | Self::VersionSaved { .. } => FanOut::Room,
        }
    }

    /// The outbound event relayed for this inbound one.
    ///
    /// Join and leave are not relayed verbatim; the manager produces
    /// `joined-session`, `user-joined`, `user-left` and `presence` for them.
    pub fn into_relay(self) -> Option<ServerEvent> {
        match self {
            Self::JoinSession { .. } | Self::LeaveSession { .. } => None,
            Self::Operation { session_id, payload } => {
                Some(ServerEvent::Operation { session_id, payload })
            }
            Self::Cursor { session_id, participant_id, position } => Some(ServerEvent::Cursor {
                session_id,
                participant_id,
                position,
            }),
            Self::Selection { session_id, participant_id, selection } => {
                Some(ServerEvent::Selection { session_id, participant_id, selection })
            }
            Self::Typing { session_id, participant_id } => {
                Some(ServerEvent::Typing { session_id, participant_id })
            }
            Self::Chat { session_id, message } => Some(ServerEvent::Chat { session_id, message }),
            Self::VersionSaved { session_id, version } => {
                Some(ServerEvent::VersionSaved { session_id, version })
            }
        }
    }
}

/// Outbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Confirmation to the joiner, with the post-join roster
    JoinedSession {
        session_id: SessionId,
        participants: Vec<Participant>,
    },
    /// Full roster snapshot
    Presence {
        session_id: SessionId,
        participants: Vec<Participant>,
    },
    UserJoined {
        session_id: SessionId,
        participant_id: ParticipantId,
        display_name: String,
    },
    UserLeft {
        session_id: SessionId,
        participant_id: ParticipantId,
    },
    Operation {
        session_id: SessionId,
        payload: Value,
    },
    Cursor {
        session_id: SessionId,
        participant_id: ParticipantId,
        position: Value,
    },
    Selection {
        session_id: SessionId,
        participant_id: ParticipantId,
        selection: Value,
    },
    Typing {
        session_id: SessionId,
        participant_id: ParticipantId,
    },
    Chat {
        session_id: SessionId,
        message: Value,
    },
    VersionSaved {
        session_id: SessionId,
        version: Value,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error { message: message.into() }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Serialization)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinedSession { .. } => "joined-session",
            Self::Presence { .. } => "presence",
            Self::UserJoined { .. } => "user-joined",
            Self::UserLeft { .. } => "user-left",
            Self::Operation { .. } => "operation",
            Self::Cursor { .. } => "cursor",
            Self::Selection { .. } => "selection",
            Self::Typing { .. } => "typing",
            Self::Chat { .. } => "chat",
            Self::VersionSaved { .. } => "version-saved",
            Self::Error { .. } => "error",
        }
    }
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Serialization error: {0}")]
    Serialization(serde_json::Error),

    #[error("Missing required field '{field}' in {event}")]
    MissingField {
        event: &'static str,
        field: &'static str,
    },

    #[error("Binary frames are not part of the protocol")]
    BinaryFrame,
}
