//! Bearer credential resolution.
//!
//! Credentials are issued and checked by an external identity service; the
//! session core only trusts the resolved [`Identity`].

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::handshake::server::Request;

use crate::protocol::ParticipantId;

/// Resolved participant identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub participant_id: ParticipantId,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("Missing bearer credential")]
    MissingCredential,

    #[error("Invalid credential")]
    InvalidCredential,

    #[error("Identity service unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, IdentityError>;
}

/// Fixed token table, for tests and local runs.
#[derive(Debug, Default, Clone)]
pub struct StaticIdentityVerifier {
    tokens: HashMap<String, Identity>,
}

impl StaticIdentityVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(
        mut self,
        token: impl Into<String>,
        participant_id: impl Into<ParticipantId>,
        display_name: impl Into<String>,
    ) -> Self {
        self.tokens.insert(
            token.into(),
            Identity {
                participant_id: participant_id.into(),
                display_name: display_name.into(),
            },
        );
        self
    }
}

#[async_trait]
impl IdentityVerifier for StaticIdentityVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, IdentityError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(IdentityError::InvalidCredential)
    }
}

/// Extract a bearer credential from the upgrade request.
///
/// Checks `Authorization: Bearer <token>` first, then a `token` query
/// parameter (browsers cannot set headers on WebSocket upgrades).
pub fn bearer_token(request: &Request) -> Option<String> {
    let from_header = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = from_header {
        return Some(token.to_owned());
    }

    request
        .uri()
        .query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, value)| *key == "token" && !value.is_empty())
        .map(|(_, value)| value.to_owned())
}
