//! Persistence collaborators: document/version store and chat store.
//!
//! The session core never depends on these for presence or delivery. When
//! attached to the [`SessionManager`](crate::manager::SessionManager), chat
//! messages and saved versions are appended after they have been relayed.
//!
//! The session core only writes. Reads (`load_document`, `ChatStore::list`)
//! serve the embedding application, e.g. an HTTP layer that hands a client
//! the current document and chat history before it joins.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::protocol::SessionId;

/// Current document state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub content: String,
    pub language: String,
}

/// Append-only version record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub content: String,
    pub author: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    #[default]
    Message,
    System,
}

/// Append-only chat record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub session_id: SessionId,
    pub author: String,
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: ChatKind,
    pub timestamp: DateTime<Utc>,
}

/// Store errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn load_document(&self, document_id: &str) -> Result<DocumentSnapshot, StoreError>;

    /// Append a version and make its content the document's current
    /// content. Existing versions are never modified.
    async fn append_version(
        &self,
        document_id: &str,
        version: VersionRecord,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn append(&self, record: ChatRecord) -> Result<(), StoreError>;

    /// All records for a session, oldest first.
    async fn list(&self, session_id: &str) -> Result<Vec<ChatRecord>, StoreError>;
}

/// Language recorded for documents first seen through a saved version.
pub const DEFAULT_LANGUAGE: &str = "plaintext";

#[derive(Debug, Default)]
struct StoredDocument {
    snapshot: Option<DocumentSnapshot>,
    versions: Vec<VersionRecord>,
}

/// In-memory [`DocumentStore`].
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: RwLock<HashMap<String, StoredDocument>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or overwrite the current content of a document.
    pub async fn put_document(&self, document_id: &str, snapshot: DocumentSnapshot) {
        let mut docs = self.documents.write().await;
        docs.entry(document_id.to_owned()).or_default().snapshot = Some(snapshot);
    }

    pub async fn versions(&self, document_id: &str) -> Vec<VersionRecord> {
        self.documents
            .read()
            .await
            .get(document_id)
            .map(|d| d.versions.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn load_document(&self, document_id: &str) -> Result<DocumentSnapshot, StoreError> {
        self.documents
            .read()
            .await
            .get(document_id)
            .and_then(|d| d.snapshot.clone())
            .ok_or_else(|| StoreError::NotFound(document_id.to_owned()))
    }

    async fn append_version(
        &self,
        document_id: &str,
        version: VersionRecord,
    ) -> Result<(), StoreError> {
        let mut docs = self.documents.write().await;
        let doc = docs.entry(document_id.to_owned()).or_default();
        let snapshot = doc.snapshot.get_or_insert_with(|| DocumentSnapshot {
            content: String::new(),
            language: DEFAULT_LANGUAGE.to_owned(),
        });
        snapshot.content.clone_from(&version.content);
        doc.versions.push(version);
        Ok(())
    }
}

/// In-memory [`ChatStore`].
#[derive(Debug, Default)]
pub struct MemoryChatStore {
    records: RwLock<HashMap<SessionId, Vec<ChatRecord>>>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn append(&self, record: ChatRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        records
            .entry(record.session_id.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn list(&self, session_id: &str) -> Result<Vec<ChatRecord>, StoreError> {
        let mut list = self
            .records
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default();
        // Appends may arrive out of timestamp order from concurrent senders.
        list.sort_by_key(|r| r.timestamp);
        Ok(list)
    }
}
