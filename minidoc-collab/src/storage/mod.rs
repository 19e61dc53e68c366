//! Durable document records.
//!
//! ```text
//! ┌──────────────┐   save_content / update_title   ┌──────────────────────┐
//! │ Synchronizer │ ──────────────────────────────► │ DocumentRepository   │
//! │ Router       │                                 │  ├── RocksStore      │
//! └──────────────┘ ◄────────── get (on join) ───── │  └── MemoryStore     │
//!                                                  └──────────────────────┘
//! ```
//!
//! A record is `id`, `title`, an opaque snapshot produced by the replica
//! engine, and two timestamps. Each save replaces the snapshot whole; there
//! is no change log.

pub mod memory;
pub mod rocks;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// Stable document identifier, as it appears in the connection path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier for a newly created document.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A stored document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: DocumentId,
    pub title: String,
    /// Replica snapshot; `None` until the first save.
    pub content: Option<Vec<u8>>,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
    /// Milliseconds since the Unix epoch
    pub updated_at: u64,
}

impl Document {
    pub fn new(id: DocumentId, title: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id,
            title: title.into(),
            content: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The stored snapshot, or an empty slice for a never-saved document.
    pub fn snapshot(&self) -> &[u8] {
        self.content.as_deref().unwrap_or_default()
    }

    /// Listing view without the binary payload.
    pub fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Document fields returned by listings (content omitted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub id: DocumentId,
    pub title: String,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(DocumentId),
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Record store the collaboration layer reads from and writes to.
///
/// Implementations own their own retry and timeout policy; callers never
/// retry.
pub trait DocumentRepository: Send + Sync {
    /// Create a document with a fresh id and no content.
    fn create(&self, title: &str) -> Result<Document, StoreError>;

    fn get(&self, id: &DocumentId) -> Result<Document, StoreError>;

    fn list(&self) -> Result<Vec<DocumentSummary>, StoreError>;

    /// Replace the title. Fails with `NotFound` if the record is gone.
    fn update_title(&self, id: &DocumentId, title: &str) -> Result<(), StoreError>;

    /// Replace the snapshot. Fails with `NotFound` if the record is gone.
    fn save_content(&self, id: &DocumentId, content: &[u8]) -> Result<(), StoreError>;

    fn delete(&self, id: &DocumentId) -> Result<(), StoreError>;
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
