//! In-memory document store.
//!
//! Used when the server runs without a storage path, and by tests that need
//! to count writes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use super::{now_millis, Document, DocumentId, DocumentRepository, DocumentSummary, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<DocumentId, Document>>,
    content_writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record as-is, replacing any existing one with the same id.
    pub fn insert(&self, document: Document) -> Result<(), StoreError> {
        self.write()?.insert(document.id.clone(), document);
        Ok(())
    }

    /// Number of successful `save_content` calls since creation.
    pub fn content_writes(&self) -> u64 {
        self.content_writes.load(Ordering::SeqCst)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<DocumentId, Document>>, StoreError> {
        self.documents
            .read()
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<DocumentId, Document>>, StoreError> {
        self.documents
            .write()
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

impl DocumentRepository for MemoryStore {
    fn create(&self, title: &str) -> Result<Document, StoreError> {
        let doc = Document::new(DocumentId::generate(), title);
        self.insert(doc.clone())?;
        Ok(doc)
    }

    fn get(&self, id: &DocumentId) -> Result<Document, StoreError> {
        self.read()?
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    fn list(&self) -> Result<Vec<DocumentSummary>, StoreError> {
        let mut docs: Vec<DocumentSummary> = self.read()?.values().map(Document::summary).collect();
        docs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(docs)
    }

    fn update_title(&self, id: &DocumentId, title: &str) -> Result<(), StoreError> {
        let mut docs = self.write()?;
        let doc = docs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        doc.title = title.to_owned();
        doc.updated_at = now_millis();
        Ok(())
    }

    fn save_content(&self, id: &DocumentId, content: &[u8]) -> Result<(), StoreError> {
        let mut docs = self.write()?;
        let doc = docs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        doc.content = Some(content.to_vec());
        doc.updated_at = now_millis();
        self.content_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete(&self, id: &DocumentId) -> Result<(), StoreError> {
        self.write()?
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }
}
