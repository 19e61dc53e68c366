//! Persistence synchronizer: decides when a room's replica goes to the store.
//!
//! ```text
//! disconnect ──► dirty? ──no──► Clean
//!                  │yes
//!                  ▼
//!         lock watermark ─► export snapshot
//!                  │
//!   equal to baseline or watermark? ──yes──► Unchanged
//!                  │no
//!                  ▼
//!          save_content ─► advance watermark ─► Written
//!
//! SAVE ──► lock watermark ─► export ─► save_content ─► advance watermark
//! ```
//!
//! The watermark lock serializes compare-and-write per room, so N sessions
//! disconnecting together after one edit produce one write. Export and write
//! are not atomic with respect to later updates; the next save picks those up.
//! Store calls run on the blocking pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::session::Session;
use crate::storage::{DocumentId, DocumentRepository, StoreError};

/// What a disconnect-time check did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Session never saw an update; nothing exported
    Clean,
    /// Exported state already durable
    Unchanged,
    /// New snapshot written
    Written,
}

pub struct Synchronizer {
    store: Arc<dyn DocumentRepository>,
    snapshots_written: AtomicU64,
}

impl Synchronizer {
    pub fn new(store: Arc<dyn DocumentRepository>) -> Self {
        Self {
            store,
            snapshots_written: AtomicU64::new(0),
        }
    }

    /// Write the room's state if `session` saw an update and the state
    /// differs from what is already stored.
    pub async fn maybe_save_on_disconnect(&self, session: &Session) -> Result<SaveOutcome, StoreError> {
        if !session.is_dirty() {
            return Ok(SaveOutcome::Clean);
        }

        let room = session.room();
        let mut persisted = room.persisted().lock().await;
        let snapshot = room.replica().lock().await.snapshot();

        if snapshot == session.baseline() || snapshot == *persisted {
            log::debug!("Snapshot for {} unchanged, skipping write", session.document_id());
            return Ok(SaveOutcome::Unchanged);
        }

        *persisted = self.write(session.document_id(), snapshot).await?;
        Ok(SaveOutcome::Written)
    }

    /// Write the room's current state unconditionally.
    pub async fn save_explicit(&self, session: &Session) -> Result<(), StoreError> {
        let room = session.room();
        let mut persisted = room.persisted().lock().await;
        let snapshot = room.replica().lock().await.snapshot();

        *persisted = self.write(session.document_id(), snapshot).await?;
        Ok(())
    }

    /// Snapshots written through this synchronizer.
    pub fn snapshots_written(&self) -> u64 {
        self.snapshots_written.load(Ordering::Relaxed)
    }

    /// Store `snapshot` on the blocking pool and hand it back once durable.
    ///
    /// Off the async thread so a caller's timeout can still fire while the
    /// store is stalled.
    async fn write(&self, id: &DocumentId, snapshot: Vec<u8>) -> Result<Vec<u8>, StoreError> {
        let store = self.store.clone();
        let target = id.clone();
        let snapshot = tokio::task::spawn_blocking(move || {
            store.save_content(&target, &snapshot).map(|()| snapshot)
        })
        .await
        .map_err(|e| StoreError::Database(format!("Store task failed: {e}")))??;

        self.snapshots_written.fetch_add(1, Ordering::Relaxed);
        log::info!("Saved snapshot for {id} ({} bytes)", snapshot.len());
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ConnectRequest;
    use crate::replica::tests::text_update;
    use crate::session::tests::context;
    use crate::storage::MemoryStore;

    #[tokio::test]
    async fn test_clean_session_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone());
        let doc = store.create("Doc").unwrap();

        let joined = Session::connect(ctx.clone(), &ConnectRequest::new(doc.id.clone()))
            .await
            .unwrap();
        let outcome = ctx.synchronizer.maybe_save_on_disconnect(&joined.session).await.unwrap();

        assert_eq!(outcome, SaveOutcome::Clean);
        assert_eq!(store.content_writes(), 0);
        assert_eq!(store.get(&doc.id).unwrap().updated_at, doc.updated_at);
    }

    #[tokio::test]
    async fn test_dirty_session_writes_once() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone());
        let doc = store.create("Doc").unwrap();

        let mut joined = Session::connect(ctx.clone(), &ConnectRequest::new(doc.id.clone()))
            .await
            .unwrap();
        joined.session.on_binary(text_update("hi").into()).await.unwrap();

        let sync = &ctx.synchronizer;
        assert_eq!(sync.maybe_save_on_disconnect(&joined.session).await.unwrap(), SaveOutcome::Written);
        assert_eq!(sync.maybe_save_on_disconnect(&joined.session).await.unwrap(), SaveOutcome::Unchanged);
        assert_eq!(store.content_writes(), 1);
        assert_eq!(sync.snapshots_written(), 1);

        let stored = store.get(&doc.id).unwrap();
        assert_eq!(stored.content.unwrap(), joined.session.room().replica().lock().await.snapshot());
    }

    #[tokio::test]
    async fn test_explicit_save_ignores_dirty_flag() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone());
        let doc = store.create("Doc").unwrap();

        let joined = Session::connect(ctx.clone(), &ConnectRequest::new(doc.id.clone()))
            .await
            .unwrap();
        assert!(!joined.session.is_dirty());

        ctx.synchronizer.save_explicit(&joined.session).await.unwrap();
        ctx.synchronizer.save_explicit(&joined.session).await.unwrap();
        assert_eq!(store.content_writes(), 2);
        assert!(!joined.session.is_dirty());
    }

    #[tokio::test]
    async fn test_explicit_save_missing_document() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone());

        let joined = Session::connect(ctx.clone(), &ConnectRequest::new("ghost"))
            .await
            .unwrap();
        let err = ctx.synchronizer.save_explicit(&joined.session).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(ctx.synchronizer.snapshots_written(), 0);
    }

    #[tokio::test]
    async fn test_save_after_explicit_save_is_unchanged() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone());
        let doc = store.create("Doc").unwrap();

        let mut joined = Session::connect(ctx.clone(), &ConnectRequest::new(doc.id.clone()))
            .await
            .unwrap();
        joined.session.on_binary(text_update("x").into()).await.unwrap();
        ctx.synchronizer.save_explicit(&joined.session).await.unwrap();

        let outcome = ctx.synchronizer.maybe_save_on_disconnect(&joined.session).await.unwrap();
        assert_eq!(outcome, SaveOutcome::Unchanged);
        assert_eq!(store.content_writes(), 1);
    }
}
