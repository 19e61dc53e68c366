//! Replica adapter over a pluggable CRDT engine.
//!
//! ```text
//!  Session ──apply_update──► ReplicaAdapter ──► Box<dyn Replica> (yrs)
//!                                 │
//!                                 └── observers (one per joined session)
//!                                       fired synchronously after every
//!                                       successful apply
//! ```
//!
//! The adapter never inspects update bytes. Everything above it works with
//! any engine implementing [`ReplicaEngine`].

use std::collections::HashMap;

use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{ReadTxn, StateVector, Transact};

/// Identifies the connection an update came from.
pub type SessionId = Uuid;

/// Replica engine errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplicaError {
    #[error("failed to decode update: {0}")]
    Decode(String),
    #[error("failed to apply update: {0}")]
    Apply(String),
}

/// One in-memory replica of a document.
pub trait Replica: Send {
    /// Merge an incremental update produced by some other replica.
    fn apply_update(&mut self, update: &[u8]) -> Result<(), ReplicaError>;

    /// Full state as an update, for a client that starts from nothing.
    fn encode_update(&self) -> Vec<u8>;

    /// Full state for durable storage. Must round-trip through
    /// [`ReplicaEngine::load`] to an identical snapshot.
    fn snapshot(&self) -> Vec<u8>;
}

/// Creates replicas from stored snapshots.
pub trait ReplicaEngine: Send + Sync {
    /// Load a replica from a snapshot. An empty slice yields an empty replica.
    fn load(&self, snapshot: &[u8]) -> Result<Box<dyn Replica>, ReplicaError>;
}

/// The Yjs-compatible engine the web client speaks.
#[derive(Debug, Default, Clone, Copy)]
pub struct YrsEngine;

impl ReplicaEngine for YrsEngine {
    fn load(&self, snapshot: &[u8]) -> Result<Box<dyn Replica>, ReplicaError> {
        let mut replica = YrsReplica::new();
        if !snapshot.is_empty() {
            replica.apply_update(snapshot)?;
        }
        Ok(Box::new(replica))
    }
}

/// A `yrs::Doc` behind the [`Replica`] interface.
pub struct YrsReplica {
    doc: yrs::Doc,
}

impl YrsReplica {
    pub fn new() -> Self {
        Self { doc: yrs::Doc::new() }
    }

    /// The underlying document, for callers that edit it directly.
    pub fn doc(&self) -> &yrs::Doc {
        &self.doc
    }

    fn encode_full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }
}

impl Default for YrsReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl Replica for YrsReplica {
    fn apply_update(&mut self, update: &[u8]) -> Result<(), ReplicaError> {
        let update = yrs::Update::decode_v1(update).map_err(|e| ReplicaError::Decode(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| ReplicaError::Apply(e.to_string()))
    }

    fn encode_update(&self) -> Vec<u8> {
        self.encode_full_state()
    }

    fn snapshot(&self) -> Vec<u8> {
        self.encode_full_state()
    }
}

/// What an observer learns about an applied update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateEvent {
    /// Session whose message carried the update
    pub origin: SessionId,
    /// Update size in bytes
    pub len: usize,
}

/// Callback fired after every successful apply.
pub type UpdateObserver = Box<dyn Fn(&UpdateEvent) + Send + Sync>;

/// A room's replica plus its registered observers.
///
/// Not internally synchronized; the room keeps it behind a mutex.
pub struct ReplicaAdapter {
    replica: Box<dyn Replica>,
    observers: HashMap<SessionId, UpdateObserver>,
    updates_applied: u64,
}

impl ReplicaAdapter {
    pub fn new(replica: Box<dyn Replica>) -> Self {
        Self {
            replica,
            observers: HashMap::new(),
            updates_applied: 0,
        }
    }

    /// Load through `engine` and wrap.
    pub fn load(engine: &dyn ReplicaEngine, snapshot: &[u8]) -> Result<Self, ReplicaError> {
        engine.load(snapshot).map(Self::new)
    }

    /// Apply `update` on behalf of `origin` and notify every observer.
    ///
    /// Observers are not called when the engine rejects the update.
    pub fn apply_update(&mut self, origin: SessionId, update: &[u8]) -> Result<(), ReplicaError> {
        self.replica.apply_update(update)?;
        self.updates_applied += 1;

        let event = UpdateEvent {
            origin,
            len: update.len(),
        };
        for observer in self.observers.values() {
            observer(&event);
        }
        Ok(())
    }

    pub fn encode_update(&self) -> Vec<u8> {
        self.replica.encode_update()
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.replica.snapshot()
    }

    /// Register `observer` under `id`, replacing any previous one.
    pub fn observe(&mut self, id: SessionId, observer: UpdateObserver) {
        self.observers.insert(id, observer);
    }

    pub fn unobserve(&mut self, id: &SessionId) -> bool {
        self.observers.remove(id).is_some()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Successful applies since the replica was loaded.
    pub fn updates_applied(&self) -> u64 {
        self.updates_applied
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use yrs::{GetString, Text};

    /// Encode an update that inserts `text` at the start of the "content" text.
    pub(crate) fn text_update(text: &str) -> Vec<u8> {
        let doc = yrs::Doc::new();
        let content = doc.get_or_insert_text("content");
        {
            let mut txn = doc.transact_mut();
            content.insert(&mut txn, 0, text);
        }
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn content_of(replica: &dyn Replica) -> String {
        let doc = yrs::Doc::new();
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(yrs::Update::decode_v1(&replica.snapshot()).unwrap())
                .unwrap();
        }
        let content = doc.get_or_insert_text("content");
        let txn = doc.transact();
        content.get_string(&txn)
    }

    #[test]
    fn test_load_empty_snapshot() {
        let replica = YrsEngine.load(&[]).unwrap();
        assert_eq!(replica.snapshot(), YrsReplica::new().snapshot());
    }

    #[test]
    fn test_apply_and_read_back() {
        let mut replica = YrsEngine.load(&[]).unwrap();
        replica.apply_update(&text_update("hello")).unwrap();
        assert_eq!(content_of(replica.as_ref()), "hello");
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut replica = YrsEngine.load(&[]).unwrap();
        replica.apply_update(&text_update("round trip")).unwrap();
        let snapshot = replica.snapshot();

        let reloaded = YrsEngine.load(&snapshot).unwrap();
        assert_eq!(reloaded.snapshot(), snapshot);
    }

    #[test]
    fn test_reject_garbage_update() {
        let mut replica = YrsEngine.load(&[]).unwrap();
        let before = replica.snapshot();
        assert!(replica.apply_update(&[0xff, 0xff, 0xff, 0xff]).is_err());
        assert_eq!(replica.snapshot(), before);
    }

    #[test]
    fn test_load_corrupt_snapshot_fails() {
        assert!(YrsEngine.load(&[0xff, 0x00, 0xff]).is_err());
    }

    #[test]
    fn test_observers_fire_on_apply() {
        let mut adapter = ReplicaAdapter::load(&YrsEngine, &[]).unwrap();
        let dirty = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));

        let flag = dirty.clone();
        adapter.observe(Uuid::new_v4(), Box::new(move |_| flag.store(true, Ordering::SeqCst)));
        let counter = calls.clone();
        adapter.observe(
            Uuid::new_v4(),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let origin = Uuid::new_v4();
        adapter.apply_update(origin, &text_update("x")).unwrap();

        assert!(dirty.load(Ordering::SeqCst));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.updates_applied(), 1);
    }

    #[test]
    fn test_observers_skip_rejected_update() {
        let mut adapter = ReplicaAdapter::load(&YrsEngine, &[]).unwrap();
        let dirty = Arc::new(AtomicBool::new(false));
        let flag = dirty.clone();
        adapter.observe(Uuid::new_v4(), Box::new(move |_| flag.store(true, Ordering::SeqCst)));

        assert!(adapter.apply_update(Uuid::new_v4(), &[0xff, 0xff]).is_err());
        assert!(!dirty.load(Ordering::SeqCst));
        assert_eq!(adapter.updates_applied(), 0);
    }

    #[test]
    fn test_unobserve() {
        let mut adapter = ReplicaAdapter::load(&YrsEngine, &[]).unwrap();
        let id = Uuid::new_v4();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        adapter.observe(
            id,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(adapter.unobserve(&id));
        assert!(!adapter.unobserve(&id));
        adapter.apply_update(Uuid::new_v4(), &text_update("x")).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(adapter.observer_count(), 0);
    }

    #[test]
    fn test_event_carries_origin() {
        let mut adapter = ReplicaAdapter::load(&YrsEngine, &[]).unwrap();
        let seen = Arc::new(std::sync::Mutex::new(None));
        let slot = seen.clone();
        adapter.observe(
            Uuid::new_v4(),
            Box::new(move |event| {
                *slot.lock().unwrap() = Some(*event);
            }),
        );

        let origin = Uuid::new_v4();
        let update = text_update("abc");
        adapter.apply_update(origin, &update).unwrap();

        let event = seen.lock().unwrap().unwrap();
        assert_eq!(event.origin, origin);
        assert_eq!(event.len, update.len());
    }
}
