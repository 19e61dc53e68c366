//! Rooms: one shared replica and one fan-out channel per open document.
//!
//! ```text
//!                 RoomRegistry
//!   sanitize(id) ──► RoomKey ──► Arc<Room>
//!                                 ├── Mutex<ReplicaAdapter>   (per-room serialization)
//!                                 ├── Mutex<Vec<u8>>          (persisted watermark)
//!                                 ├── broadcast::Sender       (fan-out, N-1 or N)
//!                                 └── members
//! ```
//!
//! Sender exclusion happens on the receiving side: every member gets each
//! [`Broadcast`] and its [`RoomFeed`] drops the ones addressed away from it.
//! A feed that falls more than `broadcast_capacity` messages behind reports
//! [`FeedError::Lagged`] and the connection is closed.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::protocol::Frame;
use crate::replica::{ReplicaAdapter, ReplicaEngine, ReplicaError, SessionId};
use crate::storage::{DocumentId, DocumentRepository, StoreError};

/// Transport-safe room name derived from a document id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomKey(String);

impl RoomKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Replace every character outside `[A-Za-z0-9]` with `_`.
///
/// Distinct ids can collide (`a-b` and `a.b`); that is accepted.
pub fn sanitize(document_id: &DocumentId) -> RoomKey {
    RoomKey(
        document_id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect(),
    )
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Messages buffered per member before it counts as lagging
    pub broadcast_capacity: usize,
    /// How long an empty room keeps its replica warm (zero = evict at once)
    pub idle_timeout: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            idle_timeout: Duration::ZERO,
        }
    }
}

/// Errors while opening a room.
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("failed to load document: {0}")]
    Store(#[from] StoreError),
    #[error("failed to load replica: {0}")]
    Replica(#[from] ReplicaError),
}

/// One fan-out message.
#[derive(Debug)]
pub struct Broadcast {
    /// Member that must not receive it
    pub exclude: Option<SessionId>,
    pub frame: Frame,
}

/// A member's view of the room channel.
pub struct RoomFeed {
    session: SessionId,
    rx: broadcast::Receiver<Arc<Broadcast>>,
}

/// Why a feed stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("member fell {0} messages behind")]
    Lagged(u64),
    #[error("room closed")]
    Closed,
}

impl RoomFeed {
    /// Next frame addressed to this member. Cancel safe.
    pub async fn recv(&mut self) -> Result<Frame, FeedError> {
        loop {
            match self.rx.recv().await {
                Ok(msg) if msg.exclude == Some(self.session) => continue,
                Ok(msg) => return Ok(msg.frame.clone()),
                Err(RecvError::Lagged(n)) => return Err(FeedError::Lagged(n)),
                Err(RecvError::Closed) => return Err(FeedError::Closed),
            }
        }
    }

    /// Non-blocking variant; `None` when nothing is queued.
    pub fn try_recv(&mut self) -> Option<Result<Frame, FeedError>> {
        use broadcast::error::TryRecvError;
        loop {
            match self.rx.try_recv() {
                Ok(msg) if msg.exclude == Some(self.session) => continue,
                Ok(msg) => return Some(Ok(msg.frame.clone())),
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Lagged(n)) => return Some(Err(FeedError::Lagged(n))),
                Err(TryRecvError::Closed) => return Some(Err(FeedError::Closed)),
            }
        }
    }
}

/// A live document room.
pub struct Room {
    key: RoomKey,
    document_id: DocumentId,
    /// The shared replica; every apply and export goes through this lock
    replica: Mutex<ReplicaAdapter>,
    /// Last snapshot known to be in the store
    persisted: Mutex<Vec<u8>>,
    sender: broadcast::Sender<Arc<Broadcast>>,
    members: RwLock<HashSet<SessionId>>,
}

impl Room {
    fn new(
        key: RoomKey,
        document_id: DocumentId,
        replica: ReplicaAdapter,
        persisted: Vec<u8>,
        capacity: usize,
    ) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            key,
            document_id,
            replica: Mutex::new(replica),
            persisted: Mutex::new(persisted),
            sender,
            members: RwLock::new(HashSet::new()),
        }
    }

    pub fn key(&self) -> &RoomKey {
        &self.key
    }

    /// The document the room was opened for.
    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub fn replica(&self) -> &Mutex<ReplicaAdapter> {
        &self.replica
    }

    /// The persisted watermark. Lock it to serialize compare-and-write.
    pub fn persisted(&self) -> &Mutex<Vec<u8>> {
        &self.persisted
    }

    /// Send `frame` to every member except `exclude`.
    ///
    /// Returns the number of live receivers. Never fails: with no receivers
    /// the frame is dropped.
    pub fn broadcast(&self, frame: Frame, exclude: Option<SessionId>) -> usize {
        self.sender
            .send(Arc::new(Broadcast { exclude, frame }))
            .unwrap_or(0)
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn has_member(&self, session: &SessionId) -> bool {
        self.members.read().await.contains(session)
    }

    async fn add_member(&self, session: SessionId) -> RoomFeed {
        self.members.write().await.insert(session);
        RoomFeed {
            session,
            rx: self.sender.subscribe(),
        }
    }

    /// Remove `session`, returning how many members remain.
    async fn remove_member(&self, session: &SessionId) -> usize {
        let mut members = self.members.write().await;
        members.remove(session);
        members.len()
    }
}

type RoomMap = Arc<RwLock<HashMap<RoomKey, Arc<Room>>>>;

/// Maps room keys to live rooms.
///
/// A room is created by the first join (loading the stored snapshot) and
/// evicted after the last leave once `idle_timeout` has passed.
pub struct RoomRegistry {
    rooms: RoomMap,
    store: Arc<dyn DocumentRepository>,
    engine: Arc<dyn ReplicaEngine>,
    config: RoomConfig,
}

impl RoomRegistry {
    pub fn new(
        store: Arc<dyn DocumentRepository>,
        engine: Arc<dyn ReplicaEngine>,
        config: RoomConfig,
    ) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            store,
            engine,
            config,
        }
    }

    /// Register `session` in the room for `document_id`, opening the room if
    /// needed. The feed is subscribed before this returns, so the member sees
    /// every broadcast sent after the join.
    pub async fn join(
        &self,
        document_id: &DocumentId,
        session: SessionId,
    ) -> Result<(Arc<Room>, RoomFeed), RoomError> {
        let key = sanitize(document_id);

        // Fast path: read lock. Holding it while adding the member keeps
        // eviction from removing the room in between.
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&key) {
                Self::check_collision(room, document_id);
                let feed = room.add_member(session).await;
                return Ok((room.clone(), feed));
            }
        }

        // Slow path: load without holding the map lock, then insert unless
        // a concurrent join opened the room first.
        let stored = match self.store.get(document_id) {
            Ok(doc) => doc.content.unwrap_or_default(),
            Err(StoreError::NotFound(_)) => {
                log::warn!("Opening room for unknown document {document_id}");
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };
        let replica = ReplicaAdapter::load(self.engine.as_ref(), &stored)?;

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(&key) {
            Self::check_collision(room, document_id);
            let feed = room.add_member(session).await;
            return Ok((room.clone(), feed));
        }

        let room = Arc::new(Room::new(
            key.clone(),
            document_id.clone(),
            replica,
            stored,
            self.config.broadcast_capacity,
        ));
        let feed = room.add_member(session).await;
        rooms.insert(key.clone(), room.clone());

        log::info!("Opened room {key} for document {document_id} ({} rooms)", rooms.len());
        Ok((room, feed))
    }

    /// Remove `session` from the room. The last leave schedules eviction.
    pub async fn leave(&self, key: &RoomKey, session: &SessionId) {
        let Some(room) = self.get(key).await else {
            return;
        };
        if room.remove_member(session).await > 0 {
            return;
        }

        if self.config.idle_timeout.is_zero() {
            Self::evict_if_idle(&self.rooms, key, &room).await;
            return;
        }

        let rooms = self.rooms.clone();
        let key = key.clone();
        let timeout = self.config.idle_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            Self::evict_if_idle(&rooms, &key, &room).await;
        });
    }

    /// Fan `frame` out to the room's members, skipping `exclude`.
    ///
    /// Returns the number of live receivers, or 0 if the room is gone.
    pub async fn broadcast(&self, key: &RoomKey, frame: Frame, exclude: Option<SessionId>) -> usize {
        match self.get(key).await {
            Some(room) => room.broadcast(frame, exclude),
            None => 0,
        }
    }

    pub async fn get(&self, key: &RoomKey) -> Option<Arc<Room>> {
        self.rooms.read().await.get(key).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn member_count(&self, key: &RoomKey) -> usize {
        match self.get(key).await {
            Some(room) => room.member_count().await,
            None => 0,
        }
    }

    /// The store rooms are loaded from.
    pub fn store(&self) -> &Arc<dyn DocumentRepository> {
        &self.store
    }

    /// Remove `room` if it is still the entry under `key` and still empty.
    async fn evict_if_idle(rooms: &RoomMap, key: &RoomKey, room: &Arc<Room>) -> bool {
        let mut rooms = rooms.write().await;
        let current = match rooms.get(key) {
            Some(current) if Arc::ptr_eq(current, room) => current,
            _ => return false,
        };
        if current.member_count().await > 0 {
            return false;
        }
        rooms.remove(key);
        log::info!("Evicted idle room {key}");
        true
    }

    fn check_collision(room: &Room, document_id: &DocumentId) {
        if room.document_id() != document_id {
            log::warn!(
                "Room key {} collides: {} joined a room opened for {}",
                room.key(),
                document_id,
                room.document_id()
            );
        }
    }
}
