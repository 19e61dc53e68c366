//! Per-connection session state machine.
//!
//! ```text
//!  CONNECTING ──admit + join──► JOINED ──disconnect──► CLOSING ──► CLOSED
//!       │                                               (save check,
//!       └── rejected / join fault ──────────────────►    unobserve, leave)
//! ```
//!
//! A session owns its dirty flag and its baseline snapshot; the replica and
//! the persisted watermark belong to the room.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Bytes;
use uuid::Uuid;

use crate::auth::{Admission, ConnectRequest};
use crate::persistence::{SaveOutcome, Synchronizer};
use crate::protocol::Frame;
use crate::replica::{ReplicaEngine, ReplicaError, SessionId};
use crate::room::{Room, RoomConfig, RoomError, RoomFeed, RoomKey, RoomRegistry};
use crate::router::Router;
use crate::storage::{DocumentId, DocumentRepository};

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Joined,
    Closing,
    Closed,
}

/// Session errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection not authorized")]
    Unauthorized,
    #[error(transparent)]
    Room(#[from] RoomError),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
    #[error("session is {0:?}")]
    NotJoined(SessionState),
}

/// Collaborators shared by every session on a server.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<RoomRegistry>,
    pub synchronizer: Arc<Synchronizer>,
    pub router: Arc<Router>,
    pub admission: Arc<dyn Admission>,
    /// Upper bound on the disconnect-time save check
    pub disconnect_grace: Duration,
}

impl SessionContext {
    pub fn new(
        store: Arc<dyn DocumentRepository>,
        engine: Arc<dyn ReplicaEngine>,
        admission: Arc<dyn Admission>,
        room_config: RoomConfig,
    ) -> Self {
        let registry = Arc::new(RoomRegistry::new(store.clone(), engine, room_config));
        let synchronizer = Arc::new(Synchronizer::new(store.clone()));
        let router = Arc::new(Router::new(store, synchronizer.clone()));
        Self {
            registry,
            synchronizer,
            router,
            admission,
            disconnect_grace: Duration::from_secs(5),
        }
    }

    pub fn with_disconnect_grace(mut self, grace: Duration) -> Self {
        self.disconnect_grace = grace;
        self
    }
}

/// A freshly joined session plus what the transport needs to start.
pub struct Joined {
    pub session: Session,
    /// Room broadcasts addressed to this session
    pub feed: RoomFeed,
    /// Full replica state, sent to the client as its first binary frame
    pub initial_state: Vec<u8>,
}

pub struct Session {
    id: SessionId,
    document_id: DocumentId,
    room: Arc<Room>,
    /// Set by the replica observer on every applied update
    dirty: Arc<AtomicBool>,
    /// Durable snapshot the room held when this session joined
    baseline: Vec<u8>,
    state: SessionState,
    ctx: SessionContext,
}

impl Session {
    /// Admit `request` and join its room.
    ///
    /// A rejected request never touches the registry. Any other failure
    /// leaves no membership or observer behind.
    pub async fn connect(ctx: SessionContext, request: &ConnectRequest) -> Result<Joined, SessionError> {
        if !ctx.admission.admit(request) {
            log::info!(
                "Rejected connection to {} from {:?}",
                request.document_id,
                request.peer_addr
            );
            return Err(SessionError::Unauthorized);
        }

        let id = Uuid::new_v4();
        let (room, feed) = ctx.registry.join(&request.document_id, id).await?;

        let dirty = Arc::new(AtomicBool::new(false));
        let initial_state = {
            let mut replica = room.replica().lock().await;
            let flag = dirty.clone();
            replica.observe(id, Box::new(move |_| flag.store(true, Ordering::SeqCst)));
            replica.encode_update()
        };
        let baseline = room.persisted().lock().await.clone();

        log::info!(
            "Session {id} joined room {} ({} members)",
            room.key(),
            room.member_count().await
        );

        Ok(Joined {
            session: Session {
                id,
                document_id: request.document_id.clone(),
                room,
                dirty,
                baseline,
                state: SessionState::Joined,
                ctx,
            },
            feed,
            initial_state,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    pub fn room_key(&self) -> &RoomKey {
        self.room.key()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the shared replica changed since this session joined.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn baseline(&self) -> &[u8] {
        &self.baseline
    }

    /// Apply a binary update and relay it to every other member.
    ///
    /// Returns the number of live receivers. A rejected update is not
    /// relayed.
    pub async fn on_binary(&mut self, update: Bytes) -> Result<usize, SessionError> {
        self.ensure_joined()?;

        // Relay under the replica lock so members see updates in apply order
        let mut replica = self.room.replica().lock().await;
        if let Err(e) = replica.apply_update(self.id, &update) {
            log::warn!("Dropping update from session {} in room {}: {e}", self.id, self.room.key());
            return Err(e.into());
        }
        Ok(self.room.broadcast(Frame::Binary(update), Some(self.id)))
    }

    /// Handle a control message; returns a reply meant for this client only.
    pub async fn on_text(&mut self, text: &str) -> Result<Option<Frame>, SessionError> {
        self.ensure_joined()?;
        let router = self.ctx.router.clone();
        Ok(router.dispatch(self, text).await)
    }

    /// Run the disconnect save check, then leave the room.
    ///
    /// Always completes: store errors are logged and the save check is cut
    /// off after `disconnect_grace`. Returns the save outcome, or `None` if
    /// the check failed or the session was not joined.
    pub async fn disconnect(&mut self) -> Option<SaveOutcome> {
        if self.state != SessionState::Joined {
            return None;
        }
        self.state = SessionState::Closing;

        let synchronizer = self.ctx.synchronizer.clone();
        let grace = self.ctx.disconnect_grace;
        let outcome = match tokio::time::timeout(grace, synchronizer.maybe_save_on_disconnect(self)).await {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(e)) => {
                log::warn!("Disconnect save for {} failed: {e}", self.document_id);
                None
            }
            Err(_) => {
                log::warn!("Disconnect save for {} exceeded {grace:?}", self.document_id);
                None
            }
        };

        self.room.replica().lock().await.unobserve(&self.id);
        self.ctx.registry.leave(self.room.key(), &self.id).await;
        self.state = SessionState::Closed;

        log::info!("Session {} left room {} ({outcome:?})", self.id, self.room.key());
        outcome
    }

    fn ensure_joined(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Joined => Ok(()),
            other => Err(SessionError::NotJoined(other)),
        }
    }
}
