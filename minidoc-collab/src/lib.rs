//! # minidoc-collab: real-time collaboration layer for minidoc
//!
//! Clients open a WebSocket per document, exchange opaque CRDT updates and
//! see each other's edits converge. This crate coordinates who is in which
//! room, relays updates, and decides when the shared replica is written to
//! the document store.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐   WebSocket    ┌─────────────┐
//! │ DocumentClient │ ◄────────────► │ SyncServer  │
//! │ (per user)     │  binary + JSON │             │
//! └────────────────┘                └──────┬──────┘
//!                                          │ one Session per connection
//!                           ┌──────────────┼───────────────┐
//!                           ▼              ▼               ▼
//!                   ┌──────────────┐ ┌──────────┐ ┌──────────────┐
//!                   │ RoomRegistry │ │ Router   │ │ Synchronizer │
//!                   │ Room:        │ │ (JSON)   │ │ (save rules) │
//!                   │  replica     │ └────┬─────┘ └──────┬───────┘
//!                   │  fan-out     │      └──────┬───────┘
//!                   └──────────────┘             ▼
//!                                      ┌────────────────────┐
//!                                      │ DocumentRepository │
//!                                      │ (RocksDB / memory) │
//!                                      └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: text-frame JSON messages and outbound frames
//! - [`replica`]: CRDT engine adapter (yrs) with update observers
//! - [`room`]: rooms, sanitized keys, fan-out with sender exclusion
//! - [`session`]: per-connection state machine
//! - [`persistence`]: explicit and disconnect-time saves
//! - [`router`]: `TITLE_UPDATE` / `SAVE` dispatch
//! - [`auth`]: admission predicate
//! - [`storage`]: document records (RocksDB + in-memory)
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket client with offline queue

pub mod auth;
pub mod client;
pub mod persistence;
pub mod protocol;
pub mod replica;
pub mod room;
pub mod router;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use auth::{Admission, AllowAll, ConnectRequest, SharedToken};
pub use client::{ClientError, ConnectionState, DocumentClient, DocumentEvent, OfflineQueue};
pub use persistence::{SaveOutcome, Synchronizer};
pub use protocol::{
    ControlMessage, ErrorReply, Frame, ProtocolError, ServerEvent, ServerMessage, DEFAULT_TITLE,
};
pub use replica::{Replica, ReplicaAdapter, ReplicaEngine, ReplicaError, YrsEngine, YrsReplica};
pub use room::{sanitize, Room, RoomConfig, RoomError, RoomKey, RoomRegistry};
pub use router::Router;
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use session::{Joined, Session, SessionContext, SessionError, SessionState};
pub use storage::{
    Document, DocumentId, DocumentRepository, DocumentSummary, MemoryStore, RocksStore,
    StoreConfig, StoreError,
};
