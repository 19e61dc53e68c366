//! WebSocket server: one task per connection, one room per document.
//!
//! Architecture:
//! ```text
//! Client A ──┐   ws://host/ws/documents/{id}
//!             ├── Session ── Room (sanitized id) ── ReplicaAdapter (yrs)
//! Client B ──┘        │            │
//!                     │            └── broadcast channel ──► Client A, B, C
//!                     │
//!                     ├── Router ──────────► DocumentRepository
//!                     └── Synchronizer ────►   (RocksDB or memory)
//! ```
//!
//! Connection lifecycle:
//! 1. Handshake: path must be `/ws/documents/{id}`, otherwise HTTP 404.
//! 2. Admission + join. Rejected: close 1008. Join fault: close 1011.
//! 3. First frame to the client: full replica state (binary).
//! 4. Loop: binary → apply + relay, text → router, room feed → client.
//! 5. Steps 3-4 and the disconnect run in their own task, so the save check
//!    and leave happen even if the connection task is cancelled.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::auth::{Admission, AllowAll, ConnectRequest, SharedToken};
use crate::replica::YrsEngine;
use crate::room::{FeedError, RoomConfig};
use crate::session::{Joined, Session, SessionContext, SessionError};
use crate::storage::{DocumentId, DocumentRepository, MemoryStore, RocksStore, StoreConfig, StoreError};

const DOCUMENT_PATH_PREFIX: &str = "/ws/documents/";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// How long an empty room keeps its replica warm
    pub room_idle_timeout: Duration,
    /// Upper bound on the disconnect-time save check
    pub disconnect_grace: Duration,
    /// Shared secret clients must present (None = admit everyone)
    pub auth_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            storage_path: None,
            room_idle_timeout: Duration::ZERO,
            disconnect_grace: Duration::from_secs(5),
            auth_token: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub snapshots_written: u64,
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Session(#[from] SessionError),
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// The collaboration server.
pub struct SyncServer {
    config: ServerConfig,
    ctx: SessionContext,
    store: Arc<dyn DocumentRepository>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server, opening RocksDB at `storage_path` if one is set.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store: Arc<dyn DocumentRepository> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a server over an already-open store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn DocumentRepository>) -> Self {
        let admission: Arc<dyn Admission> = match &config.auth_token {
            Some(token) => Arc::new(SharedToken::new(token.clone())),
            None => Arc::new(AllowAll),
        };
        let room_config = RoomConfig {
            broadcast_capacity: config.broadcast_capacity,
            idle_timeout: config.room_idle_timeout,
        };
        let ctx = SessionContext::new(store.clone(), Arc::new(YrsEngine), admission, room_config)
            .with_disconnect_grace(config.disconnect_grace);

        Self {
            config,
            ctx,
            store,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = self.ctx.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, ctx, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: SessionContext,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), ServerError> {
        let mut target: Option<ConnectRequest> = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match connect_request(request, addr) {
                Some(parsed) => {
                    target = Some(parsed);
                    Ok(response)
                }
                None => {
                    log::debug!("Rejected handshake for {} from {addr}", request.uri().path());
                    Err(not_found())
                }
            }
        };
        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws_stream) => ws_stream,
            Err(e) => {
                log::debug!("Handshake with {addr} failed: {e}");
                return Ok(());
            }
        };
        let Some(request) = target else {
            return Ok(());
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let Joined {
            mut session,
            mut feed,
            initial_state,
        } = match Session::connect(ctx.clone(), &request).await {
            Ok(joined) => joined,
            Err(e) => {
                let code = match e {
                    SessionError::Unauthorized => {
                        stats.write().await.rejected_connections += 1;
                        CloseCode::Policy
                    }
                    other => {
                        log::error!(
                            "Failed to open session for {} from {addr}: {other}",
                            request.document_id
                        );
                        CloseCode::Error
                    }
                };
                let reason = if code == CloseCode::Policy { "Unauthorized" } else { "Internal error" };
                close(&mut ws_sender, code, reason).await;
                stats.write().await.active_connections -= 1;
                return Ok(());
            }
        };

        log::info!("WebSocket session {} for {} from {addr}", session.id(), request.document_id);

        // The session body owns everything it touches, so a cancelled
        // connection task still reaches disconnect.
        let task = tokio::spawn(async move {
            let result: Result<(), ServerError> = async {
                ws_sender.send(Message::binary(initial_state)).await?;

                loop {
                    tokio::select! {
                        // Incoming WebSocket message
                        msg = ws_receiver.next() => {
                            match msg {
                                Some(Ok(Message::Binary(data))) => {
                                    record_message(&stats, data.len()).await;
                                    // Rejected updates are logged by the session
                                    let _ = session.on_binary(data).await;
                                }

                                Some(Ok(Message::Text(text))) => {
                                    record_message(&stats, text.len()).await;
                                    if let Some(reply) = session.on_text(text.as_str()).await? {
                                        ws_sender.send(reply.into()).await?;
                                    }
                                }

                                Some(Ok(Message::Close(_))) | None => {
                                    log::info!("Connection closed from {addr}");
                                    break;
                                }

                                Some(Err(e)) => {
                                    log::warn!("WebSocket error from {addr}: {e}");
                                    break;
                                }

                                // Pings are answered by tungstenite
                                _ => {}
                            }
                        }

                        // Outgoing room message
                        frame = feed.recv() => {
                            match frame {
                                Ok(frame) => ws_sender.send(frame.into()).await?,
                                Err(FeedError::Lagged(n)) => {
                                    log::warn!("Session {} lagged by {n} messages, closing", session.id());
                                    close(&mut ws_sender, CloseCode::Again, "Lagged").await;
                                    break;
                                }
                                Err(FeedError::Closed) => break,
                            }
                        }
                    }
                }
                Ok(())
            }
            .await;

            session.disconnect().await;
            stats.write().await.active_connections -= 1;
            result
        });

        match task.await {
            Ok(result) => result,
            Err(e) => {
                log::error!("Session task for {addr} failed: {e}");
                Ok(())
            }
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.ctx.registry.room_count().await;
        stats.snapshots_written = self.ctx.synchronizer.snapshots_written();
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Shared session collaborators (registry, synchronizer, router).
    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Get the document store.
    pub fn store(&self) -> &Arc<dyn DocumentRepository> {
        &self.store
    }
}

async fn record_message(stats: &RwLock<ServerStats>, len: usize) {
    let mut s = stats.write().await;
    s.total_messages += 1;
    s.total_bytes += len as u64;
}

async fn close(ws_sender: &mut WsSink, code: CloseCode, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(e) = ws_sender.send(Message::Close(Some(frame))).await {
        log::debug!("Failed to send close frame: {e}");
    }
}

fn not_found() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("Not found".to_string()));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

/// Extract the document id and token from a handshake request.
fn connect_request(request: &Request, addr: SocketAddr) -> Option<ConnectRequest> {
    let document_id = document_id_from_path(request.uri().path())?;
    let token = request
        .uri()
        .query()
        .and_then(token_from_query)
        .or_else(|| {
            request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|t| t.trim().to_owned())
        });

    Some(ConnectRequest {
        document_id,
        token,
        peer_addr: Some(addr),
    })
}

/// `/ws/documents/{id}` or `/ws/documents/{id}/`, with `{id}` percent-decoded.
pub fn document_id_from_path(path: &str) -> Option<DocumentId> {
    let rest = path.strip_prefix(DOCUMENT_PATH_PREFIX)?;
    let raw = rest.strip_suffix('/').unwrap_or(rest);
    if raw.is_empty() || raw.contains('/') {
        return None;
    }
    let id = urlencoding::decode(raw).ok()?;
    if id.is_empty() {
        return None;
    }
    Some(DocumentId::new(id.into_owned()))
}

fn token_from_query(query: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
}
