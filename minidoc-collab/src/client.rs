//! WebSocket client for a document room.
//!
//! Provides:
//! - Connection lifecycle (connect, close)
//! - Binary update send/receive; the first binary frame is the full state
//! - Title and save control messages tagged with this client's sender id
//! - Offline queue for updates made while disconnected
//!
//! Used by tooling and the integration tests; browsers speak the same
//! protocol directly.

use std::collections::VecDeque;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::{self, Message};
use url::Url;
use uuid::Uuid;

use crate::protocol::{ControlMessage, ErrorReply, ProtocolError, ServerEvent, ServerMessage};
use crate::storage::DocumentId;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEvent {
    /// Connection established
    Connected,
    /// Full document state, sent once by the server after joining
    InitialState(Vec<u8>),
    /// Update relayed from another member
    RemoteUpdate(Vec<u8>),
    TitleUpdated {
        title: String,
        sender_id: Option<String>,
    },
    /// Someone saved the document
    Saved { sender_id: Option<String> },
    /// Reply to one of our own control messages
    Error(ErrorReply),
    /// Connection lost; `code` is the close code if the server sent one
    Disconnected { code: Option<u16> },
}

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connect(#[from] tungstenite::Error),
    #[error("not connected")]
    NotConnected,
    #[error("offline queue full")]
    QueueFull,
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Updates made while disconnected, replayed on the next connect.
pub struct OfflineQueue {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update. Returns false when full.
    pub fn enqueue(&mut self, update: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(update);
        true
    }

    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(Vec::len).sum()
    }
}

/// A connection to one document room.
pub struct DocumentClient {
    /// Tags our control messages so we can recognise the echoes
    sender_id: String,

    document_id: DocumentId,

    server_url: String,

    token: Option<String>,

    state: Arc<RwLock<ConnectionState>>,

    offline_queue: Arc<Mutex<OfflineQueue>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,

    event_rx: Option<mpsc::Receiver<DocumentEvent>>,

    event_tx: mpsc::Sender<DocumentEvent>,
}

impl DocumentClient {
    /// `server_url` is the base, e.g. `ws://127.0.0.1:9090`.
    pub fn new(server_url: impl Into<String>, document_id: impl Into<DocumentId>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            sender_id: Uuid::new_v4().to_string(),
            document_id: document_id.into(),
            server_url: server_url.into(),
            token: None,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Present `token` when connecting.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<DocumentEvent>> {
        self.event_rx.take()
    }

    /// The room URL this client connects to. The document id and token are
    /// percent-encoded.
    pub fn url(&self) -> Result<Url, ClientError> {
        let mut url = Url::parse(&self.server_url).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidUrl(self.server_url.clone()))?
            .pop_if_empty()
            .extend(["ws", "documents", self.document_id.as_str()]);
        if let Some(token) = &self.token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }

    /// Connect and spawn the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        let url = self.url()?;
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });
        self.outgoing_tx = Some(out_tx.clone());

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(DocumentEvent::Connected).await;

        // Replay offline queue
        let queued = self.offline_queue.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued updates", queued.len());
            for update in queued {
                out_tx
                    .send(Message::binary(update))
                    .await
                    .map_err(|_| ClientError::NotConnected)?;
            }
        }

        // Reader task: turn frames into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut initial = true;
            let mut code = None;

            while let Some(msg) = ws_reader.next().await {
                let event = match msg {
                    Ok(Message::Binary(data)) => {
                        let update = data.to_vec();
                        if std::mem::take(&mut initial) {
                            Some(DocumentEvent::InitialState(update))
                        } else {
                            Some(DocumentEvent::RemoteUpdate(update))
                        }
                    }
                    Ok(Message::Text(text)) => match ServerMessage::from_json(text.as_str()) {
                        Ok(message) => Some(event_from(message)),
                        Err(e) => {
                            log::warn!("Ignoring unreadable server message: {e}");
                            None
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        code = frame.map(|f| u16::from(f.code));
                        break;
                    }
                    Err(e) => {
                        log::debug!("WebSocket read failed: {e}");
                        break;
                    }
                    _ => None,
                };

                if let Some(event) = event {
                    let _ = event_tx.send(event).await;
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(DocumentEvent::Disconnected { code }).await;
        });

        Ok(())
    }

    /// Send a CRDT update. Queued while disconnected.
    pub async fn send_update(&self, update: Vec<u8>) -> Result<(), ClientError> {
        if self.connection_state().await != ConnectionState::Connected {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(update) {
                return Err(ClientError::QueueFull);
            }
            return Ok(());
        }
        self.send(Message::binary(update)).await
    }

    /// Rename the document for everyone in the room.
    pub async fn publish_title(&self, title: impl Into<String>) -> Result<(), ClientError> {
        self.send_control(ControlMessage::TitleUpdate {
            title: title.into(),
            sender_id: Some(self.sender_id.clone()),
        })
        .await
    }

    /// Ask the server to persist the document now.
    pub async fn publish_save(&self) -> Result<(), ClientError> {
        self.send_control(ControlMessage::Save {
            sender_id: Some(self.sender_id.clone()),
        })
        .await
    }

    /// Send a raw text frame, bypassing control-message encoding.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.send(Message::text(text.into())).await
    }

    /// Close the connection. The reader task emits `Disconnected`.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        let result = self.send(Message::Close(None)).await;
        self.outgoing_tx = None;
        result
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }

    async fn send_control(&self, message: ControlMessage) -> Result<(), ClientError> {
        let text = message.to_json()?;
        self.send(Message::text(text)).await
    }

    async fn send(&self, msg: Message) -> Result<(), ClientError> {
        match &self.outgoing_tx {
            Some(tx) => tx.send(msg).await.map_err(|_| ClientError::NotConnected),
            None => Err(ClientError::NotConnected),
        }
    }
}

fn event_from(message: ServerMessage) -> DocumentEvent {
    match message {
        ServerMessage::Event(ServerEvent::TitleUpdate { title, sender_id }) => {
            DocumentEvent::TitleUpdated { title, sender_id }
        }
        ServerMessage::Event(ServerEvent::Save { sender_id }) => DocumentEvent::Saved { sender_id },
        ServerMessage::Error { error } => DocumentEvent::Error(error),
    }
}
