//! Wire types for the document WebSocket.
//!
//! Two kinds of frames share one connection:
//! ```text
//! Binary frame ── opaque CRDT update bytes, relayed verbatim
//! Text frame   ── JSON control message
//!                 {"eventType": "TITLE_UPDATE", "title": "…", "senderId"?: "…"}
//!                 {"eventType": "SAVE", "senderId"?: "…"}
//! ```
//!
//! Server replies are either an event of the same shape or
//! `{"error": "…"}` addressed to the sender only.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite::{Bytes, Message};

/// Title stored and broadcast when a client submits a blank one.
pub const DEFAULT_TITLE: &str = "Untitled document";

const EVENT_TITLE_UPDATE: &str = "TITLE_UPDATE";
const EVENT_SAVE: &str = "SAVE";

/// Inbound control message, parsed from a text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Rename the document. `title` is untrimmed client input.
    TitleUpdate {
        title: String,
        sender_id: Option<String>,
    },
    /// Persist the current replica state now.
    Save { sender_id: Option<String> },
}

impl ControlMessage {
    /// Parse the raw text payload of a control frame.
    ///
    /// Anything that is not JSON is `InvalidJson`. Valid JSON without a
    /// recognised `eventType` (including non-objects) is `InvalidEventType`.
    /// A missing or non-string `title` reads as empty.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;
        let sender_id = value
            .get("senderId")
            .and_then(Value::as_str)
            .map(str::to_owned);

        match value.get("eventType").and_then(Value::as_str) {
            Some(EVENT_TITLE_UPDATE) => Ok(Self::TitleUpdate {
                title: value
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                sender_id,
            }),
            Some(EVENT_SAVE) => Ok(Self::Save { sender_id }),
            _ => Err(ProtocolError::InvalidEventType),
        }
    }

    /// Encode for sending. Inbound and outbound events share one shape.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let event = match self.clone() {
            Self::TitleUpdate { title, sender_id } => ServerEvent::TitleUpdate { title, sender_id },
            Self::Save { sender_id } => ServerEvent::Save { sender_id },
        };
        serde_json::to_string(&event).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Trim a client-supplied title, falling back to [`DEFAULT_TITLE`].
pub fn normalize_title(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        DEFAULT_TITLE.to_owned()
    } else {
        trimmed.to_owned()
    }
}

/// Outbound room notification, fanned out to members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerEvent {
    TitleUpdate {
        title: String,
        #[serde(rename = "senderId", default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
    },
    Save {
        #[serde(rename = "senderId", default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
    },
}

/// Error text sent back to the originating connection only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorReply {
    #[serde(rename = "Invalid JSON data")]
    InvalidJson,
    #[serde(rename = "Invalid event type")]
    InvalidEventType,
    #[serde(rename = "Document not found")]
    DocumentNotFound,
    #[serde(rename = "Storage unavailable")]
    StorageUnavailable,
}

/// Any text frame the server may emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Event(ServerEvent),
    Error { error: ErrorReply },
}

impl ServerMessage {
    pub fn error(error: ErrorReply) -> Self {
        Self::Error { error }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// A frame ready to be written to a WebSocket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Bytes),
    Text(String),
}

impl Frame {
    /// Encode a server message as a text frame.
    pub fn message(msg: &ServerMessage) -> Result<Self, ProtocolError> {
        msg.to_json().map(Frame::Text)
    }

    pub fn error(error: ErrorReply) -> Result<Self, ProtocolError> {
        Self::message(&ServerMessage::error(error))
    }

    pub fn len(&self) -> usize {
        match self {
            Frame::Binary(b) => b.len(),
            Frame::Text(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Binary(data) => Message::Binary(data),
            Frame::Text(text) => Message::text(text),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid JSON data")]
    InvalidJson,
    #[error("invalid event type")]
    InvalidEventType,
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl ProtocolError {
    /// The reply owed to the sender for a control frame that failed to parse.
    pub fn reply(&self) -> ErrorReply {
        match self {
            ProtocolError::InvalidEventType => ErrorReply::InvalidEventType,
            _ => ErrorReply::InvalidJson,
        }
    }
}
