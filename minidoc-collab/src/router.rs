//! Control-message router for text frames.
//!
//! | Inbound        | Success                         | Failure (sender only)        |
//! |----------------|---------------------------------|------------------------------|
//! | not JSON       | -                               | `Invalid JSON data`          |
//! | unknown event  | -                               | `Invalid event type`         |
//! | `TITLE_UPDATE` | store title, broadcast to all   | `Document not found` / store |
//! | `SAVE`         | save snapshot, broadcast to all | `Document not found` / store |
//!
//! "All" includes the sender. Nothing here closes the connection or touches
//! the dirty flag.

use std::sync::Arc;

use crate::persistence::Synchronizer;
use crate::protocol::{normalize_title, ControlMessage, ErrorReply, Frame, ServerEvent, ServerMessage};
use crate::session::Session;
use crate::storage::{DocumentRepository, StoreError};

pub struct Router {
    store: Arc<dyn DocumentRepository>,
    synchronizer: Arc<Synchronizer>,
}

impl Router {
    pub fn new(store: Arc<dyn DocumentRepository>, synchronizer: Arc<Synchronizer>) -> Self {
        Self { store, synchronizer }
    }

    /// Handle one text frame from `session`.
    ///
    /// Room-wide notifications go out through the room channel; the return
    /// value is the reply owed to the sender alone, if any.
    pub async fn dispatch(&self, session: &Session, text: &str) -> Option<Frame> {
        let message = match ControlMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                log::debug!("Bad control message from session {}: {e}", session.id());
                return reply(e.reply());
            }
        };

        match message {
            ControlMessage::TitleUpdate { title, sender_id } => {
                let title = normalize_title(&title);
                if let Err(e) = self.store.update_title(session.document_id(), &title) {
                    log::warn!("Title update for {} failed: {e}", session.document_id());
                    return reply(error_reply(&e));
                }
                log::info!("Document {} renamed to {title:?}", session.document_id());
                announce(session, ServerEvent::TitleUpdate { title, sender_id });
                None
            }
            ControlMessage::Save { sender_id } => {
                if let Err(e) = self.synchronizer.save_explicit(session).await {
                    log::warn!("Explicit save for {} failed: {e}", session.document_id());
                    return reply(error_reply(&e));
                }
                announce(session, ServerEvent::Save { sender_id });
                None
            }
        }
    }
}

/// Map a store failure to the text the sender sees.
pub fn error_reply(error: &StoreError) -> ErrorReply {
    match error {
        StoreError::NotFound(_) => ErrorReply::DocumentNotFound,
        _ => ErrorReply::StorageUnavailable,
    }
}

fn reply(error: ErrorReply) -> Option<Frame> {
    match Frame::error(error) {
        Ok(frame) => Some(frame),
        Err(e) => {
            log::error!("Failed to encode error reply: {e}");
            None
        }
    }
}

fn announce(session: &Session, event: ServerEvent) {
    match Frame::message(&ServerMessage::Event(event)) {
        Ok(frame) => {
            session.room().broadcast(frame, None);
        }
        Err(e) => log::error!("Failed to encode room event: {e}"),
    }
}
