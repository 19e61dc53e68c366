//! Connection admission.
//!
//! Credential issuance lives elsewhere; the server only asks a yes/no
//! question before a connection may join a room.

use std::net::SocketAddr;

use crate::storage::DocumentId;

/// Everything known about a connection at handshake time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub document_id: DocumentId,
    /// From `?token=` or `Authorization: Bearer`
    pub token: Option<String>,
    pub peer_addr: Option<SocketAddr>,
}

impl ConnectRequest {
    pub fn new(document_id: impl Into<DocumentId>) -> Self {
        Self {
            document_id: document_id.into(),
            token: None,
            peer_addr: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Decides whether a connection may join.
pub trait Admission: Send + Sync {
    fn admit(&self, request: &ConnectRequest) -> bool;
}

/// Admits everyone. The default when no token is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Admission for AllowAll {
    fn admit(&self, _request: &ConnectRequest) -> bool {
        true
    }
}

/// Admits connections presenting one shared secret.
#[derive(Debug, Clone)]
pub struct SharedToken {
    token: String,
}

impl SharedToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

impl Admission for SharedToken {
    fn admit(&self, request: &ConnectRequest) -> bool {
        match request.token.as_deref() {
            Some(presented) => constant_time_eq(presented.as_bytes(), self.token.as_bytes()),
            None => false,
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
