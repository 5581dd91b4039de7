//! JSON wire protocol between editor clients and the relay.
//!
//! Every frame is one JSON object with a kebab-case `type` tag, carried in a
//! WebSocket text frame:
//!
//! ```text
//! client → relay   join-document | operation | cursor-position
//! relay → client   document-state | operation | user-joined
//!                  | user-left | cursor-update
//! ```
//!
//! `document-state` goes only to the connection that joined and carries the
//! recipient's own `user` record alongside the roster — the connection id is
//! assigned server-side and the socket has no other way to learn it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ot::Operation;

/// A participant in a document, as shown to peers.
///
/// `id` doubles as the OT tie-break key; it is the relay-assigned connection
/// id and stays stable for the life of the socket. `cursor` is display-only
/// and best-effort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    /// Hex colour from the relay's fixed palette.
    pub color: String,
    pub cursor: usize,
}

/// Messages a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Join (or switch to) a document. Joining while already in another
    /// document leaves the previous one first.
    JoinDocument {
        document_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_name: Option<String>,
    },
    /// Submit one local edit against the server's current content.
    Operation { operation: Operation },
    /// Report the local caret position (display-only).
    CursorPosition { position: usize },
}

/// Messages the relay sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Full snapshot for the joining connection: adopt wholesale.
    DocumentState {
        content: String,
        version: u64,
        users: Vec<User>,
        /// The recipient's own record.
        user: User,
    },
    /// A committed peer operation, stamped with the version it produced.
    Operation { operation: Operation, version: u64 },
    UserJoined { user: User, users: Vec<User> },
    UserLeft { user_id: String, users: Vec<User> },
    CursorUpdate { user_id: String, position: usize },
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("connection closed")]
    ConnectionClosed,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}
