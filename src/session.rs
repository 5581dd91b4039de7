//! Per-document authoritative state: content, version, operation log, roster.
//!
//! One [`DocumentSession`] exists per document id, guarded by a single mutex
//! so that all four mutating entry points (`join`, `leave`, `submit`,
//! `set_cursor`) are serialised — the single-writer critical section the
//! convergence argument leans on. Different documents are independent.
//!
//! [`SessionMap`] is the shared document registry: concurrent
//! `get_or_create` with the read-fast / write-create double-checked pattern.
//!
//! Invariant: `version == operations.len()`, and replaying the log against
//! the empty string reproduces `content`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::ot::{self, Operation};
use crate::protocol::User;

/// Fixed cursor palette; assignment is a process-wide round-robin.
/// Collisions after eight users merely repeat colours.
pub const COLOR_PALETTE: [&str; 8] = [
    "#e74c3c", "#3498db", "#2ecc71", "#f39c12",
    "#9b59b6", "#1abc9c", "#e67e22", "#95a5a6",
];

static COLOR_CURSOR: AtomicUsize = AtomicUsize::new(0);

fn next_color() -> &'static str {
    COLOR_PALETTE[COLOR_CURSOR.fetch_add(1, Ordering::Relaxed) % COLOR_PALETTE.len()]
}

/// One entry of the append-only operation log.
#[derive(Debug, Clone)]
pub struct CommittedOperation {
    pub operation: Operation,
    /// The version this commit produced.
    pub version: u64,
    /// Server wall-clock at commit, milliseconds.
    pub committed_at: u64,
}

/// State handed to a (re)joining connection: adopt wholesale.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub content: String,
    pub version: u64,
    pub users: Vec<User>,
}

/// Session-store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The connection submitted before joining this document.
    #[error("connection {0} is not a member of this document")]
    NotJoined(String),
}

/// Authoritative state for one document.
///
/// The document id lives in the [`SessionMap`] key; the session itself only
/// holds the state the id maps to.
pub struct DocumentSession {
    content: String,
    version: u64,
    operations: Vec<CommittedOperation>,
    users: HashMap<String, User>,
}

impl DocumentSession {
    pub fn new() -> Self {
        Self {
            content: String::new(),
            version: 0,
            operations: Vec::new(),
            users: HashMap::new(),
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn log(&self) -> &[CommittedOperation] {
        &self.operations
    }

    /// Add a user to the roster and return their record plus a snapshot.
    ///
    /// A re-join under the same connection id replaces the old record
    /// (fresh colour, cursor reset).
    pub fn join(&mut self, conn_id: &str, desired_name: Option<String>) -> (User, Snapshot) {
        let user = User {
            id: conn_id.to_string(),
            name: desired_name.unwrap_or_else(|| "Anonymous".to_string()),
            color: next_color().to_string(),
            cursor: 0,
        };
        self.users.insert(conn_id.to_string(), user.clone());
        (user, self.snapshot())
    }

    /// Remove a user from the roster. Idempotent.
    pub fn leave(&mut self, conn_id: &str) -> Option<User> {
        self.users.remove(conn_id)
    }

    /// Apply a member's operation to the authoritative content.
    ///
    /// Positions are trusted to target the current version and clamped into
    /// range: inserts to `[0, len]`, delete positions to `[0, len − length]`
    /// with the length capped at the document length. A delete that clamps
    /// to zero length (and an empty insert, which the data model forbids) is
    /// dropped and the version does not advance — `Ok(None)`.
    ///
    /// On success returns the operation as applied and the new version.
    pub fn submit(
        &mut self,
        conn_id: &str,
        mut op: Operation,
    ) -> Result<Option<(Operation, u64)>, SessionError> {
        if !self.users.contains_key(conn_id) {
            return Err(SessionError::NotJoined(conn_id.to_string()));
        }

        let len = self.content.chars().count();
        match &mut op {
            Operation::Insert { position, text, .. } => {
                if text.is_empty() {
                    return Ok(None);
                }
                *position = (*position).min(len);
            }
            Operation::Delete { position, length, .. } => {
                *length = (*length).min(len);
                *position = (*position).min(len - *length);
                if *length == 0 {
                    return Ok(None);
                }
            }
        }

        // Clamping put the span in range, so apply cannot fail.
        self.content = ot::apply(&self.content, &op).expect("clamped operation in range");
        self.version += 1;
        self.operations.push(CommittedOperation {
            operation: op.clone(),
            version: self.version,
            committed_at: ot::now_millis(),
        });
        Ok(Some((op, self.version)))
    }

    /// Update a member's cursor. Out-of-range values are accepted as-is
    /// (display-only); unknown connections are ignored.
    pub fn set_cursor(&mut self, conn_id: &str, position: usize) {
        if let Some(user) = self.users.get_mut(conn_id) {
            user.cursor = position;
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            content: self.content.clone(),
            version: self.version,
            users: self.roster(),
        }
    }

    pub fn roster(&self) -> Vec<User> {
        self.users.values().cloned().collect()
    }

    /// Connection ids of all members, for fan-out.
    pub fn member_ids(&self) -> Vec<String> {
        self.users.keys().cloned().collect()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn is_member(&self, conn_id: &str) -> bool {
        self.users.contains_key(conn_id)
    }
}

impl Default for DocumentSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared registry of live documents.
///
/// Documents are created lazily on first join and dropped again once the
/// last member leaves.
pub struct SessionMap {
    documents: RwLock<HashMap<String, Arc<Mutex<DocumentSession>>>>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
        }
    }

    /// Get the session for `doc_id`, creating it on first reference.
    pub async fn get_or_create(&self, doc_id: &str) -> Arc<Mutex<DocumentSession>> {
        {
            let docs = self.documents.read().await;
            if let Some(doc) = docs.get(doc_id) {
                return doc.clone();
            }
        }

        let mut docs = self.documents.write().await;
        // Double-check after acquiring the write lock.
        if let Some(doc) = docs.get(doc_id) {
            return doc.clone();
        }
        let doc = Arc::new(Mutex::new(DocumentSession::new()));
        docs.insert(doc_id.to_string(), doc.clone());
        doc
    }

    pub async fn get(&self, doc_id: &str) -> Option<Arc<Mutex<DocumentSession>>> {
        self.documents.read().await.get(doc_id).cloned()
    }

    /// Drop a document whose roster has emptied.
    pub async fn remove_if_empty(&self, doc_id: &str) -> bool {
        let mut docs = self.documents.write().await;
        if let Some(doc) = docs.get(doc_id) {
            if doc.lock().await.user_count() == 0 {
                docs.remove(doc_id);
                return true;
            }
        }
        false
    }

    pub async fn document_count(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn document_ids(&self) -> Vec<String> {
        self.documents.read().await.keys().cloned().collect()
    }
}

impl Default for SessionMap {
    fn default() -> Self {
        Self::new()
    }
}
