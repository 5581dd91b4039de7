//! Editor-side session driver.
//!
//! Owns the local document copy and the roster view, and speaks the wire
//! protocol to the relay:
//!
//! - local edit events run the change detector against `prev_content` and
//!   send the resulting operation;
//! - remote operations are applied through the OT algebra, updating
//!   `content` and `prev_content` under one lock so the detector never
//!   mistakes a remote change for a local edit;
//! - a `document-state` snapshot replaces local state wholesale (join and
//!   reconnect resync both go through it).
//!
//! The driver trusts the relay's linearisation: it does not hold back
//! unacknowledged local operations nor transform inbound operations against
//! them. That is sufficient while network latency stays below typing
//! latency.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::diff::detect_edit;
use crate::ot::{self, Operation};
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage, User};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events surfaced to the embedding editor UI.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    /// Snapshot adopted; local state was replaced, not merged.
    DocumentState { content: String, version: u64 },
    /// A peer operation was applied to the local content.
    RemoteOperation { operation: Operation, version: u64 },
    UserJoined(User),
    UserLeft { user_id: String },
    CursorUpdate { user_id: String, position: usize },
}

/// Reconnect policy: bounded attempts with linearly growing delay.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// Local document copy plus the roster view, guarded by one lock.
#[derive(Default)]
struct LocalDocument {
    content: String,
    /// Last text the change detector compared against.
    prev_content: String,
    version: u64,
    /// Operations observed in commit order (local and remote).
    observed: Vec<Operation>,
    /// Peers, keyed by user id; never contains self.
    roster: HashMap<String, User>,
    /// Our own record, known once the first `document-state` arrives.
    me: Option<User>,
}

struct ClientInner {
    server_url: String,
    desired_name: Option<String>,
    reconnect: ReconnectPolicy,
    state: RwLock<ConnectionState>,
    document_id: RwLock<Option<String>>,
    doc: Mutex<LocalDocument>,
    outgoing: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
}

impl ClientInner {
    fn emit(&self, event: ClientEvent) {
        let _ = self.event_tx.send(event);
    }

    async fn send_frame(&self, frame: String) -> Result<(), ProtocolError> {
        let outgoing = self.outgoing.read().await;
        match outgoing.as_ref() {
            Some(tx) => tx
                .send(Message::Text(frame.into()))
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Open the socket, spawn the writer and reader tasks, re-join the
    /// current document if this is a reconnect.
    async fn establish(self: Arc<Self>) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.server_url.as_str()).await
        {
            Ok(ok) => ok,
            Err(_) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        *self.outgoing.write().await = Some(out_tx);

        // Writer: drain the outbound channel into the socket.
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_writer.send(msg).await.is_err() {
                    break;
                }
            }
        });

        *self.state.write().await = ConnectionState::Connected;
        self.emit(ClientEvent::Connected);

        // Reconnect re-joins the same document; the fresh snapshot the
        // relay answers with replaces local state.
        if let Some(doc_id) = self.document_id.read().await.clone() {
            let join = ClientMessage::JoinDocument {
                document_id: doc_id,
                user_name: self.desired_name.clone(),
            };
            self.send_frame(join.encode()?).await?;
        }

        // Reader: decode frames until the connection drops.
        let inner = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(raw)) => match ServerMessage::decode(raw.as_str()) {
                        Ok(server_msg) => inner.handle_server_message(server_msg).await,
                        Err(e) => log::warn!("undecodable frame from relay: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            inner.connection_lost().await;
        });

        Ok(())
    }

    fn establish_boxed(
        self: Arc<Self>,
    ) -> Pin<Box<dyn Future<Output = Result<(), ProtocolError>> + Send>> {
        Box::pin(self.establish())
    }

    async fn connection_lost(self: Arc<Self>) {
        *self.outgoing.write().await = None;
        *self.state.write().await = ConnectionState::Disconnected;
        self.emit(ClientEvent::Disconnected);

        if self.reconnect.max_attempts == 0 || self.document_id.read().await.is_none() {
            return;
        }

        let inner = self.clone();
        tokio::spawn(async move {
            for attempt in 1..=inner.reconnect.max_attempts {
                *inner.state.write().await = ConnectionState::Reconnecting;
                tokio::time::sleep(inner.reconnect.base_delay * attempt).await;
                match inner.clone().establish_boxed().await {
                    Ok(()) => return,
                    Err(_) => {
                        log::warn!("reconnect attempt {attempt} failed");
                    }
                }
            }
            *inner.state.write().await = ConnectionState::Disconnected;
            log::error!("reconnect attempts exhausted");
        });
    }

    async fn handle_server_message(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::DocumentState { content, version, users, user } => {
                {
                    let mut doc = self.doc.lock().await;
                    doc.content = content.clone();
                    doc.prev_content = content.clone();
                    doc.version = version;
                    doc.roster = users
                        .into_iter()
                        .filter(|u| u.id != user.id)
                        .map(|u| (u.id.clone(), u))
                        .collect();
                    doc.me = Some(user);
                }
                self.emit(ClientEvent::DocumentState { content, version });
            }

            ServerMessage::Operation { operation, version } => {
                let applied = {
                    let mut doc = self.doc.lock().await;
                    match ot::apply(&doc.content, &operation) {
                        Ok(next) => {
                            doc.content = next.clone();
                            // prev_content moves with content so the detector
                            // does not see this as a local edit.
                            doc.prev_content = next;
                            doc.version = version;
                            doc.observed.push(operation.clone());
                            true
                        }
                        Err(e) => {
                            log::error!("remote operation did not apply: {e}");
                            false
                        }
                    }
                };
                if applied {
                    self.emit(ClientEvent::RemoteOperation { operation, version });
                }
            }

            ServerMessage::UserJoined { user, .. } => {
                let mut doc = self.doc.lock().await;
                let me = doc.me.as_ref().map(|m| m.id.clone());
                if me.as_deref() != Some(user.id.as_str()) {
                    doc.roster.insert(user.id.clone(), user.clone());
                    drop(doc);
                    self.emit(ClientEvent::UserJoined(user));
                }
            }

            ServerMessage::UserLeft { user_id, users } => {
                {
                    let mut doc = self.doc.lock().await;
                    let me = doc.me.as_ref().map(|m| m.id.clone());
                    doc.roster = users
                        .into_iter()
                        .filter(|u| Some(u.id.as_str()) != me.as_deref())
                        .map(|u| (u.id.clone(), u))
                        .collect();
                }
                self.emit(ClientEvent::UserLeft { user_id });
            }

            ServerMessage::CursorUpdate { user_id, position } => {
                {
                    let mut doc = self.doc.lock().await;
                    if let Some(user) = doc.roster.get_mut(&user_id) {
                        user.cursor = position;
                    }
                }
                self.emit(ClientEvent::CursorUpdate { user_id, position });
            }
        }
    }
}

/// The collaborative-editing client.
pub struct CollabClient {
    inner: Arc<ClientInner>,
    event_rx: Option<mpsc::UnboundedReceiver<ClientEvent>>,
}

impl CollabClient {
    pub fn new(server_url: impl Into<String>, user_name: Option<String>) -> Self {
        Self::with_reconnect_policy(server_url, user_name, ReconnectPolicy::default())
    }

    pub fn with_reconnect_policy(
        server_url: impl Into<String>,
        user_name: Option<String>,
        reconnect: ReconnectPolicy,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ClientInner {
                server_url: server_url.into(),
                desired_name: user_name,
                reconnect,
                state: RwLock::new(ConnectionState::Disconnected),
                document_id: RwLock::new(None),
                doc: Mutex::new(LocalDocument::default()),
                outgoing: RwLock::new(None),
                event_tx,
            }),
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to the relay.
    pub async fn connect(&self) -> Result<(), ProtocolError> {
        self.inner.clone().establish().await
    }

    /// Join a document. The relay answers with `document-state`.
    pub async fn join(&self, document_id: impl Into<String>) -> Result<(), ProtocolError> {
        let document_id = document_id.into();
        *self.inner.document_id.write().await = Some(document_id.clone());
        let msg = ClientMessage::JoinDocument {
            document_id,
            user_name: self.inner.desired_name.clone(),
        };
        self.inner.send_frame(msg.encode()?).await
    }

    /// Record a local edit event.
    ///
    /// Runs the change detector against the last snapshot, adopts
    /// `new_text` locally, and sends the detected operation. Returns the
    /// operation that was sent, if any. Edits made before the join snapshot
    /// arrives (or while offline) update local text only; the next resync
    /// replaces them.
    pub async fn edit(
        &self,
        new_text: &str,
        caret_after: usize,
    ) -> Result<Option<Operation>, ProtocolError> {
        let op = {
            let mut doc = self.inner.doc.lock().await;
            let op = doc
                .me
                .as_ref()
                .map(|me| me.id.clone())
                .and_then(|uid| detect_edit(&doc.prev_content, new_text, caret_after, &uid));
            doc.content = new_text.to_string();
            doc.prev_content = new_text.to_string();
            if let Some(ref op) = op {
                doc.observed.push(op.clone());
            }
            op
        };

        match op {
            Some(op) => {
                let msg = ClientMessage::Operation { operation: op.clone() };
                match self.inner.send_frame(msg.encode()?).await {
                    Ok(()) => Ok(Some(op)),
                    Err(_) => {
                        log::debug!("edit while offline; awaiting resync");
                        Ok(None)
                    }
                }
            }
            None => Ok(None),
        }
    }

    /// Report a caret move. Silently dropped when offline (display-only).
    pub async fn set_cursor(&self, position: usize) -> Result<(), ProtocolError> {
        let msg = ClientMessage::CursorPosition { position };
        match self.inner.send_frame(msg.encode()?).await {
            Ok(()) => Ok(()),
            Err(_) => Ok(()),
        }
    }

    /// Close the connection cleanly. Local state is kept; a later
    /// [`connect`](Self::connect) re-joins the current document and adopts
    /// the relay's fresh snapshot.
    pub async fn disconnect(&self) {
        let mut outgoing = self.inner.outgoing.write().await;
        if let Some(tx) = outgoing.take() {
            let _ = tx.send(Message::Close(None));
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    pub async fn document_id(&self) -> Option<String> {
        self.inner.document_id.read().await.clone()
    }

    pub async fn content(&self) -> String {
        self.inner.doc.lock().await.content.clone()
    }

    pub async fn version(&self) -> u64 {
        self.inner.doc.lock().await.version
    }

    /// Our own record, known once the join snapshot has arrived.
    pub async fn user(&self) -> Option<User> {
        self.inner.doc.lock().await.me.clone()
    }

    /// Peers currently in the document (never includes self).
    pub async fn roster(&self) -> Vec<User> {
        self.inner.doc.lock().await.roster.values().cloned().collect()
    }

    /// Number of operations observed so far, local and remote.
    pub async fn observed_len(&self) -> usize {
        self.inner.doc.lock().await.observed.len()
    }

    pub fn server_url(&self) -> &str {
        &self.inner.server_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> CollabClient {
        CollabClient::with_reconnect_policy(
            "ws://127.0.0.1:1",
            Some("Tester".into()),
            ReconnectPolicy { max_attempts: 0, base_delay: Duration::from_millis(1) },
        )
    }

    #[tokio::test]
    async fn test_initial_state() {
        let client = test_client();
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.content().await, "");
        assert_eq!(client.version().await, 0);
        assert!(client.user().await.is_none());
        assert!(client.document_id().await.is_none());
    }

    #[test]
    fn test_take_event_rx_once() {
        let mut client = test_client();
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_join_without_connection_fails() {
        let client = test_client();
        assert!(client.join("doc").await.is_err());
        // The target document is remembered for a later (re)connect.
        assert_eq!(client.document_id().await.as_deref(), Some("doc"));
    }

    #[tokio::test]
    async fn test_edit_before_join_is_local_only() {
        let client = test_client();
        let sent = client.edit("hello", 5).await.unwrap();
        assert!(sent.is_none());
        assert_eq!(client.content().await, "hello");
        assert_eq!(client.observed_len().await, 0);
    }

    #[tokio::test]
    async fn test_set_cursor_offline_is_silent() {
        let client = test_client();
        client.set_cursor(3).await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_operation_updates_prev_content() {
        let client = test_client();
        // Simulate an adopted snapshot followed by a remote insert.
        client
            .inner
            .handle_server_message(ServerMessage::DocumentState {
                content: "ab".into(),
                version: 2,
                users: vec![],
                user: User {
                    id: "me".into(),
                    name: "Tester".into(),
                    color: "#3498db".into(),
                    cursor: 0,
                },
            })
            .await;
        client
            .inner
            .handle_server_message(ServerMessage::Operation {
                operation: Operation::insert("peer", 1, "X"),
                version: 3,
            })
            .await;

        assert_eq!(client.content().await, "aXb");
        assert_eq!(client.version().await, 3);
        // prev_content moved with content: a subsequent identical edit event
        // detects nothing.
        let sent = client.edit("aXb", 3).await.unwrap();
        assert!(sent.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_replaces_roster_minus_self() {
        let client = test_client();
        let me = User { id: "me".into(), name: "T".into(), color: "#111111".into(), cursor: 0 };
        let peer = User { id: "p1".into(), name: "P".into(), color: "#222222".into(), cursor: 4 };
        client
            .inner
            .handle_server_message(ServerMessage::DocumentState {
                content: "x".into(),
                version: 1,
                users: vec![me.clone(), peer.clone()],
                user: me,
            })
            .await;

        let roster = client.roster().await;
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].id, "p1");
    }
}
