//! WebSocket relay: canonical linear history per document, fan-out to peers.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── DocumentSession (content, version, log, roster)
//! Client B ──┘         │
//!                      │  submit → apply → version++ → append log
//!                      ▼
//!               PeerRegistry fan-out (roster minus sender)
//!                      │
//!            ┌─────────┴─────────┐
//!            ▼                   ▼
//!         Client A            Client B
//! ```
//!
//! One task per connection. Each connection is bound to at most one document
//! at a time; joining another document leaves the previous one first. All
//! mutation of a document happens under its session lock, and the lock is
//! released before any frame is sent.

use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::PeerRegistry;
use crate::protocol::{ClientMessage, ServerMessage, User};
use crate::session::SessionMap;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// When set, the WebSocket handshake rejects connections whose `Origin`
    /// header differs (the CORS-style check for the browser editor).
    pub allowed_origin: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9000".to_string(),
            allowed_origin: None,
        }
    }
}

impl ServerConfig {
    /// Read configuration from the environment: `COWRITE_BIND_ADDR` (or
    /// `PORT` for the bare listen port) and `COWRITE_CLIENT_ORIGIN`.
    /// Log level is `RUST_LOG`, handled by the logger itself.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("COWRITE_BIND_ADDR") {
            config.bind_addr = addr;
        } else if let Ok(port) = std::env::var("PORT") {
            config.bind_addr = format!("0.0.0.0:{port}");
        }
        if let Ok(origin) = std::env::var("COWRITE_CLIENT_ORIGIN") {
            config.allowed_origin = Some(origin);
        }
        config
    }
}

/// Relay-wide statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub active_documents: usize,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    sessions: Arc<SessionMap>,
    registry: Arc<PeerRegistry>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            sessions: Arc::new(SessionMap::new()),
            registry: Arc::new(PeerRegistry::new()),
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Accept connections forever. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("relay listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("tcp connection from {addr}");

            let sessions = self.sessions.clone();
            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, sessions, registry, stats, config).await
                {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle one WebSocket connection from handshake to disconnect.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        sessions: Arc<SessionMap>,
        registry: Arc<PeerRegistry>,
        stats: Arc<RwLock<RelayStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = match &config.allowed_origin {
            Some(expected) => {
                let expected = expected.clone();
                tokio_tungstenite::accept_hdr_async(stream, move |req: &Request, resp: Response| {
                    let origin = req
                        .headers()
                        .get("origin")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("");
                    if origin == expected {
                        Ok(resp)
                    } else {
                        let mut denied = ErrorResponse::new(None);
                        *denied.status_mut() = StatusCode::FORBIDDEN;
                        Err(denied)
                    }
                })
                .await?
            }
            None => tokio_tungstenite::accept_async(stream).await?,
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let conn_id = Uuid::new_v4().to_string();
        log::info!("connection {conn_id} established from {addr}");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        registry.register(&conn_id, out_tx).await;

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Per-connection dispatcher state.
        let mut current_doc: Option<String> = None;
        let mut current_user: Option<User> = None;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(raw))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                            }
                            match ClientMessage::decode(raw.as_str()) {
                                Ok(client_msg) => {
                                    Self::dispatch(
                                        &conn_id,
                                        client_msg,
                                        &mut current_doc,
                                        &mut current_user,
                                        &sessions,
                                        &registry,
                                        &stats,
                                    )
                                    .await;
                                }
                                Err(e) => {
                                    log::warn!("undecodable frame from {conn_id}: {e}");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection {conn_id} closed");
                            break;
                        }
                        Some(Ok(other)) => {
                            log::debug!("ignoring non-text frame from {conn_id}: {other:?}");
                        }
                        Some(Err(e)) => {
                            log::warn!("websocket error from {conn_id}: {e}");
                            break;
                        }
                    }
                }

                frame = out_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            ws_sender.send(Message::Text(frame.into())).await?;
                        }
                        None => break,
                    }
                }
            }
        }

        // Disconnect is the cancellation primitive: leave and notify peers.
        registry.unregister(&conn_id).await;
        if let Some(doc_id) = current_doc.take() {
            Self::leave_document(&sessions, &registry, &doc_id, &conn_id).await;
        }
        if let Some(user) = current_user.take() {
            log::debug!("connection {conn_id} ({}) cleaned up", user.name);
        }
        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_documents = sessions.document_count().await;
        }

        Ok(())
    }

    /// Route one decoded client message.
    async fn dispatch(
        conn_id: &str,
        msg: ClientMessage,
        current_doc: &mut Option<String>,
        current_user: &mut Option<User>,
        sessions: &SessionMap,
        registry: &PeerRegistry,
        stats: &RwLock<RelayStats>,
    ) {
        match msg {
            ClientMessage::JoinDocument { document_id, user_name } => {
                // One document per connection: switching leaves the old one.
                if let Some(prev) = current_doc.take() {
                    if prev != document_id {
                        Self::leave_document(sessions, registry, &prev, conn_id).await;
                    }
                }

                let session = sessions.get_or_create(&document_id).await;
                let (user, snapshot, members) = {
                    let mut doc = session.lock().await;
                    let (user, snapshot) = doc.join(conn_id, user_name);
                    (user, snapshot, doc.member_ids())
                };

                let state = ServerMessage::DocumentState {
                    content: snapshot.content,
                    version: snapshot.version,
                    users: snapshot.users.clone(),
                    user: user.clone(),
                };
                match state.encode() {
                    Ok(frame) => {
                        registry.send_to(conn_id, &frame).await;
                    }
                    Err(e) => log::error!("failed to encode document-state: {e}"),
                }

                let joined = ServerMessage::UserJoined {
                    user: user.clone(),
                    users: snapshot.users,
                };
                if let Ok(frame) = joined.encode() {
                    registry.fan_out(&members, conn_id, &frame).await;
                }

                log::info!(
                    "user {} ({conn_id}) joined document {document_id}",
                    user.name
                );
                *current_doc = Some(document_id);
                *current_user = Some(user);

                let mut s = stats.write().await;
                s.active_documents = sessions.document_count().await;
            }

            ClientMessage::Operation { operation } => {
                let Some(doc_id) = current_doc.as_deref() else {
                    log::error!("operation from {conn_id} before join-document; dropped");
                    return;
                };
                let Some(session) = sessions.get(doc_id).await else {
                    log::error!("operation from {conn_id} for vanished document {doc_id}");
                    return;
                };

                let result = {
                    let mut doc = session.lock().await;
                    let outcome = doc.submit(conn_id, operation);
                    (outcome, doc.member_ids())
                };
                match result {
                    (Ok(Some((committed, version))), members) => {
                        let msg = ServerMessage::Operation { operation: committed, version };
                        match msg.encode() {
                            Ok(frame) => {
                                registry.fan_out(&members, conn_id, &frame).await;
                            }
                            Err(e) => log::error!("failed to encode operation: {e}"),
                        }
                    }
                    (Ok(None), _) => {
                        log::debug!("degenerate operation from {conn_id} dropped");
                    }
                    (Err(e), _) => {
                        log::error!("rejected operation from {conn_id}: {e}");
                    }
                }
            }

            ClientMessage::CursorPosition { position } => {
                let Some(doc_id) = current_doc.as_deref() else {
                    log::error!("cursor-position from {conn_id} before join-document; dropped");
                    return;
                };
                let Some(session) = sessions.get(doc_id).await else {
                    return;
                };

                let members = {
                    let mut doc = session.lock().await;
                    doc.set_cursor(conn_id, position);
                    doc.member_ids()
                };
                let msg = ServerMessage::CursorUpdate {
                    user_id: conn_id.to_string(),
                    position,
                };
                if let Ok(frame) = msg.encode() {
                    registry.fan_out(&members, conn_id, &frame).await;
                }
            }
        }
    }

    /// Remove a connection from a document and tell the remaining members.
    async fn leave_document(
        sessions: &SessionMap,
        registry: &PeerRegistry,
        doc_id: &str,
        conn_id: &str,
    ) {
        let Some(session) = sessions.get(doc_id).await else {
            return;
        };

        let (left, members, roster) = {
            let mut doc = session.lock().await;
            let left = doc.leave(conn_id);
            (left, doc.member_ids(), doc.roster())
        };

        if let Some(user) = left {
            let msg = ServerMessage::UserLeft { user_id: user.id, users: roster };
            if let Ok(frame) = msg.encode() {
                registry.fan_out(&members, conn_id, &frame).await;
            }
            log::info!("user {} left document {doc_id}", user.name);
        }

        if sessions.remove_if_empty(doc_id).await {
            log::info!("document {doc_id} removed (empty)");
        }
    }

    pub async fn stats(&self) -> RelayStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_documents = self.sessions.document_count().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn sessions(&self) -> &Arc<SessionMap> {
        &self.sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert!(config.allowed_origin.is_none());
    }

    #[test]
    fn test_server_creation() {
        let server = RelayServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9000");
    }

    #[tokio::test]
    async fn test_stats_initial() {
        let server = RelayServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.active_documents, 0);
    }

    #[test]
    fn test_config_from_env_override() {
        std::env::set_var("COWRITE_BIND_ADDR", "0.0.0.0:7777");
        std::env::set_var("COWRITE_CLIENT_ORIGIN", "http://localhost:5173");
        let config = ServerConfig::from_env();
        std::env::remove_var("COWRITE_BIND_ADDR");
        std::env::remove_var("COWRITE_CLIENT_ORIGIN");

        assert_eq!(config.bind_addr, "0.0.0.0:7777");
        assert_eq!(config.allowed_origin.as_deref(), Some("http://localhost:5173"));
    }
}
