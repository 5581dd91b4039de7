//! # cowrite — Real-time collaborative plain-text editing
//!
//! Multiple clients edit a shared document; a central relay enforces a
//! canonical linear history and an operational-transformation kernel keeps
//! every participant convergent.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CollabClient │ ◄─────────────────► │ RelayServer  │
//! │ (per editor) │     JSON frames     │ (central)    │
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌──────────────┐                     ┌──────────────────┐
//! │ local copy + │                     │ DocumentSession  │
//! │ OT algebra   │                     │ (authority)      │
//! └──────────────┘                     └──────┬───────────┘
//!                                             │
//!                                     ┌───────┴────────┐
//!                                     │ PeerRegistry   │
//!                                     │ (fan-out N−1)  │
//!                                     └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`ot`] — pure transform/apply/compose algebra over insert and delete
//! - [`diff`] — change detector: editor snapshots → operations
//! - [`session`] — per-document authoritative state and the document map
//! - [`protocol`] — JSON wire messages
//! - [`broadcast`] — per-member fan-out registry
//! - [`server`] — the relay: dispatch, versioning, broadcast
//! - [`client`] — editor-side driver with reconnect and resync

pub mod ot;
pub mod diff;
pub mod session;
pub mod protocol;
pub mod broadcast;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use ot::{apply, compose, transform, transform_against, Operation, OtError};
pub use diff::detect_edit;
pub use session::{
    CommittedOperation, DocumentSession, SessionError, SessionMap, Snapshot, COLOR_PALETTE,
};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage, User};
pub use broadcast::{FanoutStats, PeerRegistry};
pub use server::{RelayServer, RelayStats, ServerConfig};
pub use client::{ClientEvent, CollabClient, ConnectionState, ReconnectPolicy};
