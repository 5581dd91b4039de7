//! Per-member fan-out: deliver a frame to every roster member but the sender.
//!
//! There is deliberately no room-broadcast primitive here. Each connection
//! registers an outbound channel keyed by its connection id; a broadcast is
//! the dispatcher iterating a roster snapshot and sending to each peer
//! individually. A peer whose channel has gone away simply misses the frame
//! (recovery is reconnect-and-resync, never retry).
//!
//! Counters are atomics so the fan-out hot path never takes a lock beyond
//! the registry read.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, RwLock};

/// Snapshot of fan-out counters.
#[derive(Debug, Clone, Default)]
pub struct FanoutStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub connected_peers: usize,
}

/// Registry of live connections and their outbound frame channels.
///
/// Frames are pre-encoded JSON text; the connection's writer task owns the
/// WebSocket sink and drains its channel.
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, mpsc::UnboundedSender<String>>>,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }

    /// Register a connection's outbound channel.
    pub async fn register(&self, conn_id: &str, tx: mpsc::UnboundedSender<String>) {
        self.peers.write().await.insert(conn_id.to_string(), tx);
    }

    /// Remove a connection. Idempotent.
    pub async fn unregister(&self, conn_id: &str) {
        self.peers.write().await.remove(conn_id);
    }

    /// Send one frame to a single connection.
    pub async fn send_to(&self, conn_id: &str, frame: &str) -> bool {
        let peers = self.peers.read().await;
        match peers.get(conn_id) {
            Some(tx) if tx.send(frame.to_string()).is_ok() => {
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Send one frame to every member except `sender`.
    ///
    /// `members` is a roster snapshot taken under the document lock; the
    /// sends themselves happen outside it. Returns how many peers received
    /// the frame.
    pub async fn fan_out(&self, members: &[String], sender: &str, frame: &str) -> usize {
        let peers = self.peers.read().await;
        let mut delivered = 0;
        for member in members {
            if member == sender {
                continue;
            }
            match peers.get(member) {
                Some(tx) if tx.send(frame.to_string()).is_ok() => delivered += 1,
                _ => {
                    self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.frames_sent.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn stats(&self) -> FanoutStats {
        FanoutStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            connected_peers: self.peers.read().await.len(),
        }
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
