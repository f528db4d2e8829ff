//! Live session registry with isolated frame fan-out.
//!
//! Each open session owns an unbounded outbound queue; the registry maps
//! session id → queue sender. `broadcast` walks the map and enqueues the
//! frame per session, catch-and-continue: a session whose receiver is gone
//! (transport dead, task unwinding) is skipped and counted, never allowed to
//! abort delivery to the rest. Unregistration of a dead session happens in
//! that session's own close handling, not inside the broadcast loop.
//!
//! Frames are refcounted (`Utf8Bytes`), so fanning one frame out to N
//! sessions clones a pointer, not the payload.
//!
//! Performance target: one frame to 100 sessions < 100µs.
//! Reference: Patterson & Hennessy, Section 6.4 — Interconnection Networks

use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Utf8Bytes;
use uuid::Uuid;

/// Outbound queue handle for one session.
pub type SessionSender = mpsc::UnboundedSender<Utf8Bytes>;

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    /// Per-session frame deliveries that were enqueued
    pub frames_sent: u64,
    /// Sends skipped because the session's receiver was gone
    pub send_failures: u64,
    /// Currently registered sessions
    pub active_sessions: usize,
}

/// Atomic counters — lock-free on the broadcast hot path.
struct AtomicRegistryStats {
    frames_sent: AtomicU64,
    send_failures: AtomicU64,
}

impl AtomicRegistryStats {
    fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
        }
    }
}

/// Session-id → outbound sender map shared by all connection handlers.
pub struct ConnectionRegistry {
    conns: RwLock<HashMap<Uuid, SessionSender>>,
    atomic_stats: AtomicRegistryStats,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            conns: RwLock::new(HashMap::new()),
            atomic_stats: AtomicRegistryStats::new(),
        }
    }

    /// Register a session's outbound sender. Replaces silently if the id is
    /// somehow already present — session ids are freshly generated UUIDs.
    pub async fn register(&self, session_id: Uuid, tx: SessionSender) {
        let mut conns = self.conns.write().await;
        conns.insert(session_id, tx);
    }

    /// Remove a session. Idempotent: unregistering an unknown id is a no-op.
    /// Returns whether the session was present.
    pub async fn unregister(&self, session_id: &Uuid) -> bool {
        let mut conns = self.conns.write().await;
        conns.remove(session_id).is_some()
    }

    /// Enqueue `frame` for every registered session.
    ///
    /// Each send is isolated: a closed queue is counted and skipped, the
    /// loop continues. Returns the number of sessions the frame was
    /// enqueued for.
    pub async fn broadcast(&self, frame: Utf8Bytes) -> usize {
        let conns = self.conns.read().await;
        let mut delivered = 0usize;

        for (session_id, tx) in conns.iter() {
            if tx.send(frame.clone()).is_ok() {
                delivered += 1;
            } else {
                // The session task is gone or going; its close path owns
                // the unregistration.
                self.atomic_stats.send_failures.fetch_add(1, Ordering::Relaxed);
                debug!("Skipping closed session {session_id} during broadcast");
            }
        }

        self.atomic_stats
            .frames_sent
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Current number of registered sessions.
    pub async fn len(&self) -> usize {
        self.conns.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Check if a session is registered.
    pub async fn has_session(&self, session_id: &Uuid) -> bool {
        self.conns.read().await.contains_key(session_id)
    }

    /// All registered session ids.
    pub async fn session_ids(&self) -> Vec<Uuid> {
        self.conns.read().await.keys().copied().collect()
    }

    /// Fan-out statistics (lock-free counters + current session count).
    pub async fn stats(&self) -> RegistryStats {
        let conns = self.conns.read().await;
        RegistryStats {
            frames_sent: self.atomic_stats.frames_sent.load(Ordering::Relaxed),
            send_failures: self.atomic_stats.send_failures.load(Ordering::Relaxed),
            active_sessions: conns.len(),
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
