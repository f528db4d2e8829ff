//! Cross-replica change fan-out.
//!
//! Replicas exchange per-note deltas instead of whole-board snapshots: an
//! upsert carries the full canonical note, a delete travels as a tombstone
//! carrying only the id. Every event is stamped with the publishing
//! replica's origin id and a per-origin sequence number, which lets a
//! receiver drop its own echoes and de-duplicate redelivered events.
//!
//! Delivery is at-least-once and unordered across origins. Per-note
//! last-writer-wins at the store absorbs both properties: applying a stale
//! upsert twice converges to the same state, and a tombstone for an unknown
//! id is a no-op.
//!
//! `FanoutBus` is the backplane seam. `LocalBus` is the in-process
//! implementation used by tests and single-host deployments; a broker-backed
//! bus plugs in behind the same trait.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Ch. 11 —
//! Stream Processing (log-based message brokers)

use crate::protocol::Note;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Channel all replicas of the default board publish on.
pub const DEFAULT_CHANNEL: &str = "earth";

/// Default broadcast buffer per channel before slow subscribers lag.
pub const DEFAULT_FANOUT_CAPACITY: usize = 1024;

// ─────────────────────────────── Errors ───────────────────────────────────

#[derive(Debug)]
pub enum FanoutError {
    /// Event could not be serialized for the wire
    EncodeError(String),
    /// Payload from the bus was not a valid event
    DecodeError(String),
    /// Backplane rejected the publish
    PublishError(String),
}

impl std::fmt::Display for FanoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FanoutError::EncodeError(e) => write!(f, "Fanout encode error: {}", e),
            FanoutError::DecodeError(e) => write!(f, "Fanout decode error: {}", e),
            FanoutError::PublishError(e) => write!(f, "Fanout publish error: {}", e),
        }
    }
}

impl std::error::Error for FanoutError {}

// ─────────────────────────────── Events ───────────────────────────────────

/// One replicated mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NoteChange {
    /// Insert-or-replace with the full canonical note
    Upsert(Note),
    /// Note removed; only the id survives
    Tombstone { id: String },
}

/// Envelope for a change travelling between replicas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanoutEvent {
    /// Publishing replica's instance id
    pub origin: Uuid,
    /// Monotonic per-origin counter, starts at 1
    pub seq: u64,
    pub change: NoteChange,
}

impl FanoutEvent {
    /// Compact binary encoding for the bus payload.
    pub fn encode(&self) -> Result<Vec<u8>, FanoutError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| FanoutError::EncodeError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FanoutError> {
        let (event, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| FanoutError::DecodeError(e.to_string()))?;
        Ok(event)
    }
}

// ──────────────────────────────── Bus ─────────────────────────────────────

/// Pub/sub backplane seam between replicas.
pub trait FanoutBus: Send + Sync {
    /// Publish a payload to everyone subscribed on `channel`. Returns how
    /// many subscribers were reachable at publish time.
    fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize, FanoutError>;

    /// Subscribe to `channel`. Subscribers that fall behind the channel
    /// buffer observe a lag error and continue; the store's last-writer-wins
    /// semantics absorb the gap.
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Arc<Vec<u8>>>;
}

/// In-process bus: one tokio broadcast channel per channel name.
pub struct LocalBus {
    channels: Mutex<HashMap<String, broadcast::Sender<Arc<Vec<u8>>>>>,
    capacity: usize,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Arc<Vec<u8>>> {
        // The map of senders stays usable even if a holder panicked.
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_FANOUT_CAPACITY)
    }
}

impl FanoutBus for LocalBus {
    fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize, FanoutError> {
        // Send fails only when nobody is subscribed; that's a delivery
        // count of zero, not an error.
        Ok(self.sender(channel).send(Arc::new(payload)).unwrap_or(0))
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender(channel).subscribe()
    }
}

// ───────────────────────────── Publisher ──────────────────────────────────

/// Stamps and publishes this replica's mutations, fire-and-forget.
pub struct FanoutPublisher {
    bus: Arc<dyn FanoutBus>,
    channel: String,
    origin: Uuid,
    seq: AtomicU64,
}

impl FanoutPublisher {
    pub fn new(bus: Arc<dyn FanoutBus>, channel: impl Into<String>, origin: Uuid) -> Self {
        Self {
            bus,
            channel: channel.into(),
            origin,
            seq: AtomicU64::new(0),
        }
    }

    pub fn origin(&self) -> Uuid {
        self.origin
    }

    /// Publish an insert-or-replace carrying the full canonical note.
    pub fn publish_upsert(&self, note: &Note) {
        self.publish_change(NoteChange::Upsert(note.clone()));
    }

    /// Publish a deletion tombstone.
    pub fn publish_tombstone(&self, id: impl Into<String>) {
        self.publish_change(NoteChange::Tombstone { id: id.into() });
    }

    fn publish_change(&self, change: NoteChange) {
        let event = FanoutEvent {
            origin: self.origin,
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            change,
        };
        // Fire-and-forget: replication trouble must not stall the session
        // that caused the mutation.
        match event.encode() {
            Ok(payload) => {
                if let Err(e) = self.bus.publish(&self.channel, payload) {
                    log::warn!("Fanout publish failed on '{}': {}", self.channel, e);
                }
            }
            Err(e) => log::warn!("Fanout encode failed: {}", e),
        }
    }
}

// ──────────────────────────── Origin tracking ─────────────────────────────

/// Per-origin high-water marks for replay suppression.
///
/// At-least-once delivery can hand the same event to a subscriber twice;
/// an event at or below the origin's high-water mark is a replay and gets
/// dropped. Gaps (a jump past the next expected seq) are logged and the
/// mark advances — the missed upserts are repaired by whichever write
/// touches those notes next.
#[derive(Debug, Default)]
pub struct OriginTracker {
    last_seen: HashMap<Uuid, u64>,
}

impl OriginTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `seq` from `origin`. Returns false for replays.
    pub fn observe(&mut self, origin: Uuid, seq: u64) -> bool {
        let last = self.last_seen.get(&origin).copied().unwrap_or(0);
        if seq <= last {
            debug!("Dropping replayed fanout event {} from {}", seq, origin);
            return false;
        }
        if seq > last + 1 {
            debug!(
                "Fanout gap from {}: jumped {} -> {} ({} events unseen)",
                origin,
                last,
                seq,
                seq - last - 1
            );
        }
        self.last_seen.insert(origin, seq);
        true
    }

    pub fn origins(&self) -> usize {
        self.last_seen.len()
    }
}
