//! Authoritative in-memory note store with optional durable mirror.
//!
//! The store owns the single source of truth for the board: a note-id → note
//! map behind a `tokio` RwLock. All mutations (local client edits and remote
//! fanout applies) go through its write lock, so last-writer-wins holds per
//! message rather than per field — concurrent edits to one note serialize
//! instead of interleaving.
//!
//! Semantics:
//! - `insert` is overwrite-on-conflict: re-inserting an existing id replaces
//!   the note and refreshes `createdAt`.
//! - `update` is a field-level merge and a silent no-op for unknown ids —
//!   it never creates.
//! - `delete` is idempotent.
//!
//! When a [`KvBackend`] is attached, every mutation mirrors through it under
//! `fusen/<id>` keys and `load_from_backend` restores the map on startup.
//! Mirror writes are best-effort: a failed write is logged, never surfaced —
//! losing the mirror is recoverable, failing a live mutation is not.

use log::warn;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;

use crate::protocol::{Note, NotePatch};
use crate::storage::{KvBackend, KvError};

/// Key prefix for mirrored notes in the durable backend.
pub const NOTE_KEY_PREFIX: &str = "fusen/";

/// Current time as epoch milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn note_key(id: &str) -> String {
    format!("{NOTE_KEY_PREFIX}{id}")
}

fn encode_note(note: &Note) -> Result<Vec<u8>, KvError> {
    bincode::serde::encode_to_vec(note, bincode::config::standard())
        .map_err(|e| KvError::SerializationError(e.to_string()))
}

fn decode_note(bytes: &[u8]) -> Result<Note, KvError> {
    let (note, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| KvError::DeserializationError(e.to_string()))?;
    Ok(note)
}

/// Authoritative note map, optionally mirrored to a durable backend.
pub struct NoteStore {
    notes: RwLock<HashMap<String, Note>>,
    backend: Option<Arc<dyn KvBackend>>,
}

impl NoteStore {
    /// Memory-only store.
    pub fn new() -> Self {
        Self {
            notes: RwLock::new(HashMap::new()),
            backend: None,
        }
    }

    /// Store mirrored through a durable backend.
    pub fn with_backend(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            notes: RwLock::new(HashMap::new()),
            backend: Some(backend),
        }
    }

    /// Whether a durable mirror is attached.
    pub fn is_durable(&self) -> bool {
        self.backend.is_some()
    }

    /// Create (or overwrite) the note under `id` from a partial patch.
    ///
    /// Unset fields take insert defaults and `createdAt` is stamped fresh —
    /// also on overwrite, so a re-used id re-enters render order as new.
    /// Returns the canonical note for broadcasting.
    pub async fn insert(&self, id: &str, patch: &NotePatch) -> Note {
        let note = Note::new(id, patch, epoch_millis());
        {
            let mut notes = self.notes.write().await;
            notes.insert(id.to_string(), note.clone());
        }
        self.persist(&note);
        note
    }

    /// Merge the fields present in `patch` into the note under `id`.
    ///
    /// Returns `None` without touching anything when the id is unknown —
    /// update never creates.
    pub async fn update(&self, id: &str, patch: &NotePatch) -> Option<Note> {
        let updated = {
            let mut notes = self.notes.write().await;
            let note = notes.get_mut(id)?;
            note.merge(patch);
            note.clone()
        };
        self.persist(&updated);
        Some(updated)
    }

    /// Remove the note under `id`. Returns whether it existed.
    pub async fn delete(&self, id: &str) -> bool {
        let existed = {
            let mut notes = self.notes.write().await;
            notes.remove(id).is_some()
        };
        self.unpersist(id);
        existed
    }

    /// Fetch one note by id.
    pub async fn get(&self, id: &str) -> Option<Note> {
        self.notes.read().await.get(id).cloned()
    }

    /// All current notes in stable order: `createdAt`, then id.
    ///
    /// Feeds per-note snapshot delivery to new connections.
    pub async fn snapshot(&self) -> Vec<Note> {
        let notes = self.notes.read().await;
        let mut all: Vec<Note> = notes.values().cloned().collect();
        all.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        all
    }

    /// Number of notes on the board.
    pub async fn len(&self) -> usize {
        self.notes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Restore the map from the durable backend by scanning `fusen/` keys.
    ///
    /// Called once on startup, before any connection is accepted. Returns
    /// the number of notes restored; undecodable values are skipped with a
    /// warning so one corrupt record never blocks recovery.
    pub async fn load_from_backend(&self) -> Result<usize, KvError> {
        let Some(backend) = &self.backend else {
            return Ok(0);
        };

        let pairs = backend.list(NOTE_KEY_PREFIX)?;
        let mut loaded = 0usize;

        let mut notes = self.notes.write().await;
        for (key, value) in pairs {
            match decode_note(&value) {
                Ok(note) => {
                    notes.insert(note.id.clone(), note);
                    loaded += 1;
                }
                Err(e) => warn!("Skipping undecodable note at '{key}': {e}"),
            }
        }

        Ok(loaded)
    }

    /// Install a note exactly as another replica published it.
    ///
    /// Fanout receive path: `createdAt` is preserved (the origin stamped
    /// it), the local mirror is updated, and nothing is re-published.
    pub async fn apply_upsert(&self, note: Note) {
        {
            let mut notes = self.notes.write().await;
            notes.insert(note.id.clone(), note.clone());
        }
        self.persist(&note);
    }

    /// Apply a remote tombstone. Returns whether the note existed locally.
    ///
    /// The mirror delete runs regardless — the note may have reached the
    /// backend without ever reaching this replica's map.
    pub async fn apply_tombstone(&self, id: &str) -> bool {
        let existed = {
            let mut notes = self.notes.write().await;
            notes.remove(id).is_some()
        };
        self.unpersist(id);
        existed
    }

    /// Best-effort mirror write.
    fn persist(&self, note: &Note) {
        let Some(backend) = &self.backend else {
            return;
        };
        match encode_note(note) {
            Ok(bytes) => {
                if let Err(e) = backend.set(&note_key(&note.id), &bytes) {
                    warn!("Failed to mirror note '{}': {e}", note.id);
                }
            }
            Err(e) => warn!("Failed to encode note '{}': {e}", note.id),
        }
    }

    /// Best-effort mirror delete.
    fn unpersist(&self, id: &str) {
        let Some(backend) = &self.backend else {
            return;
        };
        if let Err(e) = backend.delete(&note_key(id)) {
            warn!("Failed to drop mirrored note '{id}': {e}");
        }
    }
}

impl Default for NoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_NOTE_SIZE;
    use crate::storage::MemoryKv;
    use std::time::Duration;

    fn patch(txt: &str, x: f64, y: f64) -> NotePatch {
        NotePatch {
            txt: Some(txt.into()),
            x: Some(x),
            y: Some(y),
            ..NotePatch::default()
        }
    }

    #[tokio::test]
    async fn test_insert_fills_defaults_and_stamps() {
        let store = NoteStore::new();
        let before = epoch_millis();
        let note = store.insert("a", &NotePatch::default()).await;

        assert_eq!(note.id, "a");
        assert_eq!(note.txt, "");
        assert_eq!(note.x, 0.0);
        assert_eq!(note.y, 0.0);
        assert_eq!(note.width, DEFAULT_NOTE_SIZE);
        assert_eq!(note.height, DEFAULT_NOTE_SIZE);
        assert!(note.created_at >= before);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_insert_duplicate_overwrites_with_fresh_stamp() {
        let store = NoteStore::new();
        let first = store.insert("a", &patch("old", 1.0, 2.0)).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = store.insert("a", &patch("new", 9.0, 9.0)).await;

        assert_eq!(second.txt, "new");
        assert_eq!(second.x, 9.0);
        assert!(
            second.created_at > first.created_at,
            "overwrite must refresh createdAt ({} vs {})",
            second.created_at,
            first.created_at
        );
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get("a").await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_update_merges_only_present_fields() {
        let store = NoteStore::new();
        let inserted = store.insert("a", &patch("hello", 10.0, 20.0)).await;

        let updated = store
            .update(
                "a",
                &NotePatch {
                    txt: Some("edited".into()),
                    ..NotePatch::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.txt, "edited");
        assert_eq!(updated.x, 10.0);
        assert_eq!(updated.y, 20.0);
        assert_eq!(updated.width, inserted.width);
        assert_eq!(updated.height, inserted.height);
        assert_eq!(updated.created_at, inserted.created_at);
    }

    #[tokio::test]
    async fn test_update_unknown_id_is_noop() {
        let store = NoteStore::new();
        store.insert("a", &patch("keep", 0.0, 0.0)).await;
        let before = store.snapshot().await;

        assert!(store.update("ghost", &patch("x", 1.0, 1.0)).await.is_none());
        assert_eq!(store.snapshot().await, before);
    }

    #[tokio::test]
    async fn test_update_never_creates() {
        let store = NoteStore::new();
        assert!(store.update("ghost", &patch("x", 1.0, 1.0)).await.is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_delete_then_delete_is_idempotent() {
        let store = NoteStore::new();
        store.insert("a", &NotePatch::default()).await;

        assert!(store.delete("a").await);
        assert!(store.snapshot().await.is_empty());
        assert!(!store.delete("a").await);
    }

    #[tokio::test]
    async fn test_snapshot_matches_sequential_reduction() {
        let store = NoteStore::new();
        let mut model: HashMap<String, Note> = HashMap::new();

        // Scripted mutation sequence, mirrored into a plain-map reduction.
        let a = store.insert("a", &patch("first", 1.0, 1.0)).await;
        model.insert("a".into(), a);
        let b = store.insert("b", &patch("second", 2.0, 2.0)).await;
        model.insert("b".into(), b);

        if let Some(a2) = store
            .update(
                "a",
                &NotePatch {
                    x: Some(50.0),
                    ..NotePatch::default()
                },
            )
            .await
        {
            model.insert("a".into(), a2);
        }

        store.delete("b").await;
        model.remove("b");

        // No-op mutations leave the model untouched.
        assert!(store.update("missing", &patch("x", 0.0, 0.0)).await.is_none());
        assert!(!store.delete("missing").await);

        let c = store.insert("c", &NotePatch::default()).await;
        model.insert("c".into(), c);

        let mut expected: Vec<Note> = model.into_values().collect();
        expected.sort_by(|m, n| m.created_at.cmp(&n.created_at).then_with(|| m.id.cmp(&n.id)));
        assert_eq!(store.snapshot().await, expected);
    }

    #[tokio::test]
    async fn test_snapshot_ordered_by_created_at_then_id() {
        let store = NoteStore::new();
        store.insert("z", &NotePatch::default()).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.insert("a", &NotePatch::default()).await;

        let snap = store.snapshot().await;
        assert_eq!(snap[0].id, "z", "older note sorts first");
        assert_eq!(snap[1].id, "a");
    }

    #[tokio::test]
    async fn test_mutations_mirror_to_backend() {
        let kv = Arc::new(MemoryKv::new());
        let store = NoteStore::with_backend(kv.clone());

        store.insert("a", &patch("persisted", 3.0, 4.0)).await;
        assert!(kv.get("fusen/a").unwrap().is_some());

        store
            .update(
                "a",
                &NotePatch {
                    txt: Some("edited".into()),
                    ..NotePatch::default()
                },
            )
            .await
            .unwrap();
        let stored = decode_note(&kv.get("fusen/a").unwrap().unwrap()).unwrap();
        assert_eq!(stored.txt, "edited");

        store.delete("a").await;
        assert!(kv.get("fusen/a").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_from_backend_restores_notes() {
        let kv = Arc::new(MemoryKv::new());

        {
            let store = NoteStore::with_backend(kv.clone());
            store.insert("a", &patch("alpha", 1.0, 1.0)).await;
            store.insert("b", &patch("beta", 2.0, 2.0)).await;
            // Store dropped — simulates process exit
        }

        let restored = NoteStore::with_backend(kv);
        let loaded = restored.load_from_backend().await.unwrap();

        assert_eq!(loaded, 2);
        assert_eq!(restored.get("a").await.unwrap().txt, "alpha");
        assert_eq!(restored.get("b").await.unwrap().txt, "beta");
    }

    #[tokio::test]
    async fn test_load_from_backend_skips_undecodable_values() {
        let kv = Arc::new(MemoryKv::new());
        {
            let store = NoteStore::with_backend(kv.clone());
            store.insert("good", &patch("ok", 0.0, 0.0)).await;
        }
        kv.set("fusen/bad", b"\xff\xfe not a note").unwrap();

        let restored = NoteStore::with_backend(kv);
        let loaded = restored.load_from_backend().await.unwrap();

        assert_eq!(loaded, 1);
        assert!(restored.get("good").await.is_some());
        assert!(restored.get("bad").await.is_none());
    }

    #[tokio::test]
    async fn test_load_without_backend_is_zero() {
        let store = NoteStore::new();
        assert_eq!(store.load_from_backend().await.unwrap(), 0);
        assert!(!store.is_durable());
    }

    #[tokio::test]
    async fn test_apply_upsert_preserves_origin_stamp() {
        let store = NoteStore::new();
        let remote = Note {
            id: "r".into(),
            txt: "from another replica".into(),
            x: 5.0,
            y: 6.0,
            width: 120.0,
            height: 80.0,
            created_at: 42,
        };

        store.apply_upsert(remote.clone()).await;
        assert_eq!(store.get("r").await.unwrap(), remote);
    }

    #[tokio::test]
    async fn test_apply_tombstone_removes_note_and_mirror() {
        let kv = Arc::new(MemoryKv::new());
        let store = NoteStore::with_backend(kv.clone());
        store.insert("a", &NotePatch::default()).await;

        assert!(store.apply_tombstone("a").await);
        assert!(store.get("a").await.is_none());
        assert!(kv.get("fusen/a").unwrap().is_none());

        // Unknown id: no-op locally, mirror delete still safe.
        assert!(!store.apply_tombstone("ghost").await);
    }

    #[tokio::test]
    async fn test_note_codec_roundtrip() {
        let note = Note {
            id: "n".into(),
            txt: "付箋".into(),
            x: -1.5,
            y: 2.5,
            width: 96.0,
            height: 96.0,
            created_at: 1_700_000_000_000,
        };
        let bytes = encode_note(&note).unwrap();
        assert_eq!(decode_note(&bytes).unwrap(), note);
    }
}
