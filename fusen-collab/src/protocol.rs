//! Wire protocol for sticky-note board synchronization.
//!
//! Frames are JSON text, tagged by `act`:
//! ```text
//! insert/update: { "act": "insert" | "update", "id": "…",
//!                  "txt"?, "x"?, "y"?, "width"?, "height"? }
//! delete:        { "act": "delete", "id": "…" }
//! ```
//!
//! Inbound frames may carry any subset of the optional fields. Outbound
//! broadcast frames are canonical: insert/update always carry every field of
//! the current note (including `createdAt`), so receivers converge on
//! identical state without merge logic; delete carries only `act` and `id`.
//!
//! Performance target: encode + parse < 2µs for a typical note frame.

use serde::{Deserialize, Serialize};

/// Default note edge length when a client omits `width`/`height` on insert.
///
/// Clients clamp interactive resizes to a 50×50 floor, but that is a UI
/// concern — the server accepts any numeric size.
pub const DEFAULT_NOTE_SIZE: f64 = 96.0;

/// A single sticky note ("fusen").
///
/// `id` is client-generated and opaque; `created_at` is stamped by the
/// server at insert time (epoch millis) and is immutable — it orders notes
/// for rendering and plays no part in conflict resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub txt: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(rename = "createdAt")]
    pub created_at: u64,
}

impl Note {
    /// Materialize a note from a partial patch, filling unset fields with
    /// defaults: empty text, origin position, 96×96 size.
    ///
    /// `created_at` is taken from the caller, never from the patch — the
    /// stamp is server-assigned.
    pub fn new(id: impl Into<String>, patch: &NotePatch, created_at: u64) -> Self {
        Self {
            id: id.into(),
            txt: patch.txt.clone().unwrap_or_default(),
            x: patch.x.unwrap_or(0.0),
            y: patch.y.unwrap_or(0.0),
            width: patch.width.unwrap_or(DEFAULT_NOTE_SIZE),
            height: patch.height.unwrap_or(DEFAULT_NOTE_SIZE),
            created_at,
        }
    }

    /// Field-level merge: only the fields present in the patch are applied,
    /// the rest stay untouched. A `createdAt` in the patch is ignored.
    pub fn merge(&mut self, patch: &NotePatch) {
        if let Some(txt) = &patch.txt {
            self.txt = txt.clone();
        }
        if let Some(x) = patch.x {
            self.x = x;
        }
        if let Some(y) = patch.y {
            self.y = y;
        }
        if let Some(width) = patch.width {
            self.width = width;
        }
        if let Some(height) = patch.height {
            self.height = height;
        }
    }
}

/// Partial set of note fields as carried by insert/update frames.
///
/// Absent fields serialize to nothing (`skip_serializing_if`), so a
/// client-built patch stays as small as what the client actually changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    /// Present on canonical outbound frames; ignored on inbound mutation.
    #[serde(rename = "createdAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
}

impl NotePatch {
    /// Reconstruct a full note from a canonical frame's patch.
    ///
    /// Returns `None` when `createdAt` is absent — a partial patch cannot
    /// stand in for a note. Missing value fields fall back to insert
    /// defaults, same as `Note::new`.
    pub fn into_note(self, id: impl Into<String>) -> Option<Note> {
        let created_at = self.created_at?;
        Some(Note::new(id, &self, created_at))
    }
}

impl From<&Note> for NotePatch {
    /// Full-field patch for canonical outbound frames.
    fn from(note: &Note) -> Self {
        Self {
            txt: Some(note.txt.clone()),
            x: Some(note.x),
            y: Some(note.y),
            width: Some(note.width),
            height: Some(note.height),
            created_at: Some(note.created_at),
        }
    }
}

/// Top-level board message, dispatched by exhaustive match.
///
/// The `act` tag is closed: adding or removing a message kind is a
/// compile-time-checked change. A frame with an unknown `act` fails to
/// parse and is dropped by the caller — the connection stays open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "act", rename_all = "lowercase")]
pub enum BoardMessage {
    Insert {
        id: String,
        #[serde(flatten)]
        patch: NotePatch,
    },
    Update {
        id: String,
        #[serde(flatten)]
        patch: NotePatch,
    },
    Delete {
        id: String,
    },
}

impl BoardMessage {
    /// Canonical insert broadcast frame: full current fields of `note`.
    pub fn insert(note: &Note) -> Self {
        Self::Insert {
            id: note.id.clone(),
            patch: NotePatch::from(note),
        }
    }

    /// Canonical update broadcast frame: full current fields of `note`.
    ///
    /// Also the frame shape used for per-note snapshot delivery to a new
    /// connection.
    pub fn update(note: &Note) -> Self {
        Self::Update {
            id: note.id.clone(),
            patch: NotePatch::from(note),
        }
    }

    /// Delete broadcast frame: `act` and `id` only.
    pub fn delete(id: impl Into<String>) -> Self {
        Self::Delete { id: id.into() }
    }

    /// The note id this message addresses, whatever the variant.
    pub fn id(&self) -> &str {
        match self {
            Self::Insert { id, .. } | Self::Update { id, .. } | Self::Delete { id } => id,
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Parse a JSON text frame.
    ///
    /// Malformed JSON, a missing `id`, and an unknown `act` all surface as
    /// `DeserializationError`; unrecognized extra fields are ignored.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
