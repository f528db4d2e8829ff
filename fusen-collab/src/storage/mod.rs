//! Durable storage layer for the note board.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   mirror writes   ┌──────────────┐
//! │ NoteStore   │ ────────────────► │ KvBackend    │
//! │ (in-memory) │                   │ (trait seam) │
//! └──────┬──────┘                   └──────┬───────┘
//!        │                                 │
//!        │ on startup: list("fusen/")      ├── RocksKv  — RocksDB, durable
//!        ▼                                 └── MemoryKv — tests / no-disk
//! ┌─────────────┐
//! │ notes map   │
//! │ (restored)  │
//! └─────────────┘
//! ```
//!
//! The in-memory map stays authoritative; the backend is a crash-recovery
//! mirror. Keys are `fusen/<id>`, values are bincode-encoded notes.
//!
//! ## Performance Targets
//!
//! | Metric                | Target  | Reference                        |
//! |-----------------------|---------|----------------------------------|
//! | Open (10k notes)      | <100ms  | DDIA Ch.3 — LSM Trees            |
//! | Point read (cache)    | <1ms    | DDIA Ch.3 — SSTables             |
//! | Mirror write          | <50μs   | DDIA Ch.3 — Write Path           |
//! | Recovery (10k notes)  | <500ms  | DDIA Ch.3 — Crash Recovery       |
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 3

pub mod kv;
pub mod rocks;

pub use kv::{KvBackend, KvError, MemoryKv};
pub use rocks::{RocksKv, StoreConfig};
