//! `jeeves-sessions` — append-only JSONL transcript store with rotation.
//!
//! One session per conversation key; each session is a sequence of numbered
//! segment files (`<key>.jsonl`, `<key>.1.jsonl`, …). Messages are only ever
//! appended; the single rewrite operation is compaction, which either drops a
//! marker line into the active segment or rotates to a fresh segment once the
//! active one is large. Bytes already on disk are never destroyed — the
//! memory index harvests the historical portions later.

pub mod error;
pub mod store;

pub use error::{Result, SessionError};
pub use store::{SessionStore, COMPACTION_MARKER, ROTATION_SIZE};
