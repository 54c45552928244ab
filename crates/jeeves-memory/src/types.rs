use serde::{Deserialize, Serialize};

/// One indexable source: a memory file or a transcript segment.
/// `path` is workspace-relative (`memory/2025-06-01.md`,
/// `sessions/heartbeat.jsonl`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedFile {
    pub path: String,
    pub content_hash: String,
}

/// A chunk of an indexed file. Line numbers are 1-indexed and inclusive and
/// refer to the *indexed text* (for session files that is the role-tagged
/// rendering, not the raw JSONL).
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: i64,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub text: String,
    pub chunk_hash: String,
    /// Absent until the embedder has produced a vector; lexically searchable
    /// either way.
    pub embedding: Option<Vec<f32>>,
}

/// A scored hit returned by [`crate::MemoryIndex::search`].
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunk_id: i64,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub text: String,
    /// Fused score in `[MIN_SCORE, 1]`.
    pub score: f64,
}
