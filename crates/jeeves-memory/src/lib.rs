//! `jeeves-memory` — persistent hybrid (vector + FTS5) index over durable
//! memory notes and historical session transcripts.
//!
//! The index is a cache: it can be rebuilt at any time from the canonical
//! `.md` files and session segments, and it is re-synced at startup and
//! after every compaction. Search fuses dense-vector cosine similarity with
//! lexical BM25 over the same chunk set; without an embeddings backend it
//! degrades to lexical-only operation.

pub mod chunker;
pub mod db;
pub mod embedder;
pub mod error;
pub mod index;
pub mod types;

pub use embedder::{Embedder, NoopEmbedder, OpenAiEmbedder, EMBED_BATCH_SIZE};
pub use error::{MemoryError, Result};
pub use index::{MemoryIndex, DEFAULT_MAX_RESULTS, MIN_SCORE};
pub use types::{Chunk, IndexedFile, SearchResult};
