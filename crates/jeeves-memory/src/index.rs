use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use jeeves_core::Message;

use crate::chunker::chunk_lines;
use crate::db::{blob_to_embedding, embedding_to_blob, init_db};
use crate::embedder::{Embedder, EMBED_BATCH_SIZE};
use crate::error::Result;
use crate::types::SearchResult;

/// Default number of hits returned by [`MemoryIndex::search`].
pub const DEFAULT_MAX_RESULTS: usize = 6;
/// Fused scores below this are dropped.
pub const MIN_SCORE: f64 = 0.35;
/// Weight of the vector branch when both branches produced results.
const VECTOR_WEIGHT: f64 = 0.7;
/// Weight of the lexical branch when both branches produced results.
const LEXICAL_WEIGHT: f64 = 0.3;

/// Hybrid index over curated memory files and historical transcript
/// portions.
///
/// Single-threaded by contract (callers hold the agent lock); the inner
/// mutex only guards the rusqlite connection across await points.
pub struct MemoryIndex {
    db: Mutex<Connection>,
    embedder: Box<dyn Embedder>,
    workspace_dir: PathBuf,
}

impl MemoryIndex {
    /// Open (or create) the index database at `db_path`.
    pub fn open(
        db_path: &Path,
        workspace_dir: impl Into<PathBuf>,
        embedder: Box<dyn Embedder>,
    ) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            embedder,
            workspace_dir: workspace_dir.into(),
        })
    }

    /// In-memory index (tests and ephemeral runs).
    pub fn in_memory(workspace_dir: impl Into<PathBuf>, embedder: Box<dyn Embedder>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            embedder,
            workspace_dir: workspace_dir.into(),
        })
    }

    /// Bring the index up to date with the workspace: memory files
    /// (`MEMORY.md`, `memory/*.md`) and the historical portions of session
    /// segments. Invoked at startup and after every compaction.
    pub async fn sync(&self) -> Result<()> {
        self.sync_memory_files().await?;
        self.sync_session_files().await?;
        Ok(())
    }

    // --- memory file flow --------------------------------------------------

    async fn sync_memory_files(&self) -> Result<()> {
        let mut sources: Vec<(String, String)> = Vec::new(); // (rel path, content)

        let root_memory = self.workspace_dir.join("MEMORY.md");
        if let Ok(content) = std::fs::read_to_string(&root_memory) {
            sources.push(("MEMORY.md".to_string(), content));
        }

        let memory_dir = self.workspace_dir.join("memory");
        if let Ok(entries) = std::fs::read_dir(&memory_dir) {
            let mut paths: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("md"))
                .collect();
            paths.sort();
            for path in paths {
                if let (Some(name), Ok(content)) = (
                    path.file_name().and_then(|n| n.to_str()),
                    std::fs::read_to_string(&path),
                ) {
                    sources.push((format!("memory/{name}"), content));
                }
            }
        }

        let seen: HashSet<String> = sources.iter().map(|(p, _)| p.clone()).collect();
        self.remove_vanished(&seen, |path| {
            path == "MEMORY.md" || path.starts_with("memory/")
        })?;

        for (rel_path, content) in sources {
            self.index_source(&rel_path, &content).await?;
        }
        Ok(())
    }

    // --- session file flow -------------------------------------------------

    async fn sync_session_files(&self) -> Result<()> {
        let sessions_dir = self.workspace_dir.join("sessions");
        let mut groups: BTreeMap<String, Vec<(u32, PathBuf)>> = BTreeMap::new();

        if let Ok(entries) = std::fs::read_dir(&sessions_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if let Some((key, n)) = split_segment_name(name) {
                    groups.entry(key).or_default().push((n, path));
                }
            }
        }

        let mut seen: HashSet<String> = HashSet::new();

        for (_key, mut segments) in groups {
            segments.sort_by_key(|(n, _)| *n);
            let Some(&(active_n, _)) = segments.last() else {
                continue;
            };

            for (n, path) in segments {
                let Some(name) = path.file_name().and_then(|f| f.to_str()) else {
                    continue;
                };
                let rel_path = format!("sessions/{name}");
                let raw = match std::fs::read_to_string(&path) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "unreadable session segment");
                        continue;
                    }
                };

                let indexable = if n == active_n {
                    // Only lines before the last compaction marker are
                    // historical; no marker (or a leading one) means the
                    // whole segment is still the live working set.
                    match historical_prefix(&raw) {
                        Some(prefix) => prefix,
                        None => continue,
                    }
                } else {
                    render_transcript(&raw)
                };

                if indexable.trim().is_empty() {
                    continue;
                }
                seen.insert(rel_path.clone());
                self.index_source(&rel_path, &indexable).await?;
            }
        }

        self.remove_vanished(&seen, |path| path.starts_with("sessions/"))?;
        Ok(())
    }

    // --- shared indexing machinery ----------------------------------------

    /// Index one source: skip when unchanged and complete, retry missing
    /// embeddings in place, otherwise re-chunk and re-embed from scratch.
    async fn index_source(&self, rel_path: &str, content: &str) -> Result<()> {
        let hash = content_hash(content);

        let (known_hash, incomplete) = {
            let db = self.db.lock().unwrap();
            let known_hash: Option<String> = db
                .query_row(
                    "SELECT content_hash FROM files WHERE path = ?1",
                    [rel_path],
                    |row| row.get(0),
                )
                .optional()?;
            let incomplete: bool = db.query_row(
                "SELECT EXISTS(SELECT 1 FROM chunks WHERE file_path = ?1 AND embedding IS NULL)",
                [rel_path],
                |row| row.get(0),
            )?;
            (known_hash, incomplete)
        };

        match known_hash {
            Some(h) if h == hash => {
                if incomplete && self.embedder.is_enabled() {
                    self.embed_missing(rel_path).await?;
                }
                Ok(())
            }
            _ => self.rebuild_source(rel_path, content, &hash).await,
        }
    }

    async fn rebuild_source(&self, rel_path: &str, content: &str, hash: &str) -> Result<()> {
        let spans = chunk_lines(content);
        debug!(path = rel_path, chunks = spans.len(), "indexing source");

        {
            let db = self.db.lock().unwrap();
            let now_ms = now_millis();
            db.execute("DELETE FROM chunks WHERE file_path = ?1", [rel_path])?;
            db.execute("DELETE FROM files WHERE path = ?1", [rel_path])?;
            db.execute(
                "INSERT INTO files (path, content_hash, mtime_ms) VALUES (?1, ?2, ?3)",
                rusqlite::params![rel_path, hash, now_ms],
            )?;
            for span in &spans {
                db.execute(
                    "INSERT INTO chunks (file_path, start_line, end_line, text, chunk_hash)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        rel_path,
                        span.start_line,
                        span.end_line,
                        span.text,
                        content_hash(&span.text),
                    ],
                )?;
            }
        }

        if self.embedder.is_enabled() {
            self.embed_missing(rel_path).await?;
        }
        Ok(())
    }

    /// Embed every NULL-embedding chunk of `rel_path`, in batches. Embedder
    /// failures degrade to lexical-only for this sync (warn, keep NULL).
    async fn embed_missing(&self, rel_path: &str) -> Result<()> {
        let pending: Vec<(i64, String)> = {
            let db = self.db.lock().unwrap();
            let mut stmt = db.prepare(
                "SELECT id, text FROM chunks
                 WHERE file_path = ?1 AND embedding IS NULL
                 ORDER BY id",
            )?;
            let rows = stmt.query_map([rel_path], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.filter_map(|r| r.ok()).collect()
        };

        for batch in pending.chunks(EMBED_BATCH_SIZE) {
            let texts: Vec<String> = batch.iter().map(|(_, t)| t.clone()).collect();
            let vectors = match self.embedder.embed(&texts).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(path = rel_path, error = %e, "embedding failed; chunks stay lexical-only");
                    return Ok(());
                }
            };
            if vectors.is_empty() {
                return Ok(());
            }

            let db = self.db.lock().unwrap();
            for ((id, _), vector) in batch.iter().zip(vectors.iter()) {
                db.execute(
                    "UPDATE chunks SET embedding = ?1 WHERE id = ?2",
                    rusqlite::params![embedding_to_blob(vector), id],
                )?;
            }
        }
        Ok(())
    }

    /// Delete files (and their chunks, via cascade) whose path matches
    /// `belongs` but was not seen in the current scan.
    fn remove_vanished<F: Fn(&str) -> bool>(
        &self,
        seen: &HashSet<String>,
        belongs: F,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let stale: Vec<String> = {
            let mut stmt = db.prepare("SELECT path FROM files")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.filter_map(|r| r.ok())
                .filter(|p| belongs(p) && !seen.contains(p))
                .collect()
        };
        for path in stale {
            info!(path, "removing vanished source from index");
            db.execute("DELETE FROM chunks WHERE file_path = ?1", [&path])?;
            db.execute("DELETE FROM files WHERE path = ?1", [&path])?;
        }
        Ok(())
    }

    // --- search ------------------------------------------------------------

    /// Hybrid search: lexical BM25 and vector cosine branches, fused by
    /// normalised weighted score. Returns at most `max_results` hits, each
    /// scoring at least [`MIN_SCORE`], best first.
    pub async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>> {
        let candidate_cap = max_results.saturating_mul(4).max(1);

        let lexical = match build_match_query(query) {
            Some(match_expr) => self.lexical_candidates(&match_expr, candidate_cap)?,
            None => Vec::new(),
        };

        let vector = match self.embedder.embed(&[query.to_string()]).await {
            Ok(mut vectors) if !vectors.is_empty() => {
                self.vector_candidates(&vectors.remove(0), candidate_cap)?
            }
            Ok(_) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "query embedding failed; lexical-only search");
                Vec::new()
            }
        };

        self.fuse_and_hydrate(lexical, vector, max_results)
    }

    /// FTS5 branch. Score: `1 / (1 + max(0, rank))` with the engine's native
    /// rank, so engines reporting negative-is-better collapse to 1.0 and are
    /// differentiated again by normalisation against the branch top.
    fn lexical_candidates(&self, match_expr: &str, cap: usize) -> Result<Vec<(i64, f64)>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT rowid, rank FROM chunks_fts
             WHERE chunks_fts MATCH ?1
             ORDER BY rank
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![match_expr, cap as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
        })?;
        Ok(rows
            .filter_map(|r| r.ok())
            .map(|(id, rank)| (id, 1.0 / (1.0 + rank.max(0.0))))
            .collect())
    }

    /// Vector branch: cosine similarity against every embedded chunk.
    /// Score: `1 - cosine_distance`.
    fn vector_candidates(&self, query: &[f32], cap: usize) -> Result<Vec<(i64, f64)>> {
        let db = self.db.lock().unwrap();
        let mut stmt =
            db.prepare("SELECT id, embedding FROM chunks WHERE embedding IS NOT NULL")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut scored: Vec<(i64, f64)> = rows
            .filter_map(|r| r.ok())
            .filter_map(|(id, blob)| {
                let embedding = blob_to_embedding(&blob);
                cosine_similarity(query, &embedding).map(|sim| (id, sim))
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(cap);
        Ok(scored)
    }

    fn fuse_and_hydrate(
        &self,
        lexical: Vec<(i64, f64)>,
        vector: Vec<(i64, f64)>,
        max_results: usize,
    ) -> Result<Vec<SearchResult>> {
        let mut fused = fuse_ids(lexical, vector);
        fused.truncate(max_results);
        self.hydrate(&fused)
    }

    /// Load full rows for fused hits, preserving score order.
    fn hydrate(&self, scored: &[(i64, f64)]) -> Result<Vec<SearchResult>> {
        let db = self.db.lock().unwrap();
        let mut out = Vec::with_capacity(scored.len());
        for (id, score) in scored {
            let row = db
                .query_row(
                    "SELECT file_path, start_line, end_line, text FROM chunks WHERE id = ?1",
                    [id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, u32>(1)?,
                            row.get::<_, u32>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()?;
            if let Some((file_path, start_line, end_line, text)) = row {
                out.push(SearchResult {
                    chunk_id: *id,
                    file_path,
                    start_line,
                    end_line,
                    text,
                    score: *score,
                });
            }
        }
        Ok(out)
    }
}

/// Score-level fusion: normalise each branch by its top score, weight
/// vector/lexical 0.7/0.3 (full weight when only one branch produced
/// results), union by chunk id, drop fused scores below [`MIN_SCORE`].
fn fuse_ids(lexical: Vec<(i64, f64)>, vector: Vec<(i64, f64)>) -> Vec<(i64, f64)> {
    let normalise = |branch: &[(i64, f64)]| -> HashMap<i64, f64> {
        let top = branch.iter().map(|(_, s)| *s).fold(f64::MIN, f64::max);
        if top <= 0.0 {
            return HashMap::new();
        }
        branch.iter().map(|(id, s)| (*id, s / top)).collect()
    };

    let lex = normalise(&lexical);
    let vec_ = normalise(&vector);

    let (w_vec, w_lex) = match (vec_.is_empty(), lex.is_empty()) {
        (false, false) => (VECTOR_WEIGHT, LEXICAL_WEIGHT),
        (false, true) => (1.0, 0.0),
        (true, false) => (0.0, 1.0),
        (true, true) => return Vec::new(),
    };

    let mut fused: HashMap<i64, f64> = HashMap::new();
    for (id, s) in &vec_ {
        *fused.entry(*id).or_insert(0.0) += w_vec * s;
    }
    for (id, s) in &lex {
        *fused.entry(*id).or_insert(0.0) += w_lex * s;
    }

    let mut out: Vec<(i64, f64)> = fused
        .into_iter()
        .filter(|(_, s)| *s >= MIN_SCORE)
        .collect();
    out.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    out
}

/// Build an FTS5 MATCH expression: lowercase, strip non-word characters,
/// drop 1-character tokens, quote what remains, join with AND.
/// `None` when nothing searchable survives.
fn build_match_query(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() > 1)
        .map(|t| format!("\"{t}\""))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" AND "))
    }
}

/// Cosine similarity; `None` for zero-length or mismatched vectors.
fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

/// `<key>.jsonl` → (key, 0); `<key>.<N>.jsonl` → (key, N); else None.
fn split_segment_name(name: &str) -> Option<(String, u32)> {
    let stem = name.strip_suffix(".jsonl")?;
    match stem.rsplit_once('.') {
        Some((key, n)) => match n.parse::<u32>() {
            Ok(n) if !key.is_empty() => Some((key.to_string(), n)),
            _ => Some((stem.to_string(), 0)),
        },
        None => Some((stem.to_string(), 0)),
    }
}

/// Render the lines *before* the last compaction marker of an active
/// segment. `None` when the marker is absent or leads the file — that
/// content is still the live working set and has no historical value.
fn historical_prefix(raw: &str) -> Option<String> {
    let lines: Vec<&str> = raw.lines().collect();
    let marker_idx = lines
        .iter()
        .rposition(|l| is_marker_line(l.trim()))?;
    if marker_idx == 0 {
        return None;
    }
    Some(render_lines(&lines[..marker_idx]))
}

/// Reduce a whole (archived) segment to indexable text.
fn render_transcript(raw: &str) -> String {
    let lines: Vec<&str> = raw.lines().collect();
    render_lines(&lines)
}

/// Role-tag each parseable message line; markers and malformed lines
/// contribute nothing.
fn render_lines(lines: &[&str]) -> String {
    let mut out: Vec<String> = Vec::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() || is_marker_line(line) {
            continue;
        }
        let Ok(msg) = serde_json::from_str::<Message>(line) else {
            continue;
        };
        let text = msg.text();
        if text.trim().is_empty() {
            continue;
        }
        let role = match msg.role {
            jeeves_core::Role::User => "User",
            jeeves_core::Role::Assistant => "Assistant",
        };
        out.push(format!("{role}: {text}"));
    }
    out.join("\n")
}

fn is_marker_line(line: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|v| v.get("@@compaction").and_then(|b| b.as_bool()))
        .unwrap_or(false)
}

fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
