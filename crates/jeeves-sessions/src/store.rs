use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use jeeves_core::Message;

use crate::error::Result;

/// Active-segment size above which a compaction rotates to a fresh segment
/// instead of rewriting in place. Bytes, checked at compaction time.
/// 2 MiB keeps any single segment a few thousand messages, which bounds both
/// the working-set parse on every turn and what the memory index must
/// re-read after rotation.
pub const ROTATION_SIZE: u64 = 2 * 1024 * 1024;

/// Line dividing a segment into historical (above) and current (below)
/// content. Everything a reader finds after the *last* marker is the live
/// working set.
pub const COMPACTION_MARKER: &str = r#"{"@@compaction":true}"#;

/// Durable per-conversation transcript store.
///
/// Keys are opaque (e.g. `telegram_12345`, `cron_<jobid>`, `heartbeat`);
/// on-disk filenames substitute `_` for anything outside `[A-Za-z0-9._-]`.
/// Single-threaded by contract — callers hold the agent lock.
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The working set: messages in the active segment strictly after its
    /// last compaction marker (the whole segment if none).
    ///
    /// Malformed lines are skipped. A missing, empty, or unreadable segment
    /// yields an empty working set — never an error.
    pub fn get(&self, key: &str) -> Vec<Message> {
        let path = self.active_segment(key).1;
        let raw = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };

        let mut messages: Vec<Message> = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if is_compaction_marker(line) {
                // Everything before the marker is historical.
                messages.clear();
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(msg) => messages.push(msg),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping malformed session line");
                }
            }
        }
        messages
    }

    /// Append `messages` as one JSON-lines block to the active segment.
    /// No-op for an empty slice.
    pub fn append(&self, key: &str, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let path = self.active_segment(key).1;
        self.write_lines(&path, messages, false)?;
        debug!(key, count = messages.len(), "appended messages");
        Ok(())
    }

    /// Rotation-aware compaction rewrite.
    ///
    /// If the active segment exceeds [`ROTATION_SIZE`], the next numbered
    /// segment is created holding only `compacted` (a fresh epoch needs no
    /// leading marker). Otherwise a marker line plus `compacted` is appended
    /// to the active segment. Prior bytes stay on disk either way.
    pub fn compact(&self, key: &str, compacted: &[Message]) -> Result<()> {
        let (index, path) = self.active_segment(key);
        let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

        if size > ROTATION_SIZE {
            let next = self.segment_path(key, index + 1);
            self.write_lines(&next, compacted, false)?;
            debug!(key, segment = index + 1, "rotated session to new segment");
        } else {
            self.write_marker_and_lines(&path, compacted)?;
            debug!(key, segment = index, "compacted session in place");
        }
        Ok(())
    }

    /// Path of the current active segment (external inspection only).
    pub fn path(&self, key: &str) -> PathBuf {
        self.active_segment(key).1
    }

    // --- internals ---------------------------------------------------------

    /// Highest-numbered existing segment for `key`, or segment 0 if the
    /// session has never been written.
    fn active_segment(&self, key: &str) -> (u32, PathBuf) {
        let sanitized = sanitize_key(key);
        let mut highest: u32 = 0;

        if let Ok(entries) = fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if let Some(n) = segment_number(&sanitized, name) {
                    highest = highest.max(n);
                }
            }
        }
        (highest, self.segment_path(key, highest))
    }

    fn segment_path(&self, key: &str, index: u32) -> PathBuf {
        let sanitized = sanitize_key(key);
        if index == 0 {
            self.dir.join(format!("{sanitized}.jsonl"))
        } else {
            self.dir.join(format!("{sanitized}.{index}.jsonl"))
        }
    }

    /// Serialise messages and append them in a single write.
    fn write_lines(&self, path: &Path, messages: &[Message], lead_marker: bool) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut buf = String::new();
        if lead_marker {
            buf.push_str(COMPACTION_MARKER);
            buf.push('\n');
        }
        for msg in messages {
            buf.push_str(&serde_json::to_string(msg)?);
            buf.push('\n');
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(buf.as_bytes())?;
        Ok(())
    }

    fn write_marker_and_lines(&self, path: &Path, messages: &[Message]) -> Result<()> {
        self.write_lines(path, messages, true)
    }
}

/// Map a session key to its on-disk stem: anything outside `[A-Za-z0-9._-]`
/// becomes `_`. Post-sanitisation collisions are a configuration error.
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Parse a directory entry name as a segment of `stem`: `<stem>.jsonl` → 0,
/// `<stem>.<N>.jsonl` → N. Anything else (including other keys that merely
/// share a prefix) → None.
fn segment_number(stem: &str, file_name: &str) -> Option<u32> {
    let rest = file_name.strip_prefix(stem)?;
    if rest == ".jsonl" {
        return Some(0);
    }
    let middle = rest.strip_prefix('.')?.strip_suffix(".jsonl")?;
    middle.parse().ok()
}

/// A line is a marker when it parses as an object carrying
/// `"@@compaction": true`. Covers the canonical literal plus any
/// whitespace-variant a foreign writer may have produced.
fn is_compaction_marker(line: &str) -> bool {
    if line == COMPACTION_MARKER {
        return true;
    }
    serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|v| v.get("@@compaction").and_then(|b| b.as_bool()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jeeves_core::{Content, ContentBlock};
    use tempfile::TempDir;

    fn store() -> (TempDir, SessionStore) {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        (dir, store)
    }

    fn texts(messages: &[Message]) -> Vec<String> {
        messages.iter().map(|m| m.text()).collect()
    }

    #[test]
    fn empty_session_yields_empty_working_set() {
        let (_dir, store) = store();
        assert!(store.get("nope").is_empty());
    }

    #[test]
    fn append_is_monotonic() {
        // P1: Get equals the concatenation of all appends in order.
        let (_dir, store) = store();
        store.append("k", &[Message::user("a"), Message::assistant("b")]).unwrap();
        store.append("k", &[Message::user("c")]).unwrap();
        store.append("k", &[]).unwrap(); // no-op
        store.append("k", &[Message::assistant("d")]).unwrap();

        assert_eq!(texts(&store.get("k")), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn compact_replaces_working_set() {
        // P2: immediately after Compact(k, C), Get(k) == C.
        let (_dir, store) = store();
        for i in 0..10 {
            store.append("k", &[Message::user(format!("m{i}"))]).unwrap();
        }
        let compacted = vec![Message::user("[summary]"), Message::assistant("ok")];
        store.compact("k", &compacted).unwrap();

        assert_eq!(texts(&store.get("k")), vec!["[summary]", "ok"]);
    }

    #[test]
    fn compact_preserves_prior_bytes() {
        // P3: every message line ever appended survives somewhere on disk.
        let (dir, store) = store();
        store.append("k", &[Message::user("precious")]).unwrap();
        store.compact("k", &[Message::user("[summary]")]).unwrap();

        let mut all_bytes = String::new();
        for entry in std::fs::read_dir(dir.path()).unwrap().flatten() {
            all_bytes.push_str(&std::fs::read_to_string(entry.path()).unwrap());
        }
        assert!(all_bytes.contains("precious"));
        assert!(all_bytes.contains("[summary]"));
    }

    #[test]
    fn repeated_compaction_uses_last_marker() {
        let (_dir, store) = store();
        store.append("k", &[Message::user("one")]).unwrap();
        store.compact("k", &[Message::user("s1")]).unwrap();
        store.append("k", &[Message::assistant("two")]).unwrap();
        store.compact("k", &[Message::user("s2")]).unwrap();

        assert_eq!(texts(&store.get("k")), vec!["s2"]);
    }

    #[test]
    fn oversized_segment_rotates_on_compact() {
        let (_dir, store) = store();
        // Inflate the active segment past the rotation threshold.
        let big = "x".repeat(64 * 1024);
        for _ in 0..40 {
            store.append("k", &[Message::user(big.clone())]).unwrap();
        }
        assert!(std::fs::metadata(store.path("k")).unwrap().len() > ROTATION_SIZE);

        store.compact("k", &[Message::user("fresh")]).unwrap();

        let active = store.path("k");
        assert!(active.to_string_lossy().ends_with("k.1.jsonl"));
        assert_eq!(texts(&store.get("k")), vec!["fresh"]);
        // The fresh segment starts a new epoch — no leading marker.
        let content = std::fs::read_to_string(&active).unwrap();
        assert!(!content.contains("@@compaction"));
    }

    #[test]
    fn segments_number_monotonically() {
        let (_dir, store) = store();
        let big = "y".repeat(ROTATION_SIZE as usize + 1024);
        store.append("k", &[Message::user(big.clone())]).unwrap();
        store.compact("k", &[Message::user("gen1")]).unwrap();
        store.append("k", &[Message::user(big)]).unwrap();
        store.compact("k", &[Message::user("gen2")]).unwrap();

        assert!(store.path("k").to_string_lossy().ends_with("k.2.jsonl"));
        assert_eq!(texts(&store.get("k")), vec!["gen2"]);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let (dir, store) = store();
        store.append("k", &[Message::user("good")]).unwrap();
        let path = store.path("k");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{not json at all\n");
        content.push_str(&serde_json::to_string(&Message::assistant("also good")).unwrap());
        content.push('\n');
        std::fs::write(&path, content).unwrap();

        assert_eq!(texts(&store.get("k")), vec!["good", "also good"]);
        drop(dir);
    }

    #[test]
    fn keys_are_sanitized_for_filenames() {
        let (_dir, store) = store();
        store.append("telegram:12345/чат", &[Message::user("hi")]).unwrap();
        let name = store
            .path("telegram:12345/чат")
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || ".-_".contains(c)));
        assert_eq!(texts(&store.get("telegram:12345/чат")), vec!["hi"]);
    }

    #[test]
    fn prefix_sharing_keys_do_not_interfere() {
        let (_dir, store) = store();
        store.append("a", &[Message::user("short")]).unwrap();
        store.append("a_b", &[Message::user("long")]).unwrap();
        assert_eq!(texts(&store.get("a")), vec!["short"]);
        assert_eq!(texts(&store.get("a_b")), vec!["long"]);
    }

    #[test]
    fn block_messages_survive_round_trip() {
        let (_dir, store) = store();
        let msg = Message::assistant_blocks(vec![
            ContentBlock::Text { text: "calling".into() },
            ContentBlock::ToolUse {
                id: "t9".into(),
                name: "bash".into(),
                input: serde_json::json!({"command": "date"}),
            },
        ]);
        store.append("k", std::slice::from_ref(&msg)).unwrap();
        let got = store.get("k");
        assert_eq!(got.len(), 1);
        match &got[0].content {
            Content::Blocks(blocks) => assert_eq!(blocks.len(), 2),
            other => panic!("expected blocks, got {other:?}"),
        }
    }
}
