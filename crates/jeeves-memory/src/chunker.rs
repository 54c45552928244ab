//! Line-oriented chunking with overlap.
//!
//! Chunks target [`CHUNK_TARGET_CHARS`] characters and carry
//! [`CHUNK_OVERLAP_CHARS`] of trailing context into the next chunk so a fact
//! split across a boundary is still retrievable from either side.

/// Target chunk size in characters.
pub const CHUNK_TARGET_CHARS: usize = 1600;
/// Trailing characters repeated at the start of the next chunk.
pub const CHUNK_OVERLAP_CHARS: usize = 320;

/// A chunk before it has been written to the index. Line numbers are
/// 1-indexed and inclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSpan {
    pub start_line: u32,
    pub end_line: u32,
    pub text: String,
}

/// Split `content` into line-aligned chunks.
///
/// Lines are never split; a single line longer than the target becomes its
/// own chunk. Whitespace-only chunks are dropped.
pub fn chunk_lines(content: &str) -> Vec<ChunkSpan> {
    let lines: Vec<&str> = content.lines().collect();
    let mut chunks: Vec<ChunkSpan> = Vec::new();

    // (1-indexed line number, line text)
    let mut buf: Vec<(u32, &str)> = Vec::new();
    let mut buf_chars: usize = 0;

    let flush = |buf: &[(u32, &str)], chunks: &mut Vec<ChunkSpan>| {
        if buf.is_empty() {
            return;
        }
        let text = buf.iter().map(|(_, l)| *l).collect::<Vec<_>>().join("\n");
        if text.trim().is_empty() {
            return;
        }
        chunks.push(ChunkSpan {
            start_line: buf[0].0,
            end_line: buf[buf.len() - 1].0,
            text,
        });
    };

    for (i, line) in lines.iter().enumerate() {
        let line_no = (i + 1) as u32;
        let cost = line.len() + 1; // newline joiner

        if buf_chars + cost > CHUNK_TARGET_CHARS && !buf.is_empty() {
            flush(&buf, &mut chunks);

            // Seed the next chunk with trailing overlap lines.
            let mut overlap: Vec<(u32, &str)> = Vec::new();
            let mut overlap_chars = 0usize;
            for &(n, l) in buf.iter().rev() {
                let c = l.len() + 1;
                if overlap_chars + c > CHUNK_OVERLAP_CHARS {
                    break;
                }
                overlap.push((n, l));
                overlap_chars += c;
            }
            overlap.reverse();
            buf = overlap;
            buf_chars = overlap_chars;
        }

        buf.push((line_no, line));
        buf_chars += cost;
    }
    flush(&buf, &mut chunks);

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_content_is_one_chunk() {
        let chunks = chunk_lines("alpha\nbeta\ngamma");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 3);
        assert_eq!(chunks[0].text, "alpha\nbeta\ngamma");
    }

    #[test]
    fn empty_and_whitespace_only_content_yields_nothing() {
        assert!(chunk_lines("").is_empty());
        assert!(chunk_lines("   \n\t\n  ").is_empty());
    }

    #[test]
    fn long_content_splits_with_overlap() {
        // 100 lines of ~40 chars = ~4100 chars → at least 3 chunks.
        let content = (0..100)
            .map(|i| format!("line {i:03} with some distinctive padding"))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = chunk_lines(&content);
        assert!(chunks.len() >= 3, "got {} chunks", chunks.len());

        for c in &chunks {
            assert!(c.text.len() <= CHUNK_TARGET_CHARS + 64);
            assert!(c.start_line <= c.end_line);
        }
        // Consecutive chunks overlap: the next chunk starts at or before the
        // previous chunk's end line.
        for pair in chunks.windows(2) {
            assert!(pair[1].start_line <= pair[0].end_line);
        }
    }

    #[test]
    fn oversized_single_line_is_its_own_chunk() {
        let long = "z".repeat(5000);
        let content = format!("short\n{long}\ntail");
        let chunks = chunk_lines(&content);
        assert!(chunks.iter().any(|c| c.text.contains(&long)));
        // Line numbering survives the oversized line.
        let tail = chunks.last().unwrap();
        assert_eq!(tail.end_line, 3);
    }

    #[test]
    fn line_numbers_are_one_indexed_inclusive() {
        let chunks = chunk_lines("only");
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 1);
    }
}
