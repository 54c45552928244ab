//! Token budget accounting for the agent loop.
//!
//! The budget works off the provider-reported usage of the *latest* call
//! (its input tokens already cover the whole prompt); the estimator below is
//! only for sizing messages the provider has not seen, e.g. compaction
//! batches.

use jeeves_core::{Content, ContentBlock, Message};

/// Fixed provider context window.
pub const CONTEXT_WINDOW_TOKENS: u64 = 200_000;
/// Head-room reserved for the reply.
pub const RESERVE_TOKENS: u64 = 8_192;
/// Soft buffer: flush fires this far before the hard compaction line.
pub const FLUSH_BUFFER_TOKENS: u64 = 4_000;

/// Warn the model (once per turn) to serialise context to disk.
pub fn should_flush(total_tokens: u64) -> bool {
    total_tokens >= CONTEXT_WINDOW_TOKENS - RESERVE_TOKENS - FLUSH_BUFFER_TOKENS
}

/// The working set must be rewritten.
pub fn should_compact(total_tokens: u64) -> bool {
    total_tokens > CONTEXT_WINDOW_TOKENS - RESERVE_TOKENS
}

/// Estimate tokens for a message the provider has not counted:
/// characters ÷ 4, × 1.2 safety margin, rounded up.
pub fn estimate_message_tokens(msg: &Message) -> u64 {
    estimate_tokens(message_chars(msg))
}

pub fn estimate_tokens(chars: usize) -> u64 {
    ((chars as f64 / 4.0) * 1.2).ceil() as u64
}

fn message_chars(msg: &Message) -> usize {
    match &msg.content {
        Content::Text(s) => s.len(),
        Content::Blocks(blocks) => blocks.iter().map(block_chars).sum(),
    }
}

fn block_chars(block: &ContentBlock) -> usize {
    match block {
        ContentBlock::Text { text } => text.len(),
        ContentBlock::ToolUse { name, input, .. } => {
            name.len() + serde_json::to_string(input).map(|s| s.len()).unwrap_or(0)
        }
        ContentBlock::ToolResult { content, .. } => content.len(),
        ContentBlock::Image { media_type, data } => media_type.len() + data.len(),
    }
}
