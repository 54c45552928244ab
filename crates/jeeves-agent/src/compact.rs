//! Compaction engine — rewrites a session's working set when the prompt
//! budget is exhausted.
//!
//! The tail of the log is kept verbatim (up to half the context window),
//! orphaned tool results in the kept suffix are repaired, and the dropped
//! prefix is summarised by the LLM in adaptively sized batches. A
//! deterministic stub summary stands in when the summariser itself fails —
//! a turn must never abort because compaction misbehaved.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use jeeves_core::{Content, ContentBlock, Message, Role};

use crate::budget::{estimate_message_tokens, CONTEXT_WINDOW_TOKENS};
use crate::client::{ChatRequest, LlmClient};
use crate::prompt::SystemPrompt;

/// Token budget for the kept suffix.
pub const RETAIN_BUDGET_TOKENS: u64 = CONTEXT_WINDOW_TOKENS / 2;

/// Head of every compacted working set.
pub const SUMMARY_PREFIX: &str = "[Previous conversation summary]\n\n";

const SUMMARY_MAX_TOKENS: u32 = 2_048;

const SUMMARISE_SYSTEM: &str = "You summarise conversation history for a personal assistant. \
Capture decisions made, action items, open questions, important facts, user preferences, \
and ongoing tasks. Be specific: keep names, dates, numbers, and file paths. \
Write a compact plain-text summary, nothing else.";

const MERGE_SYSTEM: &str = "You merge partial conversation summaries into one. \
Preserve every decision, action item, open question, fact, preference, and ongoing task \
mentioned in any part. Write a single compact plain-text summary, nothing else.";

/// Rewrite `messages` into a compacted working set: one synthetic user
/// message carrying the summary of the dropped prefix, followed by the
/// repaired kept suffix. Infallible — summariser errors degrade to a stub.
pub async fn compact(client: &dyn LlmClient, messages: &[Message]) -> Vec<Message> {
    let split = split_point(messages);
    let (dropped, kept) = messages.split_at(split);

    if dropped.is_empty() {
        return repair_tool_results(kept.to_vec());
    }

    info!(
        dropped = dropped.len(),
        kept = kept.len(),
        "compacting working set"
    );

    let summary = match summarise(client, dropped).await {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "summarisation failed; using stub summary");
            stub_summary(dropped)
        }
    };

    let mut out = Vec::with_capacity(kept.len() + 1);
    out.push(Message::user(format!("{SUMMARY_PREFIX}{summary}")));
    out.extend(repair_tool_results(kept.to_vec()));
    out
}

/// Index of the first kept message: walk from the tail, admitting messages
/// into the kept suffix while they fit [`RETAIN_BUDGET_TOKENS`]. If nothing
/// fits, keep at least the second half of the log.
fn split_point(messages: &[Message]) -> usize {
    let mut kept_tokens: u64 = 0;
    let mut split = messages.len();

    for (i, msg) in messages.iter().enumerate().rev() {
        let cost = estimate_message_tokens(msg);
        if kept_tokens + cost > RETAIN_BUDGET_TOKENS {
            break;
        }
        kept_tokens += cost;
        split = i;
    }

    if split == messages.len() {
        // Even the newest message alone blows the budget.
        messages.len() / 2
    } else {
        split
    }
}

/// Restore tool-result well-formedness: drop every `tool_result` block whose
/// `tool_use` is not present in the kept suffix, and drop messages left
/// empty by that filtering. String-content messages pass through.
fn repair_tool_results(kept: Vec<Message>) -> Vec<Message> {
    let valid_ids: HashSet<String> = kept
        .iter()
        .flat_map(|m| m.tool_use_ids().into_iter().map(String::from))
        .collect();

    kept.into_iter()
        .filter_map(|msg| match msg.content {
            Content::Text(_) => Some(msg),
            Content::Blocks(blocks) => {
                let filtered: Vec<ContentBlock> = blocks
                    .into_iter()
                    .filter(|b| match b {
                        ContentBlock::ToolResult { tool_use_id, .. } => {
                            let keep = valid_ids.contains(tool_use_id);
                            if !keep {
                                debug!(tool_use_id, "dropping orphaned tool result");
                            }
                            keep
                        }
                        _ => true,
                    })
                    .collect();
                if filtered.is_empty() {
                    None
                } else {
                    Some(Message {
                        role: msg.role,
                        content: Content::Blocks(filtered),
                    })
                }
            }
        })
        .collect()
}

/// Summarise the dropped prefix in LLM-sized batches, merging the partial
/// summaries with a second call when there is more than one.
async fn summarise(
    client: &dyn LlmClient,
    dropped: &[Message],
) -> Result<String, crate::client::ClientError> {
    let batches = partition(dropped);
    debug!(batches = batches.len(), "summarising dropped prefix");

    let mut partials: Vec<String> = Vec::with_capacity(batches.len());
    for batch in &batches {
        let transcript = render_for_summary(batch);
        let reply = summary_call(
            client,
            SUMMARISE_SYSTEM,
            format!("Summarise this conversation section:\n\n{transcript}"),
        )
        .await?;
        partials.push(reply);
    }

    if partials.len() == 1 {
        Ok(partials.remove(0))
    } else {
        summary_call(
            client,
            MERGE_SYSTEM,
            format!("Merge these partial summaries:\n\n{}", partials.join("\n\n---\n\n")),
        )
        .await
    }
}

async fn summary_call(
    client: &dyn LlmClient,
    system: &str,
    user: String,
) -> Result<String, crate::client::ClientError> {
    let req = ChatRequest {
        messages: vec![Message::user(user)],
        tools: Vec::new(),
        system_prompt: SystemPrompt::plain(system),
        model: None,
        max_tokens: SUMMARY_MAX_TOKENS,
    };
    let resp = client.send(&req).await?;
    Ok(resp.text.trim().to_string())
}

/// Split the dropped prefix into consecutive batches sized to the adaptive
/// chunk budget: wordier histories get smaller batches.
fn partition(dropped: &[Message]) -> Vec<Vec<Message>> {
    let total: u64 = dropped.iter().map(estimate_message_tokens).sum();
    let avg = total / dropped.len().max(1) as u64;
    let fraction = if avg > 2_000 {
        0.25
    } else if avg > 1_000 {
        0.3
    } else {
        0.4
    };
    let batch_budget = (CONTEXT_WINDOW_TOKENS as f64 * fraction) as u64;

    let mut batches: Vec<Vec<Message>> = Vec::new();
    let mut current: Vec<Message> = Vec::new();
    let mut current_tokens: u64 = 0;

    for msg in dropped {
        let cost = estimate_message_tokens(msg);
        if !current.is_empty() && current_tokens + cost > batch_budget {
            batches.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current.push(msg.clone());
        current_tokens += cost;
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Plain-text transcript of a batch. Tool traffic is reduced to short
/// notations — the summariser needs the shape of what happened, not the
/// payloads.
fn render_for_summary(batch: &[Message]) -> String {
    batch
        .iter()
        .map(|msg| {
            let role = match msg.role {
                Role::User => "USER",
                Role::Assistant => "ASSISTANT",
            };
            let body = match &msg.content {
                Content::Text(s) => s.clone(),
                Content::Blocks(blocks) => blocks
                    .iter()
                    .map(|b| match b {
                        ContentBlock::Text { text } => text.clone(),
                        ContentBlock::ToolUse { name, .. } => format!("[called tool: {name}]"),
                        ContentBlock::ToolResult { content, .. } => {
                            format!("[tool result: {}]", clip(content, 400))
                        }
                        ContentBlock::Image { .. } => "[Image]".to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
            };
            format!("{role}: {body}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Char-boundary-safe prefix of `s`, at most `max` bytes.
fn clip(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &s[..cut])
}

/// Deterministic fallback when the summariser is unavailable.
fn stub_summary(dropped: &[Message]) -> String {
    let users = dropped.iter().filter(|m| m.role == Role::User).count();
    let assistants = dropped.iter().filter(|m| m.role == Role::Assistant).count();
    let tool_calls: usize = dropped.iter().map(|m| m.tool_use_ids().len()).sum();
    format!(
        "[Conversation summary: {} messages ({users} user, {assistants} assistant), \
{tool_calls} tool calls. Details were compacted to save context.]",
        dropped.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ChatResponse, ClientError, Usage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replies with scripted texts in order; repeats the last one after.
    struct ScriptedSummariser {
        replies: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    impl ScriptedSummariser {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().rev().map(|s| s.to_string()).collect()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedSummariser {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn send(&self, _req: &ChatRequest) -> Result<ChatResponse, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut replies = self.replies.lock().unwrap();
            let text = replies.pop().unwrap_or_else(|| "[summary]".to_string());
            Ok(ChatResponse {
                text,
                tool_calls: Vec::new(),
                stop_reason: "end_turn".to_string(),
                usage: Usage::default(),
            })
        }
    }

    struct BrokenClient;

    #[async_trait]
    impl LlmClient for BrokenClient {
        fn name(&self) -> &str {
            "broken"
        }
        async fn send(&self, _req: &ChatRequest) -> Result<ChatResponse, ClientError> {
            Err(ClientError::Parse("unavailable".to_string()))
        }
    }

    fn conversation(n: usize, chars_per_message: usize) -> Vec<Message> {
        (0..n)
            .map(|i| {
                let text = format!("message {i} {}", "x".repeat(chars_per_message));
                if i % 2 == 0 {
                    Message::user(text)
                } else {
                    Message::assistant(text)
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn summary_heads_the_compacted_set() {
        // Big messages so a prefix is actually dropped.
        let messages = conversation(40, 20_000);
        let client = ScriptedSummariser::new(&["[summary]"]);

        let compacted = compact(&client, &messages).await;

        let head = compacted[0].text();
        assert!(head.starts_with("[Previous conversation summary]\n\n[summary]"));
        assert_eq!(compacted[0].role, Role::User);
        // The kept tail survives verbatim at the end.
        assert_eq!(
            compacted.last().unwrap().text(),
            messages.last().unwrap().text()
        );
        assert!(compacted.len() < messages.len());
    }

    #[tokio::test]
    async fn orphaned_tool_results_are_dropped() {
        // P4: a tool_result whose tool_use fell into the dropped prefix must
        // not survive compaction.
        let mut messages: Vec<Message> = Vec::new();
        messages.push(Message::assistant_blocks(vec![ContentBlock::ToolUse {
            id: "old".into(),
            name: "bash".into(),
            input: serde_json::json!({}),
        }]));
        // Padding so the split lands after the tool_use.
        for msg in conversation(30, 30_000) {
            messages.push(msg);
        }
        // The orphan sits near the tail (kept half).
        messages.push(Message::user_blocks(vec![
            ContentBlock::ToolResult {
                tool_use_id: "old".into(),
                content: "stale".into(),
            },
            ContentBlock::Text {
                text: "and a question".into(),
            },
        ]));
        messages.push(Message::assistant("answer"));

        let client = ScriptedSummariser::new(&["[summary]"]);
        let compacted = compact(&client, &messages).await;

        for msg in &compacted {
            if let Content::Blocks(blocks) = &msg.content {
                for block in blocks {
                    if let ContentBlock::ToolResult { tool_use_id, .. } = block {
                        assert_ne!(tool_use_id, "old");
                    }
                }
            }
        }
        // The sibling text block survives the filtering.
        assert!(compacted.iter().any(|m| m.text().contains("and a question")));
    }

    #[tokio::test]
    async fn paired_tool_use_and_result_in_kept_half_survive() {
        let mut messages = conversation(30, 30_000);
        messages.push(Message::assistant_blocks(vec![ContentBlock::ToolUse {
            id: "fresh".into(),
            name: "bash".into(),
            input: serde_json::json!({"command": "ls"}),
        }]));
        messages.push(Message::user_blocks(vec![ContentBlock::ToolResult {
            tool_use_id: "fresh".into(),
            content: "a.txt".into(),
        }]));

        let client = ScriptedSummariser::new(&["[summary]"]);
        let compacted = compact(&client, &messages).await;

        let has_result = compacted.iter().any(|m| {
            matches!(&m.content, Content::Blocks(blocks) if blocks.iter().any(
                |b| matches!(b, ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "fresh")
            ))
        });
        assert!(has_result);
    }

    #[tokio::test]
    async fn multiple_batches_get_merged() {
        // ~60 messages × 30k chars ≈ 540k estimated tokens → several batches
        // at the 0.25 fraction (avg > 2000 tokens per message).
        let messages = conversation(60, 30_000);
        let client = ScriptedSummariser::new(&[]);

        let compacted = compact(&client, &messages).await;
        // At least two batch summaries plus one merge call happened.
        assert!(client.calls.load(Ordering::SeqCst) >= 3);
        assert!(compacted[0].text().starts_with(SUMMARY_PREFIX));
    }

    #[tokio::test]
    async fn summariser_failure_falls_back_to_stub() {
        let mut messages = conversation(40, 30_000);
        messages.push(Message::assistant_blocks(vec![ContentBlock::ToolUse {
            id: "t1".into(),
            name: "bash".into(),
            input: serde_json::json!({}),
        }]));

        let compacted = compact(&BrokenClient, &messages).await;
        let head = compacted[0].text();
        assert!(head.starts_with(SUMMARY_PREFIX));
        assert!(head.contains("Details were compacted to save context."));
        assert!(head.contains("messages ("));
    }

    #[tokio::test]
    async fn small_working_set_passes_through() {
        let messages = conversation(4, 100);
        let client = ScriptedSummariser::new(&[]);
        let compacted = compact(&client, &messages).await;
        assert_eq!(compacted.len(), 4);
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn split_keeps_second_half_when_everything_is_huge() {
        // One message alone exceeds the retain budget.
        let huge = "y".repeat(1_000_000);
        let messages = vec![
            Message::user(huge.clone()),
            Message::assistant(huge.clone()),
            Message::user(huge.clone()),
            Message::assistant(huge),
        ];
        assert_eq!(split_point(&messages), 2);
    }

    #[test]
    fn stub_summary_counts_roles_and_tools() {
        let messages = vec![
            Message::user("q"),
            Message::assistant_blocks(vec![ContentBlock::ToolUse {
                id: "t".into(),
                name: "bash".into(),
                input: serde_json::json!({}),
            }]),
            Message::user("r"),
        ];
        let stub = stub_summary(&messages);
        assert_eq!(
            stub,
            "[Conversation summary: 3 messages (2 user, 1 assistant), 1 tool calls. \
Details were compacted to save context.]"
        );
    }
}
