//! The turn executor: prompt → LLM → tool dispatch → repeat, bounded.
//!
//! Budgets are checked against the provider-reported usage of the latest
//! call: a low budget first injects a one-shot flush prompt (asking the
//! model to persist context to a memory file), a blown budget triggers a
//! compaction rewrite mid-turn. New messages are buffered and written in
//! one append per natural exit or compaction point, so the on-disk stream
//! is a correct prefix at all times even if the process dies mid-iteration.

use std::sync::Arc;

use chrono::Local;
use tracing::{debug, info, warn};

use jeeves_core::{ContentBlock, Message};
use jeeves_memory::MemoryIndex;
use jeeves_sessions::SessionStore;

use crate::budget::{should_compact, should_flush};
use crate::client::{ChatRequest, ChatResponse, LlmClient};
use crate::compact::compact;
use crate::error::Result;
use crate::progress::{NoopProgress, ProgressSink};
use crate::prompt::PromptBuilder;
use crate::tools::ToolRegistry;

/// Upper bound on LLM calls per turn, to stop runaway tool loops.
pub const MAX_ITERATIONS: usize = 25;

/// Reply when the bound is hit. Not an error — the transcript is persisted
/// and the next turn picks up from it.
pub const MAX_ITERATIONS_REPLY: &str = "(Agent reached maximum iterations)";

const DEFAULT_MAX_TOKENS: u32 = 8_192;

/// The assistant execution core. One instance serves every session; callers
/// serialise turns through the agent lock.
pub struct AgentRunner {
    client: Arc<dyn LlmClient>,
    store: Arc<SessionStore>,
    index: Arc<MemoryIndex>,
    tools: ToolRegistry,
    prompt: PromptBuilder,
    progress: Arc<dyn ProgressSink>,
    model: Option<String>,
    max_tokens: u32,
}

impl AgentRunner {
    pub fn new(
        client: Arc<dyn LlmClient>,
        store: Arc<SessionStore>,
        index: Arc<MemoryIndex>,
        tools: ToolRegistry,
        prompt: PromptBuilder,
    ) -> Self {
        Self {
            client,
            store,
            index,
            tools,
            prompt,
            progress: Arc::new(NoopProgress),
            model: None,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Run one turn. `content` is the triggering user message (chat text,
    /// cron job message, heartbeat prompt). Returns the consolidated reply.
    pub async fn run(
        &self,
        session_key: &str,
        content: jeeves_core::Content,
    ) -> Result<String> {
        let incoming = Message {
            role: jeeves_core::Role::User,
            content,
        };
        // Images are persisted as a text stand-in; the model still sees the
        // real thing this turn.
        let persisted = incoming.sanitized_for_persistence();

        let mut working = self.store.get(session_key);
        self.store
            .append(session_key, std::slice::from_ref(&persisted))?;
        working.push(incoming);

        let system_prompt = self.prompt.build();
        let tool_defs = self.tools.definitions();

        let mut new_messages: Vec<Message> = Vec::new();
        let mut total_tokens: u64 = 0;
        let mut flush_fired = false;

        for iteration in 0..MAX_ITERATIONS {
            self.progress.thinking();

            let req = ChatRequest {
                messages: working.clone(),
                tools: tool_defs.clone(),
                system_prompt: system_prompt.clone(),
                model: self.model.clone(),
                max_tokens: self.max_tokens,
            };
            let resp = self.client.send(&req).await?;
            total_tokens = resp.usage.total();
            debug!(
                iteration,
                total_tokens,
                stop_reason = %resp.stop_reason,
                tool_calls = resp.tool_calls.len(),
                "llm call complete"
            );

            let assistant = assistant_message(&resp);
            working.push(assistant.clone());
            new_messages.push(assistant);

            if resp.tool_calls.is_empty() || resp.stop_reason == "end_turn" {
                if should_flush(total_tokens) && !flush_fired {
                    info!(total_tokens, "prompt budget low; injecting flush prompt");
                    let flush = Message::user(flush_prompt());
                    working.push(flush.clone());
                    new_messages.push(flush);
                    flush_fired = true;
                    continue;
                }
                self.store.append(session_key, &new_messages)?;
                return Ok(resp.text);
            }

            // Execute each tool call sequentially; results become one
            // user-role message of tool_result blocks in call order.
            let mut result_blocks: Vec<ContentBlock> = Vec::with_capacity(resp.tool_calls.len());
            for call in &resp.tool_calls {
                self.progress.tool_running(&call.name);
                let output = match self.tools.get(&call.name) {
                    None => format!("Unknown tool: {}", call.name),
                    Some(tool) => match tool.execute(call.input.clone()).await {
                        Ok(s) => s,
                        Err(e) => format!("Tool error: {e}"),
                    },
                };
                result_blocks.push(ContentBlock::ToolResult {
                    tool_use_id: call.id.clone(),
                    content: output,
                });
            }
            let results = Message::user_blocks(result_blocks);
            working.push(results.clone());
            new_messages.push(results);

            if should_compact(total_tokens) {
                info!(total_tokens, "prompt budget exhausted; compacting session");
                self.store.append(session_key, &new_messages)?;
                new_messages.clear();

                let compacted = compact(self.client.as_ref(), &working).await;
                self.store.compact(session_key, &compacted)?;
                working = compacted;

                if let Err(e) = self.index.sync().await {
                    warn!(error = %e, "memory index re-sync after compaction failed");
                }

                flush_fired = false;
                total_tokens = 0;
            }
        }

        warn!(
            max_iterations = MAX_ITERATIONS,
            session_key, "agent loop hit maximum iterations"
        );
        self.store.append(session_key, &new_messages)?;
        Ok(MAX_ITERATIONS_REPLY.to_string())
    }
}

/// One assistant message from a response: the bare string when there is
/// only text, a block list once tool calls are involved.
fn assistant_message(resp: &ChatResponse) -> Message {
    if resp.tool_calls.is_empty() {
        return Message::assistant(resp.text.clone());
    }
    let mut blocks: Vec<ContentBlock> = Vec::with_capacity(resp.tool_calls.len() + 1);
    if !resp.text.is_empty() {
        blocks.push(ContentBlock::Text {
            text: resp.text.clone(),
        });
    }
    for call in &resp.tool_calls {
        blocks.push(ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.input.clone(),
        });
    }
    Message::assistant_blocks(blocks)
}

/// One-shot instruction asking the model to serialise context to a dated
/// memory file before hard compaction takes it away.
fn flush_prompt() -> String {
    let today = Local::now().format("%Y-%m-%d");
    format!(
        "Context is running low. Before continuing, save important context — decisions, \
open tasks, and facts worth keeping — to memory/{today}.md using the write_file tool."
    )
}
