//! `jeeves-agent` — the assistant execution core.
//!
//! Holds the LLM client contract and its Anthropic implementation, the
//! system-prompt builder, the token budget, the compaction engine, the tool
//! system, and [`AgentRunner`] — the bounded tool-using turn executor that
//! ties them to the session store and memory index.

pub mod agent_loop;
pub mod anthropic;
pub mod budget;
pub mod client;
pub mod compact;
pub mod error;
pub mod progress;
pub mod prompt;
pub mod tools;

pub use agent_loop::{AgentRunner, MAX_ITERATIONS, MAX_ITERATIONS_REPLY};
pub use anthropic::AnthropicClient;
pub use client::{ChatRequest, ChatResponse, ClientError, LlmClient, ToolCall, ToolDefinition, Usage};
pub use error::{AgentError, Result};
pub use progress::{NoopProgress, ProgressSink};
pub use prompt::{PromptBuilder, SystemPrompt};
pub use tools::{Tool, ToolError, ToolRegistry};
