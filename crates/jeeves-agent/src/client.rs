use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use jeeves_core::Message;

use crate::prompt::SystemPrompt;

/// Tool definition sent to the LLM API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A tool call extracted from the LLM response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Token accounting reported by the provider for one call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(default)]
    pub cache_creation_input_tokens: u32,
    #[serde(default)]
    pub cache_read_input_tokens: u32,
}

impl Usage {
    /// Prompt + completion tokens of this call — the number the budget
    /// thresholds are checked against.
    pub fn total(&self) -> u64 {
        self.input_tokens as u64 + self.output_tokens as u64
    }
}

/// Request to the LLM.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub system_prompt: SystemPrompt,
    /// `None` uses the client's configured default model.
    pub model: Option<String>,
    pub max_tokens: u32,
}

/// Response from the LLM (one consolidated message).
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Concatenated text content.
    pub text: String,
    /// Tool calls requested by the model, in block order.
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: String,
    pub usage: Usage,
}

/// The provider seam the core programs against. The implementation owns
/// auth, retries, identity flags, and stream aggregation — the core treats
/// it as opaque.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    /// Whether the client authenticates via OAuth. OAuth mode prepends the
    /// provider-identity preamble to the system prompt.
    fn is_oauth(&self) -> bool {
        false
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ClientError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
}
