use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use jeeves_core::{Content, ContentBlock, Message};

use crate::client::{ChatRequest, ChatResponse, ClientError, LlmClient, ToolCall, Usage};

const API_VERSION: &str = "2023-06-01";
const OAUTH_BETA: &str = "oauth-2025-04-20";
const OAUTH_TOKEN_PREFIX: &str = "sk-ant-oat01-";

/// Soft deadline for one messages-API request. A hung request aborts the
/// turn rather than wedging the agent lock.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
/// Total attempts for retryable failures (429, 5xx).
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 1_000;
/// Cap on honoured retry-after hints.
const RETRY_AFTER_CAP_MS: u64 = 30_000;

/// Anthropic messages API client.
pub struct AnthropicClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    default_model: String,
    is_oauth: bool,
}

impl AnthropicClient {
    pub fn new(api_key: String, base_url: Option<String>, default_model: String) -> Self {
        let is_oauth = api_key.starts_with(OAUTH_TOKEN_PREFIX);
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            is_oauth,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            default_model,
        }
    }

    /// Apply auth headers — OAuth tokens use Bearer + beta header,
    /// regular API keys use x-api-key.
    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.is_oauth {
            builder
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("anthropic-beta", OAUTH_BETA)
        } else {
            builder.header("x-api-key", &self.api_key)
        }
    }

    async fn send_once(&self, body: &serde_json::Value) -> Result<ChatResponse, ClientError> {
        let url = format!("{}/v1/messages", self.base_url);
        let builder = self
            .client
            .post(&url)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(body);

        let resp = self.apply_auth(builder).send().await?;
        let status = resp.status().as_u16();

        if status == 429 {
            let retry = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(5_000);
            return Err(ClientError::RateLimited {
                retry_after_ms: retry.min(RETRY_AFTER_CAP_MS),
            });
        }

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "Anthropic API error");
            return Err(ClientError::Api {
                status,
                message: text,
            });
        }

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ClientError::Parse(e.to_string()))?;
        Ok(parse_response(api_resp))
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn is_oauth(&self) -> bool {
        self.is_oauth
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ClientError> {
        let body = build_request_body(req, &self.default_model);
        let model = req.model.as_deref().unwrap_or(&self.default_model);
        debug!(model, messages = req.messages.len(), "sending request to Anthropic");

        let mut last_err: Option<ClientError> = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.send_once(&body).await {
                Ok(resp) => return Ok(resp),
                Err(ClientError::RateLimited { retry_after_ms }) if attempt < MAX_ATTEMPTS => {
                    warn!(attempt, retry_after_ms, "rate limited; backing off");
                    tokio::time::sleep(Duration::from_millis(retry_after_ms)).await;
                    last_err = Some(ClientError::RateLimited { retry_after_ms });
                }
                Err(ClientError::Api { status, message }) if status >= 500 && attempt < MAX_ATTEMPTS => {
                    let delay = RETRY_BASE_DELAY_MS * 2u64.pow(attempt - 1);
                    warn!(attempt, status, delay_ms = delay, "server error; retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    last_err = Some(ClientError::Api { status, message });
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or(ClientError::Parse("retries exhausted".to_string())))
    }
}

fn build_request_body(req: &ChatRequest, default_model: &str) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = req.messages.iter().map(message_to_json).collect();

    // Static tier carries the cache breakpoint; the volatile tier follows
    // uncached so it cannot break the prefix.
    let mut system: Vec<serde_json::Value> = vec![serde_json::json!({
        "type": "text",
        "text": req.system_prompt.static_tier,
        "cache_control": { "type": "ephemeral" }
    })];
    if !req.system_prompt.volatile_tier.is_empty() {
        system.push(serde_json::json!({
            "type": "text",
            "text": req.system_prompt.volatile_tier,
        }));
    }

    let mut body = serde_json::json!({
        "model": req.model.as_deref().unwrap_or(default_model),
        "max_tokens": req.max_tokens,
        "system": system,
        "messages": messages,
        "stream": false,
    });

    if !req.tools.is_empty() {
        let tools: Vec<serde_json::Value> = req
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();
        body["tools"] = serde_json::Value::Array(tools);
    }

    body
}

fn message_to_json(msg: &Message) -> serde_json::Value {
    let role = match msg.role {
        jeeves_core::Role::User => "user",
        jeeves_core::Role::Assistant => "assistant",
    };
    let content = match &msg.content {
        Content::Text(s) => serde_json::Value::String(s.clone()),
        Content::Blocks(blocks) => {
            serde_json::Value::Array(blocks.iter().map(block_to_json).collect())
        }
    };
    serde_json::json!({ "role": role, "content": content })
}

fn block_to_json(block: &ContentBlock) -> serde_json::Value {
    match block {
        ContentBlock::Text { text } => serde_json::json!({ "type": "text", "text": text }),
        ContentBlock::ToolUse { id, name, input } => serde_json::json!({
            "type": "tool_use", "id": id, "name": name, "input": input,
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
        } => serde_json::json!({
            "type": "tool_result", "tool_use_id": tool_use_id, "content": content,
        }),
        // The wire format nests image payloads under a base64 source.
        ContentBlock::Image { media_type, data } => serde_json::json!({
            "type": "image",
            "source": { "type": "base64", "media_type": media_type, "data": data },
        }),
    }
}

fn parse_response(resp: ApiResponse) -> ChatResponse {
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in resp.content {
        match block {
            ApiContentBlock::Text { text } => text_parts.push(text),
            ApiContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ToolCall { id, name, input });
            }
            ApiContentBlock::Unknown => {}
        }
    }

    ChatResponse {
        text: text_parts.join(""),
        tool_calls,
        stop_reason: resp.stop_reason.unwrap_or_default(),
        usage: Usage {
            input_tokens: resp.usage.input_tokens,
            output_tokens: resp.usage.output_tokens,
            cache_creation_input_tokens: resp.usage.cache_creation_input_tokens.unwrap_or(0),
            cache_read_input_tokens: resp.usage.cache_read_input_tokens.unwrap_or(0),
        },
    }
}

// Anthropic API response types (private — only used for deserialization)

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ApiContentBlock>,
    stop_reason: Option<String>,
    usage: ApiUsage,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ApiContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
    cache_creation_input_tokens: Option<u32>,
    cache_read_input_tokens: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::SystemPrompt;

    fn request_with(messages: Vec<Message>) -> ChatRequest {
        ChatRequest {
            messages,
            tools: Vec::new(),
            system_prompt: SystemPrompt::plain("be helpful"),
            model: None,
            max_tokens: 1024,
        }
    }

    #[test]
    fn oauth_detection_by_token_prefix() {
        let oauth = AnthropicClient::new(
            "sk-ant-oat01-abc".into(),
            None,
            "claude-sonnet-4-5".into(),
        );
        assert!(oauth.is_oauth());

        let key = AnthropicClient::new("sk-ant-api03-abc".into(), None, "claude-sonnet-4-5".into());
        assert!(!key.is_oauth());
    }

    #[test]
    fn body_carries_cache_breakpoint_and_model() {
        let body = build_request_body(&request_with(vec![Message::user("hi")]), "model-x");
        assert_eq!(body["model"], "model-x");
        assert_eq!(body["system"][0]["cache_control"]["type"], "ephemeral");
        assert_eq!(body["messages"][0]["content"], "hi");
    }

    #[test]
    fn image_blocks_nest_a_base64_source() {
        let msg = Message::user_blocks(vec![ContentBlock::Image {
            media_type: "image/png".into(),
            data: "AAA=".into(),
        }]);
        let json = message_to_json(&msg);
        assert_eq!(json["content"][0]["source"]["type"], "base64");
        assert_eq!(json["content"][0]["source"]["media_type"], "image/png");
    }

    #[test]
    fn tool_result_blocks_flatten_to_wire_shape() {
        let msg = Message::user_blocks(vec![ContentBlock::ToolResult {
            tool_use_id: "t1".into(),
            content: "output".into(),
        }]);
        let json = message_to_json(&msg);
        assert_eq!(json["content"][0]["type"], "tool_result");
        assert_eq!(json["content"][0]["tool_use_id"], "t1");
    }

    #[test]
    fn response_parse_collects_text_and_tool_calls() {
        let raw = serde_json::json!({
            "content": [
                { "type": "text", "text": "let me check" },
                { "type": "tool_use", "id": "t1", "name": "bash", "input": {"command": "ls"} },
                { "type": "unsupported_block_kind", "foo": 1 }
            ],
            "stop_reason": "tool_use",
            "usage": { "input_tokens": 10, "output_tokens": 5, "cache_read_input_tokens": 3 }
        });
        let resp: ApiResponse = serde_json::from_value(raw).unwrap();
        let parsed = parse_response(resp);
        assert_eq!(parsed.text, "let me check");
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "bash");
        assert_eq!(parsed.stop_reason, "tool_use");
        assert_eq!(parsed.usage.total(), 15);
        assert_eq!(parsed.usage.cache_read_input_tokens, 3);
    }
}
