use serde::{Deserialize, Serialize};

/// A single message exchanged with the LLM.
///
/// Serialises one-per-line in session segment files, so the wire shape is
/// stable: `{"role":"user","content":"hi"}` or a block-list content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Message content: either a bare string or an ordered block list.
///
/// Untagged so that plain-text messages persist as JSON strings (the common
/// case) and only tool traffic pays for the block representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    /// The LLM wants to invoke a tool.
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// Stringified output of an earlier `ToolUse` in the same sequence.
    ToolResult {
        tool_use_id: String,
        content: String,
    },
    /// Inbound image attachment. Ingress only — never persisted; the session
    /// store receives a `Text("[Image]")` stand-in instead.
    Image {
        media_type: String,
        data: String,
    },
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Content::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Content::Text(text.into()),
        }
    }

    pub fn user_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: Content::Blocks(blocks),
        }
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content: Content::Blocks(blocks),
        }
    }

    /// Concatenated text content: the bare string, or every `Text` block
    /// joined in order. Tool and image blocks contribute nothing.
    pub fn text(&self) -> String {
        match &self.content {
            Content::Text(s) => s.clone(),
            Content::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    /// IDs of every `ToolUse` block in this message.
    pub fn tool_use_ids(&self) -> Vec<&str> {
        match &self.content {
            Content::Text(_) => Vec::new(),
            Content::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }

    /// Whether any `ToolUse` block is present.
    pub fn has_tool_use(&self) -> bool {
        !self.tool_use_ids().is_empty()
    }

    /// Copy of this message safe to write to the session log: every `Image`
    /// block becomes `Text("[Image]")`. Text-content messages pass through.
    pub fn sanitized_for_persistence(&self) -> Message {
        match &self.content {
            Content::Text(_) => self.clone(),
            Content::Blocks(blocks) => {
                let blocks = blocks
                    .iter()
                    .map(|b| match b {
                        ContentBlock::Image { .. } => ContentBlock::Text {
                            text: "[Image]".to_string(),
                        },
                        other => other.clone(),
                    })
                    .collect();
                Message {
                    role: self.role,
                    content: Content::Blocks(blocks),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_round_trips_as_string() {
        let msg = Message::user("hello");
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"hello"}"#);
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.text(), "hello");
    }

    #[test]
    fn block_content_round_trips() {
        let msg = Message::assistant_blocks(vec![
            ContentBlock::Text {
                text: "running".into(),
            },
            ContentBlock::ToolUse {
                id: "t1".into(),
                name: "bash".into(),
                input: serde_json::json!({"command": "ls"}),
            },
        ]);
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.text(), "running");
        assert_eq!(back.tool_use_ids(), vec!["t1"]);
    }

    #[test]
    fn sanitize_replaces_images() {
        let msg = Message::user_blocks(vec![
            ContentBlock::Image {
                media_type: "image/png".into(),
                data: "aGVsbG8=".into(),
            },
            ContentBlock::Text {
                text: "what is this?".into(),
            },
        ]);
        let clean = msg.sanitized_for_persistence();
        assert_eq!(clean.text(), "[Image]what is this?");
        let json = serde_json::to_string(&clean).unwrap();
        assert!(!json.contains("aGVsbG8="));
    }

    #[test]
    fn sanitize_keeps_plain_text_intact() {
        let msg = Message::user("no images here");
        let clean = msg.sanitized_for_persistence();
        assert_eq!(clean.text(), "no images here");
    }
}
