//! Tool system for the agent loop.
//!
//! Defines the `Tool` trait all tools implement, plus a registry mapping
//! names to capabilities, built once per turn. Tool failures never
//! propagate out of the loop — they are captured into the transcript as
//! `"Tool error: …"` results for the model to observe.

pub mod memory_search;
pub mod read_file;
pub mod write_file;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::client::ToolDefinition;

/// A failed tool execution. The message becomes the tool result text.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ToolError(pub String);

impl ToolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<std::io::Error> for ToolError {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}

/// Trait that all tools must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name for this tool (e.g. "memory_search").
    fn name(&self) -> &str;
    /// Human-readable description of what this tool does.
    fn description(&self) -> &str;
    /// JSON Schema for the tool's input parameters.
    fn input_schema(&self) -> serde_json::Value;
    /// Execute the tool; the returned string goes back to the model.
    async fn execute(&self, input: serde_json::Value) -> Result<String, ToolError>;
}

/// Name → capability lookup.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// API-level definitions for every registered tool.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Pull a required string parameter out of a tool input bag.
pub(crate) fn require_str<'a>(
    input: &'a serde_json::Value,
    key: &str,
) -> Result<&'a str, ToolError> {
    input
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::new(format!("missing required parameter: {key}")))
}
