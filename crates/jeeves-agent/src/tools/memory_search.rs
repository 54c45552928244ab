//! Tool: memory_search — query the hybrid memory index.

use std::sync::Arc;

use async_trait::async_trait;

use jeeves_memory::{MemoryIndex, DEFAULT_MAX_RESULTS};

use super::{require_str, Tool, ToolError};

pub struct MemorySearchTool {
    index: Arc<MemoryIndex>,
}

impl MemorySearchTool {
    pub fn new(index: Arc<MemoryIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &str {
        "memory_search"
    }

    fn description(&self) -> &str {
        "Search long-term memory: curated memory notes and earlier conversation history. \
         Use this to recall facts, decisions, or context from before the current conversation."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "What to look for (plain words work best)."
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum number of hits (default 6)."
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> Result<String, ToolError> {
        let query = require_str(&input, "query")?;
        let max_results = input
            .get("max_results")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_RESULTS);

        let hits = self
            .index
            .search(query, max_results)
            .await
            .map_err(|e| ToolError::new(e.to_string()))?;

        if hits.is_empty() {
            return Ok("No matching memories found.".to_string());
        }

        let rendered: Vec<String> = hits
            .iter()
            .map(|h| {
                format!(
                    "{} (lines {}-{}, score {:.2}):\n{}",
                    h.file_path, h.start_line, h.end_line, h.score, h.text
                )
            })
            .collect();
        Ok(rendered.join("\n\n---\n\n"))
    }
}
