//! Tool: write_file — write a workspace file, creating parents as needed.
//!
//! This is the tool the flush prompt leans on: when the budget runs low the
//! model is asked to persist important context to `memory/<date>.md`.

use std::path::PathBuf;

use async_trait::async_trait;

use super::read_file::resolve_workspace_path;
use super::{require_str, Tool, ToolError};

pub struct WriteFileTool {
    workspace_dir: PathBuf,
}

impl WriteFileTool {
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
        }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write text to a workspace file, overwriting it if it exists. Creates parent \
         directories. The path is relative to the workspace root."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Workspace-relative path to write, e.g. 'memory/2025-06-01.md'."
                },
                "content": {
                    "type": "string",
                    "description": "Text content to write."
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> Result<String, ToolError> {
        let rel = require_str(&input, "path")?;
        let content = require_str(&input, "content")?;
        let path = resolve_workspace_path(&self.workspace_dir, rel)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ToolError::new(format!("cannot create directories for '{rel}': {e}")))?;
        }
        std::fs::write(&path, content)
            .map_err(|e| ToolError::new(format!("cannot write '{rel}': {e}")))?;

        Ok(format!("Wrote {} bytes to '{rel}'", content.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn writes_and_creates_parents() {
        let dir = TempDir::new().unwrap();
        let tool = WriteFileTool::new(dir.path());

        let out = tool
            .execute(serde_json::json!({
                "path": "memory/2025-06-01.md",
                "content": "remember this"
            }))
            .await
            .unwrap();
        assert!(out.contains("13 bytes"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("memory/2025-06-01.md")).unwrap(),
            "remember this"
        );
    }

    #[tokio::test]
    async fn refuses_to_leave_the_workspace() {
        let dir = TempDir::new().unwrap();
        let tool = WriteFileTool::new(dir.path());
        let err = tool
            .execute(serde_json::json!({"path": "../evil.md", "content": "x"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("workspace"));
    }

    #[tokio::test]
    async fn missing_parameters_error_cleanly() {
        let dir = TempDir::new().unwrap();
        let tool = WriteFileTool::new(dir.path());
        let err = tool
            .execute(serde_json::json!({"path": "a.md"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("content"));
    }
}
