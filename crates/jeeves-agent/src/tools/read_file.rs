//! Tool: read_file — read a workspace file.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use super::{require_str, Tool, ToolError};

/// Output cap; longer files are cut with a note so a stray log cannot blow
/// the prompt budget in one tool round.
const MAX_OUTPUT_CHARS: usize = 50_000;

pub struct ReadFileTool {
    workspace_dir: PathBuf,
}

impl ReadFileTool {
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the workspace. The path is relative to the workspace root."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Workspace-relative path, e.g. 'memory/2025-06-01.md'."
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> Result<String, ToolError> {
        let rel = require_str(&input, "path")?;
        let path = resolve_workspace_path(&self.workspace_dir, rel)?;

        let mut content = std::fs::read_to_string(&path)
            .map_err(|e| ToolError::new(format!("cannot read '{rel}': {e}")))?;

        if content.len() > MAX_OUTPUT_CHARS {
            let cut = floor_char_boundary(&content, MAX_OUTPUT_CHARS);
            content.truncate(cut);
            content.push_str("\n[... output truncated ...]");
        }
        Ok(content)
    }
}

/// Resolve a tool-supplied path against the workspace root, refusing
/// absolute paths and `..` traversal.
pub(crate) fn resolve_workspace_path(workspace: &Path, rel: &str) -> Result<PathBuf, ToolError> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return Err(ToolError::new("path must be workspace-relative"));
    }
    for component in rel_path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(ToolError::new("path may not leave the workspace")),
        }
    }
    Ok(workspace.join(rel_path))
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    i = i.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn reads_relative_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("memory")).unwrap();
        std::fs::write(dir.path().join("memory/note.md"), "hello note").unwrap();

        let tool = ReadFileTool::new(dir.path());
        let out = tool
            .execute(serde_json::json!({"path": "memory/note.md"}))
            .await
            .unwrap();
        assert_eq!(out, "hello note");
    }

    #[tokio::test]
    async fn rejects_escaping_paths() {
        let dir = TempDir::new().unwrap();
        let tool = ReadFileTool::new(dir.path());

        let err = tool
            .execute(serde_json::json!({"path": "../outside.txt"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("workspace"));

        let err = tool
            .execute(serde_json::json!({"path": "/etc/passwd"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("workspace-relative"));
    }

    #[tokio::test]
    async fn missing_file_is_a_tool_error() {
        let dir = TempDir::new().unwrap();
        let tool = ReadFileTool::new(dir.path());
        let err = tool
            .execute(serde_json::json!({"path": "nope.md"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot read"));
    }
}
