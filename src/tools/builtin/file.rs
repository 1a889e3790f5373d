//! Workspace-bound file reading.
//!
//! Paths are resolved against the workspace directory and may not escape it.

use std::path::{Component, Path, PathBuf};

use crate::error::ToolError;
use crate::tools::{Tool, require_str};

/// Maximum file size for reading (1MB).
const MAX_READ_SIZE: u64 = 1024 * 1024;

/// Office and e-book formats that need a document converter to become text.
const CONVERTED_EXTENSIONS: &[&str] = &["pdf", "docx", "pptx", "xlsx", "epub"];

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(dir: &str) -> PathBuf {
    match dir.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => {
            let home = std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/"));
            home.join(rest.trim_start_matches('/'))
        }
        _ => PathBuf::from(dir),
    }
}

/// Resolve `.` and `..` without touching the filesystem.
fn normalize_lexical(path: &Path) -> PathBuf {
    let mut out = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if matches!(out.last(), Some(Component::Normal(_))) {
                    out.pop();
                }
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out.iter().collect()
}

/// Resolve `path_str` inside `workspace`, rejecting escapes.
fn resolve_in_workspace(path_str: &str, workspace: &Path) -> Result<PathBuf, ToolError> {
    let base = workspace
        .canonicalize()
        .unwrap_or_else(|_| normalize_lexical(workspace));
    let joined = normalize_lexical(&base.join(path_str));
    let resolved = joined.canonicalize().unwrap_or(joined);

    if !resolved.starts_with(&base) {
        return Err(ToolError::NotAuthorized(format!(
            "Path escapes workspace: {path_str}"
        )));
    }
    Ok(resolved)
}

/// Read a text file from the workspace.
#[derive(Debug)]
pub struct ReadFileTool {
    workspace: PathBuf,
}

impl ReadFileTool {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }
}

impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file at the given path, relative to the workspace \
         directory. Use this to examine code, text or configuration files. Enable \
         line numbers if you plan to reference specific lines."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path of the file to read, relative to the workspace"
                },
                "enable_line_numbers": {
                    "type": "boolean",
                    "description": "Prefix every line with its number (default: false)"
                }
            },
            "required": ["path"]
        })
    }

    fn execute(&self, params: &serde_json::Value) -> Result<String, ToolError> {
        let path_str = require_str(params, "path")?;
        let line_numbers = params
            .get("enable_line_numbers")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let path = resolve_in_workspace(path_str, &self.workspace)?;
        if !path.exists() {
            return Err(ToolError::ExecutionFailed(format!(
                "File not found at {path_str}"
            )));
        }

        if let Some(ext) = path.extension().and_then(|e| e.to_str())
            && CONVERTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
        {
            return Err(ToolError::ExecutionFailed(format!(
                "Cannot read .{ext} documents as text"
            )));
        }

        let metadata = std::fs::metadata(&path)
            .map_err(|e| ToolError::ExecutionFailed(format!("Cannot access file: {e}")))?;
        if metadata.len() > MAX_READ_SIZE {
            return Err(ToolError::ExecutionFailed(format!(
                "File too large ({} bytes). Maximum is {MAX_READ_SIZE} bytes.",
                metadata.len()
            )));
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to read file: {e}")))?;

        let lines = content.lines();
        let output = if line_numbers {
            lines
                .enumerate()
                .map(|(i, line)| format!("{:4} | {line}", i + 1))
                .collect::<Vec<_>>()
                .join("\n")
        } else {
            lines.collect::<Vec<_>>().join("\n")
        };

        tracing::debug!(path = %path.display(), bytes = metadata.len(), "read_file");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn workspace_with(name: &str, content: &str) -> (TempDir, ReadFileTool) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(name), content).unwrap();
        let tool = ReadFileTool::new(dir.path().to_path_buf());
        (dir, tool)
    }

    #[test]
    fn reads_relative_path() {
        let (_dir, tool) = workspace_with("notes.txt", "line 1\nline 2\n");
        let out = tool.execute(&json!({"path": "notes.txt"})).unwrap();
        assert_eq!(out, "line 1\nline 2");
    }

    #[test]
    fn line_numbers_are_right_aligned() {
        let (_dir, tool) = workspace_with("notes.txt", "alpha\nbeta\n");
        let out = tool
            .execute(&json!({"path": "notes.txt", "enable_line_numbers": true}))
            .unwrap();
        assert_eq!(out, "   1 | alpha\n   2 | beta");
    }

    #[test]
    fn missing_file_is_an_error() {
        let (_dir, tool) = workspace_with("notes.txt", "");
        let err = tool.execute(&json!({"path": "nope.txt"})).unwrap_err();
        assert!(err.to_string().contains("File not found"));
    }

    #[test]
    fn traversal_is_rejected() {
        let (_dir, tool) = workspace_with("notes.txt", "");
        let err = tool
            .execute(&json!({"path": "../../etc/passwd"}))
            .unwrap_err();
        assert!(matches!(err, ToolError::NotAuthorized(_)));
    }

    #[test]
    fn documents_need_conversion() {
        let (_dir, tool) = workspace_with("report.pdf", "%PDF-1.7");
        let err = tool.execute(&json!({"path": "report.pdf"})).unwrap_err();
        assert!(err.to_string().contains(".pdf"));
    }

    #[test]
    fn expand_home_only_touches_leading_tilde() {
        assert_eq!(expand_home("/srv/data"), PathBuf::from("/srv/data"));
        assert_eq!(expand_home("a~b"), PathBuf::from("a~b"));
        assert!(!expand_home("~").to_string_lossy().contains('~'));
    }
}
