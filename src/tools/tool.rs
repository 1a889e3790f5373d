use std::fmt::Debug;

use crate::error::ToolError;

/// How the turn loop treats a tool call after it is proposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    /// Executed on the drive thread; the loop continues with its result.
    Workspace,
    /// Never executed; waits for the user's answer and ends the loop.
    AskUser,
    /// Executed; its result is final and ends the loop.
    FinishTask,
}

/// A capability the model can invoke.
///
/// Execution is synchronous and runs on the conversation's drive thread.
pub trait Tool: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the call arguments.
    fn parameters_schema(&self) -> serde_json::Value;

    fn kind(&self) -> ToolKind {
        ToolKind::Workspace
    }

    fn execute(&self, params: &serde_json::Value) -> Result<String, ToolError>;
}

/// Extract a required string parameter.
pub fn require_str<'a>(params: &'a serde_json::Value, key: &str) -> Result<&'a str, ToolError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing '{key}' parameter")))
}
