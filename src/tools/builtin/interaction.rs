//! Human-in-the-loop tools.
//!
//! `ask_user` suspends the conversation until the user answers; `finish_task`
//! hands the final result back and ends it.

use crate::error::ToolError;
use crate::tools::{Tool, ToolKind, require_str};

#[derive(Debug, Default)]
pub struct AskUserTool;

impl Tool for AskUserTool {
    fn name(&self) -> &str {
        "ask_user"
    }

    fn description(&self) -> &str {
        "Ask the user a question when you need clarification or a decision \
         before continuing. The conversation pauses until the user answers."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "question": {
                    "type": "string",
                    "description": "The question to ask the user"
                },
                "options": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Suggested answers (optional)"
                }
            },
            "required": ["question"]
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::AskUser
    }

    fn execute(&self, _params: &serde_json::Value) -> Result<String, ToolError> {
        Err(ToolError::ExecutionFailed(
            "ask_user is answered by the user, not executed".to_string(),
        ))
    }
}

#[derive(Debug, Default)]
pub struct FinishTaskTool;

impl Tool for FinishTaskTool {
    fn name(&self) -> &str {
        "finish_task"
    }

    fn description(&self) -> &str {
        "Present the result of your work to the user once the task is complete."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "result": {
                    "type": "string",
                    "description": "Summary of the completed work"
                }
            },
            "required": ["result"]
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::FinishTask
    }

    fn execute(&self, params: &serde_json::Value) -> Result<String, ToolError> {
        require_str(params, "result").map(str::to_string)
    }
}
