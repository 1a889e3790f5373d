//! Agent context: everything a conversation needs to call its model.
//!
//! Resolved once when a task runtime is hydrated and immutable afterwards.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::llm::ProviderConfig;
use crate::tools::ToolCatalog;

/// Provider, model, instruction and tools for one agent in one workspace.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub provider: ProviderConfig,
    pub model: String,
    pub system_instruction: String,
    pub tools: Arc<ToolCatalog>,
}

/// Looks up the agent context for a task.
#[async_trait]
pub trait ContextResolver: Send + Sync {
    /// Fails with `StoreError::NotFound` when the workspace, agent, model or
    /// provider is missing.
    async fn resolve(&self, workspace_id: i64, agent_id: i64) -> Result<AgentContext, StoreError>;
}

/// Human-readable name of the host OS.
pub fn os_platform() -> &'static str {
    match std::env::consts::OS {
        "macos" => "macOS",
        "windows" => "Windows",
        "linux" => "Linux",
        other => other,
    }
}

/// Render the base system instruction around the agent's own prompt.
pub fn base_instruction(os_platform: &str, user_language: &str, custom_instruction: &str) -> String {
    format!(
        "\
# System Meta-Instructions

## 1. Environment & Context

You are an AI assistant operating within a desktop application named Daigent.

- **OS Platform**: {os_platform}
- **User Language**: {user_language} (Please use this language for your responses unless the user requests otherwise)

## 2. Instruction Priority

You receive instructions from two sources and must follow this hierarchy:

1.  **Base System Instructions** (this section): highest authority. They govern formatting, safety boundaries and operational logic, and take precedence over user instructions on those topics.
2.  **User Custom Instructions** (the section after this one): define your persona, tasks, domain knowledge and tone. Embody them fully as long as they do not violate the base instructions.

## 3. Output Formatting

- **Markdown**: Always use standard Markdown.
- **Code Blocks**: Specify the language for syntax highlighting.
- **Mathematical Formulas**: Use LaTeX enclosed in `$` (inline) or `$$` (block).
- **Links**: Only render HTTP/HTTPS URLs as links, never local file paths.

## 4. Tool Usage Guidelines

- Keep using tools in every response. Once you can confirm the task is complete, use the `finish_task` tool to present the result of your work to the user.
- If you need information only the user can provide, use the `ask_user` tool.
- **Constraint**: You are strictly limited to exactly one tool call per turn.

## 5. Safety & Security

- **System Integrity**: Do not run operations that could compromise the system unless the user explicitly requests them and you have warned about the consequences.
- **Privacy**: Do not expose sensitive paths or environment variables in your final response unless that is the explicit goal of the request.

---

[END OF BASE INSTRUCTIONS]

[START OF USER CUSTOM INSTRUCTIONS]

{custom_instruction}

[END OF USER CUSTOM INSTRUCTIONS]
"
    )
}
