//! Tool catalog bound to one agent context.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::llm::ToolDefinition;
use crate::tools::Tool;
use crate::tools::builtin::{AskUserTool, FinishTaskTool, ReadFileTool};

/// Immutable set of tools offered to the model.
///
/// Registration order is preserved so tool definitions are stable across calls.
#[derive(Debug, Default)]
pub struct ToolCatalog {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in tools for an agent working in `workspace`.
    pub fn for_workspace(workspace: PathBuf) -> Self {
        let mut catalog = Self::new();
        catalog.register(Arc::new(ReadFileTool::new(workspace)));
        catalog.register(Arc::new(AskUserTool));
        catalog.register(Arc::new(FinishTaskTool));
        catalog
    }

    /// Register a tool. A later registration with the same name replaces the earlier one.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_none() {
            self.order.push(name.clone());
        }
        tracing::debug!(tool = %name, "Registered tool");
    }

    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Tool definitions for LLM function calling.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }
}
