//! Conversation data model and the chunk protocol shared by the runtime and the bridge.

use serde::{Deserialize, Serialize};

/// Result recorded on a pending tool message when the user moves on without answering it.
pub const IGNORED_BY_USER: &str = "[ignored by user]";

/// A tool call proposed by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// A tool invocation and its outcome.
///
/// With both `result` and `error` unset the message is *pending*.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMessage {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ToolMessage {
    pub fn pending(call: &ToolCall) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            result: None,
            error: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.result.is_none() && self.error.is_none()
    }
}

/// A single entry in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(default)]
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning_content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool(ToolMessage),
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: content.into(),
            reasoning_content: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::Tool(_) => "tool",
        }
    }

    /// The tool message, if this is a pending one.
    pub fn as_pending_tool_mut(&mut self) -> Option<&mut ToolMessage> {
        match self {
            Self::Tool(tool) if tool.is_pending() => Some(tool),
            _ => None,
        }
    }

    pub fn is_pending_tool(&self) -> bool {
        matches!(self, Self::Tool(tool) if tool.is_pending())
    }
}

/// The completed assistant output of one model call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantMessage {
    pub content: String,
    pub reasoning_content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl AssistantMessage {
    /// Keep only the first proposed tool call. Later calls are dropped, never merged.
    pub fn keep_first_tool_call(&mut self) -> Option<ToolCall> {
        self.tool_calls.truncate(1);
        self.tool_calls.first().cloned()
    }
}

impl From<AssistantMessage> for Message {
    fn from(msg: AssistantMessage) -> Self {
        Message::Assistant {
            content: msg.content,
            reasoning_content: msg.reasoning_content,
            tool_calls: msg.tool_calls,
        }
    }
}

/// Incremental piece of a tool call as it streams in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
}

/// Unit on the streaming channel between the turn loop and the outward transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    TextDelta(String),
    ReasoningDelta(String),
    ToolCallDelta(ToolCallDelta),
    MessageStart,
    MessageEnd,
    /// Outcome of the tool executed after a turn.
    ToolResult(ToolMessage),
    /// The turn was cancelled by `stop()` or a disconnect.
    Interrupted,
    /// The drive loop has exited; nothing follows.
    Done,
    /// Provider failure that ended the turn.
    Error(String),
}

impl Chunk {
    /// Whether the drive loop stops polling the turn queue after this chunk.
    pub fn ends_turn(&self) -> bool {
        matches!(self, Self::MessageEnd | Self::Interrupted | Self::Error(_))
    }
}
