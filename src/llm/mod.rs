//! LLM integration for Daigent.
//!
//! The runtime talks to models through [`LlmClient::open_stream`], which
//! yields incremental deltas plus a channel carrying the completed assistant
//! message. The channel closing marks the end of the response.
//!
//! Supports any OpenAI-compatible chat-completions endpoint via
//! [`OpenAiCompatClient`].

mod openai_compat;

pub use openai_compat::OpenAiCompatClient;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::LlmError;
use crate::message::{AssistantMessage, Message, ToolCallDelta};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Supported provider protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    OpenAiCompatible,
}

impl FromStr for ProviderKind {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(Self::OpenAi),
            "openai_compatible" | "openai-compatible" => Ok(Self::OpenAiCompatible),
            other => Err(LlmError::RequestFailed {
                provider: other.to_string(),
                reason: "unsupported provider type".to_string(),
            }),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::OpenAi => "openai",
            Self::OpenAiCompatible => "openai_compatible",
        };
        write!(f, "{s}")
    }
}

/// Provider endpoint and credentials.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// Overrides the provider's default endpoint when set.
    pub base_url: Option<String>,
    pub api_key: secrecy::SecretString,
}

impl ProviderConfig {
    pub fn endpoint(&self) -> &str {
        match (&self.base_url, self.kind) {
            (Some(url), _) => url.trim_end_matches('/'),
            (None, _) => OPENAI_BASE_URL,
        }
    }
}

/// Tool description sent to the model for function calling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// One streaming model call.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

/// Incremental model output.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    Text(String),
    Reasoning(String),
    ToolCall(ToolCallDelta),
}

/// An open streaming response.
pub struct ModelStream {
    pub deltas: BoxStream<'static, Result<StreamDelta, LlmError>>,
    /// Yields the completed assistant message(s); closes when the response is over.
    /// Tool calls appear in the order their first delta was streamed.
    pub completed: mpsc::UnboundedReceiver<AssistantMessage>,
}

/// Streaming chat client.
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn provider_name(&self) -> &str;

    async fn open_stream(&self, request: StreamRequest) -> Result<ModelStream, LlmError>;
}

/// Builds clients from resolved provider configuration.
pub trait LlmClientFactory: Send + Sync {
    fn create(&self, provider: &ProviderConfig) -> Result<Arc<dyn LlmClient>, LlmError>;
}

/// Factory backed by [`create_client`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultClientFactory;

impl LlmClientFactory for DefaultClientFactory {
    fn create(&self, provider: &ProviderConfig) -> Result<Arc<dyn LlmClient>, LlmError> {
        create_client(provider)
    }
}

/// Create an LLM client from provider configuration.
pub fn create_client(config: &ProviderConfig) -> Result<Arc<dyn LlmClient>, LlmError> {
    match config.kind {
        ProviderKind::OpenAi | ProviderKind::OpenAiCompatible => {
            let client = OpenAiCompatClient::new(config)?;
            tracing::info!(
                provider = %config.kind,
                endpoint = config.endpoint(),
                "Created LLM client"
            );
            Ok(Arc::new(client))
        }
    }
}
