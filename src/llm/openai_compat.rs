//! Streaming client for OpenAI-compatible chat-completions endpoints.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::LlmError;
use crate::llm::{LlmClient, ModelStream, ProviderConfig, StreamDelta, StreamRequest};
use crate::message::{AssistantMessage, Message, ToolCall, ToolCallDelta};

pub struct OpenAiCompatClient {
    http: reqwest::Client,
    provider: String,
    base_url: String,
    api_key: SecretString,
}

impl OpenAiCompatClient {
    pub fn new(config: &ProviderConfig) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()?;
        Ok(Self {
            http,
            provider: config.kind.to_string(),
            base_url: config.endpoint().to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(val) =
            HeaderValue::from_str(&format!("Bearer {}", self.api_key.expose_secret()))
        {
            headers.insert(AUTHORIZATION, val);
        }
        headers
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    fn provider_name(&self) -> &str {
        &self.provider
    }

    async fn open_stream(&self, request: StreamRequest) -> Result<ModelStream, LlmError> {
        let body = build_request_body(&request);
        let url = format!("{}/chat/completions", self.base_url);

        debug!(
            provider = %self.provider,
            model = %request.model,
            messages = request.messages.len(),
            "Opening completion stream"
        );

        let resp = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(LlmError::RequestFailed {
                provider: self.provider.clone(),
                reason: format!("HTTP {}: {}", status.as_u16(), body_text),
            });
        }

        let (completed_tx, completed) = mpsc::unbounded_channel();
        let provider = self.provider.clone();
        let byte_stream = resp.bytes_stream();

        let deltas = async_stream::stream! {
            let mut lines = LineBuffer::default();
            let mut accumulator = StreamAccumulator::default();
            futures::pin_mut!(byte_stream);

            'read: while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        yield Err(LlmError::Http(e));
                        return;
                    }
                };

                for line in lines.push(&bytes) {
                    match parse_sse_line(&line) {
                        SseLine::Skip => {}
                        SseLine::Done => break 'read,
                        SseLine::Data(data) => match serde_json::from_str::<StreamChunk>(data) {
                            Ok(chunk) => {
                                for delta in accumulator.apply(chunk) {
                                    yield Ok(delta);
                                }
                            }
                            Err(e) => {
                                yield Err(LlmError::InvalidResponse {
                                    provider: provider.clone(),
                                    reason: e.to_string(),
                                });
                                return;
                            }
                        },
                    }
                }
            }

            let _ = completed_tx.send(accumulator.finish());
        };

        Ok(ModelStream {
            deltas: Box::pin(deltas),
            completed,
        })
    }
}

fn build_request_body(request: &StreamRequest) -> Value {
    let mut body = json!({
        "model": request.model,
        "stream": true,
        "messages": request.messages.iter().map(message_to_openai).collect::<Vec<_>>(),
    });
    if !request.tools.is_empty() {
        body["tools"] = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect();
    }
    body
}

fn message_to_openai(msg: &Message) -> Value {
    match msg {
        Message::System { content } | Message::User { content } => {
            json!({ "role": msg.role(), "content": content })
        }
        Message::Assistant {
            content,
            tool_calls,
            ..
        } => {
            let mut value = json!({ "role": msg.role(), "content": content });
            if !tool_calls.is_empty() {
                value["tool_calls"] = tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.name,
                                "arguments": tc.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
            }
            value
        }
        Message::Tool(tool) => {
            let content = match (&tool.result, &tool.error) {
                (Some(result), _) => result.clone(),
                (None, Some(error)) => format!("Error: {error}"),
                (None, None) => String::new(),
            };
            json!({ "role": msg.role(), "tool_call_id": tool.id, "content": content })
        }
    }
}

/// Splits a byte stream into trimmed lines.
///
/// Bytes are held until their line is complete, so a multi-byte character
/// split across network reads is decoded whole.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            lines.push(String::from_utf8_lossy(&line).trim().to_string());
        }
        lines
    }
}

enum SseLine<'a> {
    Skip,
    Done,
    Data(&'a str),
}

fn parse_sse_line(line: &str) -> SseLine<'_> {
    if line.is_empty() || line.starts_with(':') {
        return SseLine::Skip;
    }
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    match data.trim_start() {
        "[DONE]" => SseLine::Done,
        data => SseLine::Data(data),
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: ChoiceDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChoiceDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallChunk>,
}

#[derive(Debug, Deserialize)]
struct ToolCallChunk {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<FunctionChunk>,
}

#[derive(Debug, Deserialize)]
struct FunctionChunk {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    index: usize,
    id: String,
    name: String,
    arguments: String,
}

/// Folds streamed deltas into the final assistant message.
///
/// Tool calls are kept in the order their first fragment arrived, so the
/// first completed call is the one whose deltas were streamed first.
#[derive(Debug, Default)]
struct StreamAccumulator {
    content: String,
    reasoning: String,
    tool_calls: Vec<PartialToolCall>,
}

impl StreamAccumulator {
    fn apply(&mut self, chunk: StreamChunk) -> Vec<StreamDelta> {
        let mut deltas = Vec::new();
        for choice in chunk.choices {
            let delta = choice.delta;
            if let Some(reasoning) = delta.reasoning_content.filter(|s| !s.is_empty()) {
                self.reasoning.push_str(&reasoning);
                deltas.push(StreamDelta::Reasoning(reasoning));
            }
            if let Some(text) = delta.content.filter(|s| !s.is_empty()) {
                self.content.push_str(&text);
                deltas.push(StreamDelta::Text(text));
            }
            for call in delta.tool_calls {
                let (name, arguments) = match call.function {
                    Some(f) => (f.name, f.arguments.unwrap_or_default()),
                    None => (None, String::new()),
                };
                let partial = self.partial(call.index);
                if let Some(id) = &call.id {
                    partial.id.clone_from(id);
                }
                if let Some(name) = &name {
                    partial.name.push_str(name);
                }
                partial.arguments.push_str(&arguments);
                deltas.push(StreamDelta::ToolCall(ToolCallDelta {
                    index: call.index,
                    id: call.id,
                    name,
                    arguments,
                }));
            }
        }
        deltas
    }

    fn partial(&mut self, index: usize) -> &mut PartialToolCall {
        let pos = match self.tool_calls.iter().position(|p| p.index == index) {
            Some(pos) => pos,
            None => {
                self.tool_calls.push(PartialToolCall {
                    index,
                    ..Default::default()
                });
                self.tool_calls.len() - 1
            }
        };
        &mut self.tool_calls[pos]
    }

    fn finish(self) -> AssistantMessage {
        let tool_calls = self
            .tool_calls
            .into_iter()
            .map(|partial| {
                let arguments = if partial.arguments.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&partial.arguments)
                        .unwrap_or(Value::String(partial.arguments))
                };
                ToolCall {
                    id: partial.id,
                    name: partial.name,
                    arguments,
                }
            })
            .collect();
        AssistantMessage {
            content: self.content,
            reasoning_content: (!self.reasoning.is_empty()).then_some(self.reasoning),
            tool_calls,
        }
    }
}
