//! Shared fixtures: a scripted model client and a registry over an in-memory store.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use serde_json::json;
use tokio::sync::mpsc;

use daigent::config::RuntimeConfig;
use daigent::context::AgentContext;
use daigent::error::{LlmError, ToolError};
use daigent::llm::{
    LlmClient, LlmClientFactory, ModelStream, ProviderConfig, ProviderKind, StreamDelta,
    StreamRequest,
};
use daigent::message::{AssistantMessage, Message, ToolCall, ToolCallDelta};
use daigent::registry::{RegistryDeps, TaskRegistry};
use daigent::scheduler::Scheduler;
use daigent::store::{MemoryStore, TaskRecord};
use daigent::tools::builtin::{AskUserTool, FinishTaskTool};
use daigent::tools::{Tool, ToolCatalog, require_str};

/// Upper bound for anything a test waits on.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// What one model call does.
pub enum Script {
    /// Stream the deltas, then complete with the message.
    Reply(Vec<StreamDelta>, AssistantMessage),
    /// Refuse to open the stream.
    Fail(String),
    /// Stream the deltas, then never finish.
    Hang(Vec<StreamDelta>),
}

impl Script {
    pub fn text(content: &str) -> Self {
        Script::Reply(
            vec![StreamDelta::Text(content.to_string())],
            AssistantMessage {
                content: content.to_string(),
                ..Default::default()
            },
        )
    }

    /// A reply proposing the given tool calls, streaming a delta for each.
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        let deltas = calls
            .iter()
            .enumerate()
            .map(|(index, call)| {
                StreamDelta::ToolCall(ToolCallDelta {
                    index,
                    id: Some(call.id.clone()),
                    name: Some(call.name.clone()),
                    arguments: call.arguments.to_string(),
                })
            })
            .collect();
        Script::Reply(
            deltas,
            AssistantMessage {
                tool_calls: calls,
                ..Default::default()
            },
        )
    }
}

pub fn call(id: &str, name: &str, arguments: serde_json::Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    }
}

/// Model client replaying scripts queued per model name.
#[derive(Default)]
pub struct ScriptedClient {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    requests: Mutex<Vec<StreamRequest>>,
}

impl ScriptedClient {
    pub fn push(&self, model: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .entry(model.to_string())
            .or_default()
            .push_back(script);
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    async fn open_stream(&self, request: StreamRequest) -> Result<ModelStream, LlmError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.model)
            .and_then(VecDeque::pop_front);
        self.requests.lock().unwrap().push(request);

        let (completed_tx, completed) = mpsc::unbounded_channel();
        let deltas: BoxStream<'static, Result<StreamDelta, LlmError>> = match script {
            Some(Script::Reply(deltas, message)) => {
                completed_tx.send(message).unwrap();
                Box::pin(stream::iter(deltas.into_iter().map(Ok)))
            }
            Some(Script::Hang(deltas)) => {
                Box::pin(futures::StreamExt::chain(
                    stream::iter(deltas.into_iter().map(Ok)),
                    stream::pending(),
                ))
            }
            Some(Script::Fail(reason)) => {
                return Err(LlmError::RequestFailed {
                    provider: "scripted".to_string(),
                    reason,
                });
            }
            None => {
                return Err(LlmError::RequestFailed {
                    provider: "scripted".to_string(),
                    reason: "no script left".to_string(),
                });
            }
        };

        Ok(ModelStream { deltas, completed })
    }
}

struct ScriptedFactory(Arc<ScriptedClient>);

impl LlmClientFactory for ScriptedFactory {
    fn create(&self, _provider: &ProviderConfig) -> Result<Arc<dyn LlmClient>, LlmError> {
        Ok(self.0.clone())
    }
}

/// Workspace tool that echoes its `text` argument.
#[derive(Debug)]
pub struct EchoTool;

impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given text"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        })
    }

    fn execute(&self, params: &serde_json::Value) -> Result<String, ToolError> {
        Ok(format!("echo: {}", require_str(params, "text")?))
    }
}

pub struct Harness {
    pub registry: Arc<TaskRegistry>,
    pub store: Arc<MemoryStore>,
    pub client: Arc<ScriptedClient>,
}

/// Model name used by the agent of task `id`.
pub fn model_for(id: i64) -> String {
    format!("model-{id}")
}

/// Registry over tasks 1 and 2, each with its own agent and a `"hi"` user
/// message, plus task 3 with an empty conversation. Task `n` talks to model
/// `model-n`.
pub fn harness(config: RuntimeConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let tools = Arc::new(
        ToolCatalog::new()
            .with(Arc::new(EchoTool))
            .with(Arc::new(AskUserTool))
            .with(Arc::new(FinishTaskTool)),
    );

    for id in [1, 2, 3] {
        store.insert_context(
            1,
            id,
            AgentContext {
                provider: ProviderConfig {
                    kind: ProviderKind::OpenAiCompatible,
                    base_url: Some("http://localhost:9".to_string()),
                    api_key: secrecy::SecretString::from("sk-test"),
                },
                model: model_for(id),
                system_instruction: "You are a test agent.".to_string(),
                tools: Arc::clone(&tools),
            },
        );
        store.insert_task(TaskRecord {
            id,
            title: format!("task {id}"),
            workspace_id: 1,
            agent_id: Some(id),
            messages: if id == 3 {
                vec![]
            } else {
                vec![Message::user("hi")]
            },
        });
    }

    let client = Arc::new(ScriptedClient::default());
    let registry = Arc::new(TaskRegistry::new(RegistryDeps {
        scheduler: Arc::new(Scheduler::start("test-scheduler").unwrap()),
        store: store.clone(),
        resolver: store.clone(),
        llm_factory: Arc::new(ScriptedFactory(client.clone())),
        config,
    }));

    Harness {
        registry,
        store,
        client,
    }
}

/// Runtime settings with a short poll so stops are observed quickly.
pub fn fast_config() -> RuntimeConfig {
    RuntimeConfig {
        poll_interval: Duration::from_millis(10),
        ..RuntimeConfig::default()
    }
}

/// Poll `condition` until it holds or [`TEST_TIMEOUT`] elapses.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
