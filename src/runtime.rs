//! Task runtime: one conversation, its state machine, and its drive loop.
//!
//! [`AgentTaskRuntime::run_with`] starts a drive thread that repeatedly submits a
//! streaming model call to the [`Scheduler`], forwards the call's chunks to
//! the consumer's [`TurnStream`], and executes at most one tool call per turn.
//!
//! ```text
//! drive thread                      scheduler loop
//! ────────────                      ──────────────
//! submit(stream_turn) ───────────▶  open_stream, deltas ─┐
//! recv_timeout(queue) ◀──────────── turn queue ◀─────────┘
//!   └─▶ bridge (TurnStream)         append assistant (+ pending tool)
//! await_result ◀─────────────────── MessageEnd, tool call
//! execute tool, loop
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bridge::TurnStream;
use crate::config::RuntimeConfig;
use crate::context::AgentContext;
use crate::error::{TaskError, ToolError};
use crate::llm::{LlmClient, StreamDelta, StreamRequest};
use crate::message::{Chunk, IGNORED_BY_USER, Message, ToolCall, ToolMessage};
use crate::scheduler::{Scheduler, TaskHandle};
use crate::store::TaskStore;
use crate::tools::ToolKind;

/// Backoff while the turn queue is full.
const QUEUE_RETRY: Duration = Duration::from_millis(5);

/// Where the drive loop is in its turn cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    /// Between turns, or never run.
    Idle,
    /// A streaming model call is in flight.
    AwaitingModel,
    /// Executing the tool proposed by the last turn.
    ProcessingTool,
    /// The loop ended on its own: completion, a human-in-the-loop tool, or an error.
    Halted,
    /// The loop was stopped from outside.
    Interrupted,
    /// The drive loop exited and emitted `Done`.
    Done,
}

impl TurnState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TurnState) -> bool {
        use TurnState::*;

        matches!(
            (self, target),
            (Idle, AwaitingModel) | (Idle, Interrupted) |
            (AwaitingModel, ProcessingTool) | (AwaitingModel, Halted) | (AwaitingModel, Interrupted) |
            (ProcessingTool, Idle) | (ProcessingTool, Halted) | (ProcessingTool, Interrupted) |
            (Halted, Done) | (Interrupted, Done) |
            (Done, Idle)
        )
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::AwaitingModel => "awaiting_model",
            Self::ProcessingTool => "processing_tool",
            Self::Halted => "halted",
            Self::Interrupted => "interrupted",
            Self::Done => "done",
        };
        write!(f, "{s}")
    }
}

/// How the drive thread stopped reading a turn queue.
enum TurnEnd {
    MessageEnd,
    Failed,
    Interrupted,
}

/// Why the outer loop ended.
enum Exit {
    Halted,
    Interrupted,
}

/// Shared services a runtime needs.
#[derive(Clone)]
pub struct RuntimeDeps {
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<dyn TaskStore>,
    pub config: RuntimeConfig,
}

/// A live conversation.
pub struct AgentTaskRuntime {
    id: i64,
    context: AgentContext,
    client: Arc<dyn LlmClient>,
    deps: RuntimeDeps,
    messages: Mutex<Vec<Message>>,
    running: AtomicBool,
    driving: AtomicBool,
    /// Incremented by every `run()`; ties a `TurnStream` to the run it belongs to.
    generation: AtomicU64,
    current: Mutex<Option<TaskHandle<Option<ToolCall>>>>,
    drive_thread: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<TurnState>,
}

impl AgentTaskRuntime {
    pub fn new(
        id: i64,
        messages: Vec<Message>,
        context: AgentContext,
        client: Arc<dyn LlmClient>,
        deps: RuntimeDeps,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            context,
            client,
            deps,
            messages: Mutex::new(messages),
            running: AtomicBool::new(false),
            driving: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            current: Mutex::new(None),
            drive_thread: Mutex::new(None),
            state: Mutex::new(TurnState::Idle),
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn context(&self) -> &AgentContext {
        &self.context
    }

    pub fn state(&self) -> TurnState {
        *lock(&self.state)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether a drive thread is alive.
    pub fn is_driving(&self) -> bool {
        self.driving.load(Ordering::SeqCst)
    }

    /// Snapshot of the conversation.
    pub fn messages(&self) -> Vec<Message> {
        self.conversation().clone()
    }

    /// Append a message, first resolving a pending tool call the user skipped.
    pub fn append_message(&self, message: Message) {
        let mut messages = self.conversation();
        if let Some(pending) = messages.last_mut().and_then(Message::as_pending_tool_mut) {
            debug!(task_id = self.id, call_id = %pending.id, "Pending tool call ignored by user");
            pending.result = Some(IGNORED_BY_USER.to_string());
        }
        messages.push(message);
    }

    /// Answer the pending tool call `call_id` (an `ask_user` question).
    pub fn answer_tool(&self, call_id: &str, answer: impl Into<String>) -> Result<(), TaskError> {
        let mut messages = self.conversation();
        let pending = messages
            .iter_mut()
            .rev()
            .find_map(|m| m.as_pending_tool_mut().filter(|t| t.id == call_id))
            .ok_or_else(|| TaskError::NoPendingTool {
                id: self.id,
                call_id: call_id.to_string(),
            })?;
        pending.result = Some(answer.into());
        debug!(task_id = self.id, call_id, "Tool call answered");
        Ok(())
    }

    /// Start the drive loop and return its chunk stream.
    ///
    /// Fails with `Busy` while a previous drive loop is still alive.
    pub fn run(self: &Arc<Self>) -> Result<TurnStream, TaskError> {
        self.run_with(None)
    }

    /// Append `message` and start the drive loop.
    ///
    /// The message is only appended once the run is claimed, so a `Busy`
    /// result leaves the conversation untouched.
    pub fn run_with(self: &Arc<Self>, message: Option<Message>) -> Result<TurnStream, TaskError> {
        if self.driving.swap(true, Ordering::SeqCst) {
            return Err(TaskError::Busy { id: self.id });
        }
        if let Some(message) = message {
            self.append_message(message);
        }
        self.running.store(true, Ordering::SeqCst);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.transition(TurnState::Idle);

        let (bridge_tx, bridge_rx) = mpsc::channel(self.deps.config.bridge_capacity);
        let runtime = Arc::clone(self);
        let mut drive_thread = lock(&self.drive_thread);
        let spawned = std::thread::Builder::new()
            .name(format!("task-{}", self.id))
            .spawn(move || runtime.drive(bridge_tx));

        match spawned {
            Ok(handle) => *drive_thread = Some(handle),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                self.driving.store(false, Ordering::SeqCst);
                return Err(TaskError::Spawn(e.to_string()));
            }
        }
        drop(drive_thread);

        info!(task_id = self.id, generation, "Task run started");
        Ok(TurnStream::new(bridge_rx, Arc::clone(self), generation))
    }

    /// Request the drive loop to halt and cancel the in-flight model call.
    ///
    /// Idempotent; safe from any thread.
    pub fn stop(&self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        if let Some(handle) = lock(&self.current).take() {
            self.deps.scheduler.cancel(&handle);
        }
        if was_running {
            info!(task_id = self.id, "Task stop requested");
        }
    }

    /// Stop and wait for the drive thread to exit.
    ///
    /// Once this returns the runtime accepts a new run. Called from the drive
    /// thread itself it only stops.
    pub fn stop_and_wait(&self) {
        self.stop();
        let Some(handle) = lock(&self.drive_thread).take() else {
            return;
        };
        if handle.thread().id() == std::thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!(task_id = self.id, "Drive thread panicked");
            self.driving.store(false, Ordering::SeqCst);
        }
    }

    /// Stop only if `generation` is still the current run.
    pub(crate) fn stop_run(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) == generation && self.is_driving() {
            debug!(task_id = self.id, generation, "Consumer detached");
            self.stop();
        }
    }

    /// Save the conversation through the store.
    pub fn persist(&self) -> Result<(), TaskError> {
        let store = Arc::clone(&self.deps.store);
        let messages = self.messages();
        let id = self.id;
        let count = messages.len();
        self.deps
            .scheduler
            .block_on(async move { store.save_task(id, &messages).await })??;
        debug!(task_id = id, messages = count, "Task persisted");
        Ok(())
    }

    // ── Drive loop ──────────────────────────────────────────────────

    fn drive(self: Arc<Self>, bridge: mpsc::Sender<Chunk>) {
        let exit = self.drive_turns(&bridge);

        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = lock(&self.current).take() {
            self.deps.scheduler.cancel(&handle);
        }

        match exit {
            Exit::Halted => self.transition(TurnState::Halted),
            Exit::Interrupted => self.transition(TurnState::Interrupted),
        }
        if let Err(e) = self.persist() {
            warn!(task_id = self.id, error = %e, "Failed to persist task");
        }
        self.transition(TurnState::Done);
        self.driving.store(false, Ordering::SeqCst);

        let _ = bridge.blocking_send(Chunk::Done);
        info!(task_id = self.id, "Task run finished");
    }

    fn drive_turns(self: &Arc<Self>, bridge: &mpsc::Sender<Chunk>) -> Exit {
        loop {
            if !self.is_running() {
                self.emit(bridge, Chunk::Interrupted);
                return Exit::Interrupted;
            }
            self.transition(TurnState::AwaitingModel);

            let (queue_tx, queue_rx) =
                std::sync::mpsc::sync_channel(self.deps.config.turn_queue_capacity);
            let request = self.next_request();
            let handle = match self
                .deps
                .scheduler
                .submit(Arc::clone(self).stream_turn(request, queue_tx))
            {
                Ok(handle) => handle,
                Err(e) => {
                    self.emit(bridge, Chunk::Error(e.to_string()));
                    return Exit::Halted;
                }
            };
            *lock(&self.current) = Some(handle);

            match self.forward_turn(&queue_rx, bridge) {
                TurnEnd::MessageEnd => {}
                TurnEnd::Failed => return Exit::Halted,
                TurnEnd::Interrupted => {
                    self.emit(bridge, Chunk::Interrupted);
                    return Exit::Interrupted;
                }
            }

            // Still registered unless `stop()` took it.
            let Some(handle) = *lock(&self.current) else {
                self.emit(bridge, Chunk::Interrupted);
                return Exit::Interrupted;
            };
            let call = match self.deps.scheduler.await_result(handle) {
                Ok(call) => call,
                Err(e) => {
                    debug!(task_id = self.id, error = %e, "Turn unit gone");
                    self.emit(bridge, Chunk::Interrupted);
                    return Exit::Interrupted;
                }
            };
            lock(&self.current).take();

            let Some(call) = call else {
                return Exit::Halted;
            };
            if !self.is_running() {
                self.emit(bridge, Chunk::Interrupted);
                return Exit::Interrupted;
            }

            self.transition(TurnState::ProcessingTool);
            if !self.process_tool(&call, bridge) {
                return Exit::Halted;
            }
            self.transition(TurnState::Idle);
        }
    }

    /// Forward queued chunks to the bridge until the turn ends.
    fn forward_turn(&self, queue: &Receiver<Chunk>, bridge: &mpsc::Sender<Chunk>) -> TurnEnd {
        loop {
            if !self.is_running() {
                return TurnEnd::Interrupted;
            }
            match queue.recv_timeout(self.deps.config.poll_interval) {
                Ok(Chunk::Interrupted) => return TurnEnd::Interrupted,
                Ok(chunk) => {
                    let end = chunk.ends_turn().then(|| match &chunk {
                        Chunk::Error(_) => TurnEnd::Failed,
                        _ => TurnEnd::MessageEnd,
                    });
                    self.emit(bridge, chunk);
                    if let Some(end) = end {
                        return end;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return TurnEnd::Interrupted,
            }
        }
    }

    /// Run the proposed tool. Returns whether the loop continues.
    fn process_tool(&self, call: &ToolCall, bridge: &mpsc::Sender<Chunk>) -> bool {
        let Some(tool) = self.context.tools.get(&call.name) else {
            warn!(task_id = self.id, tool = %call.name, "Model called unknown tool");
            let outcome = Err(ToolError::NotFound {
                name: call.name.clone(),
            });
            if let Some(message) = self.record_tool_outcome(&call.id, outcome) {
                self.emit(bridge, Chunk::ToolResult(message));
            }
            return true;
        };

        match tool.kind() {
            ToolKind::AskUser => {
                info!(task_id = self.id, call_id = %call.id, "Waiting for user answer");
                false
            }
            kind => {
                let started = std::time::Instant::now();
                let outcome = tool.execute(&call.arguments);
                debug!(
                    task_id = self.id,
                    tool = %call.name,
                    ok = outcome.is_ok(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Tool executed"
                );
                if let Some(message) = self.record_tool_outcome(&call.id, outcome) {
                    self.emit(bridge, Chunk::ToolResult(message));
                }
                kind == ToolKind::Workspace
            }
        }
    }

    /// Store a tool outcome on its message if that message is still pending.
    fn record_tool_outcome(
        &self,
        call_id: &str,
        outcome: Result<String, ToolError>,
    ) -> Option<ToolMessage> {
        let mut messages = self.conversation();
        let pending = messages
            .iter_mut()
            .rev()
            .find_map(|m| m.as_pending_tool_mut().filter(|t| t.id == call_id))?;
        match outcome {
            Ok(result) => pending.result = Some(result),
            Err(e) => pending.error = Some(e.to_string()),
        }
        Some(pending.clone())
    }

    fn next_request(&self) -> StreamRequest {
        let history = self.conversation();
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(Message::system(self.context.system_instruction.clone()));
        messages.extend(history.iter().cloned());
        StreamRequest {
            model: self.context.model.clone(),
            messages,
            tools: self.context.tools.definitions(),
        }
    }

    /// Send a chunk to the consumer; a gone consumer stops the run.
    fn emit(&self, bridge: &mpsc::Sender<Chunk>, chunk: Chunk) {
        if bridge.blocking_send(chunk).is_err() && self.is_running() {
            debug!(task_id = self.id, "Consumer gone, stopping");
            self.stop();
        }
    }

    // ── Scheduler unit ──────────────────────────────────────────────

    /// One streaming model call. Runs on the scheduler loop.
    async fn stream_turn(
        self: Arc<Self>,
        request: StreamRequest,
        queue: SyncSender<Chunk>,
    ) -> Option<ToolCall> {
        use futures::StreamExt;

        if self.deps.config.announce_messages && !push(&queue, Chunk::MessageStart).await {
            return None;
        }

        let mut stream = match self.client.open_stream(request).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(task_id = self.id, provider = self.client.provider_name(), error = %e, "Model call failed");
                push(&queue, Chunk::Error(e.to_string())).await;
                return None;
            }
        };

        // Only the first proposed call is executed; the others are never shown.
        let mut kept_call = None;
        while let Some(delta) = stream.deltas.next().await {
            let chunk = match delta {
                Ok(StreamDelta::Text(text)) => Chunk::TextDelta(text),
                Ok(StreamDelta::Reasoning(text)) => Chunk::ReasoningDelta(text),
                Ok(StreamDelta::ToolCall(delta)) => {
                    if *kept_call.get_or_insert(delta.index) != delta.index {
                        continue;
                    }
                    Chunk::ToolCallDelta(delta)
                }
                Err(e) => {
                    warn!(task_id = self.id, error = %e, "Model stream failed");
                    push(&queue, Chunk::Error(e.to_string())).await;
                    return None;
                }
            };
            if !push(&queue, chunk).await {
                return None;
            }
        }

        let Some(mut reply) = stream.completed.recv().await else {
            push(
                &queue,
                Chunk::Error("model stream ended without a completed message".to_string()),
            )
            .await;
            return None;
        };

        let dropped = reply.tool_calls.len().saturating_sub(1);
        let call = reply.keep_first_tool_call();
        if dropped > 0 {
            debug!(task_id = self.id, dropped, "Extra tool calls dropped");
        }
        {
            let mut messages = self.conversation();
            messages.push(reply.into());
            if let Some(call) = &call {
                messages.push(Message::Tool(ToolMessage::pending(call)));
            }
        }

        push(&queue, Chunk::MessageEnd).await;
        call
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn conversation(&self) -> MutexGuard<'_, Vec<Message>> {
        lock(&self.messages)
    }

    fn transition(&self, to: TurnState) {
        let mut state = lock(&self.state);
        let from = *state;
        if from != to && !from.can_transition_to(to) {
            warn!(task_id = self.id, from = %from, to = %to, "Unexpected turn state transition");
        }
        *state = to;
    }
}

impl fmt::Debug for AgentTaskRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentTaskRuntime")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("running", &self.is_running())
            .field("driving", &self.is_driving())
            .finish()
    }
}

/// Push onto the turn queue, yielding while it is full.
///
/// Returns `false` once the drive thread has dropped the queue.
async fn push(queue: &SyncSender<Chunk>, chunk: Chunk) -> bool {
    let mut chunk = chunk;
    loop {
        match queue.try_send(chunk) {
            Ok(()) => return true,
            Err(TrySendError::Full(back)) => {
                chunk = back;
                tokio::time::sleep(QUEUE_RETRY).await;
            }
            Err(TrySendError::Disconnected(_)) => return false,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
