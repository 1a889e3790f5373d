//! Streaming bridge: the consumer half of a run and its SSE encoding.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::message::Chunk;
use crate::runtime::AgentTaskRuntime;

/// Chunks of one run, in generation order.
///
/// Single-pass: ends after `Done`. Usable as an async [`Stream`] or, from a
/// thread outside any async runtime, as a blocking [`Iterator`]. Dropping it
/// before `Done` stops the run.
pub struct TurnStream {
    inner: ReceiverStream<Chunk>,
    runtime: Arc<AgentTaskRuntime>,
    generation: u64,
    finished: bool,
}

impl TurnStream {
    pub(crate) fn new(
        rx: mpsc::Receiver<Chunk>,
        runtime: Arc<AgentTaskRuntime>,
        generation: u64,
    ) -> Self {
        Self {
            inner: ReceiverStream::new(rx),
            runtime,
            generation,
            finished: false,
        }
    }

    /// The runtime producing this stream.
    pub fn runtime(&self) -> &Arc<AgentTaskRuntime> {
        &self.runtime
    }

    fn observe(&mut self, chunk: &Option<Chunk>) {
        if matches!(chunk, None | Some(Chunk::Done)) {
            self.finished = true;
        }
    }
}

impl std::fmt::Debug for TurnStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnStream")
            .field("generation", &self.generation)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl Stream for TurnStream {
    type Item = Chunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Chunk>> {
        let polled = Pin::new(&mut self.inner).poll_next(cx);
        if let Poll::Ready(chunk) = &polled {
            self.observe(chunk);
        }
        polled
    }
}

impl Iterator for TurnStream {
    type Item = Chunk;

    /// Blocks the calling thread. Panics if called from within an async runtime.
    fn next(&mut self) -> Option<Chunk> {
        if self.finished {
            return None;
        }
        let chunk = self.inner.as_mut().blocking_recv();
        self.observe(&chunk);
        chunk
    }
}

impl Drop for TurnStream {
    fn drop(&mut self) {
        if !self.finished {
            self.runtime.stop_run(self.generation);
        }
    }
}

/// One server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: &'static str,
    pub data: Value,
}

impl SseFrame {
    pub fn into_event(self) -> Event {
        Event::default().event(self.event).data(self.data.to_string())
    }
}

/// Map a chunk to its SSE event name and JSON payload.
pub fn chunk_event(chunk: &Chunk) -> SseFrame {
    let (event, data) = match chunk {
        Chunk::TextDelta(content) => ("text_delta", json!({ "content": content })),
        Chunk::ReasoningDelta(content) => ("reasoning_delta", json!({ "content": content })),
        Chunk::ToolCallDelta(delta) => ("tool_call_delta", json!(delta)),
        Chunk::MessageStart => ("message_start", Value::Null),
        Chunk::MessageEnd => ("message_end", Value::Null),
        Chunk::ToolResult(message) => ("tool_result", json!(message)),
        Chunk::Interrupted => ("interrupted", Value::Null),
        Chunk::Done => ("done", Value::Null),
        Chunk::Error(message) => ("error", json!({ "message": message })),
    };
    SseFrame { event, data }
}

/// Serve a run as an SSE response. Client disconnect drops the stream.
pub fn sse_response(stream: TurnStream) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    use futures::StreamExt;

    // `TurnStream` is also an `Iterator`; name the stream combinator explicitly.
    Sse::new(StreamExt::map(stream, |chunk| Ok(chunk_event(&chunk).into_event())))
        .keep_alive(KeepAlive::default())
}
