//! End-to-end turn loop scenarios against a scripted model.
//!
//! These drive runtimes through the registry exactly as the HTTP layer does,
//! reading the chunk stream as a blocking iterator.

mod common;

use serde_json::json;

use common::{Script, call, fast_config, harness, model_for, wait_until};
use daigent::bridge::TurnStream;
use daigent::config::RuntimeConfig;
use daigent::error::TaskError;
use daigent::llm::StreamDelta;
use daigent::message::{Chunk, Message};
use daigent::runtime::TurnState;

fn drain(stream: TurnStream) -> Vec<Chunk> {
    stream.collect()
}

fn tool_results(chunks: &[Chunk]) -> Vec<&daigent::message::ToolMessage> {
    chunks
        .iter()
        .filter_map(|c| match c {
            Chunk::ToolResult(message) => Some(message),
            _ => None,
        })
        .collect()
}

#[test]
fn plain_reply_streams_then_halts() {
    let h = harness(fast_config());
    h.client.push(&model_for(1), Script::text("Hello"));

    let rt = h.registry.add(1).unwrap();
    let chunks = drain(rt.run().unwrap());

    assert_eq!(
        chunks,
        vec![
            Chunk::TextDelta("Hello".into()),
            Chunk::MessageEnd,
            Chunk::Done
        ]
    );
    assert_eq!(rt.state(), TurnState::Done);
    assert!(!rt.is_driving());

    let stored = h.store.messages(1).unwrap();
    assert_eq!(stored, vec![Message::user("hi"), Message::assistant("Hello")]);
}

#[test]
fn request_starts_with_system_instruction() {
    let h = harness(fast_config());
    h.client.push(&model_for(1), Script::text("Hello"));

    let rt = h.registry.add(1).unwrap();
    drain(rt.run().unwrap());

    let requests = h.client.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].model, "model-1");
    assert_eq!(
        requests[0].messages[0],
        Message::system("You are a test agent.")
    );
    assert_eq!(requests[0].messages[1], Message::user("hi"));
    let tools: Vec<&str> = requests[0].tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(tools, ["echo", "ask_user", "finish_task"]);
}

#[test]
fn only_first_tool_call_is_kept_and_loop_continues() {
    let h = harness(fast_config());
    h.client.push(
        &model_for(1),
        Script::tool_calls(vec![
            call("call_1", "echo", json!({"text": "one"})),
            call("call_2", "echo", json!({"text": "two"})),
        ]),
    );
    h.client.push(&model_for(1), Script::text("All done"));

    let rt = h.registry.add(1).unwrap();
    let chunks = drain(rt.run().unwrap());

    let results = tool_results(&chunks);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, "call_1");
    assert_eq!(results[0].result.as_deref(), Some("echo: one"));
    // The dropped call never reaches the consumer or the conversation.
    assert!(!format!("{chunks:?}").contains("call_2"), "{chunks:?}");
    assert!(chunks.iter().any(|c| matches!(c, Chunk::ToolCallDelta(d) if d.index == 0)));
    assert_eq!(chunks.last(), Some(&Chunk::Done));
    assert_eq!(
        chunks.iter().filter(|c| **c == Chunk::MessageEnd).count(),
        2
    );

    let stored = h.store.messages(1).unwrap();
    assert_eq!(stored.len(), 4, "{stored:?}");
    match &stored[1] {
        Message::Assistant { tool_calls, .. } => {
            assert_eq!(tool_calls.len(), 1);
            assert_eq!(tool_calls[0].id, "call_1");
        }
        other => panic!("expected assistant message, got {other:?}"),
    }
    match &stored[2] {
        Message::Tool(tool) => assert_eq!(tool.result.as_deref(), Some("echo: one")),
        other => panic!("expected tool message, got {other:?}"),
    }
    assert_eq!(stored[3], Message::assistant("All done"));
    assert!(!format!("{stored:?}").contains("call_2"));

    // The second call saw the tool result.
    let second = &h.client.requests()[1];
    assert!(second.messages.iter().any(|m| matches!(
        m,
        Message::Tool(tool) if tool.id == "call_1" && tool.result.is_some()
    )));
}

#[test]
fn unknown_tool_records_error_and_continues() {
    let h = harness(fast_config());
    h.client.push(
        &model_for(1),
        Script::tool_calls(vec![call("call_1", "delete_everything", json!({}))]),
    );
    h.client.push(&model_for(1), Script::text("Sorry"));

    let rt = h.registry.add(1).unwrap();
    let chunks = drain(rt.run().unwrap());

    let results = tool_results(&chunks);
    assert_eq!(results.len(), 1);
    assert!(results[0].result.is_none());
    assert!(
        results[0]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("delete_everything"))
    );
    assert_eq!(h.client.requests().len(), 2);
    assert_eq!(rt.messages().last(), Some(&Message::assistant("Sorry")));
}

#[test]
fn finish_task_ends_the_loop() {
    let h = harness(fast_config());
    h.client.push(
        &model_for(1),
        Script::tool_calls(vec![call(
            "call_1",
            "finish_task",
            json!({"result": "Summarized 3 files."}),
        )]),
    );

    let rt = h.registry.add(1).unwrap();
    let chunks = drain(rt.run().unwrap());

    let results = tool_results(&chunks);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].result.as_deref(), Some("Summarized 3 files."));
    assert_eq!(chunks.last(), Some(&Chunk::Done));
    assert_eq!(h.client.requests().len(), 1);
    assert_eq!(rt.state(), TurnState::Done);
}

#[test]
fn ask_user_waits_for_an_answer() {
    let h = harness(fast_config());
    h.client.push(
        &model_for(1),
        Script::tool_calls(vec![call(
            "call_q",
            "ask_user",
            json!({"question": "Which file?"}),
        )]),
    );

    let rt = h.registry.add(1).unwrap();
    let chunks = drain(rt.run().unwrap());

    assert!(tool_results(&chunks).is_empty());
    assert_eq!(chunks.last(), Some(&Chunk::Done));
    assert!(rt.messages().last().is_some_and(Message::is_pending_tool));
    // Persisted while still pending.
    assert!(h.store.messages(1).unwrap().last().unwrap().is_pending_tool());

    rt.answer_tool("call_q", "README.md").unwrap();
    h.client.push(&model_for(1), Script::text("Reading README.md"));
    let chunks = drain(rt.run().unwrap());
    assert_eq!(chunks.last(), Some(&Chunk::Done));

    let second = &h.client.requests()[1];
    assert!(second.messages.iter().any(|m| matches!(
        m,
        Message::Tool(tool) if tool.id == "call_q" && tool.result.as_deref() == Some("README.md")
    )));
    assert!(!rt.messages().iter().any(Message::is_pending_tool));
}

#[test]
fn stop_while_awaiting_model_interrupts_without_partial_message() {
    let h = harness(fast_config());
    h.client.push(
        &model_for(1),
        Script::Hang(vec![StreamDelta::Text("Hel".into())]),
    );

    let rt = h.registry.add(1).unwrap();
    let mut stream = rt.run().unwrap();

    assert_eq!(stream.next(), Some(Chunk::TextDelta("Hel".into())));
    assert_eq!(rt.state(), TurnState::AwaitingModel);
    assert!(h.registry.stop(1).unwrap());

    let rest: Vec<Chunk> = stream.collect();
    assert_eq!(rest, vec![Chunk::Interrupted, Chunk::Done]);
    assert_eq!(rt.messages(), vec![Message::user("hi")]);
    assert_eq!(h.store.messages(1).unwrap(), vec![Message::user("hi")]);
    assert!(h.registry.has(1));
}

#[test]
fn dropping_the_stream_stops_the_run() {
    let h = harness(fast_config());
    h.client.push(
        &model_for(1),
        Script::Hang(vec![StreamDelta::Text("Hel".into())]),
    );

    let rt = h.registry.add(1).unwrap();
    let mut stream = rt.run().unwrap();
    assert_eq!(stream.next(), Some(Chunk::TextDelta("Hel".into())));
    drop(stream);

    assert!(wait_until(|| !rt.is_driving()));
    assert!(!rt.is_running());
    assert_eq!(rt.state(), TurnState::Done);
    assert_eq!(rt.messages(), vec![Message::user("hi")]);
}

#[test]
fn second_run_while_driving_is_busy() {
    let h = harness(fast_config());
    h.client.push(&model_for(1), Script::Hang(vec![]));

    let rt = h.registry.add(1).unwrap();
    let stream = rt.run().unwrap();

    assert!(matches!(rt.run(), Err(TaskError::Busy { id: 1 })));

    rt.stop();
    let chunks = drain(stream);
    assert_eq!(chunks, vec![Chunk::Interrupted, Chunk::Done]);

    // Reusable once the previous loop has exited.
    h.client.push(&model_for(1), Script::text("Back"));
    let chunks = drain(rt.run().unwrap());
    assert_eq!(chunks.last(), Some(&Chunk::Done));
    assert_eq!(rt.messages().last(), Some(&Message::assistant("Back")));
}

#[test]
fn busy_run_with_leaves_conversation_untouched() {
    let h = harness(fast_config());
    h.client.push(&model_for(1), Script::Hang(vec![]));

    let rt = h.registry.add(1).unwrap();
    let stream = rt.run().unwrap();

    let err = rt.run_with(Some(Message::user("too early"))).unwrap_err();
    assert!(matches!(err, TaskError::Busy { id: 1 }));
    assert_eq!(rt.messages(), vec![Message::user("hi")]);

    rt.stop();
    drain(stream);
    assert_eq!(h.store.messages(1).unwrap(), vec![Message::user("hi")]);
}

#[test]
fn pause_then_immediate_resume_is_accepted() {
    let h = harness(fast_config());
    let rt = h.registry.add(1).unwrap();

    for round in 0..5 {
        h.client.push(&model_for(1), Script::Hang(vec![]));
        let stream = rt.run().unwrap();
        assert!(wait_until(|| h.client.requests().len() == round + 1));

        assert!(h.registry.stop(1).unwrap());
        assert!(!rt.is_driving());
        assert_eq!(rt.state(), TurnState::Done);
        assert_eq!(drain(stream), vec![Chunk::Interrupted, Chunk::Done]);
    }

    h.client.push(&model_for(1), Script::text("Resumed"));
    let chunks = drain(rt.run_with(Some(Message::user("go on"))).unwrap());
    assert_eq!(chunks.last(), Some(&Chunk::Done));
    assert_eq!(
        rt.messages(),
        vec![
            Message::user("hi"),
            Message::user("go on"),
            Message::assistant("Resumed")
        ]
    );
}

#[test]
fn empty_conversation_still_runs() {
    let h = harness(fast_config());
    h.client.push(&model_for(3), Script::text("Hello"));

    let rt = h.registry.add(3).unwrap();
    assert!(rt.messages().is_empty());
    let chunks = drain(rt.run().unwrap());

    assert_eq!(
        chunks,
        vec![
            Chunk::TextDelta("Hello".into()),
            Chunk::MessageEnd,
            Chunk::Done
        ]
    );
    let request = &h.client.requests()[0];
    assert_eq!(
        request.messages,
        vec![Message::system("You are a test agent.")]
    );
    assert_eq!(h.store.messages(3).unwrap(), vec![Message::assistant("Hello")]);
}

#[test]
fn provider_failure_ends_with_error_then_done() {
    let h = harness(fast_config());
    h.client
        .push(&model_for(1), Script::Fail("HTTP 401: bad key".into()));

    let rt = h.registry.add(1).unwrap();
    let chunks = drain(rt.run().unwrap());

    assert_eq!(chunks.len(), 2, "{chunks:?}");
    assert!(matches!(&chunks[0], Chunk::Error(msg) if msg.contains("HTTP 401")));
    assert_eq!(chunks[1], Chunk::Done);
    assert_eq!(rt.messages(), vec![Message::user("hi")]);
}

#[test]
fn announce_messages_emits_message_start() {
    let h = harness(RuntimeConfig {
        announce_messages: true,
        ..fast_config()
    });
    h.client.push(&model_for(1), Script::text("Hello"));

    let rt = h.registry.add(1).unwrap();
    let chunks = drain(rt.run().unwrap());

    assert_eq!(
        chunks,
        vec![
            Chunk::MessageStart,
            Chunk::TextDelta("Hello".into()),
            Chunk::MessageEnd,
            Chunk::Done
        ]
    );
}

#[test]
fn tasks_run_independently() {
    let h = harness(fast_config());
    h.client.push(&model_for(1), Script::Hang(vec![]));
    h.client.push(&model_for(2), Script::text("Two"));

    let first = h.registry.add(1).unwrap();
    let hanging = first.run().unwrap();

    let second = h.registry.add(2).unwrap();
    let chunks = drain(second.run().unwrap());
    assert_eq!(chunks.last(), Some(&Chunk::Done));
    assert_eq!(second.messages().last(), Some(&Message::assistant("Two")));

    assert!(first.is_driving());
    assert_eq!(first.state(), TurnState::AwaitingModel);

    h.registry.shutdown();
    assert_eq!(drain(hanging).last(), Some(&Chunk::Done));
    assert!(h.registry.is_empty());
}

#[test]
fn appended_message_reaches_the_next_run() {
    let h = harness(fast_config());
    h.client.push(&model_for(1), Script::text("Hello"));

    let rt = h.registry.add(1).unwrap();
    rt.append_message(Message::user("and also this"));
    drain(rt.run().unwrap());

    let request = &h.client.requests()[0];
    assert_eq!(
        request.messages.last(),
        Some(&Message::user("and also this"))
    );
    assert_eq!(h.store.messages(1).unwrap().len(), 3);
}

