//! End-to-end exchanges against a scripted agent process.
//!
//! | Scenario | Expectation |
//! |----------|-------------|
//! | streamed text + result | assistant message rebuilt, resumption id stored |
//! | complete messages + tool results | tool names resolved, noise skipped |
//! | non-zero exit | session `Error`, turn discarded, prior history kept |
//! | output ends without result | `ConnectionLost` |
//! | caller cancellation / stop | `Cancelled`, process killed, session `Stopped` or removed |
//! | exchange future dropped | session `Stopped`, tool names kept |
//! | result with blocks still open | `StreamBlockStopped` for each before the message |

use std::sync::Arc;
use std::time::Duration;

use agent_conduit::models::message::{ContentBlock, Message};
use agent_conduit::models::session::{PermissionMode, SessionStatus};
use agent_conduit::persistence::{db, SessionRepo};
use agent_conduit::registry::{EventSink, SessionEvent, SessionRegistry};
use agent_conduit::AppError;
use serde_json::{json, Value};
use serial_test::serial;
use tokio_util::sync::CancellationToken;

use super::test_helpers::{drain, heredoc, registry_for, wait_until, FakeAgent};

fn result_line(session_id: &str) -> Value {
    json!({
        "type": "result",
        "subtype": "success",
        "duration_ms": 120,
        "duration_api_ms": 100,
        "is_error": false,
        "num_turns": 1,
        "session_id": session_id,
        "total_cost_usd": 0.01,
        "result": "Hi"
    })
}

fn stream_event(uuid: &str, event: Value) -> Value {
    json!({ "type": "stream_event", "uuid": uuid, "session_id": "abc", "event": event })
}

fn scenario_lines() -> Vec<Value> {
    vec![
        json!({ "type": "system", "subtype": "init", "session_id": "abc", "model": "claude-test" }),
        stream_event(
            "u1",
            json!({ "type": "content_block_start", "index": 0, "content_block": { "type": "text", "text": "" } }),
        ),
        stream_event(
            "u2",
            json!({ "type": "content_block_delta", "index": 0, "delta": { "type": "text_delta", "text": "Hi" } }),
        ),
        stream_event("u3", json!({ "type": "content_block_stop", "index": 0 })),
        result_line("abc"),
    ]
}

#[tokio::test]
#[serial]
async fn streamed_reply_is_rebuilt_and_resume_id_stored() {
    let agent = FakeAgent::replying(&scenario_lines());
    let (registry, mut rx) = registry_for(&agent, 4);

    let session = registry.start(agent.session_config()).await.expect("start");
    let result = registry
        .send_message(&session.id, "hello", None)
        .await
        .expect("exchange");
    assert_eq!(result.session_id, "abc");

    let snapshot = registry.get(&session.id).expect("session");
    assert_eq!(snapshot.status, SessionStatus::Running);
    assert_eq!(snapshot.resume_id.as_deref(), Some("abc"));
    assert_eq!(snapshot.exchange_count, 1);
    assert!((snapshot.total_cost_usd - 0.01).abs() < 1e-9);
    assert_eq!(snapshot.total_duration_ms, 120);
    assert_eq!(snapshot.history.len(), 3);

    let Message::Assistant(assistant) = &snapshot.history[1] else {
        panic!("expected assistant message, got {:?}", snapshot.history[1]);
    };
    assert_eq!(assistant.content, vec![ContentBlock::Text { text: "Hi".into() }]);
    assert_eq!(assistant.model, "claude-test");
    assert!(snapshot.history[2].is_terminal());

    let turn = agent.stdin_line();
    assert_eq!(turn["type"], "user");
    assert_eq!(turn["message"]["content"], "hello");

    let args = agent.args();
    assert!(args.contains(&"--include-partial-messages".to_owned()));
    assert!(!args.contains(&"--resume".to_owned()));

    let kinds: Vec<&'static str> = drain(&mut rx)
        .iter()
        .map(|event| match event {
            SessionEvent::SessionStarted { .. } => "started",
            SessionEvent::StatusChanged { .. } => "status",
            SessionEvent::StreamBlockStarted { .. } => "block_start",
            SessionEvent::StreamBlockDelta { .. } => "block_delta",
            SessionEvent::StreamBlockStopped { .. } => "block_stop",
            SessionEvent::MessageReceived { .. } => "message",
            SessionEvent::ResultReceived { .. } => "result",
            _ => "other",
        })
        .collect();
    assert_eq!(
        kinds,
        [
            "started",
            "status",
            "status",
            "block_start",
            "block_delta",
            "block_stop",
            "message",
            "result",
            "status"
        ]
    );
}

#[tokio::test]
#[serial]
async fn next_exchange_resumes_the_agent_conversation() {
    let agent = FakeAgent::replying(&scenario_lines());
    let (registry, _rx) = registry_for(&agent, 4);

    let session = registry.start(agent.session_config()).await.expect("start");
    registry
        .send_message(&session.id, "first", None)
        .await
        .expect("first exchange");
    registry
        .send_message(&session.id, "second", Some(PermissionMode::Plan))
        .await
        .expect("second exchange");

    let args = agent.args();
    let resume = args.iter().position(|a| a == "--resume").expect("--resume");
    assert_eq!(args[resume + 1], "abc");
    let mode = args
        .iter()
        .position(|a| a == "--permission-mode")
        .expect("--permission-mode");
    assert_eq!(args[mode + 1], "plan");
    assert_eq!(agent.stdin_line()["session_id"], "abc");

    let snapshot = registry.get(&session.id).expect("session");
    assert_eq!(snapshot.exchange_count, 2);
    assert_eq!(snapshot.history.len(), 6);
    // The override applies to one exchange only.
    assert_eq!(snapshot.config.permission_mode, PermissionMode::Default);
}

#[tokio::test]
#[serial]
async fn result_closes_blocks_left_open() {
    let agent = FakeAgent::replying(&[
        stream_event(
            "u1",
            json!({ "type": "content_block_start", "index": 0, "content_block": { "type": "text", "text": "" } }),
        ),
        stream_event(
            "u2",
            json!({ "type": "content_block_delta", "index": 0, "delta": { "type": "text_delta", "text": "Hi" } }),
        ),
        result_line("abc"),
    ]);
    let (registry, mut rx) = registry_for(&agent, 4);

    let session = registry.start(agent.session_config()).await.expect("start");
    registry
        .send_message(&session.id, "hello", None)
        .await
        .expect("exchange");

    let events: Vec<SessionEvent> = drain(&mut rx)
        .into_iter()
        .filter(|event| !matches!(event, SessionEvent::StatusChanged { .. } | SessionEvent::SessionStarted { .. }))
        .collect();
    assert_eq!(events.len(), 5, "{events:?}");
    assert!(matches!(events[0], SessionEvent::StreamBlockStarted { index: 0, .. }));
    assert!(matches!(events[1], SessionEvent::StreamBlockDelta { index: 0, .. }));
    assert_eq!(
        events[2],
        SessionEvent::StreamBlockStopped {
            session_id: session.id.clone(),
            index: 0,
            block: ContentBlock::Text { text: "Hi".into() },
        }
    );
    assert!(matches!(events[3], SessionEvent::MessageReceived { .. }));
    assert!(matches!(events[4], SessionEvent::ResultReceived { .. }));
}

fn tool_use_reply() -> Vec<Value> {
    vec![
        json!({
            "type": "assistant",
            "session_id": "s",
            "message": {
                "model": "claude-test",
                "content": [{ "type": "tool_use", "id": "t1", "name": "Bash", "input": { "command": "ls" } }]
            }
        }),
        result_line("s"),
    ]
}

fn tool_result_reply() -> Vec<Value> {
    vec![
        json!({
            "type": "user",
            "session_id": "s",
            "message": {
                "role": "user",
                "content": [{ "type": "tool_result", "tool_use_id": "t1", "content": "a.rs" }]
            }
        }),
        result_line("s"),
    ]
}

fn resolved_tool_names(events: &[SessionEvent]) -> Vec<(String, String)> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::ToolResultReceived {
                tool_use_id,
                tool_name,
                ..
            } => Some((tool_use_id.clone(), tool_name.clone())),
            _ => None,
        })
        .collect()
}

#[tokio::test]
#[serial]
async fn tool_result_in_later_exchange_resolves_name() {
    let agent = FakeAgent::per_call(&[heredoc(&tool_use_reply()), heredoc(&tool_result_reply())]);
    let (registry, mut rx) = registry_for(&agent, 4);

    let session = registry.start(agent.session_config()).await.expect("start");
    registry
        .send_message(&session.id, "list files", None)
        .await
        .expect("first exchange");
    drain(&mut rx);
    registry
        .send_message(&session.id, "continue", None)
        .await
        .expect("second exchange");

    assert_eq!(
        resolved_tool_names(&drain(&mut rx)),
        [("t1".to_owned(), "Bash".to_owned())]
    );
}

#[tokio::test]
#[serial]
async fn dropped_exchange_future_leaves_session_stopped() {
    let agent = FakeAgent::per_call(&[
        heredoc(&tool_use_reply()),
        "exec sleep 30".to_owned(),
        heredoc(&tool_result_reply()),
    ]);
    let (registry, mut rx) = registry_for(&agent, 4);

    let session = registry.start(agent.session_config()).await.expect("start");
    registry
        .send_message(&session.id, "list files", None)
        .await
        .expect("first exchange");
    drain(&mut rx);

    let abandoned = tokio::time::timeout(
        Duration::from_millis(500),
        registry.send_message(&session.id, "hang", None),
    )
    .await;
    assert!(abandoned.is_err(), "exchange should still be running");

    let snapshot = registry.get(&session.id).expect("session");
    assert_eq!(snapshot.status, SessionStatus::Stopped);
    assert_eq!(snapshot.history.len(), 3, "abandoned turn is discarded");
    assert_eq!(snapshot.exchange_count, 1);

    let stopped = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = rx.recv().await {
            if matches!(event, SessionEvent::StatusChanged { status: SessionStatus::Stopped, .. }) {
                return true;
            }
        }
        false
    })
    .await
    .expect("status event");
    assert!(stopped);

    let restarted = registry.restart(&session.id).await.expect("restart");
    assert_eq!(restarted.status, SessionStatus::Running);
    registry
        .send_message(&session.id, "continue", None)
        .await
        .expect("exchange after restart");

    assert_eq!(
        resolved_tool_names(&drain(&mut rx)),
        [("t1".to_owned(), "Bash".to_owned())]
    );
}

#[tokio::test]
#[serial]
async fn complete_messages_and_tool_results() {
    let agent = FakeAgent::replying(&[
        json!({
            "type": "assistant",
            "session_id": "s",
            "message": {
                "model": "claude-test",
                "content": [{ "type": "tool_use", "id": "toolu_1", "name": "Read", "input": { "path": "a.rs" } }]
            }
        }),
        json!({
            "type": "user",
            "session_id": "s",
            "message": {
                "role": "user",
                "content": [
                    { "type": "tool_result", "tool_use_id": "toolu_1", "content": "fn main() {}" },
                    { "type": "tool_result", "tool_use_id": "toolu_x", "content": "?", "is_error": true }
                ]
            }
        }),
        json!("not an object"),
        json!({ "type": "mystery" }),
        json!({
            "type": "control_request",
            "request_id": "req-1",
            "request": { "subtype": "can_use_tool", "tool_name": "Bash" }
        }),
        json!({
            "type": "assistant",
            "session_id": "s",
            "message": { "model": "claude-test", "content": [{ "type": "text", "text": "Done" }] }
        }),
        result_line("s-2"),
    ]);
    let (registry, mut rx) = registry_for(&agent, 4);

    let session = registry.start(agent.session_config()).await.expect("start");
    registry
        .send_message(&session.id, "read a.rs", None)
        .await
        .expect("exchange");

    let snapshot = registry.get(&session.id).expect("session");
    let kinds: Vec<&str> = snapshot.history.iter().map(Message::kind).collect();
    assert_eq!(kinds, ["user", "assistant", "user", "assistant", "result"]);
    assert_eq!(snapshot.resume_id.as_deref(), Some("s-2"));

    let events = drain(&mut rx);
    let tool_results: Vec<(String, String, bool)> = events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::ToolResultReceived {
                tool_use_id,
                tool_name,
                is_error,
                ..
            } => Some((tool_use_id.clone(), tool_name.clone(), *is_error)),
            _ => None,
        })
        .collect();
    assert_eq!(
        tool_results,
        [
            ("toolu_1".to_owned(), "Read".to_owned(), false),
            ("toolu_x".to_owned(), "unknown".to_owned(), true),
        ]
    );
    assert!(events.iter().any(|event| matches!(
        event,
        SessionEvent::ControlRequested { request, .. } if request.control_type == "can_use_tool"
    )));
    assert!(matches!(
        events.last(),
        Some(SessionEvent::StatusChanged { status: SessionStatus::Running, .. })
    ));
}

#[tokio::test]
#[serial]
async fn failed_exchange_keeps_prior_history() {
    let agent = FakeAgent::new(&format!(
        "read -r line\nif [ -f \"$DIR/ran\" ]; then\n  echo 'auth failed' >&2\n  exit 3\nfi\ntouch \"$DIR/ran\"\n{}",
        heredoc(&scenario_lines())
    ));
    let (registry, mut rx) = registry_for(&agent, 4);

    let session = registry.start(agent.session_config()).await.expect("start");
    registry
        .send_message(&session.id, "first", None)
        .await
        .expect("first exchange");
    drain(&mut rx);

    let err = registry
        .send_message(&session.id, "second", None)
        .await
        .expect_err("second exchange fails");
    match &err {
        AppError::ProcessExit { code, stderr } => {
            assert_eq!(*code, Some(3));
            assert!(stderr.contains("auth failed"), "{stderr}");
        }
        other => panic!("expected ProcessExit, got {other:?}"),
    }

    let snapshot = registry.get(&session.id).expect("session");
    assert_eq!(snapshot.status, SessionStatus::Error);
    assert_eq!(snapshot.history.len(), 3);
    assert!(snapshot
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("auth failed")));
    assert_eq!(snapshot.resume_id.as_deref(), Some("abc"));

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|event| matches!(event, SessionEvent::ExchangeFailed { .. })));

    let err = registry
        .send_message(&session.id, "third", None)
        .await
        .expect_err("error state refuses exchanges");
    assert!(matches!(err, AppError::InvalidState(_)), "{err:?}");

    let restarted = registry.restart(&session.id).await.expect("restart");
    assert_eq!(restarted.status, SessionStatus::Running);
    assert!(restarted.last_error.is_none());
    assert_eq!(restarted.history.len(), 3);
}

#[tokio::test]
#[serial]
async fn output_ending_without_result_is_connection_lost() {
    let agent = FakeAgent::replying(&[json!({ "type": "system", "subtype": "init" })]);
    let (registry, _rx) = registry_for(&agent, 4);

    let session = registry.start(agent.session_config()).await.expect("start");
    let err = registry
        .send_message(&session.id, "hello", None)
        .await
        .expect_err("no result");
    assert!(matches!(err, AppError::ConnectionLost(_)), "{err:?}");
    assert_eq!(
        registry.get(&session.id).expect("session").status,
        SessionStatus::Error
    );
}

#[tokio::test]
#[serial]
async fn missing_cli_fails_the_exchange() {
    let agent = FakeAgent::replying(&[]);
    let mut transport = agent.transport();
    transport.cli_path = agent.path().join("no-such-agent").to_string_lossy().into_owned();
    let registry = SessionRegistry::new(Arc::new(transport), 4, EventSink::disabled());

    let session = registry.start(agent.session_config()).await.expect("start");
    let err = registry
        .send_message(&session.id, "hello", None)
        .await
        .expect_err("no executable");
    assert!(matches!(err, AppError::CliNotFound(_)), "{err:?}");
    assert_eq!(
        registry.get(&session.id).expect("session").status,
        SessionStatus::Error
    );
}

#[tokio::test]
#[serial]
async fn caller_cancellation_leaves_session_stopped() {
    let agent = FakeAgent::new("read -r line\ntouch \"$DIR/started\"\nexec sleep 30");
    let (registry, _rx) = registry_for(&agent, 4);
    let session = registry.start(agent.session_config()).await.expect("start");

    let cancel = CancellationToken::new();
    let task = {
        let registry = Arc::clone(&registry);
        let id = session.id.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            registry
                .send_message_with_cancel(&id, "wait", None, cancel)
                .await
        })
    };

    let marker = agent.path().join("started");
    wait_until(|| marker.exists()).await;
    assert_eq!(
        registry.get(&session.id).expect("session").status,
        SessionStatus::Processing
    );

    let err = registry
        .send_message(&session.id, "again", None)
        .await
        .expect_err("busy");
    assert!(matches!(err, AppError::InvalidState(_)), "{err:?}");

    cancel.cancel();
    let err = task.await.expect("join").expect_err("cancelled");
    assert!(err.is_cancelled(), "{err:?}");

    let snapshot = registry.get(&session.id).expect("session");
    assert_eq!(snapshot.status, SessionStatus::Stopped);
    assert!(snapshot.history.is_empty());
    assert!(snapshot.last_error.is_none());

    registry.restart(&session.id).await.expect("restart");
}

#[tokio::test]
#[serial]
async fn stop_cancels_in_flight_exchange() {
    let agent = FakeAgent::new("read -r line\ntouch \"$DIR/started\"\nexec sleep 30");
    let (registry, _rx) = registry_for(&agent, 4);
    let session = registry.start(agent.session_config()).await.expect("start");

    let task = {
        let registry = Arc::clone(&registry);
        let id = session.id.clone();
        tokio::spawn(async move { registry.send_message(&id, "wait", None).await })
    };

    let marker = agent.path().join("started");
    wait_until(|| marker.exists()).await;

    registry.stop(&session.id).await.expect("stop");
    registry.stop(&session.id).await.expect("second stop");

    let err = task.await.expect("join").expect_err("cancelled");
    assert!(err.is_cancelled(), "{err:?}");
    assert!(registry.get(&session.id).is_none());
    assert!(registry.is_empty());
}

#[tokio::test]
#[serial]
async fn store_receives_session_summaries() {
    let agent = FakeAgent::replying(&scenario_lines());
    let repo = SessionRepo::new(Arc::new(db::connect_memory().await.expect("db")));
    let registry = SessionRegistry::new(Arc::new(agent.transport()), 4, EventSink::disabled())
        .with_store(repo.clone());

    let session = registry.start(agent.session_config()).await.expect("start");
    let record = repo.get(&session.id).await.expect("get").expect("stored");
    assert_eq!(record.status, SessionStatus::Running);

    registry
        .send_message(&session.id, "hello", None)
        .await
        .expect("exchange");
    let record = repo.get(&session.id).await.expect("get").expect("stored");
    assert_eq!(record.resume_id.as_deref(), Some("abc"));
    assert_eq!(record.exchange_count, 1);

    registry.stop(&session.id).await.expect("stop");
    let record = repo.get(&session.id).await.expect("get").expect("stored");
    assert_eq!(record.status, SessionStatus::Stopped);
    assert!(record.stopped_at.is_some());

    let resumable = repo.list_resumable(None).await.expect("list");
    assert_eq!(resumable.len(), 1);
}
