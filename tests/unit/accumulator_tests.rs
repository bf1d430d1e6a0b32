//! Rebuilding assistant messages from `content_block_*` stream events.

use agent_conduit::models::message::{ContentBlock, JsonMap, Message, UserContent};
use agent_conduit::protocol::parse;
use agent_conduit::stream::{BlockDelta, StreamAccumulator, StreamUpdate, ToolNameMap, UNKNOWN_TOOL};
use agent_conduit::transport::writer::encode_user_turn;
use serde_json::{json, Value};

fn event(value: Value) -> JsonMap {
    value.as_object().cloned().expect("event object")
}

fn start_text(index: u64) -> JsonMap {
    event(json!({
        "type": "content_block_start",
        "index": index,
        "content_block": { "type": "text", "text": "" }
    }))
}

fn text_delta(index: Option<u64>, text: &str) -> JsonMap {
    let mut value = json!({
        "type": "content_block_delta",
        "delta": { "type": "text_delta", "text": text }
    });
    if let Some(index) = index {
        value["index"] = json!(index);
    }
    event(value)
}

fn stop(index: u64) -> JsonMap {
    event(json!({ "type": "content_block_stop", "index": index }))
}

#[test]
fn deltas_concatenate_in_order() {
    let pieces = ["The ", "quick ", "brown ", "fox", "", " jumps"];

    for n in 0..=pieces.len() {
        let mut acc = StreamAccumulator::new("claude-test");
        let mut tools = ToolNameMap::new();
        let sent = &pieces[..n];

        acc.apply(&start_text(0), &mut tools);
        for piece in sent {
            let update = acc.apply(&text_delta(Some(0), piece), &mut tools);
            assert_eq!(
                update,
                Some(StreamUpdate::BlockDelta {
                    index: 0,
                    delta: BlockDelta::Text((*piece).into())
                }),
                "n = {n}"
            );
        }
        let stopped = acc.apply(&stop(0), &mut tools);
        assert_eq!(
            stopped,
            Some(StreamUpdate::BlockStopped {
                index: 0,
                block: ContentBlock::Text {
                    text: sent.concat()
                }
            }),
            "n = {n}"
        );

        let message = acc.finish().expect("message");
        assert_eq!(message.model, "claude-test");
        assert_eq!(message.content.len(), 1, "n = {n}");
        assert_eq!(message.text(), sent.concat(), "n = {n}");
        assert!(acc.is_empty());
    }
}

#[test]
fn user_turn_and_decoded_stream_rebuild_the_reply() {
    let turn = encode_user_turn("say hi", "sess-1");
    let Message::User(user) = parse(&turn).expect("outbound turn decodes") else {
        panic!("expected a user message");
    };
    assert_eq!(user.content, UserContent::Text("say hi".into()));

    for n in 0..4 {
        let pieces: Vec<String> = (0..n).map(|i| format!("part{i} ")).collect();
        let mut lines = vec![json!({
            "type": "content_block_start",
            "index": 0,
            "content_block": { "type": "text", "text": "" }
        })];
        lines.extend(pieces.iter().map(|piece| {
            json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": { "type": "text_delta", "text": piece }
            })
        }));
        lines.push(json!({ "type": "content_block_stop", "index": 0 }));

        let mut acc = StreamAccumulator::new("claude-test");
        let mut tools = ToolNameMap::new();
        for body in lines {
            let raw = json!({ "type": "stream_event", "uuid": "u", "session_id": "abc", "event": body });
            let Message::StreamEvent(stream) = parse(&raw).expect("decode") else {
                panic!("expected a stream event");
            };
            acc.apply(&stream.event, &mut tools);
        }

        let message = acc.finish().expect("message");
        assert_eq!(message.text(), pieces.concat(), "n = {n}");
    }
}

#[test]
fn scenario_single_text_block() {
    let mut acc = StreamAccumulator::new("");
    let mut tools = ToolNameMap::new();

    acc.apply(&start_text(0), &mut tools);
    acc.apply(&text_delta(Some(0), "Hi"), &mut tools);
    acc.apply(&stop(0), &mut tools);

    let message = acc.finish().expect("message");
    assert_eq!(message.content, vec![ContentBlock::Text { text: "Hi".into() }]);
}

#[test]
fn delta_after_stop_is_dropped() {
    let mut acc = StreamAccumulator::new("");
    let mut tools = ToolNameMap::new();

    acc.apply(&start_text(0), &mut tools);
    acc.apply(&text_delta(Some(0), "a"), &mut tools);
    acc.apply(&stop(0), &mut tools);
    assert_eq!(acc.apply(&text_delta(Some(0), "b"), &mut tools), None);
    assert_eq!(acc.apply(&stop(0), &mut tools), None);

    assert_eq!(acc.message().text(), "a");
}

#[test]
fn delta_for_unknown_index_is_dropped() {
    let mut acc = StreamAccumulator::new("");
    let mut tools = ToolNameMap::new();

    acc.apply(&start_text(0), &mut tools);
    assert_eq!(acc.apply(&text_delta(Some(5), "x"), &mut tools), None);
    assert_eq!(acc.message().text(), "");
}

#[test]
fn interleaved_blocks_are_routed_by_index() {
    let mut acc = StreamAccumulator::new("");
    let mut tools = ToolNameMap::new();

    acc.apply(&start_text(0), &mut tools);
    acc.apply(&start_text(1), &mut tools);
    acc.apply(&text_delta(Some(1), "second"), &mut tools);
    acc.apply(&text_delta(Some(0), "first"), &mut tools);
    acc.apply(&stop(1), &mut tools);
    acc.apply(&stop(0), &mut tools);

    let message = acc.finish().expect("message");
    assert_eq!(
        message.content,
        vec![
            ContentBlock::Text { text: "first".into() },
            ContentBlock::Text { text: "second".into() },
        ]
    );
}

#[test]
fn index_less_delta_goes_to_latest_open_block() {
    let mut acc = StreamAccumulator::new("");
    let mut tools = ToolNameMap::new();

    acc.apply(&start_text(0), &mut tools);
    acc.apply(&start_text(1), &mut tools);
    acc.apply(&text_delta(None, "late"), &mut tools);
    acc.apply(&stop(1), &mut tools);
    acc.apply(&text_delta(None, "early"), &mut tools);

    assert_eq!(acc.open_blocks(), 1);
    let message = acc.finish().expect("message");
    assert_eq!(
        message.content,
        vec![
            ContentBlock::Text { text: "early".into() },
            ContentBlock::Text { text: "late".into() },
        ]
    );
}

#[test]
fn index_less_delta_without_open_block_is_dropped() {
    let mut acc = StreamAccumulator::new("");
    let mut tools = ToolNameMap::new();
    assert_eq!(acc.apply(&text_delta(None, "orphan"), &mut tools), None);
    assert!(acc.finish().is_none());
}

#[test]
fn mismatched_delta_kind_is_dropped() {
    let mut acc = StreamAccumulator::new("");
    let mut tools = ToolNameMap::new();

    acc.apply(&start_text(0), &mut tools);
    let thinking = event(json!({
        "type": "content_block_delta",
        "index": 0,
        "delta": { "type": "thinking_delta", "thinking": "nope" }
    }));
    assert_eq!(acc.apply(&thinking, &mut tools), None);
    assert_eq!(acc.message().text(), "");
}

#[test]
fn thinking_block_collects_text_and_signature() {
    let mut acc = StreamAccumulator::new("");
    let mut tools = ToolNameMap::new();

    acc.apply(
        &event(json!({
            "type": "content_block_start",
            "index": 0,
            "content_block": { "type": "thinking", "thinking": "" }
        })),
        &mut tools,
    );
    acc.apply(
        &event(json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "thinking_delta", "thinking": "step one" }
        })),
        &mut tools,
    );
    acc.apply(
        &event(json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "signature_delta", "signature": "sig==" }
        })),
        &mut tools,
    );

    let message = acc.finish().expect("message");
    assert_eq!(
        message.content,
        vec![ContentBlock::Thinking {
            text: "step one".into(),
            signature: "sig==".into()
        }]
    );
}

#[test]
fn tool_use_input_is_parsed_on_stop_and_name_recorded() {
    let mut acc = StreamAccumulator::new("");
    let mut tools = ToolNameMap::new();

    acc.apply(
        &event(json!({
            "type": "content_block_start",
            "index": 1,
            "content_block": { "type": "tool_use", "id": "toolu_9", "name": "Grep", "input": {} }
        })),
        &mut tools,
    );
    for piece in [r#"{"pattern":"#, r#""fn main"}"#] {
        acc.apply(
            &event(json!({
                "type": "content_block_delta",
                "index": 1,
                "delta": { "type": "input_json_delta", "partial_json": piece }
            })),
            &mut tools,
        );
    }
    let stopped = acc.apply(&stop(1), &mut tools).expect("stop update");

    let StreamUpdate::BlockStopped { block, .. } = stopped else {
        panic!("expected stop");
    };
    let ContentBlock::ToolUse { input, .. } = block else {
        panic!("expected tool_use");
    };
    assert_eq!(input.get("pattern"), Some(&json!("fn main")));
    assert_eq!(tools.resolve("toolu_9"), "Grep");
    assert_eq!(tools.resolve("toolu_missing"), UNKNOWN_TOOL);
}

#[test]
fn finish_force_closes_open_blocks() {
    let mut acc = StreamAccumulator::new("");
    let mut tools = ToolNameMap::new();

    acc.apply(&start_text(0), &mut tools);
    acc.apply(&text_delta(Some(0), "partial"), &mut tools);
    assert_eq!(acc.open_blocks(), 1);

    let message = acc.finish().expect("message");
    assert_eq!(message.text(), "partial");
    assert_eq!(acc.open_blocks(), 0);
}

#[test]
fn close_open_blocks_reports_each_forced_stop() {
    let mut acc = StreamAccumulator::new("");
    let mut tools = ToolNameMap::new();

    acc.apply(&start_text(0), &mut tools);
    acc.apply(&text_delta(Some(0), "done"), &mut tools);
    acc.apply(&stop(0), &mut tools);
    acc.apply(&start_text(1), &mut tools);
    acc.apply(&text_delta(Some(1), "cut"), &mut tools);
    acc.apply(&start_text(2), &mut tools);

    let stopped = acc.close_open_blocks();
    assert_eq!(
        stopped,
        vec![
            StreamUpdate::BlockStopped {
                index: 1,
                block: ContentBlock::Text { text: "cut".into() }
            },
            StreamUpdate::BlockStopped {
                index: 2,
                block: ContentBlock::Text { text: String::new() }
            },
        ]
    );
    assert_eq!(acc.open_blocks(), 0);
    assert!(acc.close_open_blocks().is_empty());

    let message = acc.finish().expect("message");
    assert_eq!(message.content.len(), 3);
}

#[test]
fn message_start_sets_model_and_reset_keeps_it() {
    let mut acc = StreamAccumulator::new("fallback");
    let mut tools = ToolNameMap::new();

    acc.apply(
        &event(json!({ "type": "message_start", "message": { "model": "claude-live" } })),
        &mut tools,
    );
    acc.apply(&start_text(0), &mut tools);
    acc.reset();

    assert!(acc.is_empty());
    assert_eq!(acc.message().model, "claude-live");
}

#[test]
fn tool_name_map_records_blocks() {
    let mut tools = ToolNameMap::new();
    assert!(tools.is_empty());
    tools.record_blocks(&[
        ContentBlock::Text { text: "x".into() },
        ContentBlock::ToolUse {
            id: "a".into(),
            name: "Read".into(),
            input: JsonMap::new(),
        },
    ]);
    assert_eq!(tools.len(), 1);
    assert_eq!(tools.resolve("a"), "Read");
}
