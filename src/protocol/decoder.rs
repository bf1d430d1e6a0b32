//! Stateless decoder from raw protocol objects to [`Message`]s.
//!
//! # Known inbound types
//!
//! | `type`                        | Maps to                        |
//! |-------------------------------|--------------------------------|
//! | `user`                        | [`Message::User`]              |
//! | `assistant`                   | [`Message::Assistant`]         |
//! | `system`                      | [`Message::System`]            |
//! | `result`                      | [`Message::Result`]            |
//! | `stream_event` / `stream`     | [`Message::StreamEvent`]       |
//! | `control_request`             | [`Message::ControlRequest`]    |
//! | *(any other)*                 | [`AppError::MalformedMessage`] |
//!
//! Content blocks with an unrecognised `type` decode to
//! [`ContentBlock::Unknown`] so the surrounding message survives.

use serde_json::Value;
use tracing::debug;

use crate::models::message::{
    AssistantMessage, ContentBlock, ControlRequest, JsonMap, Message, ResultMessage,
    StreamEvent, SystemMessage, Usage, UserContent, UserMessage,
};
use crate::{AppError, Result};

/// Decode one raw protocol object.
///
/// # Errors
///
/// Returns [`AppError::MalformedMessage`] naming the offending field when
/// the object is not a JSON object, the `type` is missing or unknown, or a
/// required field of the variant is absent or of the wrong type.
pub fn parse(raw: &Value) -> Result<Message> {
    let obj = raw
        .as_object()
        .ok_or_else(|| AppError::MalformedMessage("message is not a JSON object".into()))?;

    let kind = required_str(obj, "type", "message")?;
    match kind {
        "user" => parse_user(obj).map(Message::User),
        "assistant" => parse_assistant(obj).map(Message::Assistant),
        "system" => parse_system(obj).map(Message::System),
        "result" => parse_result(obj).map(Message::Result),
        "stream_event" | "stream" => parse_stream_event(obj).map(Message::StreamEvent),
        "control_request" => parse_control_request(obj).map(Message::ControlRequest),
        other => Err(AppError::MalformedMessage(format!(
            "`type`: unknown message type '{other}'"
        ))),
    }
}

/// Decode a single content block.
///
/// Unknown block types yield [`ContentBlock::Unknown`].
///
/// # Errors
///
/// Returns [`AppError::MalformedMessage`] if the block is not an object,
/// has no `type`, or a known type lacks a required field.
pub fn parse_content_block(raw: &Value) -> Result<ContentBlock> {
    let obj = raw
        .as_object()
        .ok_or_else(|| AppError::MalformedMessage("content block is not a JSON object".into()))?;

    match required_str(obj, "type", "content block")? {
        "text" => Ok(ContentBlock::Text {
            text: required_str(obj, "text", "text block")?.to_owned(),
        }),
        "thinking" => Ok(ContentBlock::Thinking {
            text: optional_str(obj, "thinking")
                .or_else(|| optional_str(obj, "text"))
                .unwrap_or_default()
                .to_owned(),
            signature: optional_str(obj, "signature").unwrap_or_default().to_owned(),
        }),
        "tool_use" => Ok(ContentBlock::ToolUse {
            id: required_str(obj, "id", "tool_use block")?.to_owned(),
            name: required_str(obj, "name", "tool_use block")?.to_owned(),
            input: obj
                .get("input")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        }),
        "tool_result" => Ok(ContentBlock::ToolResult {
            tool_use_id: required_str(obj, "tool_use_id", "tool_result block")?.to_owned(),
            content: obj.get("content").filter(|v| !v.is_null()).cloned(),
            is_error: obj.get("is_error").and_then(Value::as_bool),
        }),
        other => {
            debug!(block_type = other, "decoder: unknown content block type");
            Ok(ContentBlock::Unknown)
        }
    }
}

/// Coerce a JSON number or string-wrapped number to `u64`.
///
/// Negative, fractional, and non-numeric values yield `None`.
#[must_use]
pub fn coerce_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().and_then(float_to_u64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<u64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(float_to_u64))
        }
        _ => None,
    }
}

/// Decode a `usage` map, tolerating string-encoded counters.
#[must_use]
pub fn parse_usage(obj: &JsonMap) -> Usage {
    let field = |name: &str| obj.get(name).and_then(coerce_u64).unwrap_or(0);
    Usage {
        input_tokens: field("input_tokens"),
        output_tokens: field("output_tokens"),
        cache_creation_input_tokens: field("cache_creation_input_tokens"),
        cache_read_input_tokens: field("cache_read_input_tokens"),
    }
}

// ── Variant decoders ──────────────────────────────────────────────────────────

fn parse_user(obj: &JsonMap) -> Result<UserMessage> {
    let message = required_object(obj, "message", "user")?;
    let content = match message.get("content") {
        Some(Value::String(text)) => UserContent::Text(text.clone()),
        Some(Value::Array(items)) => UserContent::Blocks(parse_blocks(items)?),
        _ => {
            return Err(AppError::MalformedMessage(
                "`message.content`: missing or not a string/array in user message".into(),
            ))
        }
    };

    Ok(UserMessage {
        content,
        parent_tool_use_id: optional_str(obj, "parent_tool_use_id").map(str::to_owned),
    })
}

fn parse_assistant(obj: &JsonMap) -> Result<AssistantMessage> {
    let message = required_object(obj, "message", "assistant")?;
    let items = message
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            AppError::MalformedMessage(
                "`message.content`: missing or not an array in assistant message".into(),
            )
        })?;
    let model = required_str(message, "model", "assistant message")?;

    Ok(AssistantMessage {
        content: parse_blocks(items)?,
        model: model.to_owned(),
        parent_tool_use_id: optional_str(obj, "parent_tool_use_id").map(str::to_owned),
    })
}

fn parse_system(obj: &JsonMap) -> Result<SystemMessage> {
    let subtype = required_str(obj, "subtype", "system")?.to_owned();
    let data = obj
        .iter()
        .filter(|(key, _)| key.as_str() != "type" && key.as_str() != "subtype")
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    Ok(SystemMessage { subtype, data })
}

fn parse_result(obj: &JsonMap) -> Result<ResultMessage> {
    Ok(ResultMessage {
        subtype: required_str(obj, "subtype", "result")?.to_owned(),
        duration_ms: required_u64(obj, "duration_ms", "result")?,
        duration_api_ms: required_u64(obj, "duration_api_ms", "result")?,
        is_error: obj.get("is_error").and_then(Value::as_bool).ok_or_else(|| {
            AppError::MalformedMessage("`is_error`: missing or not a bool in result".into())
        })?,
        num_turns: required_u64(obj, "num_turns", "result")?,
        session_id: required_str(obj, "session_id", "result")?.to_owned(),
        total_cost_usd: obj.get("total_cost_usd").and_then(coerce_f64),
        usage: obj.get("usage").and_then(Value::as_object).map(parse_usage),
        result: optional_str(obj, "result").map(str::to_owned),
    })
}

fn parse_stream_event(obj: &JsonMap) -> Result<StreamEvent> {
    Ok(StreamEvent {
        uuid: required_str(obj, "uuid", "stream_event")?.to_owned(),
        session_id: required_str(obj, "session_id", "stream_event")?.to_owned(),
        event: required_object(obj, "event", "stream_event")?.clone(),
        parent_tool_use_id: optional_str(obj, "parent_tool_use_id").map(str::to_owned),
    })
}

fn parse_control_request(obj: &JsonMap) -> Result<ControlRequest> {
    let request = required_object(obj, "request", "control_request")?;
    let control_type = required_str(request, "subtype", "control_request.request")?.to_owned();
    let data: JsonMap = request
        .iter()
        .filter(|(key, _)| key.as_str() != "subtype")
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    Ok(ControlRequest {
        control_type,
        request_id: optional_str(obj, "request_id").map(str::to_owned),
        data: (!data.is_empty()).then_some(data),
        parent_tool_use_id: optional_str(obj, "parent_tool_use_id").map(str::to_owned),
    })
}

// ── Field helpers ─────────────────────────────────────────────────────────────

fn parse_blocks(items: &[Value]) -> Result<Vec<ContentBlock>> {
    items.iter().map(parse_content_block).collect()
}

fn required_str<'a>(obj: &'a JsonMap, field: &str, context: &str) -> Result<&'a str> {
    obj.get(field).and_then(Value::as_str).ok_or_else(|| {
        AppError::MalformedMessage(format!("`{field}`: missing or not a string in {context}"))
    })
}

fn optional_str<'a>(obj: &'a JsonMap, field: &str) -> Option<&'a str> {
    obj.get(field).and_then(Value::as_str)
}

fn required_object<'a>(obj: &'a JsonMap, field: &str, context: &str) -> Result<&'a JsonMap> {
    obj.get(field).and_then(Value::as_object).ok_or_else(|| {
        AppError::MalformedMessage(format!("`{field}`: missing or not an object in {context}"))
    })
}

fn required_u64(obj: &JsonMap, field: &str, context: &str) -> Result<u64> {
    obj.get(field).and_then(coerce_u64).ok_or_else(|| {
        AppError::MalformedMessage(format!("`{field}`: missing or not an integer in {context}"))
    })
}

fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn float_to_u64(f: f64) -> Option<u64> {
    // 2^64 as f64; anything at or above it cannot be represented.
    const LIMIT: f64 = 18_446_744_073_709_551_616.0;
    (f.is_finite() && f >= 0.0 && f.fract() == 0.0 && f < LIMIT).then(|| f as u64)
}
