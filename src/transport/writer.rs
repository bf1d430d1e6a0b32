//! Outbound line encoding.
//!
//! In streaming mode every user turn is one compact JSON object followed
//! by `\n` on the agent's stdin:
//!
//! ```json
//! {"type":"user","message":{"role":"user","content":"…"},"parent_tool_use_id":null,"session_id":"…"}
//! ```

use serde_json::{json, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{AppError, Result};

/// Build the outbound object for one user turn.
#[must_use]
pub fn encode_user_turn(text: &str, session_id: &str) -> Value {
    json!({
        "type": "user",
        "message": { "role": "user", "content": text },
        "parent_tool_use_id": null,
        "session_id": session_id,
    })
}

/// Serialise `value` to a single line.
///
/// # Errors
///
/// Returns [`AppError::Io`] if serialisation fails (not expected for `Value`).
pub fn to_line(value: &Value) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| AppError::Io(format!("failed to serialise outbound message: {e}")))
}

/// Write `line` plus the `\n` delimiter and flush.
///
/// Embedded newlines are rejected so one call is always exactly one frame.
///
/// # Errors
///
/// - [`AppError::InvalidState`] if `line` contains a newline.
/// - [`AppError::ConnectionLost`] if the pipe is closed.
pub async fn write_line<W>(sink: &mut W, line: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if line.contains('\n') {
        return Err(AppError::InvalidState(
            "outbound line must not contain a newline".into(),
        ));
    }

    let mut bytes = Vec::with_capacity(line.len() + 1);
    bytes.extend_from_slice(line.as_bytes());
    bytes.push(b'\n');

    sink.write_all(&bytes)
        .await
        .map_err(|e| AppError::ConnectionLost(format!("write failed: {e}")))?;
    sink.flush()
        .await
        .map_err(|e| AppError::ConnectionLost(format!("flush failed: {e}")))
}
