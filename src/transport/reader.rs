//! Agent output reader task.
//!
//! Reads newline-delimited JSON from an agent's stdout, parses each line
//! into a raw JSON object, and forwards it through a tokio [`mpsc`]
//! channel in emission order.
//!
//! The reader is driven by [`FramedRead`] backed by [`NdjsonCodec`], which
//! enforces the per-line limit before any JSON parsing.
//!
//! # Channel items
//!
//! | Item                                 | Meaning                                   |
//! |--------------------------------------|-------------------------------------------|
//! | `Ok(object)`                         | one decoded line                          |
//! | `Err(AppError::ProtocolDecode {..})` | one bad line; reading continues           |
//! | `Err(AppError::ConnectionLost(..))`  | unrecoverable; the reader has stopped     |
//!
//! The channel closes when stdout reaches EOF, the token is cancelled, or
//! the receiver is dropped.

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::transport::codec::NdjsonCodec;
use crate::{AppError, Result};

/// Parameters of the read loop.
#[derive(Debug, Clone, Copy)]
pub struct ReaderLimits {
    /// Maximum accepted line length.
    pub max_line_bytes: usize,
    /// Consecutive undecodable lines tolerated before giving up.
    pub max_consecutive_failures: u32,
}

/// Parse one output line into a raw protocol object.
///
/// Returns `Ok(None)` for blank lines.
///
/// # Errors
///
/// Returns [`AppError::ProtocolDecode`] carrying the raw line when the line
/// is not valid JSON or is valid JSON but not an object.
pub fn parse_line(line: &str) -> Result<Option<Value>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) if value.is_object() => Ok(Some(value)),
        Ok(_) => Err(AppError::ProtocolDecode {
            line: line.to_owned(),
            reason: "line is not a JSON object".into(),
        }),
        Err(e) => Err(AppError::ProtocolDecode {
            line: line.to_owned(),
            reason: format!("malformed json: {e}"),
        }),
    }
}

/// Reader task: reads NDJSON lines from `stdout` and forwards raw objects.
///
/// Malformed lines are forwarded as [`AppError::ProtocolDecode`] and do
/// **not** stop the reader. After `limits.max_consecutive_failures`
/// undecodable lines in a row, or on an I/O error, an
/// [`AppError::ConnectionLost`] is forwarded and the reader stops.
///
/// # Cancellation
///
/// Respects `cancel`: when the token fires the reader exits without
/// forwarding anything further.
pub async fn run_reader<R>(
    session_id: String,
    stdout: R,
    tx: mpsc::Sender<Result<Value>>,
    limits: ReaderLimits,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stdout, NdjsonCodec::with_max_line_bytes(limits.max_line_bytes));
    let mut failures: u32 = 0;

    loop {
        let item = tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(session_id, "reader: cancellation received, stopping");
                break;
            }

            item = framed.next() => item,
        };

        let forward = match item {
            None => {
                debug!(session_id, "reader: EOF detected");
                break;
            }

            Some(Err(AppError::Io(msg))) => {
                warn!(session_id, error = msg.as_str(), "reader: IO error, stopping");
                // The receiver may already be gone; nothing left to do then.
                let _ = tx
                    .send(Err(AppError::ConnectionLost(format!("stream error: {msg}"))))
                    .await;
                break;
            }

            Some(Err(err)) => Err(err),

            Some(Ok(line)) => match parse_line(&line) {
                Ok(Some(value)) => Ok(value),
                Ok(None) => continue,
                Err(err) => Err(err),
            },
        };

        let lost = if forward.is_ok() {
            failures = 0;
            false
        } else {
            failures = failures.saturating_add(1);
            debug!(session_id, failures, "reader: undecodable line");
            failures >= limits.max_consecutive_failures
        };

        if tx.send(forward).await.is_err() {
            debug!(session_id, "reader: receiver closed, stopping");
            break;
        }

        if lost {
            warn!(session_id, failures, "reader: too many undecodable lines, giving up");
            let _ = tx
                .send(Err(AppError::ConnectionLost(format!(
                    "{failures} consecutive undecodable lines"
                ))))
                .await;
            break;
        }
    }
}
