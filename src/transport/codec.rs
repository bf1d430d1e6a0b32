//! NDJSON codec for agent stdio streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a configurable maximum line
//! length so an unterminated or oversized line from a misbehaving agent
//! cannot exhaust memory.
//!
//! # Usage
//!
//! Use [`NdjsonCodec`] as the codec parameter for
//! [`tokio_util::codec::FramedRead`] over the agent's stdout. Lines are
//! UTF-8 and delimited by `\n`.
//!
//! ```rust,ignore
//! use tokio_util::codec::FramedRead;
//! use agent_conduit::transport::codec::NdjsonCodec;
//!
//! let reader = FramedRead::new(child_stdout, NdjsonCodec::new());
//! ```

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Default maximum line length accepted by the codec: 8 MiB.
///
/// Tool results (file reads, command output) routinely produce lines in
/// the megabyte range, so the bound is generous.
pub const DEFAULT_MAX_LINE_BYTES: usize = 8 * 1_048_576;

/// Placeholder recorded as the raw line of an oversized frame.
pub const OVERSIZED_LINE: &str = "<line exceeded maximum length>";

/// NDJSON codec for agent streams.
///
/// # Decoder
///
/// Inbound lines longer than the limit return
/// [`AppError::ProtocolDecode`] with reason `"line too long: …"`; the rest
/// of the oversized line is discarded and decoding resumes at the next
/// newline. I/O errors are mapped to [`AppError::Io`].
///
/// # Encoder
///
/// Outbound strings are encoded as `item\n`. The limit is a decoder-side
/// concern and is not enforced when encoding.
#[derive(Debug)]
pub struct NdjsonCodec {
    inner: LinesCodec,
    max_line_bytes: usize,
}

impl NdjsonCodec {
    /// Create a codec with the [`DEFAULT_MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    /// Create a codec with a custom line limit.
    #[must_use]
    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_line_bytes),
            max_line_bytes,
        }
    }

    /// Line limit in bytes.
    #[must_use]
    pub fn max_line_bytes(&self) -> usize {
        self.max_line_bytes
    }

    fn map_error(&self, e: LinesCodecError) -> AppError {
        match e {
            LinesCodecError::MaxLineLengthExceeded => AppError::ProtocolDecode {
                line: OVERSIZED_LINE.to_owned(),
                reason: format!("line too long: exceeded {} bytes", self.max_line_bytes),
            },
            LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
        }
    }
}

impl Default for NdjsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for NdjsonCodec {
    type Item = String;
    type Error = AppError;

    /// Decode the next newline-terminated line from `src`.
    ///
    /// Returns `Ok(None)` while `src` holds no complete line.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.inner.decode(src).map_err(|e| self.map_error(e))
    }

    /// Decode the final, possibly unterminated, line at EOF.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.inner.decode_eof(src).map_err(|e| self.map_error(e))
    }
}

impl Encoder<String> for NdjsonCodec {
    type Error = AppError;

    /// Encode `item` as a `\n`-terminated line into `dst`.
    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.inner.encode(item, dst).map_err(|e| self.map_error(e))
    }
}
