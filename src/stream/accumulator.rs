//! Incremental reconstruction of an assistant message from partial
//! `stream_event` notifications.
//!
//! Each content block moves `start → delta* → stop`. The accumulator keys
//! blocks by the event's `index`; a delta or stop without an index falls
//! back to the most recently opened block that is still open. Events that
//! address a closed or unknown block are dropped: the agent is the
//! untrusted half of the protocol and drift there must not break the
//! consumer.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};

use crate::models::message::{AssistantMessage, ContentBlock, JsonMap};
use crate::protocol::decoder::{coerce_u64, parse_content_block};

/// Name reported for a tool result whose tool-use id was never seen.
pub const UNKNOWN_TOOL: &str = "unknown";

/// Tool-use id → tool name, recorded when a `tool_use` block starts.
///
/// The protocol never repeats the tool name on the result block, so the
/// registry keeps one map per session across exchanges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolNameMap {
    names: HashMap<String, String>,
}

impl ToolNameMap {
    /// Empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the tool name for `tool_use_id`.
    pub fn record(&mut self, tool_use_id: impl Into<String>, name: impl Into<String>) {
        self.names.insert(tool_use_id.into(), name.into());
    }

    /// Record every `tool_use` block in `blocks`.
    pub fn record_blocks(&mut self, blocks: &[ContentBlock]) {
        for block in blocks {
            if let ContentBlock::ToolUse { id, name, .. } = block {
                self.record(id.clone(), name.clone());
            }
        }
    }

    /// Tool name for `tool_use_id`, or [`UNKNOWN_TOOL`].
    #[must_use]
    pub fn resolve(&self, tool_use_id: &str) -> &str {
        self.names
            .get(tool_use_id)
            .map_or(UNKNOWN_TOOL, String::as_str)
    }

    /// Number of recorded tool uses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Incremental piece of a content block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockDelta {
    /// `text_delta`.
    Text(String),
    /// `thinking_delta`.
    Thinking(String),
    /// `signature_delta` for a thinking block.
    Signature(String),
    /// `input_json_delta`: a fragment of the tool input document.
    InputJson(String),
}

/// Observable effect of one stream event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
    /// A block was opened.
    BlockStarted {
        /// Block index as declared by the agent.
        index: u64,
        /// Block as initially declared.
        block: ContentBlock,
    },
    /// A block grew; carries only the increment.
    BlockDelta {
        /// Index of the block that grew.
        index: u64,
        /// The increment.
        delta: BlockDelta,
    },
    /// A block was closed.
    BlockStopped {
        /// Index of the closed block.
        index: u64,
        /// Final block content.
        block: ContentBlock,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Open,
    Closed,
}

/// Bookkeeping for one entry of `message.content`.
#[derive(Debug)]
struct Slot {
    index: u64,
    state: BlockState,
    input_json: String,
}

/// In-progress assistant message built from stream events.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    message: AssistantMessage,
    slots: Vec<Slot>,
}

impl StreamAccumulator {
    /// Empty accumulator whose message reports `model` until a
    /// `message_start` event says otherwise.
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            message: AssistantMessage {
                model: model.into(),
                ..AssistantMessage::default()
            },
            slots: Vec::new(),
        }
    }

    /// Apply one stream event body.
    ///
    /// `tools` receives the id → name mapping of every `tool_use` block
    /// that starts. Returns `None` for events with no observable effect
    /// (dropped deltas, `message_delta`, `ping`, ...).
    pub fn apply(&mut self, event: &JsonMap, tools: &mut ToolNameMap) -> Option<StreamUpdate> {
        let kind = event.get("type").and_then(Value::as_str).unwrap_or_default();
        match kind {
            "content_block_start" => self.start_block(event, tools),
            "content_block_delta" => self.apply_delta(event),
            "content_block_stop" => self.stop_block(event),
            "message_start" => {
                if let Some(model) = event
                    .get("message")
                    .and_then(|m| m.get("model"))
                    .and_then(Value::as_str)
                {
                    model.clone_into(&mut self.message.model);
                }
                None
            }
            other => {
                debug!(event_type = other, "accumulator: ignoring stream event");
                None
            }
        }
    }

    /// Message built so far.
    #[must_use]
    pub fn message(&self) -> &AssistantMessage {
        &self.message
    }

    /// Whether no block has been started since the last reset.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of blocks still open.
    #[must_use]
    pub fn open_blocks(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state == BlockState::Open)
            .count()
    }

    /// Close every block still open, in content order, returning a
    /// `BlockStopped` update for each.
    pub fn close_open_blocks(&mut self) -> Vec<StreamUpdate> {
        let mut stopped = Vec::new();
        for pos in 0..self.slots.len() {
            if self.slots[pos].state == BlockState::Open {
                let index = self.slots[pos].index;
                debug!(index, "accumulator: force-closing open block");
                self.close(pos);
                stopped.push(StreamUpdate::BlockStopped {
                    index,
                    block: self.message.content[pos].clone(),
                });
            }
        }
        stopped
    }

    /// Force-close every open block and take the message, leaving the
    /// accumulator empty. Returns `None` when no block was started.
    ///
    /// Call [`close_open_blocks`](Self::close_open_blocks) first to observe
    /// the blocks this closes.
    pub fn finish(&mut self) -> Option<AssistantMessage> {
        self.close_open_blocks();
        if self.slots.is_empty() {
            return None;
        }
        self.slots.clear();
        let model = self.message.model.clone();
        Some(std::mem::replace(
            &mut self.message,
            AssistantMessage {
                model,
                ..AssistantMessage::default()
            },
        ))
    }

    /// Discard all progress, keeping the model.
    pub fn reset(&mut self) {
        self.slots.clear();
        self.message.content.clear();
    }

    // ── Event handlers ────────────────────────────────────────────────────────

    fn start_block(&mut self, event: &JsonMap, tools: &mut ToolNameMap) -> Option<StreamUpdate> {
        let index = event
            .get("index")
            .and_then(coerce_u64)
            .unwrap_or_else(|| u64::try_from(self.slots.len()).unwrap_or(u64::MAX));

        let Some(raw) = event.get("content_block") else {
            warn!(index, "accumulator: content_block_start without content_block");
            return None;
        };
        let block = match parse_content_block(raw) {
            Ok(block) => block,
            Err(err) => {
                warn!(index, error = %err, "accumulator: undecodable content_block_start");
                return None;
            }
        };

        if let ContentBlock::ToolUse { id, name, .. } = &block {
            tools.record(id.clone(), name.clone());
        }

        self.slots.push(Slot {
            index,
            state: BlockState::Open,
            input_json: String::new(),
        });
        self.message.content.push(block.clone());
        Some(StreamUpdate::BlockStarted { index, block })
    }

    fn apply_delta(&mut self, event: &JsonMap) -> Option<StreamUpdate> {
        let pos = self.locate(event)?;
        let index = self.slots[pos].index;

        let delta = event.get("delta").and_then(Value::as_object)?;
        let delta_kind = delta.get("type").and_then(Value::as_str).unwrap_or_default();
        let field = |name: &str| delta.get(name).and_then(Value::as_str).unwrap_or_default();

        let applied = match (&mut self.message.content[pos], delta_kind) {
            (ContentBlock::Text { text }, "text_delta") => {
                let piece = field("text");
                text.push_str(piece);
                BlockDelta::Text(piece.to_owned())
            }
            (ContentBlock::Thinking { text, .. }, "thinking_delta") => {
                let piece = field("thinking");
                text.push_str(piece);
                BlockDelta::Thinking(piece.to_owned())
            }
            (ContentBlock::Thinking { signature, .. }, "signature_delta") => {
                let piece = field("signature");
                signature.push_str(piece);
                BlockDelta::Signature(piece.to_owned())
            }
            (ContentBlock::ToolUse { .. }, "input_json_delta") => {
                let piece = field("partial_json");
                self.slots[pos].input_json.push_str(piece);
                BlockDelta::InputJson(piece.to_owned())
            }
            (block, other) => {
                debug!(
                    index,
                    block_type = block.kind(),
                    delta_type = other,
                    "accumulator: dropping delta that does not match block"
                );
                return None;
            }
        };

        Some(StreamUpdate::BlockDelta {
            index,
            delta: applied,
        })
    }

    fn stop_block(&mut self, event: &JsonMap) -> Option<StreamUpdate> {
        let pos = self.locate(event)?;
        self.close(pos);
        Some(StreamUpdate::BlockStopped {
            index: self.slots[pos].index,
            block: self.message.content[pos].clone(),
        })
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    /// Position of the open block an event addresses.
    fn locate(&self, event: &JsonMap) -> Option<usize> {
        if let Some(index) = event.get("index").and_then(coerce_u64) {
            let Some(pos) = self.slots.iter().rposition(|slot| slot.index == index) else {
                debug!(index, "accumulator: dropping event for unknown block");
                return None;
            };
            if self.slots[pos].state == BlockState::Closed {
                debug!(index, "accumulator: dropping event for closed block");
                return None;
            }
            return Some(pos);
        }

        if self.open_blocks() > 1 {
            debug!("accumulator: index-less event with several open blocks, using latest");
        }
        let found = self
            .slots
            .iter()
            .rposition(|slot| slot.state == BlockState::Open);
        if found.is_none() {
            debug!("accumulator: dropping index-less event, no open block");
        }
        found
    }

    fn close(&mut self, pos: usize) {
        let slot = &mut self.slots[pos];
        slot.state = BlockState::Closed;
        if slot.input_json.trim().is_empty() {
            return;
        }
        let raw = std::mem::take(&mut slot.input_json);
        if let ContentBlock::ToolUse { id, input, .. } = &mut self.message.content[pos] {
            match serde_json::from_str::<JsonMap>(&raw) {
                Ok(parsed) => *input = parsed,
                Err(err) => {
                    warn!(tool_use_id = %id, error = %err, "accumulator: tool input is not a JSON object");
                }
            }
        }
    }
}
