//! Protocol message model.
//!
//! Every line the agent emits decodes into exactly one [`Message`]. The
//! variants are closed so that decoding and downstream dispatch stay
//! exhaustive; open-ended payloads (event bodies, tool inputs) stay as
//! ordered JSON maps and are pattern-matched by their consumers.

use serde::Serialize;
use serde_json::{Map, Value};

/// Ordered key/value document used for payloads of unknown shape.
pub type JsonMap = Map<String, Value>;

/// Typed unit of message content.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain assistant or user text.
    Text {
        /// Text body.
        text: String,
    },
    /// Extended reasoning emitted before the visible answer.
    Thinking {
        /// Reasoning text.
        text: String,
        /// Opaque integrity signature attached by the model.
        signature: String,
    },
    /// Tool invocation requested by the assistant.
    ToolUse {
        /// Tool-use identifier, echoed back by the matching result.
        id: String,
        /// Tool name.
        name: String,
        /// Tool arguments.
        input: JsonMap,
    },
    /// Output of a tool invocation.
    ToolResult {
        /// Identifier of the `ToolUse` block this result answers.
        tool_use_id: String,
        /// Result payload (string or nested block array), kept raw.
        content: Option<Value>,
        /// Whether the tool reported failure.
        is_error: Option<bool>,
    },
    /// Placeholder for a block type this engine does not understand.
    Unknown,
}

impl ContentBlock {
    /// Wire discriminator for this block.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Thinking { .. } => "thinking",
            Self::ToolUse { .. } => "tool_use",
            Self::ToolResult { .. } => "tool_result",
            Self::Unknown => "unknown",
        }
    }
}

/// Body of a user turn: bare text or a block list (tool results).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum UserContent {
    /// Plain text turn.
    Text(String),
    /// Structured content, typically `tool_result` blocks.
    Blocks(Vec<ContentBlock>),
}

/// User turn, either sent by the caller or echoed by the agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserMessage {
    /// Turn content.
    pub content: UserContent,
    /// Parent tool-use id when emitted from inside a sub-agent.
    pub parent_tool_use_id: Option<String>,
}

impl UserMessage {
    /// Build a plain-text user turn.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: UserContent::Text(text.into()),
            parent_tool_use_id: None,
        }
    }

    /// Content blocks carried by this turn; empty for plain text.
    #[must_use]
    pub fn blocks(&self) -> &[ContentBlock] {
        match &self.content {
            UserContent::Text(_) => &[],
            UserContent::Blocks(blocks) => blocks,
        }
    }
}

/// Complete assistant turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AssistantMessage {
    /// Ordered content blocks.
    pub content: Vec<ContentBlock>,
    /// Model identifier that produced the turn.
    pub model: String,
    /// Parent tool-use id when emitted from inside a sub-agent.
    pub parent_tool_use_id: Option<String>,
}

impl AssistantMessage {
    /// Concatenated text of every `Text` block, in order.
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Out-of-band system notice (`init`, `compact_boundary`, ...).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemMessage {
    /// Notice subtype.
    pub subtype: String,
    /// Remaining fields of the notice.
    pub data: JsonMap,
}

/// Token accounting reported on a result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
    /// Tokens written to the prompt cache.
    pub cache_creation_input_tokens: u64,
    /// Tokens served from the prompt cache.
    pub cache_read_input_tokens: u64,
}

/// Terminal message of an exchange.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultMessage {
    /// `success`, `error_max_turns`, `error_during_execution`, ...
    pub subtype: String,
    /// Wall-clock duration of the exchange.
    pub duration_ms: u64,
    /// Time spent waiting on the model API.
    pub duration_api_ms: u64,
    /// Whether the agent considers the turn failed.
    pub is_error: bool,
    /// Number of agent turns consumed.
    pub num_turns: u64,
    /// Resumption id for the next exchange.
    pub session_id: String,
    /// Cost of the exchange in USD.
    pub total_cost_usd: Option<f64>,
    /// Token accounting.
    pub usage: Option<Usage>,
    /// Final answer text.
    pub result: Option<String>,
}

/// Partial-message notification (`content_block_start` / `_delta` / `_stop`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEvent {
    /// Event identifier.
    pub uuid: String,
    /// Agent-side conversation id.
    pub session_id: String,
    /// Raw event body; see [`crate::stream::accumulator`].
    pub event: JsonMap,
    /// Parent tool-use id when emitted from inside a sub-agent.
    pub parent_tool_use_id: Option<String>,
}

/// Request from the agent that expects a control response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlRequest {
    /// Request subtype, e.g. `can_use_tool`.
    pub control_type: String,
    /// Correlation id when present.
    pub request_id: Option<String>,
    /// Request body.
    pub data: Option<JsonMap>,
    /// Parent tool-use id when emitted from inside a sub-agent.
    pub parent_tool_use_id: Option<String>,
}

/// Every message the agent can emit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// User turn (caller input or tool results).
    User(UserMessage),
    /// Complete assistant turn.
    Assistant(AssistantMessage),
    /// System notice.
    System(SystemMessage),
    /// Terminal result.
    Result(ResultMessage),
    /// Partial-message notification.
    StreamEvent(StreamEvent),
    /// Control request.
    ControlRequest(ControlRequest),
}

impl Message {
    /// Wire discriminator for this message.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Assistant(_) => "assistant",
            Self::System(_) => "system",
            Self::Result(_) => "result",
            Self::StreamEvent(_) => "stream_event",
            Self::ControlRequest(_) => "control_request",
        }
    }

    /// Whether this message ends an exchange.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result(_))
    }
}
