//! Events pushed to external listeners.
//!
//! Every observable step of a session is reported as a [`SessionEvent`]
//! through a bounded tokio [`mpsc`] channel. Within one exchange the events
//! are sent in exactly the order the agent emitted the underlying
//! messages; the `ResultReceived` event is the last message-derived event
//! of an exchange.

use std::path::PathBuf;

use tokio::sync::mpsc;
use tracing::debug;

use crate::models::message::{ContentBlock, ControlRequest, Message, ResultMessage};
use crate::models::session::SessionStatus;
use crate::stream::accumulator::{BlockDelta, StreamUpdate};

/// Notification emitted by the session registry.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A session was registered.
    SessionStarted {
        /// Local session id.
        session_id: String,
        /// Working directory of the session.
        project_path: PathBuf,
        /// Seeded resumption id for resumed conversations.
        resume_id: Option<String>,
    },
    /// The session moved to a new lifecycle status.
    StatusChanged {
        /// Local session id.
        session_id: String,
        /// New status.
        status: SessionStatus,
    },
    /// A complete user or assistant message arrived.
    MessageReceived {
        /// Local session id.
        session_id: String,
        /// The message.
        message: Message,
    },
    /// A streamed content block opened.
    StreamBlockStarted {
        /// Local session id.
        session_id: String,
        /// Block index.
        index: u64,
        /// Block as declared.
        block: ContentBlock,
    },
    /// A streamed content block grew; carries only the increment.
    StreamBlockDelta {
        /// Local session id.
        session_id: String,
        /// Block index.
        index: u64,
        /// The increment.
        delta: BlockDelta,
    },
    /// A streamed content block closed.
    StreamBlockStopped {
        /// Local session id.
        session_id: String,
        /// Block index.
        index: u64,
        /// Final block content.
        block: ContentBlock,
    },
    /// A tool result arrived; the tool name is resolved from earlier
    /// tool-use blocks of the same session.
    ToolResultReceived {
        /// Local session id.
        session_id: String,
        /// Tool-use id the result answers.
        tool_use_id: String,
        /// Resolved tool name, `"unknown"` when never seen.
        tool_name: String,
        /// Whether the tool reported failure.
        is_error: bool,
    },
    /// The agent asked for a control decision.
    ControlRequested {
        /// Local session id.
        session_id: String,
        /// The request.
        request: ControlRequest,
    },
    /// The exchange finished with a result (cost, duration, resumption id).
    ResultReceived {
        /// Local session id.
        session_id: String,
        /// The result.
        result: ResultMessage,
    },
    /// The exchange failed; the session moved to `Error`.
    ExchangeFailed {
        /// Local session id.
        session_id: String,
        /// Human-readable failure.
        error: String,
    },
}

impl SessionEvent {
    /// Local session id the event belongs to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::SessionStarted { session_id, .. }
            | Self::StatusChanged { session_id, .. }
            | Self::MessageReceived { session_id, .. }
            | Self::StreamBlockStarted { session_id, .. }
            | Self::StreamBlockDelta { session_id, .. }
            | Self::StreamBlockStopped { session_id, .. }
            | Self::ToolResultReceived { session_id, .. }
            | Self::ControlRequested { session_id, .. }
            | Self::ResultReceived { session_id, .. }
            | Self::ExchangeFailed { session_id, .. } => session_id,
        }
    }

    /// Wrap an accumulator update.
    #[must_use]
    pub fn from_stream_update(session_id: &str, update: StreamUpdate) -> Self {
        let session_id = session_id.to_owned();
        match update {
            StreamUpdate::BlockStarted { index, block } => Self::StreamBlockStarted {
                session_id,
                index,
                block,
            },
            StreamUpdate::BlockDelta { index, delta } => Self::StreamBlockDelta {
                session_id,
                index,
                delta,
            },
            StreamUpdate::BlockStopped { index, block } => Self::StreamBlockStopped {
                session_id,
                index,
                block,
            },
        }
    }
}

/// Sending half of the listener channel; a sink without a channel drops
/// every event.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<SessionEvent>>,
}

impl EventSink {
    /// Sink delivering to `tx`.
    #[must_use]
    pub fn new(tx: mpsc::Sender<SessionEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Sink that discards everything.
    #[must_use]
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Channel pair with `capacity`, returning the sink and the receiver.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Deliver `event`, waiting for channel capacity. A closed channel is
    /// logged and otherwise ignored.
    pub async fn emit(&self, event: SessionEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(err) = tx.send(event).await {
            debug!(
                session_id = err.0.session_id(),
                "event listener closed, dropping event"
            );
        }
    }
}
