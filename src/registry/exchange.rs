//! One request/response exchange against a freshly spawned agent.
//!
//! The driver writes the user turn, closes stdin and consumes decoded
//! messages until the terminal `result`. Every message is committed to the
//! session history and reported to listeners in arrival order.

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::message::{ContentBlock, Message, ResultMessage};
use crate::models::session::ExchangeConfig;
use crate::protocol;
use crate::stream::{StreamAccumulator, ToolNameMap};
use crate::transport::ProcessTransport;
use crate::{AppError, Result};

use super::events::SessionEvent;
use super::SessionRegistry;

/// Cancellation sources of one exchange.
#[derive(Debug, Clone)]
pub(super) struct Cancellation {
    /// Triggered by `stop`.
    pub session: CancellationToken,
    /// Supplied by the caller.
    pub caller: CancellationToken,
}

impl Cancellation {
    async fn cancelled(&self) -> AppError {
        tokio::select! {
            () = self.session.cancelled() => AppError::Cancelled("session stopped".into()),
            () = self.caller.cancelled() => {
                AppError::Cancelled("exchange cancelled by caller".into())
            }
        }
    }
}

/// Everything one exchange needs besides the transport.
pub(super) struct Exchange<'a> {
    pub registry: &'a SessionRegistry,
    pub session_id: &'a str,
    pub tools: &'a mut ToolNameMap,
    pub cancel: Cancellation,
}

impl Exchange<'_> {
    /// Spawn the agent, send `text` and drive the exchange to its result.
    ///
    /// The process is closed gracefully after a result and killed on any
    /// failure or cancellation.
    pub(super) async fn run(
        mut self,
        config: ExchangeConfig,
        text: &str,
        outbound_id: &str,
    ) -> Result<ResultMessage> {
        let model = config.config.model.clone().unwrap_or_default();
        let mut transport =
            ProcessTransport::new(self.registry.transport.clone(), config, self.session_id);

        let outcome = self.drive(&mut transport, text, outbound_id, model).await;
        match &outcome {
            Ok(_) => transport.close().await,
            Err(_) => transport.dispose().await,
        }
        outcome
    }

    async fn drive(
        &mut self,
        transport: &mut ProcessTransport,
        text: &str,
        outbound_id: &str,
        model: String,
    ) -> Result<ResultMessage> {
        if self.cancel.session.is_cancelled() || self.cancel.caller.is_cancelled() {
            return Err(self.cancel.cancelled().await);
        }

        transport.connect(None).await?;
        debug!(pid = ?transport.pid(), "agent spawned");

        let cancel = self.cancel.clone();
        tokio::select! {
            biased;
            err = cancel.cancelled() => return Err(err),
            sent = transport.send_user_turn(text, outbound_id) => sent?,
        }
        transport.close_input();

        let mut accumulator = StreamAccumulator::new(model);
        loop {
            let item = tokio::select! {
                biased;
                err = cancel.cancelled() => return Err(err),
                item = transport.next_message() => item,
            };

            let raw: Value = match item {
                None => {
                    return Err(AppError::ConnectionLost(
                        "agent output ended before a result".into(),
                    ))
                }
                Some(Ok(raw)) => raw,
                Some(Err(err @ AppError::ProtocolDecode { .. })) => {
                    warn!(%err, "skipping undecodable line");
                    continue;
                }
                Some(Err(err)) => return Err(err),
            };

            let message = match protocol::parse(&raw) {
                Ok(message) => message,
                Err(err) => {
                    warn!(%err, "skipping malformed message");
                    continue;
                }
            };

            if let Some(result) = self.handle(&mut accumulator, message).await {
                return Ok(result);
            }
        }
    }

    /// Apply one decoded message; returns the result once the exchange ends.
    async fn handle(
        &mut self,
        accumulator: &mut StreamAccumulator,
        message: Message,
    ) -> Option<ResultMessage> {
        match message {
            Message::StreamEvent(event) => {
                if let Some(update) = accumulator.apply(&event.event, self.tools) {
                    self.emit(SessionEvent::from_stream_update(self.session_id, update))
                        .await;
                }
            }
            Message::Assistant(assistant) => {
                self.tools.record_blocks(&assistant.content);
                accumulator.reset();
                self.commit(Message::Assistant(assistant)).await;
            }
            Message::User(user) => {
                for block in user.blocks() {
                    if let ContentBlock::ToolResult {
                        tool_use_id,
                        is_error,
                        ..
                    } = block
                    {
                        let tool_name = self.tools.resolve(tool_use_id).to_owned();
                        self.emit(SessionEvent::ToolResultReceived {
                            session_id: self.session_id.to_owned(),
                            tool_use_id: tool_use_id.clone(),
                            tool_name,
                            is_error: is_error.unwrap_or(false),
                        })
                        .await;
                    }
                }
                self.commit(Message::User(user)).await;
            }
            Message::System(system) => {
                debug!(subtype = %system.subtype, "system message");
                if system.subtype == "init" && accumulator.is_empty() {
                    if let Some(model) = system.data.get("model").and_then(Value::as_str) {
                        *accumulator = StreamAccumulator::new(model);
                    }
                }
            }
            Message::ControlRequest(request) => {
                warn!(
                    control_type = %request.control_type,
                    "agent requested a control decision; no responder is attached"
                );
                self.emit(SessionEvent::ControlRequested {
                    session_id: self.session_id.to_owned(),
                    request,
                })
                .await;
            }
            Message::Result(result) => {
                for update in accumulator.close_open_blocks() {
                    self.emit(SessionEvent::from_stream_update(self.session_id, update))
                        .await;
                }
                if let Some(assistant) = accumulator.finish() {
                    self.tools.record_blocks(&assistant.content);
                    self.commit(Message::Assistant(assistant)).await;
                }
                if result.is_error {
                    warn!(subtype = %result.subtype, "agent reported an error result");
                }
                self.registry.record_result(self.session_id, &result);
                info!(
                    resume_id = %result.session_id,
                    num_turns = result.num_turns,
                    duration_ms = result.duration_ms,
                    "exchange completed"
                );
                self.emit(SessionEvent::ResultReceived {
                    session_id: self.session_id.to_owned(),
                    result: result.clone(),
                })
                .await;
                return Some(result);
            }
        }
        None
    }

    async fn commit(&self, message: Message) {
        self.registry.append_history(self.session_id, message.clone());
        self.emit(SessionEvent::MessageReceived {
            session_id: self.session_id.to_owned(),
            message,
        })
        .await;
    }

    async fn emit(&self, event: SessionEvent) {
        self.registry.events.emit(event).await;
    }
}
