//! Session registry: the map of live sessions and the exchange lifecycle.
//!
//! Sessions live in a [`DashMap`] keyed by local session id. Each entry owns
//! its history, its tool-name map and a cancellation token triggered by
//! [`SessionRegistry::stop`]. An exchange claims its session by moving it to
//! `Processing` under the entry guard, so at most one exchange runs per
//! session while different sessions proceed independently. Map guards are
//! never held across an `.await`.
//!
//! The claim is released by [`ExchangeClaim`] even when the caller drops
//! the exchange future, so an abandoned exchange leaves its session
//! `Stopped` instead of stuck in `Processing`.

pub mod engine;
pub mod events;
mod exchange;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::GlobalConfig;
use crate::models::message::{Message, ResultMessage, UserMessage};
use crate::models::session::{
    ExchangeConfig, PermissionMode, Session, SessionConfig, SessionStatus,
};
use crate::persistence::{SessionRecord, SessionRepo};
use crate::stream::ToolNameMap;
use crate::transport::TransportConfig;
use crate::{AppError, Result};

pub use engine::{EngineFuture, SessionEngine};
pub use events::{EventSink, SessionEvent};

use exchange::{Cancellation, Exchange};

/// Live state of one registered session.
#[derive(Debug)]
struct SessionEntry {
    session: Session,
    tool_names: ToolNameMap,
    cancel: CancellationToken,
}

/// Registry of live sessions.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionEntry>,
    /// Registered sessions plus reservations taken by in-progress starts.
    slots: AtomicUsize,
    transport: Arc<TransportConfig>,
    events: EventSink,
    store: Option<SessionRepo>,
    max_sessions: usize,
}

impl SessionRegistry {
    /// Registry spawning agents with `transport`, holding at most
    /// `max_sessions` sessions.
    #[must_use]
    pub fn new(transport: Arc<TransportConfig>, max_sessions: usize, events: EventSink) -> Self {
        Self {
            sessions: DashMap::new(),
            slots: AtomicUsize::new(0),
            transport,
            events,
            store: None,
            max_sessions,
        }
    }

    /// Registry configured from the global configuration.
    #[must_use]
    pub fn from_config(config: &GlobalConfig, events: EventSink) -> Self {
        let max_sessions = usize::try_from(config.max_concurrent_sessions).unwrap_or(usize::MAX);
        Self::new(config.transport_config(), max_sessions, events)
    }

    /// Write session summaries through to `store`.
    #[must_use]
    pub fn with_store(mut self, store: SessionRepo) -> Self {
        self.store = Some(store);
        self
    }

    /// Register a new session. The agent is not contacted until the first
    /// [`send_message`](Self::send_message).
    ///
    /// # Errors
    ///
    /// Returns `AppError::AtCapacity` when the concurrency cap is reached.
    pub async fn start(&self, config: SessionConfig) -> Result<Session> {
        self.register(config, None).await
    }

    /// Register a new local session continuing the agent conversation
    /// identified by `resume_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AtCapacity` when the concurrency cap is reached.
    pub async fn resume(&self, config: SessionConfig, resume_id: &str) -> Result<Session> {
        self.register(config, Some(resume_id.to_owned())).await
    }

    async fn register(&self, config: SessionConfig, resume_id: Option<String>) -> Result<Session> {
        self.reserve_slot()?;

        let mut session = Session::new(config);
        session.resume_id = resume_id;
        let session_id = session.id.clone();
        let project_path = session.config.project_path.clone();
        let seeded = session.resume_id.clone();

        self.sessions.insert(
            session_id.clone(),
            SessionEntry {
                session,
                tool_names: ToolNameMap::new(),
                cancel: CancellationToken::new(),
            },
        );
        info!(
            session_id,
            project = %project_path.display(),
            resume_id = seeded.as_deref(),
            "session registered"
        );

        self.events
            .emit(SessionEvent::SessionStarted {
                session_id: session_id.clone(),
                project_path,
                resume_id: seeded,
            })
            .await;

        let snapshot = self
            .update(&session_id, |entry| {
                entry.session.status = SessionStatus::Running;
                entry.session.clone()
            })
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} stopped during start")))?;
        self.status_changed(&session_id, SessionStatus::Running).await;
        Ok(snapshot)
    }

    /// Run one exchange carrying `text` and wait for its result.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` for an unknown session.
    /// - `AppError::InvalidState` unless the session is `Running`.
    /// - `AppError::Cancelled` when the session is stopped mid-exchange
    ///   (the session is left `Stopped`).
    /// - Any transport failure (the session is left `Error`).
    ///
    /// Dropping the future before it completes also leaves the session
    /// `Stopped`, with the in-flight turn discarded.
    pub async fn send_message(
        &self,
        session_id: &str,
        text: &str,
        permission_override: Option<PermissionMode>,
    ) -> Result<ResultMessage> {
        self.send_message_with_cancel(session_id, text, permission_override, CancellationToken::new())
            .await
    }

    /// [`send_message`](Self::send_message) with a caller cancellation token.
    ///
    /// # Errors
    ///
    /// As [`send_message`](Self::send_message); cancelling `caller` yields
    /// `AppError::Cancelled`.
    pub async fn send_message_with_cancel(
        &self,
        session_id: &str,
        text: &str,
        permission_override: Option<PermissionMode>,
        caller: CancellationToken,
    ) -> Result<ResultMessage> {
        let span = info_span!("send_message", session_id);
        self.exchange(session_id, text, permission_override, caller)
            .instrument(span)
            .await
    }

    async fn exchange(
        &self,
        session_id: &str,
        text: &str,
        permission_override: Option<PermissionMode>,
        caller: CancellationToken,
    ) -> Result<ResultMessage> {
        let (config, tools, session_cancel, outbound_id, history_mark) = {
            let mut entry = self
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))?;

            let status = entry.session.status;
            if status == SessionStatus::Processing {
                return Err(AppError::InvalidState(format!(
                    "session {session_id} already has an exchange in flight"
                )));
            }
            if !entry.session.can_transition_to(SessionStatus::Processing) {
                return Err(AppError::InvalidState(format!(
                    "session {session_id} is {status}; restart it first"
                )));
            }

            let session = &mut entry.session;
            session.status = SessionStatus::Processing;
            session.touch();
            let mark = session.history.len();
            session.history.push(Message::User(UserMessage::text(text)));
            let config = ExchangeConfig::new(
                &session.config,
                session.resume_id.as_deref(),
                permission_override,
            );
            let outbound_id = session.resume_id.clone().unwrap_or_else(|| session.id.clone());
            let cancel = entry.cancel.child_token();
            let tools = std::mem::take(&mut entry.tool_names);
            (config, tools, cancel, outbound_id, mark)
        };
        let mut claim = ExchangeClaim {
            registry: self,
            session_id,
            history_mark,
            tools: Some(tools),
        };
        self.status_changed(session_id, SessionStatus::Processing)
            .await;
        info!(
            permission_mode = %config.permission_mode(),
            resume_id = config.resume_id.as_deref(),
            "exchange started"
        );

        let outcome = Exchange {
            registry: self,
            session_id,
            tools: claim.tools(),
            cancel: Cancellation {
                session: session_cancel,
                caller,
            },
        }
        .run(config, text, &outbound_id)
        .await;

        let tools = claim.release();
        self.finish_exchange(session_id, tools, history_mark, &outcome)
            .await;
        outcome
    }

    async fn finish_exchange(
        &self,
        session_id: &str,
        tools: ToolNameMap,
        history_mark: usize,
        outcome: &Result<ResultMessage>,
    ) {
        let (status, failure) = match outcome {
            Ok(_) => (SessionStatus::Running, None),
            Err(err) if err.is_cancelled() => (SessionStatus::Stopped, None),
            Err(err) => (SessionStatus::Error, Some(err.to_string())),
        };

        let updated = self.update(session_id, |entry| {
            entry.tool_names = tools;
            let session = &mut entry.session;
            if status != SessionStatus::Running {
                session.history.truncate(history_mark);
            }
            session.status = status;
            session.last_error.clone_from(&failure);
            session.touch();
        });
        if updated.is_none() {
            debug!("session removed during exchange");
            return;
        }

        match (&failure, outcome) {
            (Some(error), _) => {
                warn!(%error, "exchange failed");
                self.events
                    .emit(SessionEvent::ExchangeFailed {
                        session_id: session_id.to_owned(),
                        error: error.clone(),
                    })
                    .await;
            }
            (None, Err(err)) => info!(reason = %err, "exchange cancelled"),
            (None, Ok(_)) => {}
        }
        self.status_changed(session_id, status).await;
    }

    /// Stop a session: cancel its in-flight exchange, release its state and
    /// remove it from the registry. Unknown ids are ignored.
    ///
    /// # Errors
    ///
    /// Never fails today; the signature leaves room for remote teardown.
    pub async fn stop(&self, session_id: &str) -> Result<()> {
        let Some((_, mut entry)) = self.sessions.remove(session_id) else {
            debug!(session_id, "stop: session not registered");
            return Ok(());
        };
        self.slots.fetch_sub(1, Ordering::AcqRel);

        entry.cancel.cancel();
        entry.session.status = SessionStatus::Stopped;
        entry.session.touch();
        info!(session_id, "session stopped");

        self.persist(&entry.session).await;
        self.events
            .emit(SessionEvent::StatusChanged {
                session_id: session_id.to_owned(),
                status: SessionStatus::Stopped,
            })
            .await;
        Ok(())
    }

    /// Return a `Stopped` or `Error` session to `Running`, keeping its
    /// history and resumption id.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` for an unknown session.
    /// - `AppError::InvalidState` for any other status.
    pub async fn restart(&self, session_id: &str) -> Result<Session> {
        let snapshot = {
            let mut entry = self
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))?;
            let status = entry.session.status;
            if !matches!(status, SessionStatus::Stopped | SessionStatus::Error) {
                return Err(AppError::InvalidState(format!(
                    "session {session_id} is {status}; only stopped or failed sessions restart"
                )));
            }
            if entry.cancel.is_cancelled() {
                entry.cancel = CancellationToken::new();
            }
            entry.session.status = SessionStatus::Running;
            entry.session.last_error = None;
            entry.session.touch();
            entry.session.clone()
        };
        info!(session_id, "session restarted");
        self.status_changed(session_id, SessionStatus::Running).await;
        Ok(snapshot)
    }

    /// Snapshot of one session.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.session.clone())
    }

    /// Snapshots of every session, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .map(|entry| entry.session.clone())
            .collect();
        sessions.sort_by_key(|session| session.created_at);
        sessions
    }

    /// Snapshots of sessions working in `project`, oldest first.
    #[must_use]
    pub fn sessions_for_project(&self, project: &Path) -> Vec<Session> {
        let mut sessions = self.list();
        sessions.retain(|session| session.config.project_path == project);
        sessions
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Stop every session.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        info!(count = ids.len(), "stopping all sessions");
        for id in ids {
            if let Err(err) = self.stop(&id).await {
                warn!(session_id = %id, %err, "failed to stop session during shutdown");
            }
        }
    }

    // ── Entry helpers ─────────────────────────────────────────────────────────

    /// Take one of the `max_sessions` slots, failing when none is free.
    fn reserve_slot(&self) -> Result<()> {
        self.slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |taken| {
                (taken < self.max_sessions).then_some(taken + 1)
            })
            .map(|_| ())
            .map_err(|_| {
                AppError::AtCapacity(format!("{} sessions already registered", self.max_sessions))
            })
    }

    /// Run `f` on the entry under its guard; `None` when the session is gone.
    fn update<R>(&self, session_id: &str, f: impl FnOnce(&mut SessionEntry) -> R) -> Option<R> {
        self.sessions
            .get_mut(session_id)
            .map(|mut entry| f(&mut entry))
    }

    fn append_history(&self, session_id: &str, message: Message) {
        self.update(session_id, |entry| {
            entry.session.history.push(message);
            entry.session.touch();
        });
    }

    fn record_result(&self, session_id: &str, result: &ResultMessage) {
        self.update(session_id, |entry| {
            let session = &mut entry.session;
            if !result.session_id.is_empty() {
                session.resume_id = Some(result.session_id.clone());
            }
            session.total_cost_usd += result.total_cost_usd.unwrap_or(0.0);
            session.total_duration_ms = session.total_duration_ms.saturating_add(result.duration_ms);
            session.exchange_count += 1;
            session.history.push(Message::Result(result.clone()));
            session.touch();
        });
    }

    async fn status_changed(&self, session_id: &str, status: SessionStatus) {
        if let Some(snapshot) = self.get(session_id) {
            self.persist(&snapshot).await;
        }
        self.events
            .emit(SessionEvent::StatusChanged {
                session_id: session_id.to_owned(),
                status,
            })
            .await;
    }

    /// Persist and announce a status change from synchronous code such as
    /// a destructor. Skipped outside a tokio runtime.
    fn report_detached(&self, session: Session) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let events = self.events.clone();
        let store = self.store.clone();
        handle.spawn(async move {
            if let Some(store) = store {
                if let Err(err) = store.upsert(&SessionRecord::from_session(&session)).await {
                    warn!(session_id = %session.id, %err, "failed to persist session");
                }
            }
            events
                .emit(SessionEvent::StatusChanged {
                    session_id: session.id,
                    status: session.status,
                })
                .await;
        });
    }

    async fn persist(&self, session: &Session) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(err) = store.upsert(&SessionRecord::from_session(session)).await {
            warn!(session_id = %session.id, %err, "failed to persist session");
        }
    }
}

/// A session held in `Processing` by one exchange.
///
/// Owns the session's tool-name map while the exchange runs. Dropped
/// without [`release`](Self::release), it restores the map, discards the
/// in-flight turn and leaves the session `Stopped`.
struct ExchangeClaim<'a> {
    registry: &'a SessionRegistry,
    session_id: &'a str,
    history_mark: usize,
    tools: Option<ToolNameMap>,
}

impl ExchangeClaim<'_> {
    fn tools(&mut self) -> &mut ToolNameMap {
        self.tools.get_or_insert_with(ToolNameMap::new)
    }

    /// Hand the tool map back for the regular completion path.
    fn release(mut self) -> ToolNameMap {
        self.tools.take().unwrap_or_default()
    }
}

impl Drop for ExchangeClaim<'_> {
    fn drop(&mut self) {
        let Some(tools) = self.tools.take() else {
            return;
        };
        let mark = self.history_mark;
        let snapshot = self.registry.update(self.session_id, |entry| {
            entry.tool_names = tools;
            let session = &mut entry.session;
            session.history.truncate(mark);
            session.status = SessionStatus::Stopped;
            session.touch();
            session.clone()
        });
        if let Some(snapshot) = snapshot {
            warn!(session_id = self.session_id, "exchange abandoned by caller, session stopped");
            self.registry.report_detached(snapshot);
        }
    }
}

impl SessionEngine for SessionRegistry {
    fn start_session(&self, config: SessionConfig) -> EngineFuture<'_, Session> {
        Box::pin(self.start(config))
    }

    fn send_message(
        &self,
        session_id: &str,
        text: &str,
        permission_override: Option<PermissionMode>,
    ) -> EngineFuture<'_, ResultMessage> {
        let session_id = session_id.to_owned();
        let text = text.to_owned();
        Box::pin(async move {
            SessionRegistry::send_message(self, &session_id, &text, permission_override).await
        })
    }

    fn stop_session(&self, session_id: &str) -> EngineFuture<'_, ()> {
        let session_id = session_id.to_owned();
        Box::pin(async move { self.stop(&session_id).await })
    }

    fn get_session(&self, session_id: &str) -> Option<Session> {
        self.get(session_id)
    }

    fn list_sessions_for_project(&self, project: &Path) -> Vec<Session> {
        self.sessions_for_project(project)
    }
}
