//! Upward interface offered to the web/UI layer and background services.
//!
//! The [`SessionEngine`] trait is the only surface other subsystems may
//! call; it hands out [`Session`] snapshots and never exposes the live
//! per-session state.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use crate::models::message::ResultMessage;
use crate::models::session::{PermissionMode, Session, SessionConfig};
use crate::Result;

/// Boxed future returned by [`SessionEngine`] operations.
pub type EngineFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Protocol-agnostic interface between callers and the session engine.
pub trait SessionEngine: Send + Sync {
    /// Register a new session. Does not contact the agent.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::AtCapacity`](crate::AppError::AtCapacity) when
    /// the concurrency cap is reached.
    fn start_session(&self, config: SessionConfig) -> EngineFuture<'_, Session>;

    /// Run one exchange carrying `text`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`](crate::AppError::NotFound) for an
    /// unknown session, [`AppError::InvalidState`](crate::AppError::InvalidState)
    /// unless the session is `Running`, [`AppError::Cancelled`](crate::AppError::Cancelled)
    /// when stopped mid-exchange, or the transport failure that ended it.
    ///
    /// Dropping the returned future abandons the exchange: the agent is
    /// killed and the session is left `Stopped`.
    fn send_message(
        &self,
        session_id: &str,
        text: &str,
        permission_override: Option<PermissionMode>,
    ) -> EngineFuture<'_, ResultMessage>;

    /// Stop a session and cancel its in-flight exchange.
    ///
    /// This operation is idempotent: stopping an unknown or already
    /// stopped session returns `Ok(())`.
    ///
    /// # Errors
    ///
    /// Reserved for implementations that must reach a remote process.
    fn stop_session(&self, session_id: &str) -> EngineFuture<'_, ()>;

    /// Snapshot of one session.
    fn get_session(&self, session_id: &str) -> Option<Session>;

    /// Snapshots of every session whose working directory is `project`.
    fn list_sessions_for_project(&self, project: &Path) -> Vec<Session>;
}
