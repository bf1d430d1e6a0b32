//! Error types shared across the engine.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all engine failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// The agent executable could not be found on the host.
    CliNotFound(String),
    /// Pipe closed or the agent process went away mid-exchange.
    ConnectionLost(String),
    /// A single output line could not be parsed as a JSON object.
    ProtocolDecode {
        /// Raw line as received from the agent.
        line: String,
        /// Parser failure description.
        reason: String,
    },
    /// A decoded object violates the wire contract; names the offending field.
    MalformedMessage(String),
    /// Agent process exited with a non-zero status.
    ProcessExit {
        /// Exit code, `None` when terminated by a signal.
        code: Option<i32>,
        /// Tail of the process's standard error.
        stderr: String,
    },
    /// Requested entity does not exist.
    NotFound(String),
    /// Operation is not permitted in the session's current state.
    InvalidState(String),
    /// Registry refused a new session because the concurrency cap is reached.
    AtCapacity(String),
    /// Exchange was cancelled by the caller or by `stop`.
    Cancelled(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether this error represents an expected cancellation rather than a failure.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::CliNotFound(msg) => write!(f, "cli not found: {msg}"),
            Self::ConnectionLost(msg) => write!(f, "connection lost: {msg}"),
            Self::ProtocolDecode { line, reason } => {
                write!(f, "protocol decode: {reason} (line: {line})")
            }
            Self::MalformedMessage(msg) => write!(f, "malformed message: {msg}"),
            Self::ProcessExit { code, stderr } => {
                let code = code.map_or_else(|| "signal".to_owned(), |c| c.to_string());
                let stderr = stderr.trim();
                if stderr.is_empty() {
                    write!(f, "process exit: status {code}")
                } else {
                    write!(f, "process exit: status {code}: {stderr}")
                }
            }
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::AtCapacity(msg) => write!(f, "at capacity: {msg}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
