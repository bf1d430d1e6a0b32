//! Session model and lifecycle helpers.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::message::{JsonMap, Message};
use crate::AppError;

/// Tools the agent may use while planning; nothing on this list edits files
/// or runs commands.
pub const PLAN_MODE_TOOLS: &[&str] = &[
    "Read",
    "Glob",
    "Grep",
    "WebFetch",
    "WebSearch",
    "Task",
    "AskUserQuestion",
];

/// Lifecycle status for a conversation session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session allocated but not yet ready.
    Starting,
    /// Idle and ready for the next exchange.
    Running,
    /// An exchange is in flight.
    Processing,
    /// Stopped by the caller or by cancellation.
    Stopped,
    /// Last exchange failed; requires an explicit restart.
    Error,
}

impl SessionStatus {
    /// Stable lower-case name, as persisted.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Processing => "processing",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl Display for SessionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "processing" => Ok(Self::Processing),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            other => Err(AppError::Db(format!("invalid session status: {other}"))),
        }
    }
}

/// Controls whether the agent may run side-effecting tools unattended.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionMode {
    /// Agent asks before every side-effecting tool.
    #[default]
    Default,
    /// File edits are accepted automatically.
    AcceptEdits,
    /// Read-only planning; see [`PLAN_MODE_TOOLS`].
    Plan,
    /// Every tool runs without confirmation.
    BypassPermissions,
}

impl PermissionMode {
    /// Configuration spelling (`accept-edits`, ...).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "accept-edits",
            Self::Plan => "plan",
            Self::BypassPermissions => "bypass-permissions",
        }
    }

    /// Value for the agent's `--permission-mode` flag.
    #[must_use]
    pub fn as_cli_arg(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::Plan => "plan",
            Self::BypassPermissions => "bypassPermissions",
        }
    }
}

impl Display for PermissionMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionMode {
    type Err = AppError;

    /// Accepts both the configuration and the CLI spelling.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "accept-edits" | "acceptEdits" => Ok(Self::AcceptEdits),
            "plan" => Ok(Self::Plan),
            "bypass-permissions" | "bypassPermissions" => Ok(Self::BypassPermissions),
            other => Err(AppError::Config(format!("unknown permission mode: {other}"))),
        }
    }
}

/// Per-session configuration captured at `start`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SessionConfig {
    /// Working directory of the agent process; also the session's project key.
    pub project_path: PathBuf,
    /// Model identifier; the agent's default when `None`.
    #[serde(default)]
    pub model: Option<String>,
    /// Tools permitted without confirmation.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Tools the agent must never use.
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
    /// Permission mode applied to every exchange unless overridden.
    #[serde(default)]
    pub permission_mode: PermissionMode,
    /// Text appended to the agent's system prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// MCP server definitions keyed by server name.
    #[serde(default)]
    pub mcp_servers: JsonMap,
    /// Extra environment variables for the agent process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Request `stream_event` partial messages from the agent.
    #[serde(default)]
    pub include_partial_messages: bool,
}

impl SessionConfig {
    /// Configuration rooted at `project_path` with every other field defaulted.
    #[must_use]
    pub fn new(project_path: impl Into<PathBuf>) -> Self {
        Self {
            project_path: project_path.into(),
            ..Self::default()
        }
    }
}

/// Exchange-scoped configuration derived from a [`SessionConfig`].
///
/// Carries the resumption id of the previous exchange and applies a
/// permission override; plan mode narrows the allowed tools to
/// [`PLAN_MODE_TOOLS`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeConfig {
    /// Effective configuration for this exchange.
    pub config: SessionConfig,
    /// Resumption id handed to the agent, if any.
    pub resume_id: Option<String>,
}

impl ExchangeConfig {
    /// Derive the configuration for one exchange.
    #[must_use]
    pub fn new(
        config: &SessionConfig,
        resume_id: Option<&str>,
        permission_override: Option<PermissionMode>,
    ) -> Self {
        let mut config = config.clone();
        if let Some(mode) = permission_override {
            config.permission_mode = mode;
        }
        if config.permission_mode == PermissionMode::Plan {
            config.allowed_tools = PLAN_MODE_TOOLS.iter().map(|t| (*t).to_owned()).collect();
        }
        Self {
            config,
            resume_id: resume_id.map(str::to_owned),
        }
    }

    /// Effective permission mode.
    #[must_use]
    pub fn permission_mode(&self) -> PermissionMode {
        self.config.permission_mode
    }

    /// Effective allowed tool list.
    #[must_use]
    pub fn allowed_tools(&self) -> &[String] {
        &self.config.allowed_tools
    }
}

/// Conversation session as observed by callers.
///
/// The registry owns the live instance; lookups hand out clones.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Locally generated identifier.
    pub id: String,
    /// Resumption id assigned by the agent on the last completed exchange.
    pub resume_id: Option<String>,
    /// Configuration captured at start.
    pub config: SessionConfig,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Completed user, assistant, and result messages, in order.
    pub history: Vec<Message>,
    /// Sum of `total_cost_usd` across results.
    pub total_cost_usd: f64,
    /// Sum of `duration_ms` across results.
    pub total_duration_ms: u64,
    /// Number of exchanges that reached a result.
    pub exchange_count: u64,
    /// Failure description of the last failed exchange.
    pub last_error: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last activity timestamp.
    pub last_activity: DateTime<Utc>,
}

impl Session {
    /// Construct a new session with a generated identifier.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            resume_id: None,
            config,
            status: SessionStatus::Starting,
            history: Vec::new(),
            total_cost_usd: 0.0,
            total_duration_ms: 0,
            exchange_count: 0,
            last_error: None,
            created_at: now,
            last_activity: now,
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self.status, next),
            (
                SessionStatus::Starting | SessionStatus::Processing,
                SessionStatus::Running
            ) | (
                SessionStatus::Running,
                SessionStatus::Processing | SessionStatus::Stopped
            ) | (
                SessionStatus::Processing,
                SessionStatus::Stopped | SessionStatus::Error
            ) | (
                SessionStatus::Stopped | SessionStatus::Error,
                SessionStatus::Running
            ) | (SessionStatus::Starting | SessionStatus::Error, SessionStatus::Stopped)
        )
    }

    /// Record activity now.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}
