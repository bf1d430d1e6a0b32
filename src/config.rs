//! Global configuration parsing, validation, and credential loading.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::models::session::{PermissionMode, SessionConfig};
use crate::transport::codec::DEFAULT_MAX_LINE_BYTES;
use crate::transport::spawner::{DEFAULT_MAX_DECODE_FAILURES, TransportConfig};
use crate::{AppError, Result};

/// Log filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Keyring service under which credentials are stored.
pub const KEYRING_SERVICE: &str = "agent-conduit";

/// Credentials forwarded to the agent: `(keyring key, environment variable)`.
pub const CREDENTIALS: &[(&str, &str)] = &[
    ("anthropic_api_key", "ANTHROPIC_API_KEY"),
    ("claude_code_oauth_token", "CLAUDE_CODE_OAUTH_TOKEN"),
    ("github_token", "GITHUB_TOKEN"),
];

/// Agent process I/O limits.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TransportSection {
    /// Maximum accepted output line length in bytes.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// Consecutive undecodable lines tolerated before the connection is lost.
    #[serde(default = "default_max_decode_failures")]
    pub max_consecutive_decode_failures: u32,
    /// Grace period between closing stdin and killing the agent.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            max_line_bytes: default_max_line_bytes(),
            max_consecutive_decode_failures: default_max_decode_failures(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

fn default_max_line_bytes() -> usize {
    DEFAULT_MAX_LINE_BYTES
}

fn default_max_decode_failures() -> u32 {
    DEFAULT_MAX_DECODE_FAILURES
}

fn default_shutdown_grace_ms() -> u64 {
    2000
}

/// Optional `SQLite` session store.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StoreConfig {
    /// Whether sessions are persisted.
    #[serde(default)]
    pub enabled: bool,
    /// Database file; defaults under the workspace root.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Days after a session stops before its record is purged.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: None,
            retention_days: default_retention_days(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_retention_days() -> u32 {
    30
}

fn default_max_concurrent_sessions() -> u32 {
    8
}

fn default_cli_path() -> String {
    "claude".into()
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_event_buffer() -> usize {
    256
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Agent executable.
    #[serde(default = "default_cli_path")]
    pub cli_path: String,
    /// Extra arguments for every agent invocation.
    #[serde(default)]
    pub cli_args: Vec<String>,
    /// Default project directory for new sessions.
    #[serde(default = "default_workspace_root")]
    pub default_workspace_root: PathBuf,
    /// Model used when a session does not choose one.
    #[serde(default)]
    pub default_model: Option<String>,
    /// Permission mode used when a session does not choose one.
    #[serde(default)]
    pub default_permission_mode: PermissionMode,
    /// Ask the agent for partial `stream_event` messages.
    #[serde(default = "default_true")]
    pub include_partial_messages: bool,
    /// Maximum concurrently registered sessions.
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: u32,
    /// Host environment variables forwarded to the agent.
    #[serde(default)]
    pub env_passthrough: Vec<String>,
    /// Capacity of the session event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Agent process I/O limits.
    #[serde(default)]
    pub transport: TransportSection,
    /// Session store settings.
    #[serde(default)]
    pub store: StoreConfig,
    /// Credentials resolved at runtime (populated by `load_credentials`).
    #[serde(skip)]
    pub credentials: HashMap<String, String>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            cli_path: default_cli_path(),
            cli_args: Vec::new(),
            default_workspace_root: default_workspace_root(),
            default_model: None,
            default_permission_mode: PermissionMode::Default,
            include_partial_messages: true,
            max_concurrent_sessions: default_max_concurrent_sessions(),
            env_passthrough: Vec::new(),
            event_buffer: default_event_buffer(),
            transport: TransportSection::default(),
            store: StoreConfig::default(),
            credentials: HashMap::new(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve agent credentials from the OS keychain with env-var fallback.
    ///
    /// Missing credentials are not an error: the agent may carry its own
    /// login.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the keychain task panics.
    pub async fn load_credentials(&mut self) -> Result<()> {
        for &(keyring_key, env_key) in CREDENTIALS {
            match load_credential(keyring_key, env_key).await? {
                Some(value) => {
                    self.credentials.insert(env_key.to_owned(), value);
                }
                None => debug!(key = keyring_key, "credential not configured"),
            }
        }
        Ok(())
    }

    /// Absolute path to the default workspace root.
    #[must_use]
    pub fn default_workspace_root(&self) -> &Path {
        &self.default_workspace_root
    }

    /// Database file used by the session store.
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        self.store.path.clone().unwrap_or_else(|| {
            self.default_workspace_root
                .join(".agent-conduit")
                .join("sessions.db")
        })
    }

    /// Process-level transport configuration.
    #[must_use]
    pub fn transport_config(&self) -> Arc<TransportConfig> {
        Arc::new(TransportConfig {
            cli_path: self.cli_path.clone(),
            cli_args: self.cli_args.clone(),
            env_passthrough: self.env_passthrough.clone(),
            credentials: self.credentials.clone(),
            max_line_bytes: self.transport.max_line_bytes,
            max_consecutive_decode_failures: self.transport.max_consecutive_decode_failures,
            shutdown_grace: Duration::from_millis(self.transport.shutdown_grace_ms),
        })
    }

    /// Session configuration for `project` populated from the global defaults.
    #[must_use]
    pub fn default_session_config(&self, project: Option<&Path>) -> SessionConfig {
        SessionConfig {
            project_path: project.map_or_else(|| self.default_workspace_root.clone(), Path::to_path_buf),
            model: self.default_model.clone(),
            permission_mode: self.default_permission_mode,
            include_partial_messages: self.include_partial_messages,
            ..SessionConfig::default()
        }
    }

    fn validate(&mut self) -> Result<()> {
        if self.cli_path.trim().is_empty() {
            return Err(AppError::Config("cli_path must not be empty".into()));
        }

        if self.max_concurrent_sessions == 0 {
            return Err(AppError::Config(
                "max_concurrent_sessions must be greater than zero".into(),
            ));
        }

        if self.event_buffer == 0 {
            return Err(AppError::Config("event_buffer must be greater than zero".into()));
        }

        if self.transport.max_line_bytes == 0 {
            return Err(AppError::Config(
                "transport.max_line_bytes must be greater than zero".into(),
            ));
        }

        if self.transport.max_consecutive_decode_failures == 0 {
            return Err(AppError::Config(
                "transport.max_consecutive_decode_failures must be greater than zero".into(),
            ));
        }

        let canonical_root = self
            .default_workspace_root
            .canonicalize()
            .map_err(|err| AppError::Config(format!("default_workspace_root invalid: {err}")))?;
        self.default_workspace_root = canonical_root;

        Ok(())
    }
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<Option<String>> {
    let key = keyring_key.to_owned();

    // Try OS keychain first via spawn_blocking (keyring is synchronous I/O).
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(Some(value)),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(keyring::Error::NoEntry) => {
            debug!(key = keyring_key, "no keychain entry, trying env var");
        }
        Err(err) => {
            debug!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    // Fallback to environment variable.
    Ok(env::var(env_key).ok().filter(|value| !value.is_empty()))
}
