//! Agent process spawner.
//!
//! Launches one agent process per exchange with:
//! - `kill_on_drop(true)` so processes are cleaned up automatically.
//! - `env_clear()` + a safe variable allowlist, then the configured
//!   passthrough variables, credentials, and the exchange's own
//!   environment (later entries win).
//! - An argument list derived from the exchange configuration; see
//!   [`build_args`].

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::models::session::ExchangeConfig;
use crate::transport::codec::DEFAULT_MAX_LINE_BYTES;
use crate::{AppError, Result};

// ── Environment allowlist ────────────────────────────────────────────────────

/// Environment variables inherited by the spawned agent process.
///
/// Every other variable from the host environment is stripped via
/// `env_clear()` before the child is launched.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "TERM",
    "TMPDIR",
    "SHELL",
    "RUST_LOG",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Default number of consecutive undecodable lines tolerated before the
/// connection is declared lost.
pub const DEFAULT_MAX_DECODE_FAILURES: u32 = 32;

/// Default grace period between closing stdin and force-killing the agent.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// ── Configuration ────────────────────────────────────────────────────────────

/// Process-level configuration shared by every exchange.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Agent executable (e.g., `claude`).
    pub cli_path: String,
    /// Extra arguments appended after the generated ones.
    pub cli_args: Vec<String>,
    /// Host environment variables forwarded in addition to [`ALLOWED_ENV_VARS`].
    pub env_passthrough: Vec<String>,
    /// Credential variables injected into every child.
    pub credentials: HashMap<String, String>,
    /// Maximum accepted output line length.
    pub max_line_bytes: usize,
    /// Consecutive undecodable lines tolerated before `ConnectionLost`.
    pub max_consecutive_decode_failures: u32,
    /// Wait between closing stdin and force-killing on graceful close.
    pub shutdown_grace: Duration,
}

impl TransportConfig {
    /// Defaults for `cli_path`.
    #[must_use]
    pub fn new(cli_path: impl Into<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
            cli_args: Vec::new(),
            env_passthrough: Vec::new(),
            credentials: HashMap::new(),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            max_consecutive_decode_failures: DEFAULT_MAX_DECODE_FAILURES,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

// ── Argument construction ────────────────────────────────────────────────────

/// Build the agent argument list for one exchange.
///
/// Without `initial_prompt` the agent is started in streaming-input mode
/// and user turns are written to stdin; with it the agent runs single-shot
/// and the prompt is the final positional argument.
#[must_use]
pub fn build_args(
    transport: &TransportConfig,
    exchange: &ExchangeConfig,
    initial_prompt: Option<&str>,
) -> Vec<String> {
    let cfg = &exchange.config;
    let mut args: Vec<String> = ["--print", "--output-format", "stream-json", "--verbose"]
        .iter()
        .map(|s| (*s).to_owned())
        .collect();

    if initial_prompt.is_none() {
        args.extend(["--input-format".to_owned(), "stream-json".to_owned()]);
    }

    if let Some(model) = cfg.model.as_deref().filter(|m| !m.is_empty()) {
        args.extend(["--model".to_owned(), model.to_owned()]);
    }

    args.extend([
        "--permission-mode".to_owned(),
        cfg.permission_mode.as_cli_arg().to_owned(),
    ]);

    if !cfg.allowed_tools.is_empty() {
        args.extend(["--allowedTools".to_owned(), cfg.allowed_tools.join(",")]);
    }
    if !cfg.disallowed_tools.is_empty() {
        args.extend(["--disallowedTools".to_owned(), cfg.disallowed_tools.join(",")]);
    }

    if let Some(prompt) = cfg.system_prompt.as_deref().filter(|p| !p.is_empty()) {
        args.extend(["--append-system-prompt".to_owned(), prompt.to_owned()]);
    }

    if !cfg.mcp_servers.is_empty() {
        let doc: Value = json!({ "mcpServers": cfg.mcp_servers });
        args.extend(["--mcp-config".to_owned(), doc.to_string()]);
    }

    if let Some(resume) = exchange.resume_id.as_deref() {
        args.extend(["--resume".to_owned(), resume.to_owned()]);
    }

    if cfg.include_partial_messages {
        args.push("--include-partial-messages".to_owned());
    }

    args.extend(transport.cli_args.iter().cloned());

    if let Some(prompt) = initial_prompt {
        args.push("--".to_owned());
        args.push(prompt.to_owned());
    }

    args
}

/// Build the child environment: allowlist, passthrough, credentials, then
/// the exchange's own variables.
#[must_use]
pub fn build_env(transport: &TransportConfig, exchange: &ExchangeConfig) -> Vec<(String, String)> {
    let mut env: HashMap<String, String> = HashMap::new();

    let inherited = ALLOWED_ENV_VARS
        .iter()
        .copied()
        .chain(transport.env_passthrough.iter().map(String::as_str));
    for key in inherited {
        if let Ok(val) = std::env::var(key) {
            env.insert(key.to_owned(), val);
        }
    }

    for (key, val) in &transport.credentials {
        env.insert(key.clone(), val.clone());
    }
    for (key, val) in &exchange.config.env {
        env.insert(key.clone(), val.clone());
    }

    let mut env: Vec<(String, String)> = env.into_iter().collect();
    env.sort();
    env
}

// ── Spawner ──────────────────────────────────────────────────────────────────

/// Spawn the agent process for one exchange with all three stdio pipes.
///
/// # Errors
///
/// - `AppError::Config`: the working directory does not exist.
/// - `AppError::CliNotFound`: the executable is not on the host.
/// - `AppError::Io`: any other OS spawn failure.
pub fn spawn_agent(
    transport: &TransportConfig,
    exchange: &ExchangeConfig,
    session_id: &str,
    initial_prompt: Option<&str>,
) -> Result<Child> {
    let workdir: &Path = &exchange.config.project_path;
    if !workdir.is_dir() {
        return Err(AppError::Config(format!(
            "working directory does not exist: {}",
            workdir.display()
        )));
    }

    let args = build_args(transport, exchange, initial_prompt);
    debug!(session_id, cli = %transport.cli_path, ?args, "spawning agent process");

    let mut cmd = Command::new(&transport.cli_path);
    cmd.args(&args);

    // Strip inherited environment, then inject only the safe allowlist.
    cmd.env_clear();
    cmd.envs(build_env(transport, exchange));

    cmd.current_dir(workdir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            AppError::CliNotFound(format!("{}: {err}", transport.cli_path))
        } else {
            AppError::Io(format!("failed to spawn agent: {err}"))
        }
    })?;

    info!(
        session_id,
        pid = child.id(),
        resume = exchange.resume_id.as_deref(),
        "agent process spawned"
    );
    Ok(child)
}
