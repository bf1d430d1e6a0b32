use std::time::Duration;

use agent_conduit::config::{GlobalConfig, DEFAULT_LOG_FILTER};
use agent_conduit::models::session::PermissionMode;
use agent_conduit::AppError;

fn sample_toml(workspace: &str) -> String {
    format!(
        r#"
cli_path = "/usr/local/bin/claude"
cli_args = ["--max-turns", "4"]
default_workspace_root = '{workspace}'
default_model = "claude-sonnet"
default_permission_mode = "accept-edits"
include_partial_messages = false
max_concurrent_sessions = 2
env_passthrough = ["HTTPS_PROXY"]
event_buffer = 16

[transport]
max_line_bytes = 4096
max_consecutive_decode_failures = 5
shutdown_grace_ms = 500

[store]
enabled = true
retention_days = 7
"#
    )
}

#[test]
fn parses_full_config() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().to_str().expect("utf8");
    let config = GlobalConfig::from_toml_str(&sample_toml(root)).expect("valid config");

    assert_eq!(config.cli_path, "/usr/local/bin/claude");
    assert_eq!(config.cli_args, vec!["--max-turns", "4"]);
    assert_eq!(config.default_model.as_deref(), Some("claude-sonnet"));
    assert_eq!(config.default_permission_mode, PermissionMode::AcceptEdits);
    assert!(!config.include_partial_messages);
    assert_eq!(config.max_concurrent_sessions, 2);
    assert_eq!(config.event_buffer, 16);
    assert_eq!(config.transport.max_line_bytes, 4096);
    assert_eq!(config.transport.max_consecutive_decode_failures, 5);
    assert!(config.store.enabled);
    assert_eq!(config.store.retention_days, 7);
    assert_eq!(
        config.default_workspace_root(),
        temp.path().canonicalize().expect("canonical")
    );
}

#[test]
fn empty_config_uses_defaults() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().to_str().expect("utf8");
    let config =
        GlobalConfig::from_toml_str(&format!("default_workspace_root = '{root}'")).expect("valid");

    assert_eq!(config.cli_path, "claude");
    assert!(config.cli_args.is_empty());
    assert_eq!(config.default_permission_mode, PermissionMode::Default);
    assert!(config.include_partial_messages);
    assert_eq!(config.max_concurrent_sessions, 8);
    assert_eq!(config.event_buffer, 256);
    assert_eq!(config.transport.max_line_bytes, 8 * 1_048_576);
    assert_eq!(config.transport.max_consecutive_decode_failures, 32);
    assert_eq!(config.transport.shutdown_grace_ms, 2000);
    assert!(!config.store.enabled);
    assert_eq!(config.store.retention_days, 30);
}

#[test]
fn store_path_defaults_under_workspace() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().to_str().expect("utf8");
    let config =
        GlobalConfig::from_toml_str(&format!("default_workspace_root = '{root}'")).expect("valid");

    let path = config.store_path();
    assert!(path.starts_with(config.default_workspace_root()));
    assert!(path.ends_with(".agent-conduit/sessions.db"));
}

#[test]
fn zero_sessions_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().to_str().expect("utf8");
    let toml = format!("default_workspace_root = '{root}'\nmax_concurrent_sessions = 0");

    let err = GlobalConfig::from_toml_str(&toml).expect_err("must reject");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("max_concurrent_sessions")));
}

#[test]
fn empty_cli_path_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().to_str().expect("utf8");
    let toml = format!("default_workspace_root = '{root}'\ncli_path = \"  \"");

    let err = GlobalConfig::from_toml_str(&toml).expect_err("must reject");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn missing_workspace_is_rejected() {
    let err = GlobalConfig::from_toml_str("default_workspace_root = '/definitely/not/here/xyz'")
        .expect_err("must reject");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("default_workspace_root")));
}

#[test]
fn invalid_toml_is_config_error() {
    let err = GlobalConfig::from_toml_str("cli_path = [").expect_err("must reject");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn transport_config_carries_limits() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().to_str().expect("utf8");
    let config = GlobalConfig::from_toml_str(&sample_toml(root)).expect("valid config");

    let transport = config.transport_config();
    assert_eq!(transport.cli_path, "/usr/local/bin/claude");
    assert_eq!(transport.max_line_bytes, 4096);
    assert_eq!(transport.max_consecutive_decode_failures, 5);
    assert_eq!(transport.shutdown_grace, Duration::from_millis(500));
    assert_eq!(transport.env_passthrough, vec!["HTTPS_PROXY"]);
}

#[test]
fn default_session_config_uses_global_defaults() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().to_str().expect("utf8");
    let config = GlobalConfig::from_toml_str(&sample_toml(root)).expect("valid config");

    let session = config.default_session_config(None);
    assert_eq!(session.project_path, config.default_workspace_root());
    assert_eq!(session.model.as_deref(), Some("claude-sonnet"));
    assert_eq!(session.permission_mode, PermissionMode::AcceptEdits);
    assert!(!session.include_partial_messages);

    let project = temp.path().join("sub");
    let session = config.default_session_config(Some(&project));
    assert_eq!(session.project_path, project);
}

#[test]
fn default_log_filter_is_info() {
    assert_eq!(DEFAULT_LOG_FILTER, "info");
}
