//! Credential resolution falls back to environment variables when the OS
//! keychain has no entry.

use agent_conduit::config::GlobalConfig;
use serial_test::serial;

#[tokio::test]
#[serial]
async fn env_fallback_populates_credentials() {
    std::env::set_var("GITHUB_TOKEN", "ghp-test-token");

    let mut config = GlobalConfig::default();
    config.load_credentials().await.expect("load credentials");

    assert_eq!(
        config.credentials.get("GITHUB_TOKEN").map(String::as_str),
        Some("ghp-test-token")
    );
    assert_eq!(
        config.transport_config().credentials.get("GITHUB_TOKEN").map(String::as_str),
        Some("ghp-test-token")
    );

    std::env::remove_var("GITHUB_TOKEN");
}

#[tokio::test]
#[serial]
async fn empty_env_value_is_ignored() {
    std::env::set_var("CLAUDE_CODE_OAUTH_TOKEN", "");

    let mut config = GlobalConfig::default();
    config.load_credentials().await.expect("load credentials");

    assert!(!config.credentials.contains_key("CLAUDE_CODE_OAUTH_TOKEN"));

    std::env::remove_var("CLAUDE_CODE_OAUTH_TOKEN");
}
