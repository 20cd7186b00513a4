//! Unit tests for configuration parsing, defaults, and validation.

use std::time::Duration;

use agent_foreman::config::{BackoffConfig, BackoffCurve, GlobalConfig, WavePolicy};
use agent_foreman::models::task::TaskCategory;
use agent_foreman::AppError;

/// Minimal valid TOML pointing at an existing workspace root.
fn minimal_toml(root: &str) -> String {
    format!(
        r#"
workspace_root = "{root}"
agent_cli = "claude"
"#
    )
}

#[test]
fn minimal_config_gets_defaults() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = GlobalConfig::from_toml_str(&minimal_toml(temp.path().to_str().expect("utf8")))
        .expect("config should parse");

    assert_eq!(config.supervisor.idle_seconds, 60);
    assert_eq!(config.supervisor.timeout_seconds, 7200);
    assert_eq!(config.supervisor.grace_seconds, 10);
    assert_eq!(config.http_port, 4700);
    assert_eq!(config.hub.heartbeat_seconds, 15);
    assert_eq!(config.hub.history_capacity, 1024);
    assert_eq!(config.wave_policy, WavePolicy::Halt);
    assert_eq!(config.ceiling_for(TaskCategory::Primary), 2);
    assert_eq!(config.ceiling_for(TaskCategory::Worker), 4);
}

#[test]
fn store_path_defaults_under_workspace() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = GlobalConfig::from_toml_str(&minimal_toml(temp.path().to_str().expect("utf8")))
        .expect("config should parse");

    let path = config.store_path();
    assert!(path.starts_with(&config.workspace_root));
    assert!(path.ends_with(".foreman/sessions.json"));
}

#[test]
fn explicit_sections_override_defaults() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().to_str().expect("utf8");
    let raw = format!(
        r#"
workspace_root = "{root}"
agent_cli = "codex"
agent_cli_args = ["--headless"]
http_port = 9100
wave_policy = "continue"

[category_ceilings]
primary = 1
worker = 8

[supervisor]
idle_seconds = 5
timeout_seconds = 30
grace_seconds = 2

[supervisor.backoff]
curve = "linear"
base_seconds = 3
cap_seconds = 9

[hub]
heartbeat_seconds = 1
history_capacity = 16
"#
    );

    let config = GlobalConfig::from_toml_str(&raw).expect("config should parse");
    assert_eq!(config.agent_cli_args, vec!["--headless".to_owned()]);
    assert_eq!(config.http_port, 9100);
    assert_eq!(config.wave_policy, WavePolicy::Continue);
    assert_eq!(config.ceiling_for(TaskCategory::Primary), 1);
    assert_eq!(config.ceiling_for(TaskCategory::Worker), 8);
    assert_eq!(config.idle_window(), Duration::from_secs(5));
    assert_eq!(config.attempt_timeout(), Duration::from_secs(30));
    assert_eq!(config.stop_grace(), Duration::from_secs(2));
    assert_eq!(config.supervisor.backoff.curve, BackoffCurve::Linear);
}

#[test]
fn empty_agent_cli_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().to_str().expect("utf8");
    let raw = format!(
        r#"
workspace_root = "{root}"
agent_cli = "  "
"#
    );

    let err = GlobalConfig::from_toml_str(&raw).expect_err("should reject empty agent_cli");
    assert!(matches!(err, AppError::Config(_)), "got {err:?}");
}

#[test]
fn zero_idle_window_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().to_str().expect("utf8");
    let raw = format!(
        r#"
workspace_root = "{root}"
agent_cli = "claude"

[supervisor]
idle_seconds = 0
"#
    );

    let err = GlobalConfig::from_toml_str(&raw).expect_err("should reject zero idle window");
    assert!(matches!(err, AppError::Config(_)), "got {err:?}");
}

#[test]
fn zero_category_ceiling_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().to_str().expect("utf8");
    let raw = format!(
        r#"
workspace_root = "{root}"
agent_cli = "claude"

[category_ceilings]
primary = 0
"#
    );

    let err = GlobalConfig::from_toml_str(&raw).expect_err("should reject zero ceiling");
    assert!(matches!(err, AppError::Config(_)), "got {err:?}");
}

#[test]
fn missing_workspace_root_is_rejected() {
    let raw = r#"
workspace_root = "/definitely/not/a/real/path/for/tests"
agent_cli = "claude"
"#;

    let err = GlobalConfig::from_toml_str(raw).expect_err("should reject missing workspace");
    assert!(matches!(err, AppError::Config(_)), "got {err:?}");
}

// ── Backoff curves ───────────────────────────────────────────────────────────

#[test]
fn linear_backoff_grows_by_base() {
    let backoff = BackoffConfig {
        curve: BackoffCurve::Linear,
        base_seconds: 2,
        cap_seconds: 60,
    };
    assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(2));
    assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(4));
    assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(6));
}

#[test]
fn exponential_backoff_doubles() {
    let backoff = BackoffConfig {
        curve: BackoffCurve::Exponential,
        base_seconds: 2,
        cap_seconds: 60,
    };
    assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(2));
    assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(4));
    assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(8));
}

#[test]
fn backoff_respects_cap() {
    let backoff = BackoffConfig {
        curve: BackoffCurve::Exponential,
        base_seconds: 2,
        cap_seconds: 10,
    };
    assert_eq!(backoff.delay_for_attempt(10), Duration::from_secs(10));
}
