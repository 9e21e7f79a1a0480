use std::path::PathBuf;

use runweave_core::config::AppConfig;
use runweave_core::error::RunweaveError;
use runweave_test_utils::write_config;

#[test]
fn test_load_full_config_from_file() {
    let (_dir, path) = write_config(
        r#"
[orchestrator]
workspace = "/tmp/runweave-test"
event_bus_capacity = 64

[cost]
warning_threshold = 25.5
per_run_estimate = 0.4

[storage]
preferences_db = "/tmp/runweave-test/prefs.db"

[log]
enabled = true
log_dir = "/tmp/runweave-test/run-logs"
level = 3
"#,
    );

    let config = AppConfig::load(&path).expect("load config");

    assert_eq!(config.orchestrator.workspace, "/tmp/runweave-test");
    assert_eq!(config.orchestrator.event_bus_capacity, 64);
    assert_eq!(config.cost.warning_threshold, 25.5);
    assert_eq!(config.cost.per_run_estimate, Some(0.4));
    assert_eq!(
        config.preferences_path(),
        PathBuf::from("/tmp/runweave-test/prefs.db")
    );

    let log = config.log.as_ref().expect("log present");
    assert!(log.enabled);
    assert_eq!(log.level, 3);
    assert_eq!(config.log_dir(), PathBuf::from("/tmp/runweave-test/run-logs"));
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("RUNWEAVE_TEST_WORKSPACE", "/srv/weave");

    let (_dir, path) = write_config(
        r#"
[orchestrator]
workspace = "${RUNWEAVE_TEST_WORKSPACE}"
"#,
    );

    let config = AppConfig::load(&path).expect("load config");
    assert_eq!(config.workspace_dir(), PathBuf::from("/srv/weave"));
    assert_eq!(
        config.preferences_path(),
        PathBuf::from("/srv/weave/preferences.db")
    );

    std::env::remove_var("RUNWEAVE_TEST_WORKSPACE");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let (_dir, path) = write_config(
        r#"
[cost]
per_run_estimate = 1.0
"#,
    );

    let config = AppConfig::load(&path).expect("load config");

    assert_eq!(config.orchestrator.workspace, "~/.runweave");
    assert_eq!(config.orchestrator.event_bus_capacity, 256);
    assert_eq!(config.cost.warning_threshold, 100.0);
    assert!(config.storage.preferences_db.is_none());
    assert!(config.log.is_none());
}

#[test]
fn test_missing_file_is_reported() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let err = AppConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, RunweaveError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_toml_is_a_config_error() {
    let (_dir, path) = write_config("[cost]\nwarning_threshold = \"lots\"\n");
    let err = AppConfig::load(&path).unwrap_err();
    assert!(matches!(err, RunweaveError::Config(_)));
}
