use wo_core::config::{ConfigError, WorkspaceConfig, CONFIG_FILE};
use wo_core::{ErrorCode, Workspace};

#[test]
fn missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = WorkspaceConfig::load(dir.path()).expect("defaults load");
    assert_eq!(cfg, WorkspaceConfig::default());
    assert_eq!(cfg.spawn_command, "claude");
    assert_eq!(cfg.health_check_timeout_secs, 600);
    assert_eq!(cfg.log_level, "info");
}

#[test]
fn workspace_toml_is_picked_up_by_open() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join(CONFIG_FILE),
        r#"
main_branch = "trunk"
remote = "upstream"
ticket_prefix = "K"
test_command = "make check"
lock_timeout_secs = 5
spawn_args = ["--print"]
"#,
    )
    .unwrap();

    let ws = Workspace::open(dir.path()).expect("workspace opens");
    let cfg = ws.config();
    assert_eq!(cfg.main_branch, "trunk");
    assert_eq!(cfg.remote, "upstream");
    assert_eq!(cfg.ticket_prefix.as_deref(), Some("K"));
    assert_eq!(cfg.test_command.as_deref(), Some("make check"));
    assert_eq!(cfg.lock_timeout_secs, 5);
    assert_eq!(cfg.spawn_args, vec!["--print"]);
    // untouched keys keep their defaults
    assert_eq!(cfg.stale_lock_secs, 3600);
    assert!(cfg.push_after_accept);
}

#[test]
fn malformed_toml_is_config_invalid() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(CONFIG_FILE), "main_branch = [").unwrap();

    let err = WorkspaceConfig::load(dir.path()).expect_err("parse should fail");
    assert!(matches!(err, ConfigError::Parse(_)));

    let err = Workspace::open(dir.path()).expect_err("open should fail");
    assert_eq!(err.code, ErrorCode::ConfigInvalid);
    assert!(err.message.contains(CONFIG_FILE));
}

#[test]
fn semantic_errors_fail_validation() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(CONFIG_FILE), "max_parallel = 0\n").unwrap();
    let err = WorkspaceConfig::load(dir.path()).expect_err("validation should fail");
    assert!(err.to_string().contains("max_parallel"));

    std::fs::write(dir.path().join(CONFIG_FILE), "ticket_prefix = \"not valid\"\n").unwrap();
    let err = WorkspaceConfig::load(dir.path()).expect_err("validation should fail");
    assert!(err.to_string().contains("ticket_prefix"));
}

#[test]
fn config_roundtrip_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = WorkspaceConfig {
        main_branch: "develop".into(),
        test_command: Some("cargo test --workspace".into()),
        push_after_accept: false,
        ..WorkspaceConfig::default()
    };
    std::fs::write(dir.path().join(CONFIG_FILE), cfg.to_toml().expect("serialize")).unwrap();

    let loaded = WorkspaceConfig::load(dir.path()).expect("load back");
    assert_eq!(loaded, cfg);
}
