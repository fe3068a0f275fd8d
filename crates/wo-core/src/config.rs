use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{ErrorCode, OperatorError};
use crate::{lock, validation};

/// File name of the optional per-workspace configuration.
pub const CONFIG_FILE: &str = "workspace.toml";

/// Per-workspace settings loaded from `<workspace>/workspace.toml`.
///
/// Every field has a default, so a missing file (or a file that sets only a
/// couple of keys) is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "default_main_branch")]
    pub main_branch: String,
    #[serde(default = "default_remote")]
    pub remote: String,
    /// Ticket used by batch create when none is given on the command line.
    #[serde(default)]
    pub ticket_prefix: Option<String>,
    /// Overrides test auto-detection when set.
    #[serde(default)]
    pub test_command: Option<String>,
    #[serde(default = "default_test_timeout_secs")]
    pub test_timeout_secs: u64,
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    #[serde(default = "default_stale_lock_secs")]
    pub stale_lock_secs: u64,
    #[serde(default = "default_health_check_timeout_secs")]
    pub health_check_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub push_after_accept: bool,
    #[serde(default = "default_true")]
    pub delete_remote_branch: bool,
    #[serde(default = "default_spawn_command")]
    pub spawn_command: String,
    #[serde(default = "default_spawn_args")]
    pub spawn_args: Vec<String>,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            main_branch: default_main_branch(),
            remote: default_remote(),
            ticket_prefix: None,
            test_command: None,
            test_timeout_secs: default_test_timeout_secs(),
            lock_timeout_secs: default_lock_timeout_secs(),
            stale_lock_secs: default_stale_lock_secs(),
            health_check_timeout_secs: default_health_check_timeout_secs(),
            push_after_accept: true,
            delete_remote_branch: true,
            spawn_command: default_spawn_command(),
            spawn_args: default_spawn_args(),
            max_parallel: default_max_parallel(),
            log_level: default_log_level(),
        }
    }
}

fn default_main_branch() -> String {
    "main".into()
}
fn default_remote() -> String {
    "origin".into()
}
fn default_test_timeout_secs() -> u64 {
    300
}
fn default_lock_timeout_secs() -> u64 {
    lock::DEFAULT_ACQUIRE_TIMEOUT.as_secs()
}
fn default_stale_lock_secs() -> u64 {
    lock::DEFAULT_STALE_AFTER.as_secs()
}
fn default_health_check_timeout_secs() -> u64 {
    600
}
fn default_true() -> bool {
    true
}
fn default_spawn_command() -> String {
    "claude".into()
}
fn default_spawn_args() -> Vec<String> {
    vec!["--dangerously-skip-permissions".into(), "-p".into()]
}
fn default_max_parallel() -> usize {
    3
}
fn default_log_level() -> String {
    "info".into()
}

impl WorkspaceConfig {
    /// Load `workspace.toml` from the workspace root, falling back to
    /// defaults when the file does not exist.
    pub fn load(workspace_root: &Path) -> Result<Self, ConfigError> {
        let path = workspace_root.join(CONFIG_FILE);
        if path.exists() {
            Self::load_from(&path)
        } else {
            let cfg = WorkspaceConfig::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: WorkspaceConfig =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.main_branch.trim().is_empty() {
            return Err(ConfigError::Validation("main_branch must not be empty".into()));
        }
        validation::validate_branch_name(&self.main_branch)
            .map_err(|e| ConfigError::Validation(format!("main_branch: {e}")))?;
        if self.remote.trim().is_empty() {
            return Err(ConfigError::Validation("remote must not be empty".into()));
        }
        for (name, value) in [
            ("test_timeout_secs", self.test_timeout_secs),
            ("lock_timeout_secs", self.lock_timeout_secs),
            ("stale_lock_secs", self.stale_lock_secs),
            ("health_check_timeout_secs", self.health_check_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{name} must be > 0")));
            }
        }
        if self.max_parallel == 0 {
            return Err(ConfigError::Validation("max_parallel must be >= 1".into()));
        }
        if self.spawn_command.trim().is_empty() {
            return Err(ConfigError::Validation("spawn_command must not be empty".into()));
        }
        if let Some(ticket) = &self.ticket_prefix {
            validation::validate_ticket(ticket)
                .map_err(|e| ConfigError::Validation(format!("ticket_prefix: {e}")))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

impl From<ConfigError> for OperatorError {
    fn from(err: ConfigError) -> Self {
        OperatorError::new(
            ErrorCode::ConfigInvalid,
            format!("Invalid {CONFIG_FILE}: {err}"),
        )
        .with_hint(format!(
            "Fix or remove {CONFIG_FILE} in the workspace root; every key is optional."
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = WorkspaceConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.main_branch, "main");
        assert_eq!(cfg.remote, "origin");
        assert_eq!(cfg.test_timeout_secs, 300);
        assert_eq!(cfg.lock_timeout_secs, 30);
        assert_eq!(cfg.stale_lock_secs, 3600);
        assert!(cfg.push_after_accept);
        assert_eq!(cfg.max_parallel, 3);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: WorkspaceConfig = toml::from_str(
            r#"
main_branch = "develop"
push_after_accept = false
"#,
        )
        .unwrap();
        assert_eq!(cfg.main_branch, "develop");
        assert!(!cfg.push_after_accept);
        assert_eq!(cfg.remote, "origin");
        assert_eq!(cfg.spawn_args, default_spawn_args());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let cfg = WorkspaceConfig {
            lock_timeout_secs: 0,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("lock_timeout_secs"));
    }

    #[test]
    fn bad_main_branch_is_rejected() {
        let cfg = WorkspaceConfig {
            main_branch: "main..x".into(),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn converts_to_config_invalid() {
        let err: OperatorError = ConfigError::Parse("bad".into()).into();
        assert_eq!(err.code, ErrorCode::ConfigInvalid);
        assert!(err.hint.is_some());
    }

    #[test]
    fn to_toml_roundtrips() {
        let cfg = WorkspaceConfig {
            ticket_prefix: Some("WH-1".into()),
            ..Default::default()
        };
        let text = cfg.to_toml().unwrap();
        let back: WorkspaceConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, cfg);
    }
}
