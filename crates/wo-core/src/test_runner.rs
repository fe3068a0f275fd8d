use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::errors::{ErrorCode, OperatorError};

pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(300);

const STDOUT_TAIL_BYTES: usize = 5000;
const STDERR_TAIL_BYTES: usize = 2000;

/// Marker file → test command, checked in this order.
const DETECTION: &[(&str, &str)] = &[
    ("Cargo.toml", "cargo test"),
    ("package.json", "npm test"),
    ("go.mod", "go test ./..."),
    ("pyproject.toml", "pytest"),
    ("pytest.ini", "pytest"),
    ("setup.py", "pytest"),
    ("pom.xml", "mvn test"),
    ("build.gradle", "./gradlew test"),
    ("Gemfile", "bundle exec rspec"),
];

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of one test gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub passed: bool,
    pub command: Option<String>,
    /// `-1` when the run timed out or could not be started.
    pub exit_code: Option<i32>,
    pub duration_secs: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout_tail: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr_tail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperatorError>,
}

impl TestOutcome {
    pub fn passed(command: impl Into<String>, duration: Duration) -> Self {
        Self {
            passed: true,
            command: Some(command.into()),
            exit_code: Some(0),
            duration_secs: duration.as_secs_f64(),
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            error: None,
        }
    }

    pub fn failed(err: TestRunError, duration: Duration) -> Self {
        let (command, exit_code) = match &err {
            TestRunError::DetectionFailed { .. } => (None, None),
            TestRunError::Failed { command, exit_code } => (Some(command.clone()), *exit_code),
            TestRunError::Timeout { command, .. } | TestRunError::Spawn { command, .. } => {
                (Some(command.clone()), Some(-1))
            }
        };
        Self {
            passed: false,
            command,
            exit_code,
            duration_secs: duration.as_secs_f64(),
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            error: Some(err.into()),
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum TestRunError {
    #[error("Could not detect a test command in {dir}")]
    DetectionFailed { dir: String },
    #[error("Tests failed: `{command}` exited with {}", .exit_code.map_or("a signal".to_string(), |c| c.to_string()))]
    Failed {
        command: String,
        exit_code: Option<i32>,
    },
    #[error("Tests timed out after {}s: `{command}`", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },
    #[error("Failed to start `{command}`: {message}")]
    Spawn { command: String, message: String },
}

impl From<TestRunError> for OperatorError {
    fn from(err: TestRunError) -> Self {
        let message = err.to_string();
        match err {
            TestRunError::DetectionFailed { .. } => {
                OperatorError::new(ErrorCode::TestDetectionFailed, message)
                    .with_hint("Set test_command in workspace.toml or pass --test-command.")
            }
            TestRunError::Failed { command, .. } => {
                OperatorError::new(ErrorCode::TestsFailed, message)
                    .with_hint("Fix the failing tests in the worktree, then accept again.")
                    .with_recovery(format!("Reproduce locally: {command}"))
            }
            TestRunError::Timeout { .. } => OperatorError::new(ErrorCode::TestTimeout, message)
                .with_hint("Raise test_timeout_secs in workspace.toml if the suite is just slow."),
            TestRunError::Spawn { .. } => OperatorError::new(ErrorCode::TestsFailed, message)
                .with_hint("Check that the test command is installed and on PATH."),
        }
    }
}

// ---------------------------------------------------------------------------
// TestRunner trait
// ---------------------------------------------------------------------------

/// Runs a project's test suite in a directory.
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// `command` overrides whatever the runner would otherwise use.
    async fn run(&self, dir: &Path, command: Option<&str>, timeout: Duration) -> TestOutcome;
}

/// Runs tests through `sh -c`, detecting the command when none is given.
#[derive(Debug, Clone, Default)]
pub struct CommandTestRunner {
    default_command: Option<String>,
}

impl CommandTestRunner {
    pub fn new(default_command: Option<String>) -> Self {
        Self { default_command }
    }

    /// Explicit command, else the configured one, else marker-file detection.
    pub fn resolve_command(&self, dir: &Path, command: Option<&str>) -> Option<String> {
        command
            .map(str::to_string)
            .or_else(|| self.default_command.clone())
            .or_else(|| detect_test_command(dir).map(str::to_string))
    }
}

/// Test command implied by the project's marker files, if any.
pub fn detect_test_command(dir: &Path) -> Option<&'static str> {
    DETECTION
        .iter()
        .find(|(marker, _)| dir.join(marker).exists())
        .map(|(_, command)| *command)
}

#[async_trait]
impl TestRunner for CommandTestRunner {
    async fn run(&self, dir: &Path, command: Option<&str>, timeout: Duration) -> TestOutcome {
        let started = Instant::now();
        let Some(command) = self.resolve_command(dir, command) else {
            warn!(dir = %dir.display(), "no test command detected");
            return TestOutcome::failed(
                TestRunError::DetectionFailed {
                    dir: dir.display().to_string(),
                },
                started.elapsed(),
            );
        };

        info!(dir = %dir.display(), command = %command, timeout_secs = timeout.as_secs(), "running tests");

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                return TestOutcome::failed(
                    TestRunError::Spawn {
                        command,
                        message: e.to_string(),
                    },
                    started.elapsed(),
                )
            }
        };

        // Dropping the future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return TestOutcome::failed(
                    TestRunError::Spawn {
                        command,
                        message: e.to_string(),
                    },
                    started.elapsed(),
                )
            }
            Err(_) => {
                warn!(command = %command, timeout_secs = timeout.as_secs(), "tests timed out");
                return TestOutcome::failed(
                    TestRunError::Timeout { command, timeout },
                    started.elapsed(),
                );
            }
        };

        let elapsed = started.elapsed();
        let stdout_tail = tail(&String::from_utf8_lossy(&output.stdout), STDOUT_TAIL_BYTES);
        let stderr_tail = tail(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL_BYTES);

        let mut outcome = if output.status.success() {
            info!(command = %command, elapsed_ms = elapsed.as_millis() as u64, "tests passed");
            TestOutcome::passed(command, elapsed)
        } else {
            let exit_code = output.status.code();
            warn!(command = %command, exit_code = ?exit_code, "tests failed");
            TestOutcome::failed(TestRunError::Failed { command, exit_code }, elapsed)
        };
        outcome.stdout_tail = stdout_tail;
        outcome.stderr_tail = stderr_tail;
        outcome
    }
}

/// Last `max` bytes of `s`, moved forward to a char boundary.
fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}
