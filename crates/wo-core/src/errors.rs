//! Structured, machine-readable errors shared by every operation.
//!
//! Each module keeps its own `thiserror` enum for precise matching inside the
//! crate; all of them convert into [`OperatorError`] before crossing the
//! public API, so callers (the CLI, scripts) can branch on a stable
//! [`ErrorCode`] and show a hint instead of a raw error chain.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // --- Preconditions ---
    WorkspaceNotFound,
    RepoNotFound,
    TaskExists,
    TaskNotFound,
    WorktreeNotFound,
    InvalidInput,
    ConfigInvalid,
    UncommittedChanges,
    NoOperationInProgress,

    // --- Locking ---
    LockHeld,
    LockTimeout,

    // --- Git ---
    RebaseConflict,
    RebaseFailed,
    MergeConflict,
    MergeFailed,
    CheckoutFailed,
    PushFailed,
    CleanupFailed,
    WorktreeCreateFailed,
    GitCommandFailed,

    // --- Tests ---
    TestsFailed,
    TestTimeout,
    TestDetectionFailed,

    // --- Plan ---
    PlanParseFailed,
    NoTasksFound,

    // --- Sub-agents ---
    StatusWriteFailed,
    StatusReadFailed,
    SubagentTimeout,
    SubagentSpawnFailed,

    IoError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::WorkspaceNotFound => "WORKSPACE_NOT_FOUND",
            ErrorCode::RepoNotFound => "REPO_NOT_FOUND",
            ErrorCode::TaskExists => "TASK_EXISTS",
            ErrorCode::TaskNotFound => "TASK_NOT_FOUND",
            ErrorCode::WorktreeNotFound => "WORKTREE_NOT_FOUND",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::ConfigInvalid => "CONFIG_INVALID",
            ErrorCode::UncommittedChanges => "UNCOMMITTED_CHANGES",
            ErrorCode::NoOperationInProgress => "NO_OPERATION_IN_PROGRESS",
            ErrorCode::LockHeld => "LOCK_HELD",
            ErrorCode::LockTimeout => "LOCK_TIMEOUT",
            ErrorCode::RebaseConflict => "REBASE_CONFLICT",
            ErrorCode::RebaseFailed => "REBASE_FAILED",
            ErrorCode::MergeConflict => "MERGE_CONFLICT",
            ErrorCode::MergeFailed => "MERGE_FAILED",
            ErrorCode::CheckoutFailed => "CHECKOUT_FAILED",
            ErrorCode::PushFailed => "PUSH_FAILED",
            ErrorCode::CleanupFailed => "CLEANUP_FAILED",
            ErrorCode::WorktreeCreateFailed => "WORKTREE_CREATE_FAILED",
            ErrorCode::GitCommandFailed => "GIT_COMMAND_FAILED",
            ErrorCode::TestsFailed => "TESTS_FAILED",
            ErrorCode::TestTimeout => "TEST_TIMEOUT",
            ErrorCode::TestDetectionFailed => "TEST_DETECTION_FAILED",
            ErrorCode::PlanParseFailed => "PLAN_PARSE_FAILED",
            ErrorCode::NoTasksFound => "NO_TASKS_FOUND",
            ErrorCode::StatusWriteFailed => "STATUS_WRITE_FAILED",
            ErrorCode::StatusReadFailed => "STATUS_READ_FAILED",
            ErrorCode::SubagentTimeout => "SUBAGENT_TIMEOUT",
            ErrorCode::SubagentSpawnFailed => "SUBAGENT_SPAWN_FAILED",
            ErrorCode::IoError => "IO_ERROR",
        }
    }

    /// Whether the failure happened before anything in the workspace was
    /// touched, so retrying after fixing the input or setup is always safe.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            ErrorCode::WorkspaceNotFound
                | ErrorCode::RepoNotFound
                | ErrorCode::TaskExists
                | ErrorCode::TaskNotFound
                | ErrorCode::WorktreeNotFound
                | ErrorCode::InvalidInput
                | ErrorCode::ConfigInvalid
                | ErrorCode::UncommittedChanges
                | ErrorCode::NoOperationInProgress
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// OperatorError
// ---------------------------------------------------------------------------

/// The error every public operation returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct OperatorError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recovery_options: Vec<String>,
}

pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            hint: None,
            recovery_options: Vec::new(),
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_recovery(mut self, option: impl Into<String>) -> Self {
        self.recovery_options.push(option.into());
        self
    }

    // --- Common constructors ------------------------------------------------

    pub fn workspace_not_found(path: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::WorkspaceNotFound,
            format!("Workspace does not exist: {path}"),
        )
        .with_hint("Create the workspace directory first.")
        .with_recovery(format!("Create directory: mkdir -p {path}"))
    }

    pub fn repo_not_found(path: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::RepoNotFound,
            format!("Repository not found at: {path}"),
        )
        .with_hint("The workspace needs a primary clone in its `repo/` folder.")
        .with_recovery("Clone the repository into <workspace>/repo")
    }

    pub fn task_exists(task: &str, task_dir: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::TaskExists,
            format!("Task folder already exists: {task_dir}"),
        )
        .with_hint("A task with this name already exists in the workspace.")
        .with_recovery(format!("Check task status: operator task status {task}"))
    }

    pub fn task_not_found(task: &str, task_dir: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::TaskNotFound,
            format!("Task folder not found: {task_dir}"),
        )
        .with_hint("The task doesn't exist or was already removed.")
        .with_recovery(format!("Create the task: operator task create <ticket> {task}"))
    }

    pub fn worktree_not_found(task: &str, worktree: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::WorktreeNotFound,
            format!("Worktree not found: {worktree}"),
        )
        .with_hint("The task exists but its worktree is missing.")
        .with_recovery(format!("Inspect worktrees: git worktree list (task {task})"))
    }

    pub fn invalid_input(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message).with_hint(hint)
    }

    pub fn io(context: &str, err: &std::io::Error) -> Self {
        Self::new(ErrorCode::IoError, format!("{context}: {err}"))
    }
}
