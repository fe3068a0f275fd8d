use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info_span, Span};

use crate::config::WorkspaceConfig;
use crate::errors::{OperatorError, Result};
use crate::git::{GitRunner, RealGitRunner};
use crate::health::{HealthMonitor, STATUS_FILE};
use crate::lock::{self, ForceUnlockReport, LockStatus, WorkspaceLock};
use crate::plan::{PlanGraph, PLAN_FILE};
use crate::spawner::CommandSpawner;
use crate::test_runner::CommandTestRunner;
use crate::validation;

/// Directory holding the single primary clone.
pub const REPO_DIR: &str = "repo";
/// Prefix of every task folder (`task-<name>`).
pub const TASK_DIR_PREFIX: &str = "task-";
pub const WORKTREE_DIR: &str = "worktree";

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

/// Handle to one orchestration workspace.
///
/// Owns the loaded configuration, the git runner and a tracing span tagged
/// with the workspace path; every operation goes through a handle instead
/// of process-wide state.
#[derive(Clone)]
pub struct Workspace {
    root: PathBuf,
    config: WorkspaceConfig,
    span: Span,
    git: Arc<dyn GitRunner>,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("root", &self.root)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Workspace {
    /// Open an existing workspace directory and load its `workspace.toml`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(OperatorError::workspace_not_found(root.display()));
        }
        let root = root
            .canonicalize()
            .map_err(|e| OperatorError::io("Failed to resolve workspace path", &e))?;
        let config = WorkspaceConfig::load(&root)?;
        Ok(Self::with_config(root, config))
    }

    /// Build a handle around an explicit config, skipping the file.
    pub fn with_config(root: impl Into<PathBuf>, config: WorkspaceConfig) -> Self {
        let root = root.into();
        let span = info_span!("workspace", path = %root.display());
        Self {
            root,
            config,
            span,
            git: Arc::new(RealGitRunner),
        }
    }

    /// Replace the git runner (for testing).
    pub fn with_git_runner(mut self, git: Arc<dyn GitRunner>) -> Self {
        self.git = git;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn git(&self) -> &dyn GitRunner {
        self.git.as_ref()
    }

    // -- layout --------------------------------------------------------------

    pub fn repo_path(&self) -> PathBuf {
        self.root.join(REPO_DIR)
    }

    pub fn task_dir(&self, task: &str) -> PathBuf {
        self.root.join(format!("{TASK_DIR_PREFIX}{task}"))
    }

    pub fn worktree_path(&self, task: &str) -> PathBuf {
        self.task_dir(task).join(WORKTREE_DIR)
    }

    pub fn spec_path(&self, task: &str) -> PathBuf {
        self.task_dir(task).join("spec.md")
    }

    pub fn status_path(&self, task: &str) -> PathBuf {
        self.task_dir(task).join(STATUS_FILE)
    }

    pub fn plan_path(&self) -> PathBuf {
        self.root.join(PLAN_FILE)
    }

    pub fn task_branch(&self, ticket: &str, task: &str) -> String {
        validation::task_branch(ticket, task)
    }

    /// Names of every `task-*` folder, sorted.
    pub fn task_names(&self) -> Result<Vec<String>> {
        let entries = std::fs::read_dir(&self.root)
            .map_err(|e| OperatorError::io("Failed to list workspace", &e))?;
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|n| n.strip_prefix(TASK_DIR_PREFIX))
                    .filter(|n| !n.is_empty())
                    .map(str::to_string)
            })
            .collect();
        names.sort();
        Ok(names)
    }

    // -- locking -------------------------------------------------------------

    fn new_lock(&self, operation: &str) -> WorkspaceLock {
        WorkspaceLock::new(&self.root, operation)
            .with_stale_after(Duration::from_secs(self.config.stale_lock_secs))
    }

    /// Wait up to the configured timeout for the workspace lock. The lock
    /// is released when the returned guard is dropped.
    pub async fn lock(&self, operation: &str) -> Result<WorkspaceLock> {
        let mut lock = self.new_lock(operation);
        lock.acquire(Duration::from_secs(self.config.lock_timeout_secs), true)
            .await?;
        Ok(lock)
    }

    /// Take the lock only if it is free right now.
    pub async fn try_lock(&self, operation: &str) -> Result<WorkspaceLock> {
        let mut lock = self.new_lock(operation);
        lock.acquire(Duration::ZERO, false).await?;
        Ok(lock)
    }

    pub fn lock_status(&self) -> LockStatus {
        lock::check_lock_status(&self.root, Duration::from_secs(self.config.stale_lock_secs))
    }

    pub fn force_unlock(&self) -> Result<ForceUnlockReport> {
        Ok(lock::force_unlock(&self.root)?)
    }

    // -- collaborators -------------------------------------------------------

    pub fn health(&self) -> HealthMonitor {
        HealthMonitor::new(
            &self.root,
            Duration::from_secs(self.config.health_check_timeout_secs),
        )
    }

    pub fn load_plan(&self) -> Result<PlanGraph> {
        Ok(PlanGraph::load(&self.plan_path())?)
    }

    pub fn test_runner(&self) -> CommandTestRunner {
        CommandTestRunner::new(self.config.test_command.clone())
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.config.test_timeout_secs)
    }

    pub fn spawner(&self) -> CommandSpawner {
        CommandSpawner::new(self.config.spawn_command.clone(), self.config.spawn_args.clone())
    }
}
