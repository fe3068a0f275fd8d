//! Single-task operations: create, sync, reset and read-only status.

use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{ErrorCode, OperatorError, Result};
use crate::git;
use crate::health::SubagentStatus;
use crate::lock::WorkspaceLock;
use crate::validation::{validate_branch_name, validate_task_name, validate_ticket};
use crate::workspace::Workspace;

/// Scaffold files written into every new task folder.
pub const SCAFFOLD_FILES: [&str; 3] = ["spec.md", "feedback.md", "results.md"];

const UNCOMMITTED_FILES_SHOWN: usize = 10;
const RESULTS_SUMMARY_CHARS: usize = 100;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedTask {
    pub task_name: String,
    pub ticket: String,
    pub task_dir: PathBuf,
    pub worktree_path: PathBuf,
    pub branch: String,
    pub based_on: String,
    pub files_created: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncedTask {
    pub task_name: String,
    pub rebased_onto: String,
    /// Whether the preceding fetch succeeded; a failed fetch is not fatal.
    pub fetched: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task: String,
    pub error: OperatorError,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncAllReport {
    pub success: bool,
    pub synced: Vec<String>,
    pub failed: Vec<TaskFailure>,
    /// Task folders without a worktree.
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetTask {
    pub task_name: String,
    pub reset_to: String,
    pub fetched: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaffoldFiles {
    pub spec: bool,
    pub feedback: bool,
    pub results: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusReport {
    pub task_name: String,
    pub task_dir: PathBuf,
    pub exists: bool,
    pub files: ScaffoldFiles,
    pub has_worktree: bool,
    pub branch: Option<String>,
    pub total_commits: Option<u64>,
    pub last_commit: Option<String>,
    pub uncommitted_changes: usize,
    /// First few lines of `git status --porcelain`.
    pub uncommitted_files: Vec<String>,
    pub results_summary: Option<String>,
    pub subagent: Option<SubagentStatus>,
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

impl Workspace {
    /// Create `task-<name>/` with its scaffold files and a worktree on
    /// `feature/<ticket>/<name>`, branched from `base` (default: the main
    /// branch).
    pub async fn create_task(&self, ticket: &str, name: &str, base: Option<&str>) -> Result<CreatedTask> {
        let lock = self.lock(&format!("create_task:{name}")).await?;
        self.create_task_locked(&lock, ticket, name, base)
    }

    /// [`create_task`](Self::create_task) for callers already holding the
    /// workspace lock.
    pub fn create_task_locked(
        &self,
        _lock: &WorkspaceLock,
        ticket: &str,
        name: &str,
        base: Option<&str>,
    ) -> Result<CreatedTask> {
        let ticket = validate_ticket(ticket)?;
        let name = validate_task_name(name)?;
        let base = validate_branch_name(base.unwrap_or(&self.config().main_branch))?;

        let repo = self.repo_path();
        if !repo.exists() {
            return Err(OperatorError::repo_not_found(repo.display()));
        }
        let task_dir = self.task_dir(&name);
        if task_dir.exists() {
            return Err(OperatorError::task_exists(&name, task_dir.display()));
        }

        let branch = self.task_branch(&ticket, &name);
        let worktree = self.worktree_path(&name);
        info!(task = %name, branch = %branch, base = %base, "creating task");

        if let Err(e) = write_scaffold(&task_dir, &ticket, &name, &branch) {
            let _ = std::fs::remove_dir_all(&task_dir);
            return Err(OperatorError::io("Failed to write task files", &e));
        }

        let worktree_arg = worktree.to_string_lossy();
        let output = git::run(
            self.git(),
            &repo,
            &["worktree", "add", &worktree_arg, "-b", &branch, &base],
        );
        if !output.success {
            warn!(task = %name, stderr = %output.message(), "worktree add failed; removing task folder");
            let _ = std::fs::remove_dir_all(&task_dir);
            return Err(OperatorError::new(
                ErrorCode::WorktreeCreateFailed,
                format!("Failed to create worktree: {}", output.message()),
            )
            .with_hint(format!("Check that branch '{base}' exists and '{branch}' does not."))
            .with_recovery(format!(
                "Retry manually: git worktree add {worktree_arg} -b {branch} {base}"
            )));
        }

        Ok(CreatedTask {
            task_name: name,
            ticket,
            task_dir,
            worktree_path: worktree,
            branch,
            based_on: base,
            files_created: SCAFFOLD_FILES.iter().map(|f| f.to_string()).collect(),
        })
    }

    /// Rebase a task's worktree onto the main branch.
    pub async fn sync_task(&self, name: &str) -> Result<SyncedTask> {
        let lock = self.lock(&format!("sync_task:{name}")).await?;
        self.sync_task_locked(&lock, name)
    }

    fn sync_task_locked(&self, _lock: &WorkspaceLock, name: &str) -> Result<SyncedTask> {
        let name = validate_task_name(name)?;
        let main = self.config().main_branch.clone();
        let worktree = self.existing_worktree(&name)?;

        let fetched = self.fetch(&worktree);
        let output = git::run(self.git(), &worktree, &["rebase", &main]);
        if !output.success {
            let conflict = git::detect_conflict(self.git(), &worktree, &output);
            let _ = git::run(self.git(), &worktree, &["rebase", "--abort"]);
            return Err(match conflict {
                Some(paths) => {
                    warn!(task = %name, conflicts = ?paths, "rebase conflict; aborted");
                    let mut err = OperatorError::new(
                        ErrorCode::RebaseConflict,
                        format!("Rebase of task '{name}' onto {main} has conflicts"),
                    )
                    .with_hint(format!(
                        "Start the rebase by hand (git rebase {main} in the worktree), then: operator task conflicts {name}"
                    ));
                    for path in paths {
                        err = err.with_recovery(format!("Resolve conflicts in: {path}"));
                    }
                    err
                }
                None => OperatorError::new(
                    ErrorCode::RebaseFailed,
                    format!("Rebase failed: {}", output.message()),
                )
                .with_recovery(format!("Inspect manually: cd {} && git rebase {main}", worktree.display())),
            });
        }

        info!(task = %name, onto = %main, "task synced");
        Ok(SyncedTask {
            task_name: name,
            rebased_onto: main,
            fetched,
        })
    }

    /// Sync every task that has a worktree, under one lock. Individual
    /// failures are collected, never abort the batch.
    pub async fn sync_all(&self) -> Result<SyncAllReport> {
        let lock = self.lock("sync_all").await?;
        let mut report = SyncAllReport::default();
        for name in self.task_names()? {
            if !self.worktree_path(&name).exists() {
                report.skipped.push(name);
                continue;
            }
            match self.sync_task_locked(&lock, &name) {
                Ok(_) => report.synced.push(name),
                Err(error) => report.failed.push(TaskFailure { task: name, error }),
            }
        }
        report.success = report.failed.is_empty();
        info!(
            synced = report.synced.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "sync-all finished"
        );
        Ok(report)
    }

    /// Throw away the worktree's changes: hard reset onto the main branch
    /// and remove untracked files.
    pub async fn reset_task(&self, name: &str) -> Result<ResetTask> {
        let name = validate_task_name(name)?;
        let _lock = self.lock(&format!("reset_task:{name}")).await?;
        let main = self.config().main_branch.clone();
        let worktree = self.existing_worktree(&name)?;

        let fetched = self.fetch(&worktree);
        let output = git::run(self.git(), &worktree, &["reset", "--hard", &main]);
        if !output.success {
            return Err(OperatorError::new(
                ErrorCode::GitCommandFailed,
                format!("Reset failed: {}", output.message()),
            )
            .with_hint(format!("Check that '{main}' exists in the repository.")));
        }
        let clean = git::run(self.git(), &worktree, &["clean", "-fd"]);
        if !clean.success {
            warn!(task = %name, stderr = %clean.message(), "git clean failed");
        }

        info!(task = %name, reset_to = %main, "task worktree reset");
        Ok(ResetTask {
            task_name: name,
            reset_to: main,
            fetched,
        })
    }

    /// Read-only snapshot of one task. A missing task folder is reported
    /// with `exists == false` rather than as an error.
    pub fn task_status(&self, name: &str) -> Result<TaskStatusReport> {
        let name = validate_task_name(name)?;
        let task_dir = self.task_dir(&name);
        let worktree = self.worktree_path(&name);
        let mut report = TaskStatusReport {
            task_name: name.clone(),
            exists: task_dir.is_dir(),
            files: ScaffoldFiles::default(),
            has_worktree: worktree.exists(),
            branch: None,
            total_commits: None,
            last_commit: None,
            uncommitted_changes: 0,
            uncommitted_files: Vec::new(),
            results_summary: None,
            subagent: None,
            task_dir,
        };
        if !report.exists {
            return Ok(report);
        }

        report.files = ScaffoldFiles {
            spec: report.task_dir.join("spec.md").exists(),
            feedback: report.task_dir.join("feedback.md").exists(),
            results: report.task_dir.join("results.md").exists(),
        };

        if report.has_worktree {
            let git = self.git();
            report.branch = git::current_branch(git, &worktree);

            let count = git::run(git, &worktree, &["rev-list", "--count", "HEAD"]);
            report.total_commits = count
                .success
                .then(|| count.stdout.trim().parse().ok())
                .flatten();

            let status = git::run(git, &worktree, &["status", "--porcelain"]);
            if status.success {
                let changes: Vec<String> = status
                    .stdout
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .map(str::to_string)
                    .collect();
                report.uncommitted_changes = changes.len();
                report.uncommitted_files = changes.into_iter().take(UNCOMMITTED_FILES_SHOWN).collect();
            }

            let log = git::run(git, &worktree, &["log", "-1", "--format=%h %s"]);
            report.last_commit = Some(log.stdout.trim().to_string()).filter(|s| log.success && !s.is_empty());
        }

        report.results_summary = std::fs::read_to_string(report.task_dir.join("results.md"))
            .ok()
            .and_then(|content| results_summary(&content));

        report.subagent = self.health().read_status(&name).ok().and_then(|r| r.status);
        Ok(report)
    }

    /// Status of every `task-*` folder, in name order.
    pub fn list_tasks(&self) -> Result<Vec<TaskStatusReport>> {
        self.task_names()?
            .iter()
            .filter(|name| validate_task_name(name).is_ok())
            .map(|name| self.task_status(name))
            .collect()
    }

    // -- helpers -------------------------------------------------------------

    pub(crate) fn existing_worktree(&self, name: &str) -> Result<PathBuf> {
        let worktree = self.worktree_path(name);
        if !self.task_dir(name).is_dir() {
            return Err(OperatorError::task_not_found(name, self.task_dir(name).display()));
        }
        if !worktree.is_dir() {
            return Err(OperatorError::worktree_not_found(name, worktree.display()));
        }
        Ok(worktree)
    }

    /// `git fetch <remote>`; failures only log.
    pub(crate) fn fetch(&self, dir: &Path) -> bool {
        let remote = &self.config().remote;
        let output = git::run(self.git(), dir, &["fetch", remote]);
        if !output.success {
            warn!(remote = %remote, stderr = %output.message(), "fetch failed; continuing with local refs");
        }
        output.success
    }
}

fn write_scaffold(task_dir: &Path, ticket: &str, name: &str, branch: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(task_dir)?;
    let today = Local::now().format("%Y-%m-%d");
    std::fs::write(
        task_dir.join("spec.md"),
        format!(
            "# Task: {name}\n\
             \n\
             ## Ticket: {ticket}\n\
             ## Branch: {branch}\n\
             ## Created: {today}\n\
             \n\
             ---\n\
             \n\
             ## Objective\n\
             \n\
             _Describe the objective here_\n\
             \n\
             ---\n\
             \n\
             ## Requirements\n\
             \n\
             1. _Requirement 1_\n\
             \n\
             ## Files to Modify\n\
             \n\
             - `path/to/file` - _what to change_\n\
             \n\
             ## Acceptance Criteria\n\
             \n\
             - [ ] All existing tests pass\n\
             \n\
             ## Hints\n\
             \n\
             - _Helpful hints_\n"
        ),
    )?;
    std::fs::write(
        task_dir.join("feedback.md"),
        format!("# Feedback: {name}\n\n_No feedback yet_\n"),
    )?;
    std::fs::write(
        task_dir.join("results.md"),
        format!("# Results: {name}\n\n_Results will be written by sub-agent_\n"),
    )?;
    Ok(())
}

/// First line of results.md that is neither a heading nor a placeholder.
fn results_summary(content: &str) -> Option<String> {
    content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with('_'))
        .map(|l| l.chars().take(RESULTS_SUMMARY_CHARS).collect())
}
