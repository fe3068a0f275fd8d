//! Accepting a task: rebase, test, merge, test, push, clean up.
//!
//! Every side-effecting step binds its rollback action when it starts. A
//! failure before the point of no return (a successful push, or the
//! post-merge test gate when pushing is disabled) walks the recorded steps
//! backwards and restores the checkpoint taken at the start. Cleanup after
//! that point only produces warnings.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn, Instrument};
use wo_telemetry::operation::OperationTimer;

use crate::config::WorkspaceConfig;
use crate::errors::{ErrorCode, OperatorError, Result};
use crate::git::{self, GitOutput};
use crate::test_runner::{TestOutcome, TestRunner};
use crate::validation::{validate_branch_name, validate_task_name, validate_ticket};
use crate::workspace::Workspace;

const MERGE_SUBJECT_CHARS: usize = 50;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptOptions {
    pub push: bool,
    pub delete_remote_branch: bool,
    /// Overrides the configured or detected test command for both gates.
    pub test_command: Option<String>,
}

impl AcceptOptions {
    pub fn from_config(config: &WorkspaceConfig) -> Self {
        Self {
            push: config.push_after_accept,
            delete_remote_branch: config.delete_remote_branch,
            test_command: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    Checkpoint,
    Rebase,
    TestAfterRebase,
    SwitchToMain,
    Merge,
    TestAfterMerge,
    Push,
    RemoveWorktree,
    DeleteLocalBranch,
    DeleteRemoteBranch,
}

impl StepName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Checkpoint => "checkpoint",
            Self::Rebase => "rebase",
            Self::TestAfterRebase => "test_after_rebase",
            Self::SwitchToMain => "switch_to_main",
            Self::Merge => "merge",
            Self::TestAfterMerge => "test_after_merge",
            Self::Push => "push",
            Self::RemoveWorktree => "remove_worktree",
            Self::DeleteLocalBranch => "delete_local_branch",
            Self::DeleteRemoteBranch => "delete_remote_branch",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the repository was checked out to before the transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum OriginalHead {
    Branch(String),
    Detached(String),
}

/// Reversal of one step, bound when the step starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackAction {
    /// Abort any rebase in progress, then hard-reset the worktree.
    ResetWorktree { commit: String },
    /// Abort a rebase that never finished. The worktree is only reset if
    /// its HEAD moved off `commit`.
    AbortRebase { commit: String },
    /// Check the repository back out to what it was on.
    RestoreHead { head: OriginalHead },
    /// Abort any merge in progress, then hard-reset the checked-out main.
    ResetMain { commit: String },
    /// Abort a merge that never finished; the main ref is restored separately.
    AbortMerge,
}

impl RollbackAction {
    /// The reversal for a step that failed before completing. A rebase or
    /// merge git refused changed nothing, so only the abort applies.
    fn for_incomplete(self) -> Self {
        match self {
            Self::ResetWorktree { commit } => Self::AbortRebase { commit },
            Self::ResetMain { .. } => Self::AbortMerge,
            other => other,
        }
    }
}

impl fmt::Display for RollbackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResetWorktree { commit } => write!(f, "reset worktree to {commit}"),
            Self::AbortRebase { .. } => f.write_str("abort rebase"),
            Self::RestoreHead {
                head: OriginalHead::Branch(b),
            } => write!(f, "switch repository back to {b}"),
            Self::RestoreHead {
                head: OriginalHead::Detached(c),
            } => write!(f, "detach repository back at {c}"),
            Self::ResetMain { commit } => write!(f, "reset main to {commit}"),
            Self::AbortMerge => f.write_str("abort merge"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub name: StepName,
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    rollback: Option<RollbackAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub main_commit: String,
    pub worktree_commit: String,
    pub original_head: OriginalHead,
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptReport {
    pub success: bool,
    pub task_name: String,
    pub branch: String,
    pub main_branch: String,
    pub steps: Vec<Step>,
    pub log: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub checkpoint: Option<Checkpoint>,
    pub merge_message: Option<String>,
    pub test_after_rebase: Option<TestOutcome>,
    pub test_after_merge: Option<TestOutcome>,
    pub pushed: bool,
    /// Absent when no rollback was needed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolled_back: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rollback_errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperatorError>,
    pub message: String,
}

impl AcceptReport {
    pub fn step(&self, name: StepName) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }
}

// ---------------------------------------------------------------------------
// AcceptTransaction
// ---------------------------------------------------------------------------

/// One accept attempt. Lives for a single call and is never persisted.
pub struct AcceptTransaction<'a> {
    ws: &'a Workspace,
    task_name: String,
    branch: String,
    main: String,
    repo: PathBuf,
    worktree: PathBuf,
    task_dir: PathBuf,
    steps: Vec<Step>,
    checkpoint: Option<Checkpoint>,
    log: Vec<String>,
    warnings: Vec<String>,
    merge_message: Option<String>,
    test_after_rebase: Option<TestOutcome>,
    test_after_merge: Option<TestOutcome>,
    pushed: bool,
    main_touched: bool,
    past_point_of_no_return: bool,
}

impl<'a> AcceptTransaction<'a> {
    pub fn new(ws: &'a Workspace, ticket: &str, task_name: &str) -> Self {
        Self {
            ws,
            task_name: task_name.to_string(),
            branch: ws.task_branch(ticket, task_name),
            main: ws.config().main_branch.clone(),
            repo: ws.repo_path(),
            worktree: ws.worktree_path(task_name),
            task_dir: ws.task_dir(task_name),
            steps: Vec::new(),
            checkpoint: None,
            log: Vec::new(),
            warnings: Vec::new(),
            merge_message: None,
            test_after_rebase: None,
            test_after_merge: None,
            pushed: false,
            main_touched: false,
            past_point_of_no_return: false,
        }
    }

    /// Run every step; on failure before the point of no return, roll back.
    pub async fn execute(mut self, tests: &dyn TestRunner, opts: &AcceptOptions) -> AcceptReport {
        match self.run(tests, opts).await {
            Ok(()) => {
                let message = format!(
                    "Task '{}' accepted and merged into {}",
                    self.task_name, self.main
                );
                self.note(message.clone());
                self.into_report(true, None, None, Vec::new(), message)
            }
            Err(err) => {
                if let Some(step) = self.steps.last_mut().filter(|s| !s.completed) {
                    step.error = Some(err.message.clone());
                }
                error!(task = %self.task_name, code = %err.code, error = %err.message, "accept failed; rolling back");
                self.note(format!("FAILED: {}", err.message));
                let rollback_errors = self.rollback();
                let rolled_back = rollback_errors.is_empty();
                let message = if rolled_back {
                    format!("Accept of '{}' failed; repository restored", self.task_name)
                } else {
                    format!(
                        "Accept of '{}' failed and rollback was incomplete; manual intervention needed",
                        self.task_name
                    )
                };
                self.into_report(false, Some(err), Some(rolled_back), rollback_errors, message)
            }
        }
    }

    async fn run(&mut self, tests: &dyn TestRunner, opts: &AcceptOptions) -> Result<()> {
        let remote = self.ws.config().remote.clone();
        if self.ws.fetch(&self.worktree) {
            self.note(format!("Fetched {remote}"));
        } else {
            self.warn(format!("Fetch from {remote} failed; continuing with local refs"));
        }

        // -- checkpoint ------------------------------------------------------
        self.begin(StepName::Checkpoint, None);
        let checkpoint = self.capture_checkpoint()?;
        self.note(format!(
            "Checkpoint: {} at {}, worktree at {}",
            self.main, checkpoint.main_commit, checkpoint.worktree_commit
        ));
        self.checkpoint = Some(checkpoint.clone());
        self.complete();

        // -- rebase ----------------------------------------------------------
        let reset_worktree = RollbackAction::ResetWorktree {
            commit: checkpoint.worktree_commit.clone(),
        };
        self.begin(StepName::Rebase, Some(reset_worktree.clone()));
        let output = self.git(&self.worktree, &["rebase", &self.main]);
        if !output.success {
            return Err(self.rebase_error(&output));
        }
        self.complete();

        self.begin(StepName::TestAfterRebase, Some(reset_worktree));
        let outcome = tests
            .run(&self.worktree, opts.test_command.as_deref(), self.ws.test_timeout())
            .await;
        let passed = outcome.passed;
        let failure = (!passed).then(|| test_error("rebase", &outcome));
        self.test_after_rebase = Some(outcome);
        if let Some(err) = failure {
            return Err(err);
        }
        self.complete();

        // -- merge -----------------------------------------------------------
        self.begin(
            StepName::SwitchToMain,
            Some(RollbackAction::RestoreHead {
                head: checkpoint.original_head.clone(),
            }),
        );
        let output = self.git(&self.repo, &["switch", &self.main]);
        if !output.success {
            return Err(OperatorError::new(
                ErrorCode::CheckoutFailed,
                format!("Failed to switch to {}: {}", self.main, output.message()),
            )
            .with_hint("The primary clone may have uncommitted changes.")
            .with_recovery(format!("Inspect: cd {} && git status", self.repo.display())));
        }
        self.complete();

        let reset_main = RollbackAction::ResetMain {
            commit: checkpoint.main_commit.clone(),
        };
        let message = merge_message(
            &self.task_name,
            std::fs::read_to_string(self.task_dir.join("spec.md")).ok().as_deref(),
        );
        self.merge_message = Some(message.clone());
        self.begin(StepName::Merge, Some(reset_main.clone()));
        self.main_touched = true;
        let output = self.git(&self.repo, &["merge", "--no-ff", &self.branch, "-m", &message]);
        if !output.success {
            return Err(self.merge_error(&output));
        }
        self.complete();

        self.begin(StepName::TestAfterMerge, Some(reset_main.clone()));
        let outcome = tests
            .run(&self.repo, opts.test_command.as_deref(), self.ws.test_timeout())
            .await;
        let passed = outcome.passed;
        let failure = (!passed).then(|| test_error("merge", &outcome));
        self.test_after_merge = Some(outcome);
        if let Some(err) = failure {
            return Err(err);
        }
        self.complete();

        // -- push ------------------------------------------------------------
        if opts.push {
            self.begin(StepName::Push, Some(reset_main));
            let output = self.git(&self.repo, &["push", &remote, &self.main]);
            if !output.success {
                return Err(OperatorError::new(
                    ErrorCode::PushFailed,
                    format!("Push of {} to {remote} failed: {}", self.main, output.message()),
                )
                .with_hint("The merge was rolled back; nothing reached the remote.")
                .with_recovery(format!("Check access: git ls-remote {remote}"))
                .with_recovery("Retry with --no-push to merge locally only"));
            }
            self.pushed = true;
            self.complete();
        }

        self.past_point_of_no_return = true;
        self.note("Point of no return reached; cleaning up".to_string());
        self.cleanup(&remote, opts.delete_remote_branch);
        Ok(())
    }

    // -- checkpoint ----------------------------------------------------------

    fn capture_checkpoint(&self) -> Result<Checkpoint> {
        let git = self.ws.git();
        let checkpoint_error = |e: String| {
            OperatorError::new(ErrorCode::GitCommandFailed, format!("Could not record checkpoint: {e}"))
                .with_hint("Check that the main branch exists in the primary clone.")
        };
        let main_commit = git::rev_parse(git, &self.repo, &self.main).map_err(checkpoint_error)?;
        let worktree_commit = git::rev_parse(git, &self.worktree, "HEAD").map_err(checkpoint_error)?;
        let original_head = match git::current_branch(git, &self.repo) {
            Some(branch) => OriginalHead::Branch(branch),
            None => OriginalHead::Detached(git::rev_parse(git, &self.repo, "HEAD").map_err(checkpoint_error)?),
        };
        Ok(Checkpoint {
            main_commit,
            worktree_commit,
            original_head,
        })
    }

    // -- cleanup -------------------------------------------------------------

    fn cleanup(&mut self, remote: &str, delete_remote_branch: bool) {
        let worktree = self.worktree.to_string_lossy().into_owned();

        self.begin(StepName::RemoveWorktree, None);
        let removed = self.git(&self.repo, &["worktree", "remove", &worktree]).success
            || self.git(&self.repo, &["worktree", "remove", "--force", &worktree]).success;
        self.finish_cleanup(removed, format!("Could not remove worktree {worktree}"));

        self.begin(StepName::DeleteLocalBranch, None);
        let deleted = self.git(&self.repo, &["branch", "-d", &self.branch]).success
            || self.git(&self.repo, &["branch", "-D", &self.branch]).success;
        self.finish_cleanup(deleted, format!("Could not delete local branch {}", self.branch));

        if delete_remote_branch {
            self.begin(StepName::DeleteRemoteBranch, None);
            let deleted = self
                .git(&self.repo, &["push", remote, "--delete", &self.branch])
                .success;
            self.finish_cleanup(
                deleted,
                format!("Remote branch {} not found or already deleted", self.branch),
            );
        }
    }

    fn finish_cleanup(&mut self, ok: bool, warning: String) {
        if ok {
            self.complete();
            return;
        }
        if let Some(step) = self.steps.last_mut() {
            step.error = Some(format!("{}: {warning}", ErrorCode::CleanupFailed));
        }
        self.warn(warning);
    }

    // -- rollback ------------------------------------------------------------

    /// Undo recorded steps newest first, then put the repository's HEAD and
    /// the main ref back to the checkpoint. Returns what could not be undone.
    fn rollback(&mut self) -> Vec<String> {
        let mut errors = Vec::new();
        let Some(checkpoint) = self.checkpoint.clone() else {
            self.note("Nothing to roll back (no checkpoint was taken)".to_string());
            return errors;
        };
        if self.past_point_of_no_return {
            return errors;
        }

        let actions: Vec<(StepName, RollbackAction)> = self
            .steps
            .iter()
            .rev()
            .filter_map(|s| {
                let action = s.rollback.clone()?;
                let action = match s.name {
                    StepName::Rebase | StepName::Merge if !s.completed => action.for_incomplete(),
                    _ => action,
                };
                Some((s.name, action))
            })
            .collect();
        let mut undone: Vec<RollbackAction> = Vec::new();
        for (step, action) in actions {
            if undone.contains(&action) {
                continue;
            }
            self.note(format!("Rolling back {step}: {action}"));
            if let Err(e) = self.undo(&action) {
                warn!(task = %self.task_name, %step, error = %e, "rollback action failed");
                errors.push(format!("{step}: {e}"));
            }
            undone.push(action);
        }

        if let Err(e) = self.restore_head(&checkpoint.original_head) {
            errors.push(format!("restore head: {e}"));
        }
        if self.main_touched {
            if let Err(e) = self.restore_main_ref(&checkpoint.main_commit) {
                errors.push(format!("restore {}: {e}", self.main));
            }
        }

        if errors.is_empty() {
            self.note("Rollback complete".to_string());
        } else {
            error!(task = %self.task_name, errors = ?errors, "rollback incomplete");
        }
        errors
    }

    fn undo(&self, action: &RollbackAction) -> std::result::Result<(), String> {
        match action {
            RollbackAction::ResetWorktree { commit } => {
                let _ = self.git(&self.worktree, &["rebase", "--abort"]);
                expect_success(self.git(&self.worktree, &["reset", "--hard", commit]))
            }
            RollbackAction::AbortRebase { commit } => {
                let _ = self.git(&self.worktree, &["rebase", "--abort"]);
                if git::rev_parse(self.ws.git(), &self.worktree, "HEAD")? == *commit {
                    return Ok(());
                }
                expect_success(self.git(&self.worktree, &["reset", "--hard", commit]))
            }
            RollbackAction::RestoreHead { head } => self.switch_to(head),
            RollbackAction::ResetMain { commit } => {
                let _ = self.git(&self.repo, &["merge", "--abort"]);
                expect_success(self.git(&self.repo, &["reset", "--hard", commit]))
            }
            RollbackAction::AbortMerge => {
                let _ = self.git(&self.repo, &["merge", "--abort"]);
                Ok(())
            }
        }
    }

    fn restore_head(&self, head: &OriginalHead) -> std::result::Result<(), String> {
        let git = self.ws.git();
        let current = match git::current_branch(git, &self.repo) {
            Some(branch) => OriginalHead::Branch(branch),
            None => OriginalHead::Detached(git::rev_parse(git, &self.repo, "HEAD")?),
        };
        if &current == head {
            return Ok(());
        }
        self.switch_to(head)
    }

    fn switch_to(&self, head: &OriginalHead) -> std::result::Result<(), String> {
        match head {
            OriginalHead::Branch(branch) => expect_success(self.git(&self.repo, &["switch", branch])),
            OriginalHead::Detached(commit) => {
                expect_success(self.git(&self.repo, &["switch", "--detach", commit]))
            }
        }
    }

    /// Force the main ref back to `commit` if it moved.
    fn restore_main_ref(&self, commit: &str) -> std::result::Result<(), String> {
        let git = self.ws.git();
        if git::rev_parse(git, &self.repo, &self.main)? == commit {
            return Ok(());
        }
        if git::current_branch(git, &self.repo).as_deref() == Some(self.main.as_str()) {
            expect_success(self.git(&self.repo, &["reset", "--hard", commit]))
        } else {
            expect_success(self.git(&self.repo, &["branch", "-f", &self.main, commit]))
        }
    }

    // -- errors --------------------------------------------------------------

    fn rebase_error(&self, output: &GitOutput) -> OperatorError {
        match git::detect_conflict(self.ws.git(), &self.worktree, output) {
            Some(paths) => {
                let mut err = OperatorError::new(
                    ErrorCode::RebaseConflict,
                    format!("Rebase onto {} has conflicts", self.main),
                )
                .with_hint(format!(
                    "Sync the task, resolve the conflicts in the worktree, then accept again: operator task sync {}",
                    self.task_name
                ));
                for path in paths {
                    err = err.with_recovery(format!("Resolve conflicts in: {path}"));
                }
                err
            }
            None => OperatorError::new(
                ErrorCode::RebaseFailed,
                format!("Rebase failed: {}", output.message()),
            ),
        }
    }

    fn merge_error(&self, output: &GitOutput) -> OperatorError {
        match git::detect_conflict(self.ws.git(), &self.repo, output) {
            Some(paths) => {
                let mut err = OperatorError::new(
                    ErrorCode::MergeConflict,
                    format!("Merge of {} into {} has conflicts", self.branch, self.main),
                )
                .with_hint("Sync the task onto the main branch and resolve the conflicts there.");
                for path in paths {
                    err = err.with_recovery(format!("Resolve conflicts in: {path}"));
                }
                err
            }
            None => OperatorError::new(
                ErrorCode::MergeFailed,
                format!("Merge failed: {}", output.message()),
            ),
        }
    }

    // -- bookkeeping ---------------------------------------------------------

    fn git(&self, dir: &Path, args: &[&str]) -> GitOutput {
        git::run(self.ws.git(), dir, args)
    }

    fn begin(&mut self, name: StepName, rollback: Option<RollbackAction>) {
        self.note(format!("{name}..."));
        self.steps.push(Step {
            name,
            completed: false,
            error: None,
            rollback,
        });
    }

    fn complete(&mut self) {
        if let Some(step) = self.steps.last_mut() {
            step.completed = true;
            let line = format!("{} done", step.name);
            self.note(line);
        }
    }

    fn note(&mut self, line: String) {
        info!(task = %self.task_name, "{line}");
        self.log.push(line);
    }

    fn warn(&mut self, warning: String) {
        warn!(task = %self.task_name, "{warning}");
        self.log.push(format!("WARNING: {warning}"));
        self.warnings.push(warning);
    }

    fn into_report(
        self,
        success: bool,
        error: Option<OperatorError>,
        rolled_back: Option<bool>,
        rollback_errors: Vec<String>,
        message: String,
    ) -> AcceptReport {
        AcceptReport {
            success,
            task_name: self.task_name,
            branch: self.branch,
            main_branch: self.main,
            steps: self.steps,
            log: self.log,
            warnings: self.warnings,
            checkpoint: self.checkpoint,
            merge_message: self.merge_message,
            test_after_rebase: self.test_after_rebase,
            test_after_merge: self.test_after_merge,
            pushed: self.pushed,
            rolled_back,
            rollback_errors,
            error,
            message,
        }
    }
}

fn expect_success(output: GitOutput) -> std::result::Result<(), String> {
    if output.success {
        Ok(())
    } else {
        Err(output.message())
    }
}

/// Error for a failed test gate, keeping the runner's own code.
fn test_error(gate: &str, outcome: &TestOutcome) -> OperatorError {
    let mut err = outcome
        .error
        .clone()
        .unwrap_or_else(|| OperatorError::new(ErrorCode::TestsFailed, "tests did not pass"));
    err.message = format!("Tests failed after {gate}: {}", err.message);
    err
}

/// `Merge <task>: <objective>`, where the objective is the first non-empty,
/// non-heading line under `## Objective` in the task's spec.
pub fn merge_message(task_name: &str, spec: Option<&str>) -> String {
    let objective = spec.and_then(|spec| {
        spec.lines()
            .skip_while(|l| !l.starts_with("## Objective"))
            .skip(1)
            .map(str::trim)
            .find(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|l| l.chars().take(MERGE_SUBJECT_CHARS).collect::<String>())
    });
    match objective {
        Some(objective) => format!("Merge {task_name}: {objective}"),
        None => format!("Merge {task_name}"),
    }
}

/// Refuse to start while `dir` has uncommitted changes to tracked files.
/// Rollback resets to commits, so such changes could not be restored.
fn ensure_clean(git: &dyn git::GitRunner, dir: &Path, what: &str) -> Result<()> {
    let changes = git::uncommitted_tracked(git, dir).map_err(|e| {
        OperatorError::new(ErrorCode::GitCommandFailed, format!("Could not inspect {what}: {e}"))
    })?;
    if changes.is_empty() {
        return Ok(());
    }
    let mut err = OperatorError::new(
        ErrorCode::UncommittedChanges,
        format!("Uncommitted changes in {what}: {} file(s)", changes.len()),
    )
    .with_hint("Commit or stash them before accepting; nothing was touched.")
    .with_recovery(format!("Inspect: cd {} && git status", dir.display()));
    for line in changes.iter().take(5) {
        err = err.with_recovery(format!("Uncommitted: {}", line.trim()));
    }
    Err(err)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

impl Workspace {
    /// Accept a task under the workspace lock.
    ///
    /// Validation, missing repository or worktree, lock contention and
    /// uncommitted tracked changes are returned as `Err` before anything is
    /// touched. Once the transaction
    /// starts, the outcome (including failures and rollback) is in the
    /// returned report.
    pub async fn accept_task(
        &self,
        ticket: &str,
        name: &str,
        opts: &AcceptOptions,
        tests: &dyn TestRunner,
    ) -> Result<AcceptReport> {
        let ticket = validate_ticket(ticket)?;
        let name = validate_task_name(name)?;
        validate_branch_name(&self.config().main_branch)?;

        let repo = self.repo_path();
        if !repo.is_dir() {
            return Err(OperatorError::repo_not_found(repo.display()));
        }
        let worktree = self.worktree_path(&name);
        if !worktree.is_dir() {
            return Err(OperatorError::worktree_not_found(&name, worktree.display()));
        }

        let _lock = self.lock(&format!("accept_task:{name}")).await?;
        ensure_clean(self.git(), &worktree, &format!("the worktree of task '{name}'"))?;
        ensure_clean(self.git(), &repo, "the primary clone")?;

        let timer = OperationTimer::start("accept_task");
        info!(task = %name, ticket = %ticket, push = opts.push, "accepting task");

        let report = AcceptTransaction::new(self, &ticket, &name)
            .execute(tests, opts)
            .instrument(timer.span().clone())
            .await;
        timer.finish(report.success);
        Ok(report)
    }
}
