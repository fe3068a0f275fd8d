//! Inspecting and resolving a rebase or merge left stopped on conflicts in
//! a task's worktree.
//!
//! `sync_task` and `accept_task` abort their own conflicts. These operations
//! are for a rebase the operator starts by hand (`git rebase <main>` in the
//! worktree) to carry a task across a conflicting change.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{ErrorCode, OperatorError, Result};
use crate::git::{self, GitRunner};
use crate::validation::validate_task_name;
use crate::workspace::Workspace;

const PREVIEW_LINES: usize = 20;
const SIDE_PREVIEW_LINES: usize = 10;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitOperation {
    Rebase,
    Merge,
}

impl GitOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rebase => "rebase",
            Self::Merge => "merge",
        }
    }
}

impl fmt::Display for GitOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of a conflict to keep.
///
/// These are git's own `--ours`/`--theirs`. During a rebase `ours` is the
/// branch being rebased onto and `theirs` is the task's commit being
/// replayed; during a merge `ours` is the checked-out branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Ours,
    Theirs,
    /// Leave the file for hand editing; nothing is staged.
    Manual,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ours => "ours",
            Self::Theirs => "theirs",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = OperatorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ours" => Ok(Self::Ours),
            "theirs" => Ok(Self::Theirs),
            "manual" => Ok(Self::Manual),
            _ => Err(OperatorError::invalid_input(
                format!("Invalid resolution '{s}'"),
                "Use one of: ours, theirs, manual.",
            )),
        }
    }
}

/// What the conflict markers in one file look like.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictMarkers {
    pub conflict_count: usize,
    /// The first conflict block, markers included.
    pub preview: String,
    pub ours_preview: String,
    pub theirs_preview: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictedFile {
    pub path: String,
    #[serde(flatten)]
    pub markers: ConflictMarkers,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub task_name: String,
    pub has_conflicts: bool,
    /// `None` when no rebase or merge is stopped in the worktree.
    pub operation: Option<GitOperation>,
    pub files: Vec<ConflictedFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveReport {
    pub success: bool,
    pub task_name: String,
    pub resolution: Resolution,
    pub resolved: Vec<String>,
    /// Files left for hand editing (`manual`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manual: Vec<String>,
    pub failed: Vec<FileFailure>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinueReport {
    pub success: bool,
    pub task_name: String,
    pub operation: GitOperation,
    /// The operation stopped again (or still has unresolved files).
    pub more_conflicts: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicted_files: Vec<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortReport {
    pub task_name: String,
    pub operation: GitOperation,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// The repository's git directory as seen from `dir`. For a linked
/// worktree this is its private directory under the main `.git`.
fn git_dir(git: &dyn GitRunner, dir: &Path) -> Option<PathBuf> {
    let output = git::run(git, dir, &["rev-parse", "--git-dir"]);
    let raw = output.stdout.trim();
    if !output.success || raw.is_empty() {
        return None;
    }
    let path = PathBuf::from(raw);
    Some(if path.is_absolute() { path } else { dir.join(path) })
}

/// The rebase or merge currently stopped in `dir`, if any.
pub fn operation_in_progress(git: &dyn GitRunner, dir: &Path) -> Option<GitOperation> {
    let git_dir = git_dir(git, dir)?;
    if git_dir.join("rebase-merge").exists() || git_dir.join("rebase-apply").exists() {
        Some(GitOperation::Rebase)
    } else if git_dir.join("MERGE_HEAD").exists() {
        Some(GitOperation::Merge)
    } else {
        None
    }
}

/// Count the conflict blocks in `content` and capture the first one.
pub fn scan_markers(content: &str) -> ConflictMarkers {
    let mut markers = ConflictMarkers::default();
    let mut preview: Vec<&str> = Vec::new();
    let mut ours: Vec<&str> = Vec::new();
    let mut theirs: Vec<&str> = Vec::new();

    #[derive(PartialEq)]
    enum Side {
        Outside,
        Ours,
        Theirs,
    }
    let mut side = Side::Outside;
    let mut first_done = false;

    for line in content.lines() {
        if line.starts_with("<<<<<<<") {
            markers.conflict_count += 1;
            side = Side::Ours;
            if !first_done {
                preview.push(line);
            }
        } else if line.starts_with("=======") && side != Side::Outside {
            side = Side::Theirs;
            if !first_done {
                preview.push(line);
            }
        } else if line.starts_with(">>>>>>>") && side != Side::Outside {
            side = Side::Outside;
            if !first_done {
                preview.push(line);
                first_done = true;
            }
        } else if !first_done {
            match side {
                Side::Ours => {
                    preview.push(line);
                    ours.push(line);
                }
                Side::Theirs => {
                    preview.push(line);
                    theirs.push(line);
                }
                Side::Outside => {}
            }
        }
    }

    let truncated = preview.len() > PREVIEW_LINES;
    preview.truncate(PREVIEW_LINES);
    markers.preview = preview.join("\n");
    if truncated {
        markers.preview.push_str("\n... (truncated)");
    }
    ours.truncate(SIDE_PREVIEW_LINES);
    theirs.truncate(SIDE_PREVIEW_LINES);
    markers.ours_preview = ours.join("\n");
    markers.theirs_preview = theirs.join("\n");
    markers
}

/// Conflicted files in `dir` with their marker summaries.
pub fn detect_conflicts(git: &dyn GitRunner, dir: &Path) -> (Option<GitOperation>, Vec<ConflictedFile>) {
    let operation = operation_in_progress(git, dir);
    let files = git::unmerged_paths(git, dir)
        .into_iter()
        .map(|path| {
            let markers = std::fs::read_to_string(dir.join(&path))
                .map(|content| scan_markers(&content))
                .unwrap_or_default();
            ConflictedFile { path, markers }
        })
        .collect();
    (operation, files)
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

impl Workspace {
    /// Read-only: what is stopped in the task's worktree and which files
    /// conflict.
    pub fn task_conflicts(&self, name: &str) -> Result<ConflictReport> {
        let name = validate_task_name(name)?;
        let worktree = self.existing_worktree(&name)?;
        let (operation, files) = detect_conflicts(self.git(), &worktree);
        Ok(ConflictReport {
            task_name: name,
            has_conflicts: !files.is_empty(),
            operation,
            files,
        })
    }

    /// Resolve `files` (every conflicted file when empty) by keeping one
    /// side and staging the result.
    pub async fn resolve_conflicts(
        &self,
        name: &str,
        resolution: Resolution,
        files: &[String],
    ) -> Result<ResolveReport> {
        let name = validate_task_name(name)?;
        let _lock = self.lock(&format!("resolve_conflicts:{name}")).await?;
        let worktree = self.existing_worktree(&name)?;
        let git = self.git();

        let conflicted = git::unmerged_paths(git, &worktree);
        let targets: Vec<String> = if files.is_empty() {
            if resolution == Resolution::Manual {
                return Err(OperatorError::invalid_input(
                    "Manual resolution needs explicit file names",
                    "Name the files to leave for editing, or resolve all with ours/theirs.",
                ));
            }
            conflicted.clone()
        } else {
            files.to_vec()
        };

        let mut report = ResolveReport {
            success: true,
            task_name: name.clone(),
            resolution,
            resolved: Vec::new(),
            manual: Vec::new(),
            failed: Vec::new(),
            message: String::new(),
        };
        for path in targets {
            if !conflicted.contains(&path) {
                report.failed.push(FileFailure {
                    error: format!("'{path}' has no unresolved conflict"),
                    path,
                });
                continue;
            }
            match resolve_file(git, &worktree, &path, resolution) {
                Ok(()) if resolution == Resolution::Manual => report.manual.push(path),
                Ok(()) => report.resolved.push(path),
                Err(error) => {
                    warn!(task = %name, path = %path, error = %error, "could not resolve file");
                    report.failed.push(FileFailure { path, error });
                }
            }
        }

        report.success = report.failed.is_empty();
        report.message = if report.resolved.is_empty() && report.manual.is_empty() && report.success {
            "No conflicts to resolve".to_string()
        } else if resolution == Resolution::Manual {
            format!(
                "Left {} file(s) for manual resolution; edit them, then: git add <file>",
                report.manual.len()
            )
        } else {
            let mut message = format!(
                "Resolved {} file(s) using {resolution}",
                report.resolved.len()
            );
            if !report.failed.is_empty() {
                message.push_str(&format!(", {} failed", report.failed.len()));
            }
            message
        };
        info!(
            task = %name,
            %resolution,
            resolved = report.resolved.len(),
            failed = report.failed.len(),
            "conflicts resolved"
        );
        Ok(report)
    }

    /// Carry on with the stopped rebase or merge once every file is
    /// resolved. `message` sets the merge commit message.
    pub async fn continue_operation(&self, name: &str, message: Option<&str>) -> Result<ContinueReport> {
        let name = validate_task_name(name)?;
        let _lock = self.lock(&format!("continue_operation:{name}")).await?;
        let worktree = self.existing_worktree(&name)?;
        let git = self.git();
        let operation = operation_in_progress(git, &worktree)
            .ok_or_else(|| nothing_in_progress(&name))?;

        let mut report = ContinueReport {
            success: false,
            task_name: name.clone(),
            operation,
            more_conflicts: false,
            conflicted_files: Vec::new(),
            message: String::new(),
        };

        let unresolved = git::unmerged_paths(git, &worktree);
        if !unresolved.is_empty() {
            report.message = format!("Cannot continue: {} file(s) still conflict", unresolved.len());
            report.more_conflicts = true;
            report.conflicted_files = unresolved;
            return Ok(report);
        }

        let output = match (operation, message) {
            (GitOperation::Rebase, _) => {
                git::run(git, &worktree, &["-c", "core.editor=true", "rebase", "--continue"])
            }
            (GitOperation::Merge, Some(message)) => git::run(git, &worktree, &["commit", "-m", message]),
            (GitOperation::Merge, None) => git::run(git, &worktree, &["commit", "--no-edit"]),
        };

        let again = git::unmerged_paths(git, &worktree);
        if !again.is_empty() {
            report.message = format!("{operation} continued but stopped on more conflicts");
            report.more_conflicts = true;
            report.conflicted_files = again;
        } else if !output.success {
            report.message = format!("{operation} could not continue: {}", output.message());
        } else if operation_in_progress(git, &worktree).is_some() {
            report.message = format!("{operation} continued but has not finished");
        } else {
            report.success = true;
            report.message = format!("{operation} completed");
        }
        info!(task = %name, %operation, success = report.success, "continued after conflicts");
        Ok(report)
    }

    /// Abandon the stopped rebase or merge, returning the worktree to where
    /// it was before it started.
    pub async fn abort_operation(&self, name: &str) -> Result<AbortReport> {
        let name = validate_task_name(name)?;
        let _lock = self.lock(&format!("abort_operation:{name}")).await?;
        let worktree = self.existing_worktree(&name)?;
        let git = self.git();
        let operation = operation_in_progress(git, &worktree)
            .ok_or_else(|| nothing_in_progress(&name))?;

        let output = git::run(git, &worktree, &[operation.as_str(), "--abort"]);
        if !output.success {
            return Err(OperatorError::new(
                ErrorCode::GitCommandFailed,
                format!("Failed to abort {operation}: {}", output.message()),
            )
            .with_recovery(format!(
                "Inspect: cd {} && git status",
                worktree.display()
            )));
        }
        info!(task = %name, %operation, "aborted");
        Ok(AbortReport {
            task_name: name,
            operation,
            message: format!("{operation} aborted; worktree returned to its previous state"),
        })
    }
}

fn resolve_file(
    git: &dyn GitRunner,
    dir: &Path,
    path: &str,
    resolution: Resolution,
) -> std::result::Result<(), String> {
    let side = match resolution {
        Resolution::Manual => return Ok(()),
        Resolution::Ours => "--ours",
        Resolution::Theirs => "--theirs",
    };
    let output = git::run(git, dir, &["checkout", side, "--", path]);
    if !output.success {
        return Err(format!("checkout {side} failed: {}", output.message()));
    }
    let output = git::run(git, dir, &["add", "--", path]);
    if !output.success {
        return Err(format!("staging failed: {}", output.message()));
    }
    Ok(())
}

fn nothing_in_progress(task: &str) -> OperatorError {
    OperatorError::new(
        ErrorCode::NoOperationInProgress,
        format!("No rebase or merge is in progress for task '{task}'"),
    )
    .with_hint("Start one first, e.g. `git rebase <main>` in the worktree.")
    .with_recovery(format!("Check state: operator task conflicts {task}"))
}
