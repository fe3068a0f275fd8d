//! Task dependency graph parsed from the workspace `plan.md`.
//!
//! The plan document is the single source of truth for task status; nothing
//! here writes back to it or caches it between queries. A task section looks
//! like:
//!
//! ```markdown
//! ### 2. `task-b`
//! - Status: PENDING
//! - Dependencies: task-a, `task-c`
//! - Branch: feature/K-1/task-b
//! - Priority: HIGH
//! - Description: Wire the new parser into the CLI
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::errors::{ErrorCode, OperatorError};

pub const PLAN_FILE: &str = "plan.md";

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    InProgress,
    InReview,
    Iterating,
    Completed,
    Done,
    Merged,
    Blocked,
    Abandoned,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 9] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::InReview,
        TaskStatus::Iterating,
        TaskStatus::Completed,
        TaskStatus::Done,
        TaskStatus::Merged,
        TaskStatus::Blocked,
        TaskStatus::Abandoned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::InReview => "IN_REVIEW",
            TaskStatus::Iterating => "ITERATING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Done => "DONE",
            TaskStatus::Merged => "MERGED",
            TaskStatus::Blocked => "BLOCKED",
            TaskStatus::Abandoned => "ABANDONED",
        }
    }

    /// COMPLETED, DONE and MERGED all satisfy a dependency.
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Done | TaskStatus::Merged
        )
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            TaskStatus::InProgress | TaskStatus::InReview | TaskStatus::Iterating
        )
    }

    /// Case-insensitive; anything unrecognized is PENDING.
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or(TaskStatus::Pending)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == upper)
            .ok_or_else(|| format!("unknown task status: {s}"))
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub status: TaskStatus,
    pub dependencies: Vec<String>,
    pub branch: Option<String>,
    pub priority: Option<String>,
    pub description: Option<String>,
}

impl Task {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: TaskStatus::Pending,
            dependencies: Vec::new(),
            branch: None,
            priority: None,
            description: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("plan.md not found at {}", .0.display())]
    NotFound(PathBuf),
    #[error("Failed to read plan.md at {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<PlanError> for OperatorError {
    fn from(err: PlanError) -> Self {
        OperatorError::new(ErrorCode::PlanParseFailed, err.to_string())
            .with_hint("Create a plan.md in the workspace root with one `### task-name` section per task")
    }
}

// ---------------------------------------------------------------------------
// PlanGraph
// ---------------------------------------------------------------------------

/// Parsed plan: tasks in document order plus a name index.
#[derive(Debug, Clone, Default)]
pub struct PlanGraph {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedTask {
    pub missing: Vec<String>,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnblockedReport {
    pub unblocked: Vec<String>,
    pub blocked: BTreeMap<String, BlockedTask>,
    pub in_progress: Vec<String>,
    pub completed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyCheck {
    pub can_spawn: bool,
    pub task_exists: bool,
    pub status: Option<TaskStatus>,
    pub missing: Vec<String>,
    pub completed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl PlanGraph {
    /// Read and parse `path`.
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        if !path.exists() {
            return Err(PlanError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path).map_err(|source| PlanError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let graph = Self::parse(&content);
        debug!(plan = %path.display(), tasks = graph.len(), "plan parsed");
        Ok(graph)
    }

    /// Parse a plan document. Never fails: malformed sections are skipped and
    /// malformed fields fall back to defaults.
    pub fn parse(content: &str) -> Self {
        let mut graph = PlanGraph::default();
        let mut current: Option<Section> = None;

        for line in content.lines() {
            if let Some(name) = parse_task_header(line) {
                if let Some(section) = current.take() {
                    graph.insert(section.task);
                }
                current = Some(Section::new(name));
                continue;
            }
            if is_section_break(line) {
                if let Some(section) = current.take() {
                    graph.insert(section.task);
                }
                continue;
            }
            if let Some(section) = current.as_mut() {
                section.apply(line);
            }
        }
        if let Some(section) = current.take() {
            graph.insert(section.task);
        }
        graph
    }

    /// A later section with the same name replaces the earlier one but keeps
    /// its position.
    fn insert(&mut self, task: Task) {
        match self.index.get(&task.name) {
            Some(&i) => self.tasks[i] = task,
            None => {
                self.index.insert(task.name.clone(), self.tasks.len());
                self.tasks.push(task);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Task> {
        self.index.get(name).map(|&i| &self.tasks[i])
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn with_status(&self, status: TaskStatus) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(move |t| t.status == status)
    }

    fn dependency_met(&self, dep: &str) -> bool {
        self.get(dep).is_some_and(|t| t.status.is_completed())
    }

    /// Bucket every task. A task is unblocked iff it is PENDING/BLOCKED and
    /// every dependency exists and is completed; cycles simply stay blocked.
    pub fn get_unblocked(&self) -> UnblockedReport {
        let mut report = UnblockedReport::default();
        for task in &self.tasks {
            if task.status.is_completed() {
                report.completed.push(task.name.clone());
                continue;
            }
            if task.status.is_in_progress() {
                report.in_progress.push(task.name.clone());
                continue;
            }
            if task.status == TaskStatus::Abandoned {
                continue;
            }

            let missing: Vec<String> = task
                .dependencies
                .iter()
                .filter(|dep| !self.dependency_met(dep))
                .cloned()
                .collect();
            if missing.is_empty() {
                report.unblocked.push(task.name.clone());
            } else {
                report.blocked.insert(
                    task.name.clone(),
                    BlockedTask {
                        missing,
                        status: task.status,
                    },
                );
            }
        }
        report
    }

    /// Whether `name` may be spawned now.
    pub fn check_dependencies(&self, name: &str) -> DependencyCheck {
        let Some(task) = self.get(name) else {
            warn!(task = name, "task not found in plan.md, allowing spawn");
            return DependencyCheck {
                can_spawn: true,
                task_exists: false,
                status: None,
                missing: Vec::new(),
                completed: Vec::new(),
                warning: Some(format!("Task '{name}' not found in plan.md - spawning anyway")),
            };
        };

        if task.status.is_completed() {
            return DependencyCheck {
                can_spawn: false,
                task_exists: true,
                status: Some(task.status),
                missing: Vec::new(),
                completed: task.dependencies.clone(),
                warning: Some(format!("Task '{name}' is already {}", task.status)),
            };
        }

        if task.status.is_in_progress() {
            return DependencyCheck {
                can_spawn: true,
                task_exists: true,
                status: Some(task.status),
                missing: Vec::new(),
                completed: Vec::new(),
                warning: Some(format!("Task '{name}' is {} - re-spawning", task.status)),
            };
        }

        let (completed, missing): (Vec<String>, Vec<String>) = task
            .dependencies
            .iter()
            .cloned()
            .partition(|dep| self.dependency_met(dep));

        DependencyCheck {
            can_spawn: missing.is_empty(),
            task_exists: true,
            status: Some(task.status),
            missing,
            completed,
            warning: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Line parsing
// ---------------------------------------------------------------------------

/// `### 1. `name``, `### name`, `### `name`` → `name`.
fn parse_task_header(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("###")?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let mut rest = rest.trim();

    // Optional "N. " ordinal.
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    if digits > 0 {
        if let Some(after) = rest[digits..].strip_prefix('.') {
            if after.starts_with(char::is_whitespace) {
                rest = after.trim_start();
            }
        }
    }

    let rest = rest.strip_prefix('`').unwrap_or(rest);
    let rest = rest.strip_suffix('`').unwrap_or(rest);
    let valid = !rest.is_empty()
        && rest
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    valid.then_some(rest)
}

/// Any heading of level 1-3 ends the current task section.
fn is_section_break(line: &str) -> bool {
    let hashes = line.bytes().take_while(|&b| b == b'#').count();
    (1..=3).contains(&hashes)
        && line[hashes..].starts_with(char::is_whitespace)
}

/// One task section while it is being read. Status and dependencies have
/// meaningful defaults, so "already seen" is tracked apart from the value.
struct Section {
    task: Task,
    seen_status: bool,
    seen_dependencies: bool,
}

impl Section {
    fn new(name: &str) -> Self {
        Self {
            task: Task::new(name),
            seen_status: false,
            seen_dependencies: false,
        }
    }

    /// Apply a `- Key: value` line. The first occurrence of each key wins.
    fn apply(&mut self, line: &str) {
        let Some(rest) = line.trim_start().strip_prefix('-') else {
            return;
        };
        let Some((key, value)) = rest.trim_start().split_once(':') else {
            return;
        };
        let value = value.trim();
        let task = &mut self.task;

        match key.trim().to_ascii_lowercase().as_str() {
            "status" if !self.seen_status => {
                task.status = TaskStatus::parse_lenient(leading_word(value));
                self.seen_status = true;
            }
            "dependencies" if !self.seen_dependencies => {
                task.dependencies = parse_dependencies(value);
                self.seen_dependencies = true;
            }
            "branch" if task.branch.is_none() && !value.is_empty() => {
                task.branch = Some(value.trim_matches('`').to_string());
            }
            "priority" if task.priority.is_none() => {
                let word = leading_word(value);
                if !word.is_empty() {
                    task.priority = Some(word.to_ascii_uppercase());
                }
            }
            "description" if task.description.is_none() && !value.is_empty() => {
                task.description = Some(value.to_string());
            }
            _ => {}
        }
    }
}

fn leading_word(value: &str) -> &str {
    let end = value
        .find(|c: char| !(c.is_alphanumeric() || c == '_'))
        .unwrap_or(value.len());
    &value[..end]
}

fn parse_dependencies(value: &str) -> Vec<String> {
    if is_none_sentinel(value) {
        return Vec::new();
    }
    value
        .split(',')
        .map(|dep| dep.trim().trim_matches('`').trim())
        .filter(|dep| !dep.is_empty() && !is_none_sentinel(dep))
        .map(str::to_string)
        .collect()
}

fn is_none_sentinel(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "none" | "n/a" | "-"
    )
}
