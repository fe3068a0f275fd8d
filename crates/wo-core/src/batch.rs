use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use wo_telemetry::operation::OperationTimer;

use crate::errors::{ErrorCode, OperatorError, Result};
use crate::plan::{PlanGraph, TaskStatus, UnblockedReport};
use crate::spawner::{self, Spawner};
use crate::task::TaskFailure;
use crate::validation::validate_ticket;
use crate::workspace::Workspace;

/// Ticket used for branch names when neither the caller nor the config
/// names one.
pub const DEFAULT_TICKET: &str = "WH";

/// Above this, spawn-parallel still runs but warns.
pub const HIGH_PARALLELISM: usize = 10;

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedTask {
    pub task: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// False iff at least one task failed.
    pub success: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub created: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spawned: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedTask>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<TaskFailure>,
    /// Unblocked tasks left for a later run because the cap was reached.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remaining: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
    pub message: String,
}

impl BatchReport {
    fn skip(&mut self, task: &str, reason: impl Into<String>) {
        let reason = reason.into();
        info!(task, reason = %reason, "skipping task");
        self.skipped.push(SkippedTask {
            task: task.to_string(),
            reason,
        });
    }

    fn fail(&mut self, task: &str, error: OperatorError) {
        error!(task, code = %error.code, error = %error.message, "batch task failed");
        self.failed.push(TaskFailure {
            task: task.to_string(),
            error,
        });
    }

    fn finish(&mut self, verb: &str) {
        self.success = self.failed.is_empty();
        let mut parts = Vec::new();
        if !self.created.is_empty() {
            parts.push(format!("{} created", self.created.len()));
        }
        if !self.spawned.is_empty() {
            parts.push(format!("{} spawned", self.spawned.len()));
        }
        if !self.skipped.is_empty() {
            parts.push(format!("{} skipped", self.skipped.len()));
        }
        if !self.failed.is_empty() {
            parts.push(format!("{} failed", self.failed.len()));
        }
        if !self.remaining.is_empty() {
            parts.push(format!("{} remaining (hit limit)", self.remaining.len()));
        }
        if parts.is_empty() {
            parts.push("nothing to do".to_string());
        }
        self.message = format!("{verb} complete: {}", parts.join(", "));
    }
}

// ---------------------------------------------------------------------------
// BatchCoordinator
// ---------------------------------------------------------------------------

/// Creates and launches many tasks at once, following the plan's
/// dependency order.
pub struct BatchCoordinator<'a> {
    ws: &'a Workspace,
    spawner: &'a dyn Spawner,
}

impl<'a> BatchCoordinator<'a> {
    pub fn new(ws: &'a Workspace, spawner: &'a dyn Spawner) -> Self {
        Self { ws, spawner }
    }

    fn ticket(&self, ticket: Option<&str>) -> Result<String> {
        let ticket = ticket
            .or(self.ws.config().ticket_prefix.as_deref())
            .unwrap_or(DEFAULT_TICKET);
        Ok(validate_ticket(ticket)?)
    }

    /// Create a folder and worktree for every PENDING task that has none,
    /// all under one workspace lock.
    pub async fn create_all(&self, ticket: Option<&str>) -> Result<BatchReport> {
        let ticket = self.ticket(ticket)?;
        let plan = self.ws.load_plan()?;
        if plan.is_empty() {
            return Err(OperatorError::new(ErrorCode::NoTasksFound, "No tasks found in plan.md")
                .with_hint("Add task sections to plan.md first."));
        }

        let pending: Vec<String> = plan
            .with_status(TaskStatus::Pending)
            .map(|t| t.name.clone())
            .collect();
        let mut report = BatchReport::default();
        if pending.is_empty() {
            report.success = true;
            report.message = "No pending tasks found in plan.md".to_string();
            return Ok(report);
        }

        let timer = OperationTimer::start("batch_create_all");
        info!(count = pending.len(), ticket = %ticket, "creating pending tasks");
        let lock = self.ws.lock("create_all_tasks").await?;
        for name in &pending {
            if self.ws.task_dir(name).exists() {
                report.skip(name, "task folder already exists");
                continue;
            }
            match self.ws.create_task_locked(&lock, &ticket, name, None) {
                Ok(created) => {
                    info!(task = %name, branch = %created.branch, "task created");
                    report.created.push(name.clone());
                }
                Err(e) => report.fail(name, e),
            }
        }
        drop(lock);

        report.finish("Batch create");
        timer.finish(report.success);
        Ok(report)
    }

    /// Launch a sub-agent for every unblocked task that has a worktree.
    pub fn spawn_unblocked(&self, ticket: Option<&str>, force: bool) -> Result<BatchReport> {
        self.spawn(None, ticket, force)
    }

    /// Like [`spawn_unblocked`](Self::spawn_unblocked), but launches at most
    /// `max` sub-agents; the rest are reported as `remaining`.
    pub fn spawn_parallel(&self, max: usize, ticket: Option<&str>, force: bool) -> Result<BatchReport> {
        if max < 1 {
            return Err(OperatorError::invalid_input(
                format!("Invalid max_parallel value: {max}"),
                "max_parallel must be at least 1",
            ));
        }
        if max > HIGH_PARALLELISM {
            warn!(max_parallel = max, "max_parallel is very high; sub-agents may starve each other");
        }
        self.spawn(Some(max), ticket, force)
    }

    fn spawn(&self, max: Option<usize>, ticket: Option<&str>, force: bool) -> Result<BatchReport> {
        let ticket = self.ticket(ticket)?;
        let plan = self.ws.load_plan()?;
        let unblocked = plan.get_unblocked();

        let mut report = BatchReport {
            max_parallel: max,
            ..BatchReport::default()
        };
        if unblocked.unblocked.is_empty() {
            report.success = true;
            report.message = nothing_unblocked(&unblocked);
            info!(message = %report.message, "nothing to spawn");
            return Ok(report);
        }

        let timer = OperationTimer::start("batch_spawn");
        let health = self.ws.health();
        let mut launches = 0usize;
        for name in &unblocked.unblocked {
            if max.is_some_and(|max| launches >= max) {
                report.remaining.push(name.clone());
                continue;
            }
            if !self.ws.worktree_path(name).is_dir() {
                report.skip(name, "no task folder or worktree; run batch create-all first");
                continue;
            }
            if let Some(reason) = self.blocked_reason(&plan, name, force) {
                report.skip(name, reason);
                continue;
            }

            launches += 1;
            if let Err(e) = health.mark_started(name) {
                report.fail(name, e.into());
                continue;
            }
            let request = spawner::request_for(&self.ws.task_dir(name), name, &ticket);
            match self.spawner.spawn(&request) {
                Ok(pid) => {
                    if let Err(e) = health.mark_running(name, &format!("Sub-agent launched (pid {pid})")) {
                        warn!(task = %name, error = %e, "could not record running state");
                    }
                    report.spawned.push(name.clone());
                }
                Err(e) => {
                    let error: OperatorError = e.into();
                    if let Err(e) = health.mark_failed(name, &error.message) {
                        warn!(task = %name, error = %e, "could not record failed state");
                    }
                    report.fail(name, error);
                }
            }
        }

        report.finish(if max.is_some() { "Spawn parallel" } else { "Spawn unblocked" });
        timer.finish(report.success);
        Ok(report)
    }

    /// Re-check a task's dependencies right before launch.
    fn blocked_reason(&self, plan: &PlanGraph, name: &str, force: bool) -> Option<String> {
        if force {
            return None;
        }
        let check = plan.check_dependencies(name);
        if check.can_spawn {
            return None;
        }
        Some(if check.missing.is_empty() {
            "task is already completed".to_string()
        } else {
            format!("dependencies not satisfied: {}", check.missing.join(", "))
        })
    }
}

fn nothing_unblocked(report: &UnblockedReport) -> String {
    let mut parts = vec!["No unblocked tasks to spawn".to_string()];
    if !report.in_progress.is_empty() {
        parts.push(format!("{} task(s) already in progress", report.in_progress.len()));
    }
    if !report.blocked.is_empty() {
        parts.push(format!("{} task(s) blocked by dependencies", report.blocked.len()));
    }
    parts.join(". ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_lists_only_non_empty_buckets() {
        let mut report = BatchReport {
            created: vec!["a".into(), "b".into()],
            ..BatchReport::default()
        };
        report.skip("c", "task folder already exists");
        report.finish("Batch create");
        assert!(report.success);
        assert_eq!(report.message, "Batch create complete: 2 created, 1 skipped");
    }

    #[test]
    fn any_failure_clears_success() {
        let mut report = BatchReport::default();
        report.fail("a", OperatorError::new(ErrorCode::SubagentSpawnFailed, "boom"));
        report.finish("Spawn unblocked");
        assert!(!report.success);
        assert_eq!(report.message, "Spawn unblocked complete: 1 failed");
    }

    #[test]
    fn nothing_unblocked_explains_why() {
        let plan = PlanGraph::parse(
            "### a\n- Status: IN_PROGRESS\n\n### b\n- Status: PENDING\n- Dependencies: a\n",
        );
        assert_eq!(
            nothing_unblocked(&plan.get_unblocked()),
            "No unblocked tasks to spawn. 1 task(s) already in progress. 1 task(s) blocked by dependencies"
        );
    }
}
