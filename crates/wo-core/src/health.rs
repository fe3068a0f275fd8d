//! Sub-agent health records.
//!
//! Each task folder may hold a `.subagent-status.json` written by the
//! operator (start/launch) and by the sub-agent itself (heartbeats,
//! completion). Liveness is judged purely from the last heartbeat.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::errors::{ErrorCode, OperatorError};
use crate::validation::{self, ValidationError};

pub const STATUS_FILE: &str = ".subagent-status.json";
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(600);

// ---------------------------------------------------------------------------
// SubagentState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubagentState {
    Starting,
    Running,
    Completed,
    Failed,
}

impl SubagentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubagentState::Completed | SubagentState::Failed)
    }

    /// Returns `true` when a write of `target` over `self` is valid.
    /// Terminal states accept nothing; a new attempt replaces the record
    /// instead of transitioning it.
    pub fn can_transition_to(&self, target: &SubagentState) -> bool {
        matches!(
            (self, target),
            (SubagentState::Starting, _)
                | (SubagentState::Running, SubagentState::Starting)
                | (SubagentState::Running, SubagentState::Running)
                | (SubagentState::Running, SubagentState::Completed)
                | (SubagentState::Running, SubagentState::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubagentState::Starting => "starting",
            SubagentState::Running => "running",
            SubagentState::Completed => "completed",
            SubagentState::Failed => "failed",
        }
    }
}

impl fmt::Display for SubagentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SubagentStatus
// ---------------------------------------------------------------------------

/// Persisted record, one per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubagentStatus {
    pub task_name: String,
    pub status: SubagentState,
    pub progress: String,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SubagentStatus {
    pub fn new(task_name: &str, now: DateTime<Utc>) -> Self {
        Self {
            task_name: task_name.to_string(),
            status: SubagentState::Starting,
            progress: "Initializing".into(),
            error: None,
            started_at: now,
            last_heartbeat: now,
            completed_at: None,
        }
    }

    /// Terminal records are always healthy; live ones need a heartbeat
    /// younger than `timeout`.
    pub fn is_healthy_at(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        if self.status.is_terminal() {
            return true;
        }
        seconds_between(self.last_heartbeat, now) < timeout.as_secs_f64()
    }

    pub fn is_healthy(&self, timeout: Duration) -> bool {
        self.is_healthy_at(Utc::now(), timeout)
    }

    pub fn seconds_since_heartbeat(&self, now: DateTime<Utc>) -> f64 {
        seconds_between(self.last_heartbeat, now)
    }

    /// Run time so far, or total run time once terminal.
    pub fn duration_secs(&self, now: DateTime<Utc>) -> f64 {
        seconds_between(self.started_at, self.completed_at.unwrap_or(now))
    }

    /// Apply a write at `now`. Keeps `started_at`, refreshes the heartbeat
    /// and fixes `completed_at` on the first terminal transition.
    fn apply(
        &mut self,
        state: SubagentState,
        progress: &str,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) {
        self.status = state;
        self.progress = progress.to_string();
        self.last_heartbeat = now;
        if let Some(error) = error {
            self.error = Some(error.to_string());
        }
        if state.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum HealthError {
    #[error(transparent)]
    InvalidTaskName(#[from] ValidationError),
    #[error("Task folder not found: {}", .dir.display())]
    TaskNotFound { task: String, dir: PathBuf },
    #[error("Sub-agent for '{task}' is already {state}; its status can no longer change")]
    Terminal { task: String, state: SubagentState },
    #[error("Failed to write status file {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to read status file {}: {message}", .path.display())]
    Read { path: PathBuf, message: String },
}

impl From<HealthError> for OperatorError {
    fn from(err: HealthError) -> Self {
        let message = err.to_string();
        match err {
            HealthError::InvalidTaskName(e) => e.into(),
            HealthError::TaskNotFound { task, dir } => {
                OperatorError::task_not_found(&task, dir.display())
            }
            HealthError::Terminal { task, .. } => {
                OperatorError::new(ErrorCode::StatusWriteFailed, message)
                    .with_hint("Start a new attempt to reset the record.")
                    .with_recovery(format!("Clear the record: operator health cleanup {task}"))
            }
            HealthError::Write { path, .. } => {
                let dir = path.parent().map(|p| p.display().to_string()).unwrap_or_default();
                OperatorError::new(ErrorCode::StatusWriteFailed, message)
                    .with_hint("Check file permissions in the task folder.")
                    .with_recovery(format!("Check permissions: ls -la {dir}"))
                    .with_recovery("Ensure the task folder is writable")
            }
            HealthError::Read { path, .. } => {
                OperatorError::new(ErrorCode::StatusReadFailed, message)
                    .with_hint("The status file may be corrupted or inaccessible.")
                    .with_recovery(format!("Check file: cat {}", path.display()))
                    .with_recovery("Remove corrupted status file and restart sub-agent")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub exists: bool,
    pub status: Option<SubagentStatus>,
    pub is_healthy: Option<bool>,
    pub seconds_since_heartbeat: Option<f64>,
    pub duration_secs: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthVerdict {
    NotStarted,
    Healthy,
    Hung,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub task_name: String,
    pub verdict: HealthVerdict,
    /// `None` when no sub-agent was started.
    pub healthy: Option<bool>,
    pub progress: Option<String>,
    pub seconds_since_heartbeat: Option<f64>,
    pub duration_secs: Option<f64>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recovery_options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHealth {
    pub task_name: String,
    /// `None` when no record exists.
    pub status: Option<SubagentState>,
    pub progress: Option<String>,
    pub healthy: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub tasks: Vec<TaskHealth>,
    pub total: usize,
    pub starting: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub not_started: usize,
}

// ---------------------------------------------------------------------------
// HealthMonitor
// ---------------------------------------------------------------------------

/// Reads and writes sub-agent status records for one workspace.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    root: PathBuf,
    timeout: Duration,
}

impl HealthMonitor {
    pub fn new(root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            root: root.into(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn status_path(&self, task: &str) -> PathBuf {
        self.root.join(format!("task-{task}")).join(STATUS_FILE)
    }

    /// Create or update the record for `task`.
    pub fn write_status(
        &self,
        task: &str,
        state: SubagentState,
        progress: &str,
        error: Option<&str>,
    ) -> Result<SubagentStatus, HealthError> {
        let task = validation::validate_task_name(task)?;
        let path = self.status_path(&task);
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        if !dir.is_dir() {
            return Err(HealthError::TaskNotFound { task, dir });
        }

        let now = Utc::now();
        let mut record = match read_record(&path) {
            Ok(Some(existing)) if existing.status.is_terminal() => {
                if state != SubagentState::Starting {
                    return Err(HealthError::Terminal {
                        task,
                        state: existing.status,
                    });
                }
                info!(task = %task, previous = %existing.status, "starting new sub-agent attempt");
                SubagentStatus::new(&task, now)
            }
            Ok(Some(existing)) => {
                if !existing.status.can_transition_to(&state) {
                    return Err(HealthError::Terminal {
                        task,
                        state: existing.status,
                    });
                }
                existing
            }
            Ok(None) => SubagentStatus::new(&task, now),
            Err(e) => {
                warn!(task = %task, error = %e, "unreadable status record, starting fresh");
                SubagentStatus::new(&task, now)
            }
        };
        record.apply(state, progress, error, now);

        write_record(&path, &record)?;
        debug!(task = %task, status = %record.status, progress = %record.progress, "status written");
        Ok(record)
    }

    pub fn mark_started(&self, task: &str) -> Result<SubagentStatus, HealthError> {
        self.write_status(task, SubagentState::Starting, "Initializing", None)
    }

    pub fn mark_running(&self, task: &str, progress: &str) -> Result<SubagentStatus, HealthError> {
        self.write_status(task, SubagentState::Running, progress, None)
    }

    /// Steady-state call from a live sub-agent.
    pub fn heartbeat(&self, task: &str, progress: &str) -> Result<SubagentStatus, HealthError> {
        self.write_status(task, SubagentState::Running, progress, None)
    }

    pub fn mark_completed(&self, task: &str) -> Result<SubagentStatus, HealthError> {
        self.write_status(task, SubagentState::Completed, "Completed", None)
    }

    pub fn mark_failed(&self, task: &str, error: &str) -> Result<SubagentStatus, HealthError> {
        self.write_status(task, SubagentState::Failed, "Failed", Some(error))
    }

    /// Absence of a record is reported, not an error.
    pub fn read_status(&self, task: &str) -> Result<StatusReport, HealthError> {
        let task = validation::validate_task_name(task)?;
        let now = Utc::now();
        Ok(match read_record(&self.status_path(&task))? {
            Some(record) => StatusReport {
                exists: true,
                is_healthy: Some(record.is_healthy_at(now, self.timeout)),
                seconds_since_heartbeat: Some(record.seconds_since_heartbeat(now)),
                duration_secs: Some(record.duration_secs(now)),
                status: Some(record),
            },
            None => StatusReport {
                exists: false,
                status: None,
                is_healthy: None,
                seconds_since_heartbeat: None,
                duration_secs: None,
            },
        })
    }

    pub fn check_health(
        &self,
        task: &str,
        timeout: Option<Duration>,
    ) -> Result<HealthCheck, HealthError> {
        let task = validation::validate_task_name(task)?;
        let timeout = timeout.unwrap_or(self.timeout);
        let now = Utc::now();

        let Some(record) = read_record(&self.status_path(&task))? else {
            return Ok(HealthCheck {
                task_name: task,
                verdict: HealthVerdict::NotStarted,
                healthy: None,
                progress: None,
                seconds_since_heartbeat: None,
                duration_secs: None,
                message: "No sub-agent has been started".into(),
                error: None,
                warning: None,
                recovery_options: Vec::new(),
            });
        };

        let healthy = record.is_healthy_at(now, timeout);
        let since = record.seconds_since_heartbeat(now);
        let mut check = HealthCheck {
            task_name: task.clone(),
            verdict: HealthVerdict::Healthy,
            healthy: Some(healthy),
            progress: Some(record.progress.clone()),
            seconds_since_heartbeat: Some(since),
            duration_secs: Some(record.duration_secs(now)),
            message: String::new(),
            error: None,
            warning: None,
            recovery_options: Vec::new(),
        };

        match record.status {
            SubagentState::Completed => {
                check.verdict = HealthVerdict::Completed;
                check.message = "Sub-agent completed successfully".into();
            }
            SubagentState::Failed => {
                let error = record.error.clone().unwrap_or_else(|| "unknown error".into());
                check.verdict = HealthVerdict::Failed;
                check.message = format!("Sub-agent failed: {error}");
                check.error = Some(error);
            }
            _ if !healthy => {
                let hung = subagent_timeout(&task, timeout);
                check.verdict = HealthVerdict::Hung;
                check.message = format!(
                    "Sub-agent may be hung (no heartbeat in {}s)",
                    since as u64
                );
                check.warning = hung.hint;
                check.recovery_options = hung.recovery_options;
            }
            _ => {
                check.message = format!("Sub-agent running: {}", record.progress);
            }
        }
        Ok(check)
    }

    /// Remove the record. Returns whether one existed.
    pub fn cleanup_status(&self, task: &str) -> Result<bool, HealthError> {
        let task = validation::validate_task_name(task)?;
        let path = self.status_path(&task);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(task = %task, "status record removed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(HealthError::Write { path, source }),
        }
    }

    /// Every `task-*` folder in name order, with counts.
    pub fn list_all(&self) -> Result<HealthSummary, HealthError> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| HealthError::Read {
            path: self.root.clone(),
            message: e.to_string(),
        })?;
        let mut names: Vec<String> = entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                e.file_name()
                    .to_str()
                    .and_then(|n| n.strip_prefix("task-"))
                    .map(str::to_string)
            })
            .collect();
        names.sort();

        let now = Utc::now();
        let mut summary = HealthSummary::default();
        for name in names {
            let record = match read_record(&self.status_path(&name)) {
                Ok(record) => record,
                Err(e) => {
                    warn!(task = %name, error = %e, "skipping unreadable status record");
                    None
                }
            };
            let entry = match record {
                Some(record) => {
                    match record.status {
                        SubagentState::Starting => summary.starting += 1,
                        SubagentState::Running => summary.running += 1,
                        SubagentState::Completed => summary.completed += 1,
                        SubagentState::Failed => summary.failed += 1,
                    }
                    TaskHealth {
                        task_name: name,
                        status: Some(record.status),
                        healthy: Some(record.is_healthy_at(now, self.timeout)),
                        progress: Some(record.progress),
                    }
                }
                None => {
                    summary.not_started += 1;
                    TaskHealth {
                        task_name: name,
                        status: None,
                        progress: None,
                        healthy: None,
                    }
                }
            };
            summary.tasks.push(entry);
        }
        summary.total = summary.tasks.len();
        Ok(summary)
    }
}

fn subagent_timeout(task: &str, timeout: Duration) -> OperatorError {
    OperatorError::new(
        ErrorCode::SubagentTimeout,
        format!(
            "Sub-agent for '{task}' sent no heartbeat in {}s",
            timeout.as_secs()
        ),
    )
    .with_hint("The sub-agent may be hung or may have crashed without reporting.")
    .with_recovery(format!("Inspect the worktree: operator task status {task}"))
    .with_recovery(format!("Mark it failed: operator health fail {task} \"hung\""))
    .with_recovery("Respawn it: operator batch spawn-unblocked --force")
}

fn read_record(path: &Path) -> Result<Option<SubagentStatus>, HealthError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(HealthError::Read {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| HealthError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

fn write_record(path: &Path, record: &SubagentStatus) -> Result<(), HealthError> {
    let json = serde_json::to_string_pretty(record).map_err(|e| HealthError::Write {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)
        .and_then(|()| std::fs::rename(&tmp, path))
        .map_err(|source| HealthError::Write {
            path: path.to_path_buf(),
            source,
        })
}
