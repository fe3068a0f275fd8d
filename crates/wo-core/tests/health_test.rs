//! Sub-agent status records: lifecycle, verdicts and workspace summaries.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{add_task, mock_workspace, MockGitRunner};
use wo_core::health::{HealthError, HealthVerdict, SubagentState, SubagentStatus, STATUS_FILE};
use wo_core::{ErrorCode, OperatorError, Workspace};

fn workspace_with(tasks: &[&str]) -> (tempfile::TempDir, Workspace) {
    let (dir, ws) = mock_workspace(Arc::new(MockGitRunner::new()));
    for task in tasks {
        add_task(&ws, task);
    }
    (dir, ws)
}

// ===========================================================================
// Lifecycle
// ===========================================================================

#[test]
fn test_full_lifecycle() {
    let (_dir, ws) = workspace_with(&["a"]);
    let health = ws.health();

    let started = health.mark_started("a").unwrap();
    assert_eq!(started.status, SubagentState::Starting);
    assert_eq!(started.progress, "Initializing");
    assert!(ws.task_dir("a").join(STATUS_FILE).exists());

    let running = health.mark_running("a", "Sub-agent launched (pid 7)").unwrap();
    assert_eq!(running.status, SubagentState::Running);
    assert_eq!(running.started_at, started.started_at);

    let beat = health.heartbeat("a", "halfway").unwrap();
    assert_eq!(beat.progress, "halfway");
    assert!(beat.last_heartbeat >= running.last_heartbeat);

    let done = health.mark_completed("a").unwrap();
    assert_eq!(done.status, SubagentState::Completed);
    assert!(done.completed_at.is_some());

    let on_disk: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(health.status_path("a")).unwrap(),
    )
    .unwrap();
    assert_eq!(on_disk["status"], "completed");
    assert_eq!(on_disk["task_name"], "a");
}

#[test]
fn test_heartbeat_without_record_creates_one() {
    let (_dir, ws) = workspace_with(&["a"]);

    let record = ws.health().heartbeat("a", "booted").unwrap();

    assert_eq!(record.status, SubagentState::Running);
    assert_eq!(record.progress, "booted");
}

#[test]
fn test_terminal_record_rejects_further_writes() {
    let (_dir, ws) = workspace_with(&["a"]);
    let health = ws.health();
    health.mark_started("a").unwrap();
    health.mark_failed("a", "compiler exploded").unwrap();

    let err = health.heartbeat("a", "still here").unwrap_err();
    assert!(matches!(
        err,
        HealthError::Terminal {
            state: SubagentState::Failed,
            ..
        }
    ));
    assert!(health.mark_completed("a").is_err());

    let report = health.read_status("a").unwrap();
    let record = report.status.unwrap();
    assert_eq!(record.status, SubagentState::Failed);
    assert_eq!(record.error.as_deref(), Some("compiler exploded"));

    let op: OperatorError = err.into();
    assert_eq!(op.code, ErrorCode::StatusWriteFailed);
}

#[test]
fn test_mark_started_after_terminal_begins_fresh_attempt() {
    let (_dir, ws) = workspace_with(&["a"]);
    let health = ws.health();
    health.mark_started("a").unwrap();
    health.mark_failed("a", "boom").unwrap();

    let fresh = health.mark_started("a").unwrap();

    assert_eq!(fresh.status, SubagentState::Starting);
    assert!(fresh.error.is_none());
    assert!(fresh.completed_at.is_none());
}

#[test]
fn test_writes_need_task_folder_and_valid_name() {
    let (_dir, ws) = workspace_with(&[]);
    let health = ws.health();

    assert!(matches!(
        health.mark_started("ghost").unwrap_err(),
        HealthError::TaskNotFound { .. }
    ));
    assert!(matches!(
        health.mark_started("../escape").unwrap_err(),
        HealthError::InvalidTaskName(_)
    ));
    let op: OperatorError = health.mark_started("ghost").unwrap_err().into();
    assert_eq!(op.code, ErrorCode::TaskNotFound);
}

// ===========================================================================
// Reading and verdicts
// ===========================================================================

#[test]
fn test_read_status_without_record() {
    let (_dir, ws) = workspace_with(&["a"]);
    let report = ws.health().read_status("a").unwrap();
    assert!(!report.exists);
    assert!(report.status.is_none());
    assert!(report.is_healthy.is_none());
}

#[test]
fn test_check_health_verdicts() {
    let (_dir, ws) = workspace_with(&["idle", "live", "done", "broken"]);
    let health = ws.health();
    health.heartbeat("live", "compiling").unwrap();
    health.mark_started("done").unwrap();
    health.mark_completed("done").unwrap();
    health.mark_started("broken").unwrap();
    health.mark_failed("broken", "segfault").unwrap();

    let idle = health.check_health("idle", None).unwrap();
    assert_eq!(idle.verdict, HealthVerdict::NotStarted);
    assert!(idle.healthy.is_none());

    let live = health.check_health("live", None).unwrap();
    assert_eq!(live.verdict, HealthVerdict::Healthy);
    assert_eq!(live.healthy, Some(true));
    assert_eq!(live.message, "Sub-agent running: compiling");

    let done = health.check_health("done", None).unwrap();
    assert_eq!(done.verdict, HealthVerdict::Completed);
    assert_eq!(done.healthy, Some(true));

    let broken = health.check_health("broken", None).unwrap();
    assert_eq!(broken.verdict, HealthVerdict::Failed);
    assert_eq!(broken.error.as_deref(), Some("segfault"));
}

#[test]
fn test_stale_heartbeat_is_hung() {
    let (_dir, ws) = workspace_with(&["a"]);
    let health = ws.health();
    let mut record = SubagentStatus::new("a", Utc::now() - chrono::Duration::minutes(30));
    record.status = SubagentState::Running;
    record.progress = "stuck".into();
    std::fs::write(
        health.status_path("a"),
        serde_json::to_string_pretty(&record).unwrap(),
    )
    .unwrap();

    let check = health.check_health("a", Some(Duration::from_secs(60))).unwrap();
    assert_eq!(check.verdict, HealthVerdict::Hung);
    assert_eq!(check.healthy, Some(false));
    assert!(check.seconds_since_heartbeat.unwrap() >= 1800.0);
    assert!(check.message.contains("may be hung"));
    assert!(!check.recovery_options.is_empty());

    // A generous timeout makes the same record healthy again.
    let check = health
        .check_health("a", Some(Duration::from_secs(3 * 3600)))
        .unwrap();
    assert_eq!(check.verdict, HealthVerdict::Healthy);
}

#[test]
fn test_corrupt_record_is_a_read_error() {
    let (_dir, ws) = workspace_with(&["a"]);
    let health = ws.health();
    std::fs::write(health.status_path("a"), "{ not json").unwrap();

    let err = health.read_status("a").unwrap_err();
    assert!(matches!(err, HealthError::Read { .. }));
    let op: OperatorError = err.into();
    assert_eq!(op.code, ErrorCode::StatusReadFailed);

    // Writing over it starts a fresh record.
    let record = health.mark_started("a").unwrap();
    assert_eq!(record.status, SubagentState::Starting);
}

// ===========================================================================
// Workspace-wide
// ===========================================================================

#[test]
fn test_list_all_counts_by_state() {
    let (_dir, ws) = workspace_with(&["c", "a", "b", "d", "e"]);
    let health = ws.health();
    health.heartbeat("a", "working").unwrap();
    health.mark_started("e").unwrap();
    health.mark_started("b").unwrap();
    health.mark_completed("b").unwrap();
    health.mark_started("c").unwrap();
    health.mark_failed("c", "x").unwrap();
    std::fs::write(ws.root().join("notes.txt"), "not a task").unwrap();

    let summary = health.list_all().unwrap();

    let names: Vec<&str> = summary.tasks.iter().map(|t| t.task_name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c", "d", "e"]);
    assert_eq!(summary.total, 5);
    // Launched but not yet reporting is not counted as running.
    assert_eq!(summary.starting, 1);
    assert_eq!(summary.running, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.not_started, 1);
    assert!(summary.tasks[3].status.is_none());
}

#[test]
fn test_cleanup_status() {
    let (_dir, ws) = workspace_with(&["a"]);
    let health = ws.health();
    health.mark_started("a").unwrap();

    assert!(health.cleanup_status("a").unwrap());
    assert!(!health.status_path("a").exists());
    assert!(!health.cleanup_status("a").unwrap());
}
