//! Single-task operations against a recording git runner.

mod common;

use std::sync::Arc;

use common::{add_task, mock_workspace, MockGitRunner};
use wo_core::git::GitOutput;
use wo_core::health::SubagentState;
use wo_core::ErrorCode;

// ===========================================================================
// create
// ===========================================================================

#[tokio::test]
async fn test_create_task_scaffolds_and_adds_worktree() {
    let git = Arc::new(MockGitRunner::new());
    let (_dir, ws) = mock_workspace(git.clone());

    let created = ws.create_task("k-1", "fix-logging", None).await.unwrap();

    assert_eq!(created.ticket, "K-1");
    assert_eq!(created.branch, "feature/K-1/fix-logging");
    assert_eq!(created.based_on, "main");
    assert_eq!(created.files_created, vec!["spec.md", "feedback.md", "results.md"]);
    for file in &created.files_created {
        assert!(created.task_dir.join(file).exists(), "{file} missing");
    }
    let feedback = std::fs::read_to_string(created.task_dir.join("feedback.md")).unwrap();
    assert!(feedback.contains("_No feedback yet_"));

    let (dir, args) = git.commands().remove(0);
    assert!(dir.ends_with("repo"));
    assert_eq!(
        args,
        vec![
            "worktree".to_string(),
            "add".to_string(),
            ws.worktree_path("fix-logging").display().to_string(),
            "-b".to_string(),
            "feature/K-1/fix-logging".to_string(),
            "main".to_string(),
        ]
    );
    // The lock is released afterwards.
    assert!(!ws.lock_status().locked);
}

#[tokio::test]
async fn test_create_task_from_custom_base() {
    let git = Arc::new(MockGitRunner::new());
    let (_dir, ws) = mock_workspace(git.clone());

    let created = ws.create_task("K-1", "a", Some("release/2.0")).await.unwrap();

    assert_eq!(created.based_on, "release/2.0");
    assert_eq!(git.commands()[0].1.last().unwrap(), "release/2.0");
}

#[tokio::test]
async fn test_create_task_worktree_failure_removes_folder() {
    let git = Arc::new(MockGitRunner::new());
    git.fail(&["worktree", "add"], "fatal: invalid reference: main");
    let (_dir, ws) = mock_workspace(git.clone());

    let err = ws.create_task("K-1", "a", None).await.unwrap_err();

    assert_eq!(err.code, ErrorCode::WorktreeCreateFailed);
    assert!(err.message.contains("invalid reference"));
    assert!(!ws.task_dir("a").exists());
}

#[tokio::test]
async fn test_create_task_preconditions() {
    let git = Arc::new(MockGitRunner::new());
    let (_dir, ws) = mock_workspace(git.clone());

    add_task(&ws, "a");
    let err = ws.create_task("K-1", "a", None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::TaskExists);

    let err = ws.create_task("K-1", "bad name", None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidInput);

    let err = ws.create_task("K-1", "b", Some("bad..branch")).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidInput);

    std::fs::remove_dir(ws.repo_path()).unwrap();
    let err = ws.create_task("K-1", "b", None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::RepoNotFound);

    assert!(git.commands().is_empty());
}

// ===========================================================================
// sync / reset
// ===========================================================================

#[tokio::test]
async fn test_sync_task_rebases_onto_main() {
    let git = Arc::new(MockGitRunner::new());
    let (_dir, ws) = mock_workspace(git.clone());
    add_task(&ws, "a");

    let synced = ws.sync_task("a").await.unwrap();

    assert_eq!(synced.rebased_onto, "main");
    assert!(synced.fetched);
    assert_eq!(
        git.transcript(),
        vec!["worktree: fetch origin", "worktree: rebase main"]
    );
}

#[tokio::test]
async fn test_sync_task_conflict_aborts_rebase() {
    let git = Arc::new(MockGitRunner::new());
    git.respond(
        &["rebase", "main"],
        GitOutput {
            success: false,
            stdout: "CONFLICT (content): Merge conflict in a.txt".into(),
            stderr: String::new(),
        },
    );
    let (_dir, ws) = mock_workspace(git.clone());
    add_task(&ws, "a");

    let err = ws.sync_task("a").await.unwrap_err();

    assert_eq!(err.code, ErrorCode::RebaseConflict);
    assert!(err.hint.unwrap().contains("git rebase --continue"));
    assert!(git.ran(&["rebase", "--abort"]));
}

#[tokio::test]
async fn test_sync_task_other_failure() {
    let git = Arc::new(MockGitRunner::new());
    git.fail(&["rebase", "main"], "fatal: invalid upstream 'main'");
    let (_dir, ws) = mock_workspace(git.clone());
    add_task(&ws, "a");

    let err = ws.sync_task("a").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::RebaseFailed);

    let err = ws.sync_task("nope").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::TaskNotFound);
}

#[tokio::test]
async fn test_sync_all_collects_per_task_results() {
    let git = Arc::new(MockGitRunner::new());
    let (_dir, ws) = mock_workspace(git.clone());
    add_task(&ws, "good");
    add_task(&ws, "bad");
    std::fs::create_dir(ws.task_dir("empty")).unwrap();
    git.respond_in("task-bad/worktree", &["rebase"], GitOutput::failed("boom"));

    let report = ws.sync_all().await.unwrap();

    assert!(!report.success);
    assert_eq!(report.synced, vec!["good"]);
    assert_eq!(report.skipped, vec!["empty"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].task, "bad");
    assert_eq!(report.failed[0].error.code, ErrorCode::RebaseFailed);
}

#[tokio::test]
async fn test_reset_task_hard_resets_and_cleans() {
    let git = Arc::new(MockGitRunner::new());
    git.fail(&["fetch"], "offline");
    let (_dir, ws) = mock_workspace(git.clone());
    add_task(&ws, "a");

    let reset = ws.reset_task("a").await.unwrap();

    assert_eq!(reset.reset_to, "main");
    assert!(!reset.fetched);
    assert_eq!(
        git.transcript(),
        vec![
            "worktree: fetch origin",
            "worktree: reset --hard main",
            "worktree: clean -fd"
        ]
    );
}

#[tokio::test]
async fn test_reset_task_failure_is_reported() {
    let git = Arc::new(MockGitRunner::new());
    git.fail(&["reset"], "fatal: ambiguous argument");
    let (_dir, ws) = mock_workspace(git.clone());
    add_task(&ws, "a");

    let err = ws.reset_task("a").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::GitCommandFailed);
    assert!(!git.ran(&["clean"]));
}

// ===========================================================================
// status / list
// ===========================================================================

#[test]
fn test_task_status_reports_git_and_health() {
    let git = Arc::new(MockGitRunner::new());
    git.respond(&["branch", "--show-current"], GitOutput::ok("feature/K-1/a\n"));
    git.respond(&["rev-list", "--count"], GitOutput::ok("7\n"));
    git.respond(&["status", "--porcelain"], GitOutput::ok(" M src/lib.rs\n?? notes.txt\n"));
    git.respond(&["log", "-1"], GitOutput::ok("abc1234 K-1: add parser\n"));
    let (_dir, ws) = mock_workspace(git.clone());
    add_task(&ws, "a");
    std::fs::write(
        ws.task_dir("a").join("results.md"),
        "# Results\n\nParser handles EOF now.\n",
    )
    .unwrap();
    ws.health().heartbeat("a", "writing tests").unwrap();

    let status = ws.task_status("a").unwrap();

    assert!(status.exists);
    assert!(status.files.spec && status.files.feedback && status.files.results);
    assert!(status.has_worktree);
    assert_eq!(status.branch.as_deref(), Some("feature/K-1/a"));
    assert_eq!(status.total_commits, Some(7));
    assert_eq!(status.uncommitted_changes, 2);
    assert_eq!(status.last_commit.as_deref(), Some("abc1234 K-1: add parser"));
    assert_eq!(status.results_summary.as_deref(), Some("Parser handles EOF now."));
    let subagent = status.subagent.unwrap();
    assert_eq!(subagent.status, SubagentState::Running);
    assert_eq!(subagent.progress, "writing tests");
}

#[test]
fn test_task_status_of_missing_task() {
    let git = Arc::new(MockGitRunner::new());
    let (_dir, ws) = mock_workspace(git.clone());

    let status = ws.task_status("ghost").unwrap();

    assert!(!status.exists);
    assert!(!status.has_worktree);
    assert!(git.commands().is_empty());
}

#[test]
fn test_list_tasks_in_name_order() {
    let git = Arc::new(MockGitRunner::new());
    let (_dir, ws) = mock_workspace(git);
    add_task(&ws, "zeta");
    add_task(&ws, "alpha");
    std::fs::create_dir(ws.task_dir("beta")).unwrap();

    let names: Vec<String> = ws
        .list_tasks()
        .unwrap()
        .into_iter()
        .map(|t| t.task_name)
        .collect();

    assert_eq!(names, vec!["alpha", "beta", "zeta"]);
}
