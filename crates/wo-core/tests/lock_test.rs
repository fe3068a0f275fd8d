//! Workspace lock: exclusion, timeouts, stale reclamation and diagnostics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use wo_core::lock::{
    check_lock_status, force_unlock, LockError, LockInfo, WorkspaceLock, DEFAULT_STALE_AFTER, LOCK_FILE,
    LOCK_INFO_FILE,
};
use wo_core::ErrorCode;

fn write_info(dir: &std::path::Path, info: &LockInfo) {
    std::fs::write(dir.join(LOCK_FILE), "").unwrap();
    std::fs::write(dir.join(LOCK_INFO_FILE), serde_json::to_string(info).unwrap()).unwrap();
}

fn dead_holder() -> LockInfo {
    LockInfo {
        pid: 999_999_999,
        operation: "crashed accept".into(),
        acquired_at: chrono::Utc::now().to_rfc3339(),
        hostname: "elsewhere".into(),
    }
}

// ===========================================================================
// Acquire / release
// ===========================================================================

#[tokio::test]
async fn test_acquire_writes_info_and_release_removes_it() {
    let dir = tempfile::tempdir().unwrap();
    let mut lock = WorkspaceLock::new(dir.path(), "create_task:a");

    lock.acquire(Duration::from_secs(1), true).await.unwrap();
    assert!(lock.is_acquired());

    let info: LockInfo = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join(LOCK_INFO_FILE)).unwrap(),
    )
    .unwrap();
    assert_eq!(info.pid, std::process::id());
    assert_eq!(info.operation, "create_task:a");
    assert!(info.acquired_at_utc().is_some());

    lock.release();
    assert!(!lock.is_acquired());
    assert!(!dir.path().join(LOCK_FILE).exists());
    assert!(!dir.path().join(LOCK_INFO_FILE).exists());

    // Releasing twice is harmless.
    lock.release();
}

#[tokio::test]
async fn test_acquire_is_reentrant_on_same_handle() {
    let dir = tempfile::tempdir().unwrap();
    let mut lock = WorkspaceLock::new(dir.path(), "op");
    lock.acquire(Duration::from_secs(1), false).await.unwrap();
    lock.acquire(Duration::from_secs(1), false).await.unwrap();
    assert!(lock.is_acquired());
}

#[tokio::test]
async fn test_second_handle_is_refused_with_holder_info() {
    let dir = tempfile::tempdir().unwrap();
    let mut first = WorkspaceLock::new(dir.path(), "accept_task:a");
    first.acquire(Duration::from_secs(1), false).await.unwrap();

    let mut second = WorkspaceLock::new(dir.path(), "create_task:b");
    let err = second.acquire(Duration::from_secs(1), false).await.unwrap_err();

    match &err {
        LockError::Held { holder: Some(holder) } => {
            assert_eq!(holder.operation, "accept_task:a");
            assert_eq!(holder.pid, std::process::id());
        }
        other => panic!("expected Held with holder, got {other:?}"),
    }
    assert!(!second.is_acquired());
    let op: wo_core::OperatorError = err.into();
    assert_eq!(op.code, ErrorCode::LockHeld);
    assert!(op.hint.is_some());
}

#[tokio::test]
async fn test_blocking_acquire_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let mut first = WorkspaceLock::new(dir.path(), "holder");
    first.acquire(Duration::from_secs(1), false).await.unwrap();

    let started = Instant::now();
    let mut second = WorkspaceLock::new(dir.path(), "waiter");
    let err = second.acquire(Duration::from_millis(700), true).await.unwrap_err();

    assert!(started.elapsed() >= Duration::from_millis(700));
    assert!(matches!(err, LockError::Timeout { .. }));
    assert_eq!(err.holder().map(|h| h.operation.as_str()), Some("holder"));
}

#[tokio::test]
async fn test_blocking_acquire_succeeds_once_released() {
    let dir = tempfile::tempdir().unwrap();
    let mut first = WorkspaceLock::new(dir.path(), "holder");
    first.acquire(Duration::from_secs(1), false).await.unwrap();

    let path = dir.path().to_path_buf();
    let waiter = tokio::spawn(async move {
        let mut second = WorkspaceLock::new(path, "waiter");
        second.acquire(Duration::from_secs(5), true).await.map(|_| second)
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    first.release();

    let second = waiter.await.unwrap().unwrap();
    assert!(second.is_acquired());
}

#[tokio::test]
async fn test_dropping_the_handle_releases() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut lock = WorkspaceLock::new(dir.path(), "scoped");
        lock.acquire(Duration::from_secs(1), false).await.unwrap();
    }
    let mut again = WorkspaceLock::new(dir.path(), "next");
    again.acquire(Duration::from_secs(1), false).await.unwrap();
}

#[tokio::test]
async fn test_missing_workspace_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut lock = WorkspaceLock::new(dir.path().join("nope"), "op");
    let err = lock.acquire(Duration::from_secs(1), true).await.unwrap_err();
    assert!(matches!(err, LockError::WorkspaceMissing(_)));
    assert!(!dir.path().join("nope").exists());
}

// ===========================================================================
// Stale locks
// ===========================================================================

#[tokio::test]
async fn test_stale_lock_from_dead_pid_is_reclaimed_without_waiting() {
    let dir = tempfile::tempdir().unwrap();
    write_info(dir.path(), &dead_holder());

    let started = Instant::now();
    let mut lock = WorkspaceLock::new(dir.path(), "recovering");
    lock.acquire(Duration::from_secs(30), true).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    let status = check_lock_status(dir.path(), DEFAULT_STALE_AFTER);
    assert!(status.locked);
    assert_eq!(status.info.unwrap().operation, "recovering");
}

#[tokio::test]
async fn test_old_lock_is_stale_even_with_live_pid() {
    let dir = tempfile::tempdir().unwrap();
    let old = LockInfo {
        pid: std::process::id(),
        operation: "ancient".into(),
        acquired_at: (chrono::Utc::now() - chrono::Duration::hours(2)).to_rfc3339(),
        hostname: "here".into(),
    };
    write_info(dir.path(), &old);

    let mut lock = WorkspaceLock::new(dir.path(), "fresh").with_stale_after(Duration::from_secs(3600));
    lock.acquire(Duration::from_millis(100), false).await.unwrap();
    assert!(lock.is_acquired());
}

#[tokio::test]
async fn test_live_lock_with_dead_pid_record_is_not_reclaimed() {
    let dir = tempfile::tempdir().unwrap();
    let mut winner = WorkspaceLock::new(dir.path(), "winner");
    winner.acquire(Duration::from_secs(1), false).await.unwrap();
    // The record a waiter saw before `winner` took over: a crashed holder.
    std::fs::write(
        dir.path().join(LOCK_INFO_FILE),
        serde_json::to_string(&dead_holder()).unwrap(),
    )
    .unwrap();

    let mut late = WorkspaceLock::new(dir.path(), "late");
    let err = late.acquire(Duration::from_secs(1), false).await.unwrap_err();

    assert!(matches!(err, LockError::Held { .. }), "{err:?}");
    assert!(!late.is_acquired());
    assert!(winner.is_acquired());
    assert!(dir.path().join(LOCK_FILE).exists());
}

#[tokio::test]
async fn test_old_lock_still_held_is_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    let mut holder = WorkspaceLock::new(dir.path(), "slow");
    holder.acquire(Duration::from_secs(1), false).await.unwrap();
    let old = LockInfo {
        pid: std::process::id(),
        operation: "slow".into(),
        acquired_at: (chrono::Utc::now() - chrono::Duration::hours(2)).to_rfc3339(),
        hostname: "here".into(),
    };
    std::fs::write(dir.path().join(LOCK_INFO_FILE), serde_json::to_string(&old).unwrap()).unwrap();

    let mut other = WorkspaceLock::new(dir.path(), "impatient").with_stale_after(Duration::from_secs(3600));
    let err = other.acquire(Duration::from_millis(100), false).await.unwrap_err();
    assert!(matches!(err, LockError::Held { .. }));

    let status = check_lock_status(dir.path(), Duration::from_secs(3600));
    assert!(status.locked);
    assert!(status.stale);
}

// ===========================================================================
// Diagnostics
// ===========================================================================

#[tokio::test]
async fn test_status_reports_free_held_and_leftover() {
    let dir = tempfile::tempdir().unwrap();
    let status = check_lock_status(dir.path(), DEFAULT_STALE_AFTER);
    assert!(!status.locked && !status.stale && status.info.is_none());

    let mut lock = WorkspaceLock::new(dir.path(), "busy");
    lock.acquire(Duration::from_secs(1), false).await.unwrap();
    let status = check_lock_status(dir.path(), DEFAULT_STALE_AFTER);
    assert!(status.locked);
    assert!(!status.stale);
    assert_eq!(status.info.unwrap().operation, "busy");
    lock.release();

    // Files left behind by a crashed holder: present but not locked.
    write_info(dir.path(), &dead_holder());
    let status = check_lock_status(dir.path(), DEFAULT_STALE_AFTER);
    assert!(!status.locked);
    assert!(status.stale);
    assert_eq!(status.info.unwrap().operation, "crashed accept");
}

#[test]
fn test_status_of_lock_file_without_record_is_leftover() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(LOCK_FILE), "").unwrap();
    let status = check_lock_status(dir.path(), DEFAULT_STALE_AFTER);
    assert!(!status.locked);
    assert!(status.stale);
    assert!(status.info.is_none());
}

#[tokio::test]
async fn test_status_queries_never_make_acquire_fail() {
    let dir = tempfile::tempdir().unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let poller = {
        let path = dir.path().to_path_buf();
        let stop = stop.clone();
        std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                check_lock_status(&path, DEFAULT_STALE_AFTER);
            }
        })
    };

    for _ in 0..200 {
        let mut lock = WorkspaceLock::new(dir.path(), "busy loop");
        lock.acquire(Duration::ZERO, false).await.unwrap();
        lock.release();
    }

    stop.store(true, Ordering::Relaxed);
    poller.join().unwrap();
}

#[test]
fn test_force_unlock_removes_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    write_info(dir.path(), &dead_holder());

    let report = force_unlock(dir.path()).unwrap();
    assert!(report.removed_lock);
    assert!(report.removed_info);
    assert_eq!(report.previous_info.unwrap().operation, "crashed accept");
    assert!(!dir.path().join(LOCK_FILE).exists());

    let report = force_unlock(dir.path()).unwrap();
    assert!(!report.removed_lock && !report.removed_info);
}
