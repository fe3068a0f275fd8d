//! Cross-process workspace lock.
//!
//! Every operation that mutates branches, worktrees or task folders runs
//! while holding an exclusive `flock` on `<workspace>/.workspace.lock`. A JSON
//! sidecar (`.workspace.lock.info`) records who holds it, for diagnostics and
//! stale-lock detection.
//!
//! ## Staleness
//!
//! A lock is stale when the recorded holder pid is no longer running, or when
//! it was acquired longer ago than the staleness threshold (default one hour).
//! A waiting acquirer reclaims a stale lock once, before it starts polling,
//! and only after winning the `flock` on the existing file. A stale-looking
//! record whose file is still locked belongs to a live process and is left
//! for `force_unlock`.
//!
//! ## Release ordering
//!
//! Release unlinks the lock file *before* dropping the `flock`. An acquirer
//! that opened the old inode and then wins the `flock` notices that the path
//! no longer refers to its inode and retries, so two processes never hold
//! "the" lock at the same time.

use std::fs::{File, OpenOptions};
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::errors::{ErrorCode, OperatorError};

pub const LOCK_FILE: &str = ".workspace.lock";
pub const LOCK_INFO_FILE: &str = ".workspace.lock.info";

pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(3600);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Workspace does not exist: {}", .0.display())]
    WorkspaceMissing(PathBuf),
    #[error("Workspace is locked by another operation{}", describe_holder(.holder.as_ref()))]
    Held { holder: Option<LockInfo> },
    #[error("Timeout waiting for workspace lock after {}s{}", .timeout.as_secs(), describe_holder(.holder.as_ref()))]
    Timeout {
        timeout: Duration,
        holder: Option<LockInfo>,
    },
    #[error("lock file I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_holder(holder: Option<&LockInfo>) -> String {
    match holder {
        Some(info) => format!(
            " (operation '{}', pid {} on {}, since {})",
            info.operation, info.pid, info.hostname, info.acquired_at
        ),
        None => String::new(),
    }
}

impl LockError {
    pub fn holder(&self) -> Option<&LockInfo> {
        match self {
            LockError::Held { holder } | LockError::Timeout { holder, .. } => holder.as_ref(),
            _ => None,
        }
    }
}

impl From<LockError> for OperatorError {
    fn from(err: LockError) -> Self {
        let message = err.to_string();
        match err {
            LockError::WorkspaceMissing(path) => OperatorError::workspace_not_found(path.display()),
            LockError::Held { holder } => {
                let mut e = OperatorError::new(ErrorCode::LockHeld, message)
                    .with_hint("Another process is currently modifying the workspace.")
                    .with_recovery("Wait for the other operation to complete")
                    .with_recovery("Check lock status: operator lock status");
                if let Some(info) = holder {
                    e = e.with_recovery(format!(
                        "Check if process {} is still running",
                        info.pid
                    ));
                }
                e.with_recovery("Force unlock (if stale): operator lock unlock --yes")
            }
            LockError::Timeout { .. } => OperatorError::new(ErrorCode::LockTimeout, message)
                .with_hint("Another operation may be stuck or taking too long.")
                .with_recovery("Check what operation is running: operator lock status")
                .with_recovery("Wait and retry")
                .with_recovery("Force unlock if the operation is stuck: operator lock unlock --yes"),
            LockError::Io(e) => OperatorError::io("workspace lock", &e),
        }
    }
}

// ---------------------------------------------------------------------------
// LockInfo
// ---------------------------------------------------------------------------

/// Contents of `.workspace.lock.info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub operation: String,
    /// ISO-8601; RFC 3339 when written by us, naive UTC is accepted on read.
    pub acquired_at: String,
    pub hostname: String,
}

impl LockInfo {
    fn current(operation: &str) -> Self {
        Self {
            pid: std::process::id(),
            operation: operation.to_string(),
            acquired_at: Utc::now().to_rfc3339(),
            hostname: hostname(),
        }
    }

    pub fn acquired_at_utc(&self) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(&self.acquired_at) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&self.acquired_at, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub fn holder_alive(&self) -> bool {
        pid_alive(self.pid)
    }

    /// Holder is dead, or the lock is older than `stale_after`.
    pub fn is_stale(&self, stale_after: Duration) -> bool {
        if self.pid != 0 && !self.holder_alive() {
            return true;
        }
        match self.acquired_at_utc() {
            Some(at) => (Utc::now() - at)
                .to_std()
                .map(|age| age > stale_after)
                .unwrap_or(false),
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// WorkspaceLock
// ---------------------------------------------------------------------------

/// Exclusive lock over one workspace directory.
///
/// Released on [`release`](Self::release) or on drop, whichever comes first.
#[derive(Debug)]
pub struct WorkspaceLock {
    workspace: PathBuf,
    operation: String,
    lock_file: PathBuf,
    info_file: PathBuf,
    stale_after: Duration,
    file: Option<File>,
}

enum Attempt {
    Acquired(File),
    Busy,
    /// Won the flock on an inode that was unlinked meanwhile.
    Replaced,
}

impl WorkspaceLock {
    pub fn new(workspace: impl Into<PathBuf>, operation: impl Into<String>) -> Self {
        let workspace = workspace.into();
        Self {
            lock_file: workspace.join(LOCK_FILE),
            info_file: workspace.join(LOCK_INFO_FILE),
            workspace,
            operation: operation.into(),
            stale_after: DEFAULT_STALE_AFTER,
            file: None,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn is_acquired(&self) -> bool {
        self.file.is_some()
    }

    /// Acquire the lock. Calling it again on an acquired handle is a no-op.
    ///
    /// With `blocking == false` contention fails immediately with
    /// [`LockError::Held`]; otherwise the lock file is polled every 500ms
    /// until `timeout` elapses ([`LockError::Timeout`]).
    pub async fn acquire(&mut self, timeout: Duration, blocking: bool) -> Result<(), LockError> {
        if self.file.is_some() {
            return Ok(());
        }
        if !self.workspace.is_dir() {
            return Err(LockError::WorkspaceMissing(self.workspace.clone()));
        }

        self.clean_stale()?;

        let started = Instant::now();
        loop {
            match self.try_once()? {
                Attempt::Acquired(file) => {
                    self.file = Some(file);
                    self.write_info();
                    debug!(
                        workspace = %self.workspace.display(),
                        operation = %self.operation,
                        "workspace lock acquired"
                    );
                    return Ok(());
                }
                Attempt::Replaced => continue,
                Attempt::Busy => {}
            }

            let holder = read_info(&self.info_file);
            if !blocking {
                warn!(
                    workspace = %self.workspace.display(),
                    holder = ?holder,
                    "workspace lock held by another operation"
                );
                return Err(LockError::Held { holder });
            }
            if started.elapsed() >= timeout {
                warn!(
                    workspace = %self.workspace.display(),
                    timeout_secs = timeout.as_secs(),
                    holder = ?holder,
                    "timed out waiting for workspace lock"
                );
                return Err(LockError::Timeout { timeout, holder });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Release the lock; a no-op on an unacquired handle. Never fails.
    pub fn release(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        let _ = std::fs::remove_file(&self.info_file);
        let _ = std::fs::remove_file(&self.lock_file);
        unlock(&file);
        drop(file);
        debug!(
            workspace = %self.workspace.display(),
            operation = %self.operation,
            "workspace lock released"
        );
    }

    fn try_once(&self) -> Result<Attempt, LockError> {
        let file = open_lock_file(&self.lock_file)?;
        if !try_flock_exclusive(&file)? {
            return Ok(Attempt::Busy);
        }
        if !same_file(&file, &self.lock_file) {
            return Ok(Attempt::Replaced);
        }
        Ok(Attempt::Acquired(file))
    }

    /// Remove a stale lock, but only while holding its `flock`. A lock
    /// that still has an OS-level holder is never unlinked, whatever its
    /// info record says.
    fn clean_stale(&self) -> Result<(), LockError> {
        let Some(info) = read_info(&self.info_file) else {
            return Ok(());
        };
        if !info.is_stale(self.stale_after) {
            return Ok(());
        }
        let file = match OpenOptions::new().read(true).write(true).open(&self.lock_file) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Orphaned info record with no lock file.
                let _ = std::fs::remove_file(&self.info_file);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if !try_flock_exclusive(&file)? {
            debug!(
                workspace = %self.workspace.display(),
                pid = info.pid,
                "stale-looking workspace lock is still held; not reclaiming"
            );
            return Ok(());
        }
        let unchanged = same_file(&file, &self.lock_file)
            && read_info(&self.info_file).map_or(true, |current| current.is_stale(self.stale_after));
        if unchanged {
            info!(
                workspace = %self.workspace.display(),
                pid = info.pid,
                operation = %info.operation,
                acquired_at = %info.acquired_at,
                "reclaiming stale workspace lock"
            );
            let _ = std::fs::remove_file(&self.info_file);
            let _ = std::fs::remove_file(&self.lock_file);
        }
        unlock(&file);
        Ok(())
    }

    fn write_info(&self) {
        let info = LockInfo::current(&self.operation);
        let Ok(json) = serde_json::to_string_pretty(&info) else {
            return;
        };
        let tmp = self.info_file.with_extension("info.tmp");
        if std::fs::write(&tmp, json).is_ok() {
            let _ = std::fs::rename(&tmp, &self.info_file);
        }
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        self.release();
    }
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStatus {
    pub workspace: String,
    pub locked: bool,
    pub stale: bool,
    pub info: Option<LockInfo>,
}

/// Report whether the workspace lock is held and whether it looks stale.
///
/// Judged from the lock file, its info record and a liveness check on the
/// recorded pid. Never takes the `flock`, so a status query cannot make a
/// concurrent `try_lock` fail. A lock file without an info record is
/// reported as a stale leftover.
pub fn check_lock_status(workspace: &Path, stale_after: Duration) -> LockStatus {
    let mut status = LockStatus {
        workspace: workspace.display().to_string(),
        locked: false,
        stale: false,
        info: None,
    };
    if !workspace.join(LOCK_FILE).exists() {
        return status;
    }
    status.info = read_info(&workspace.join(LOCK_INFO_FILE));
    match &status.info {
        Some(info) => {
            status.locked = info.holder_alive();
            status.stale = info.is_stale(stale_after);
        }
        None => status.stale = true,
    }
    status
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceUnlockReport {
    pub removed_lock: bool,
    pub removed_info: bool,
    pub previous_info: Option<LockInfo>,
}

/// Delete the lock artifacts unconditionally. The caller must be sure no
/// other process is inside a locked operation.
pub fn force_unlock(workspace: &Path) -> Result<ForceUnlockReport, LockError> {
    let lock_file = workspace.join(LOCK_FILE);
    let info_file = workspace.join(LOCK_INFO_FILE);
    let mut report = ForceUnlockReport {
        removed_lock: false,
        removed_info: false,
        previous_info: read_info(&info_file),
    };
    if lock_file.exists() {
        std::fs::remove_file(&lock_file)?;
        report.removed_lock = true;
    }
    if info_file.exists() {
        std::fs::remove_file(&info_file)?;
        report.removed_info = true;
    }
    warn!(
        workspace = %workspace.display(),
        previous = ?report.previous_info,
        "workspace lock force-removed"
    );
    Ok(report)
}

// ---------------------------------------------------------------------------
// OS helpers
// ---------------------------------------------------------------------------

fn read_info(path: &Path) -> Option<LockInfo> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

fn open_lock_file(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true).truncate(false);
    #[cfg(unix)]
    options.mode(0o644);
    options.open(path)
}

#[cfg(unix)]
fn same_file(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (file.metadata(), std::fs::metadata(path)) {
        (Ok(held), Ok(current)) => held.dev() == current.dev() && held.ino() == current.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_file(_file: &File, path: &Path) -> bool {
    path.exists()
}

/// `flock(LOCK_EX | LOCK_NB)`: `Ok(false)` when someone else holds it.
fn try_flock_exclusive(file: &File) -> std::io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the fd is owned by `file` and valid for this call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock
            || err.raw_os_error() == Some(libc::EWOULDBLOCK)
        {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(true)
    }
}

fn unlock(file: &File) {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the fd is owned by `file` and valid for this call.
        unsafe {
            libc::flock(file.as_raw_fd(), libc::LOCK_UN);
        }
    }
    #[cfg(not(unix))]
    let _ = file;
}

/// Check if a process with the given PID is alive.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // SAFETY: kill with signal 0 checks existence without sending a signal.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to someone else.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    // Assume alive; never reclaim where liveness cannot be checked.
    true
}

#[cfg(unix)]
fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for buf.len() bytes.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if rc != 0 {
        return "unknown".into();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]).into_owned();
    if name.is_empty() {
        "unknown".into()
    } else {
        name
    }
}

#[cfg(not(unix))]
fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn bogus_pids_are_dead() {
        assert!(!pid_alive(0));
        assert!(!pid_alive(999_999_999));
        assert!(!pid_alive(u32::MAX));
    }

    #[test]
    fn hostname_is_never_empty() {
        assert!(!hostname().is_empty());
    }

    #[test]
    fn parses_rfc3339_and_naive_timestamps() {
        let mut info = LockInfo::current("test");
        assert!(info.acquired_at_utc().is_some());

        info.acquired_at = "2026-01-02T03:04:05.123456".into();
        let at = info.acquired_at_utc().unwrap();
        assert_eq!(at.to_rfc3339(), "2026-01-02T03:04:05.123456+00:00");

        info.acquired_at = "yesterday".into();
        assert!(info.acquired_at_utc().is_none());
    }

    #[test]
    fn staleness_by_pid_and_age() {
        let live = LockInfo::current("live");
        assert!(!live.is_stale(DEFAULT_STALE_AFTER));

        let dead = LockInfo {
            pid: 999_999_999,
            ..LockInfo::current("dead")
        };
        assert!(dead.is_stale(DEFAULT_STALE_AFTER));

        let old = LockInfo {
            acquired_at: (Utc::now() - chrono::Duration::hours(2)).to_rfc3339(),
            ..LockInfo::current("old")
        };
        assert!(old.is_stale(DEFAULT_STALE_AFTER));
        assert!(!old.is_stale(Duration::from_secs(3 * 3600)));
    }

    #[test]
    fn held_error_carries_holder_in_message() {
        let err = LockError::Held {
            holder: Some(LockInfo {
                pid: 42,
                operation: "accept_task".into(),
                acquired_at: "2026-01-01T00:00:00+00:00".into(),
                hostname: "box".into(),
            }),
        };
        assert!(err.to_string().contains("accept_task"));
        assert_eq!(err.holder().map(|h| h.pid), Some(42));

        let op: OperatorError = err.into();
        assert_eq!(op.code, ErrorCode::LockHeld);
        assert!(op.recovery_options.iter().any(|r| r.contains("42")));
    }
}
