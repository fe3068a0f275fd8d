use std::time::Duration;

use clap::Subcommand;
use serde_json::json;
use wo_core::lock::{ForceUnlockReport, LockInfo, LockStatus};
use wo_core::Workspace;

use super::{Outcome, Output};

#[derive(Subcommand)]
pub enum LockCommand {
    /// Show whether the workspace is locked and by whom.
    Status,
    /// Remove the lock files regardless of the holder.
    Unlock {
        /// Confirm removal; without it only the current holder is shown.
        #[arg(long)]
        yes: bool,
    },
    /// Take the lock and hold it, to check that other operations wait.
    Test {
        #[arg(long, default_value_t = 5)]
        hold_secs: u64,
    },
}

pub async fn run(ws: &Workspace, cmd: LockCommand, out: Output) -> Outcome {
    match cmd {
        LockCommand::Status => {
            let status = ws.lock_status();
            out.emit(&status, print_status)?;
            Ok(true)
        }
        LockCommand::Unlock { yes: false } => {
            let status = ws.lock_status();
            out.emit(&status, |status| {
                print_status(status);
                println!("Re-run with --yes to remove the lock files.");
            })?;
            Ok(false)
        }
        LockCommand::Unlock { yes: true } => {
            let report = ws.force_unlock()?;
            out.emit(&report, print_unlock)?;
            Ok(true)
        }
        LockCommand::Test { hold_secs } => {
            let lock = ws.lock("lock_test").await?;
            if !out.is_json() {
                println!("Lock acquired; holding for {hold_secs}s...");
            }
            tokio::time::sleep(Duration::from_secs(hold_secs)).await;
            drop(lock);
            out.emit(&json!({ "success": true, "held_secs": hold_secs }), |_| {
                println!("Lock released.");
            })?;
            Ok(true)
        }
    }
}

fn describe(info: &LockInfo) -> String {
    format!(
        "operation '{}' (pid {} on {}, since {})",
        info.operation, info.pid, info.hostname, info.acquired_at
    )
}

fn print_status(status: &LockStatus) {
    match (&status.info, status.locked, status.stale) {
        (_, false, false) => println!("Workspace is not locked."),
        (Some(info), true, false) => println!("Locked by {}", describe(info)),
        (Some(info), _, true) => println!("Stale lock left by {}", describe(info)),
        (None, locked, _) => println!(
            "Lock file present ({}) with no holder info.",
            if locked { "held" } else { "not held" }
        ),
    }
}

fn print_unlock(report: &ForceUnlockReport) {
    if !report.removed_lock && !report.removed_info {
        println!("No lock files to remove.");
        return;
    }
    println!("Lock files removed.");
    if let Some(info) = &report.previous_info {
        println!("  previous holder: {}", describe(info));
    }
}
