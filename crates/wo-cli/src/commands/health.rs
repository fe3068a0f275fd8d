use std::time::Duration;

use clap::Subcommand;
use serde_json::json;
use wo_core::health::{HealthCheck, HealthSummary, StatusReport, SubagentStatus};
use wo_core::Workspace;

use super::{Outcome, Output};

#[derive(Subcommand)]
pub enum HealthCommand {
    /// Show the raw status record of a task's sub-agent.
    Status { name: String },
    /// Judge whether a task's sub-agent is alive, finished or hung.
    Check {
        name: String,
        /// Heartbeat timeout in seconds (default from workspace.toml).
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Summarise every task's sub-agent.
    List,
    /// Record a heartbeat from a running sub-agent.
    Heartbeat {
        name: String,
        #[arg(default_value = "Working")]
        progress: String,
    },
    /// Mark a sub-agent as completed.
    Complete { name: String },
    /// Mark a sub-agent as failed.
    Fail { name: String, error: String },
    /// Delete a task's status record.
    Cleanup { name: String },
}

pub fn run(ws: &Workspace, cmd: HealthCommand, out: Output) -> Outcome {
    let health = ws.health();
    match cmd {
        HealthCommand::Status { name } => {
            let report = health.read_status(&name)?;
            out.emit(&report, |r| print_report(&name, r))?;
            Ok(true)
        }
        HealthCommand::Check { name, timeout } => {
            let check = health.check_health(&name, timeout.map(Duration::from_secs))?;
            out.emit(&check, print_check)?;
            Ok(check.healthy.unwrap_or(true))
        }
        HealthCommand::List => {
            let summary = health.list_all()?;
            out.emit(&summary, print_summary)?;
            Ok(true)
        }
        HealthCommand::Heartbeat { name, progress } => {
            let record = health.heartbeat(&name, &progress)?;
            out.emit(&record, print_record)?;
            Ok(true)
        }
        HealthCommand::Complete { name } => {
            let record = health.mark_completed(&name)?;
            out.emit(&record, print_record)?;
            Ok(true)
        }
        HealthCommand::Fail { name, error } => {
            let record = health.mark_failed(&name, &error)?;
            out.emit(&record, print_record)?;
            Ok(true)
        }
        HealthCommand::Cleanup { name } => {
            let removed = health.cleanup_status(&name)?;
            out.emit(&json!({ "task_name": name, "removed": removed }), |_| {
                if removed {
                    println!("Removed status record for '{name}'.");
                } else {
                    println!("No status record for '{name}'.");
                }
            })?;
            Ok(true)
        }
    }
}

fn print_record(record: &SubagentStatus) {
    println!("{}: {} ({})", record.task_name, record.status, record.progress);
    if let Some(error) = &record.error {
        println!("  error: {error}");
    }
}

fn print_report(name: &str, report: &StatusReport) {
    let Some(record) = &report.status else {
        println!("{name}: no sub-agent started");
        return;
    };
    print_record(record);
    println!("  started:        {}", record.started_at.to_rfc3339());
    println!("  last heartbeat: {}", record.last_heartbeat.to_rfc3339());
    if let Some(completed) = record.completed_at {
        println!("  completed:      {}", completed.to_rfc3339());
    }
    if let Some(healthy) = report.is_healthy {
        println!("  healthy:        {healthy}");
    }
}

fn print_check(check: &HealthCheck) {
    println!("{}: {}", check.task_name, check.message);
    if let Some(warning) = &check.warning {
        println!("  warning: {warning}");
    }
    for option in &check.recovery_options {
        println!("  - {option}");
    }
}

fn print_summary(summary: &HealthSummary) {
    for task in &summary.tasks {
        let state = task.status.map(|s| s.as_str()).unwrap_or("not started");
        let health = match task.healthy {
            Some(false) => "  (no recent heartbeat)",
            _ => "",
        };
        println!(
            "{:<24} {:<12} {}{health}",
            task.task_name,
            state,
            task.progress.as_deref().unwrap_or("")
        );
    }
    println!(
        "{} tasks: {} starting, {} running, {} completed, {} failed, {} not started",
        summary.total,
        summary.starting,
        summary.running,
        summary.completed,
        summary.failed,
        summary.not_started
    );
}
