use clap::Subcommand;
use wo_core::plan::{DependencyCheck, Task, UnblockedReport};
use wo_core::Workspace;

use super::{join_or_dash, Outcome, Output};

#[derive(Subcommand)]
pub enum PlanCommand {
    /// List every task in plan.md with its status and dependencies.
    Parse,
    /// Show which tasks can start now and what blocks the rest.
    Unblocked,
    /// Check whether one task may be spawned.
    Check { name: String },
}

pub fn run(ws: &Workspace, cmd: PlanCommand, out: Output) -> Outcome {
    let plan = ws.load_plan()?;
    match cmd {
        PlanCommand::Parse => {
            out.emit(&plan.tasks(), |tasks| print_tasks(tasks))?;
            Ok(true)
        }
        PlanCommand::Unblocked => {
            let report = plan.get_unblocked();
            out.emit(&report, print_unblocked)?;
            Ok(true)
        }
        PlanCommand::Check { name } => {
            let check = plan.check_dependencies(&name);
            out.emit(&check, |check| print_check(&name, check))?;
            Ok(check.can_spawn)
        }
    }
}

fn print_tasks(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("No tasks in plan.md.");
    }
    for task in tasks {
        println!(
            "{:<24} {:<12} deps: {}",
            task.name,
            task.status.as_str(),
            join_or_dash(&task.dependencies)
        );
    }
}

fn print_unblocked(report: &UnblockedReport) {
    println!("Unblocked:   {}", join_or_dash(&report.unblocked));
    println!("In progress: {}", join_or_dash(&report.in_progress));
    println!("Completed:   {}", join_or_dash(&report.completed));
    if !report.blocked.is_empty() {
        println!("Blocked:");
        for (name, blocked) in &report.blocked {
            println!("  {name} ({}) waiting on {}", blocked.status, blocked.missing.join(", "));
        }
    }
}

fn print_check(name: &str, check: &DependencyCheck) {
    if check.can_spawn {
        println!("'{name}' can be spawned.");
    } else if check.missing.is_empty() {
        println!("'{name}' should not be spawned.");
    } else {
        println!("'{name}' is blocked by: {}", check.missing.join(", "));
    }
    if let Some(warning) = &check.warning {
        println!("  warning: {warning}");
    }
}
