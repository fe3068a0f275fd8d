use clap::Subcommand;
use wo_core::batch::{BatchCoordinator, BatchReport};
use wo_core::Workspace;

use super::{print_operator_error, Outcome, Output};

#[derive(Subcommand)]
pub enum BatchCommand {
    /// Create a folder and worktree for every PENDING task in plan.md.
    CreateAll {
        #[arg(long)]
        ticket: Option<String>,
    },
    /// Launch a sub-agent for every unblocked task.
    SpawnUnblocked {
        #[arg(long)]
        ticket: Option<String>,
        /// Skip the dependency re-check before each launch.
        #[arg(long)]
        force: bool,
    },
    /// Like spawn-unblocked, but launch at most <MAX> sub-agents.
    SpawnParallel {
        /// Launch cap (default: max_parallel from workspace.toml).
        max: Option<usize>,
        #[arg(long)]
        ticket: Option<String>,
        #[arg(long)]
        force: bool,
    },
}

pub async fn run(ws: &Workspace, cmd: BatchCommand, out: Output) -> Outcome {
    let spawner = ws.spawner();
    let batch = BatchCoordinator::new(ws, &spawner);
    let report = match cmd {
        BatchCommand::CreateAll { ticket } => batch.create_all(ticket.as_deref()).await?,
        BatchCommand::SpawnUnblocked { ticket, force } => {
            batch.spawn_unblocked(ticket.as_deref(), force)?
        }
        BatchCommand::SpawnParallel { max, ticket, force } => {
            let max = max.unwrap_or(ws.config().max_parallel);
            batch.spawn_parallel(max, ticket.as_deref(), force)?
        }
    };
    out.emit(&report, print_report)?;
    Ok(report.success)
}

fn print_report(report: &BatchReport) {
    println!("{}", report.message);
    for name in &report.created {
        println!("  created   {name}");
    }
    for name in &report.spawned {
        println!("  spawned   {name}");
    }
    for skipped in &report.skipped {
        println!("  skipped   {} ({})", skipped.task, skipped.reason);
    }
    for name in &report.remaining {
        println!("  remaining {name}");
    }
    for failure in &report.failed {
        println!("  failed    {}", failure.task);
        print_operator_error(&failure.error);
    }
}
