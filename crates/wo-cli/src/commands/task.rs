use clap::Subcommand;
use wo_core::accept::{AcceptOptions, AcceptReport};
use wo_core::conflict::{ConflictReport, ContinueReport, Resolution, ResolveReport};
use wo_core::review::{QualityReport, Recommendation, ReviewOptions};
use wo_core::task::{SyncAllReport, TaskStatusReport};
use wo_core::Workspace;

use super::{join_or_dash, print_operator_error, Outcome, Output};

#[derive(Subcommand)]
pub enum TaskCommand {
    /// Create a task folder and its worktree on `feature/<ticket>/<name>`.
    Create {
        ticket: String,
        name: String,
        /// Branch or commit to start from (default: the main branch).
        #[arg(long)]
        base: Option<String>,
    },
    /// Rebase a task's worktree onto the main branch.
    Sync { name: String },
    /// Rebase every task that has a worktree.
    SyncAll,
    /// Discard a task's work and reset it to the main branch.
    Reset { name: String },
    /// Test, merge into main and clean up; rolls back on any failure.
    Accept {
        ticket: String,
        name: String,
        /// Do not push the main branch after merging.
        #[arg(long)]
        no_push: bool,
        /// Leave the remote feature branch in place.
        #[arg(long)]
        keep_remote_branch: bool,
        /// Test command for both gates (default: configured or detected).
        #[arg(long)]
        test_command: Option<String>,
    },
    /// Show one task's files, git state and sub-agent status.
    Status { name: String },
    /// List every task in the workspace.
    List,
    /// Show the rebase or merge stopped in a task's worktree and its conflicts.
    Conflicts { name: String },
    /// Resolve conflicted files by keeping one side (ours, theirs or manual).
    Resolve {
        name: String,
        strategy: Resolution,
        /// Files to resolve (default: every conflicted file).
        files: Vec<String>,
    },
    /// Continue the stopped rebase or merge once conflicts are resolved.
    Continue {
        name: String,
        /// Commit message when finishing a merge.
        #[arg(long, short)]
        message: Option<String>,
    },
    /// Abort the stopped rebase or merge in a task's worktree.
    Abort { name: String },
    /// Score a task against its spec and recommend accept, iterate or reset.
    Review {
        name: String,
        /// Score without running the test suite.
        #[arg(long)]
        no_tests: bool,
        /// Test command (default: configured or detected).
        #[arg(long)]
        test_command: Option<String>,
    },
}

pub async fn run(ws: &Workspace, cmd: TaskCommand, out: Output) -> Outcome {
    match cmd {
        TaskCommand::Create { ticket, name, base } => {
            let created = ws.create_task(&ticket, &name, base.as_deref()).await?;
            out.emit(&created, |c| {
                println!("Created task '{}' on branch {} (from {})", c.task_name, c.branch, c.based_on);
                println!("  folder:   {}", c.task_dir.display());
                println!("  worktree: {}", c.worktree_path.display());
            })?;
            Ok(true)
        }
        TaskCommand::Sync { name } => {
            let synced = ws.sync_task(&name).await?;
            out.emit(&synced, |s| {
                println!("Rebased '{}' onto {}", s.task_name, s.rebased_onto);
                if !s.fetched {
                    println!("  (fetch failed; rebased onto the local branch)");
                }
            })?;
            Ok(true)
        }
        TaskCommand::SyncAll => {
            let report = ws.sync_all().await?;
            out.emit(&report, print_sync_all)?;
            Ok(report.success)
        }
        TaskCommand::Reset { name } => {
            let reset = ws.reset_task(&name).await?;
            out.emit(&reset, |r| {
                println!("Reset '{}' to {}", r.task_name, r.reset_to);
            })?;
            Ok(true)
        }
        TaskCommand::Accept {
            ticket,
            name,
            no_push,
            keep_remote_branch,
            test_command,
        } => {
            let mut opts = AcceptOptions::from_config(ws.config());
            opts.push &= !no_push;
            opts.delete_remote_branch &= !keep_remote_branch;
            opts.test_command = test_command;

            let tests = ws.test_runner();
            let report = ws.accept_task(&ticket, &name, &opts, &tests).await?;
            out.emit(&report, print_accept)?;
            Ok(report.success)
        }
        TaskCommand::Status { name } => {
            let status = ws.task_status(&name)?;
            out.emit(&status, print_status)?;
            Ok(status.exists)
        }
        TaskCommand::List => {
            let tasks = ws.list_tasks()?;
            out.emit(&tasks, |tasks| {
                if tasks.is_empty() {
                    println!("No tasks.");
                }
                for t in tasks {
                    let state = t
                        .subagent
                        .as_ref()
                        .map(|s| s.status.as_str())
                        .unwrap_or("-");
                    println!(
                        "{:<24} {:<40} {:>3} uncommitted  agent: {state}",
                        t.task_name,
                        t.branch.as_deref().unwrap_or("-"),
                        t.uncommitted_changes,
                    );
                }
            })?;
            Ok(true)
        }
        TaskCommand::Conflicts { name } => {
            let report = ws.task_conflicts(&name)?;
            out.emit(&report, print_conflicts)?;
            Ok(!report.has_conflicts)
        }
        TaskCommand::Resolve { name, strategy, files } => {
            let report = ws.resolve_conflicts(&name, strategy, &files).await?;
            out.emit(&report, print_resolve)?;
            Ok(report.success)
        }
        TaskCommand::Continue { name, message } => {
            let report = ws.continue_operation(&name, message.as_deref()).await?;
            out.emit(&report, print_continue)?;
            Ok(report.success)
        }
        TaskCommand::Abort { name } => {
            let report = ws.abort_operation(&name).await?;
            out.emit(&report, |r| println!("{}", r.message))?;
            Ok(true)
        }
        TaskCommand::Review {
            name,
            no_tests,
            test_command,
        } => {
            let opts = ReviewOptions {
                skip_tests: no_tests,
                test_command,
            };
            let tests = ws.test_runner();
            let report = ws.review_task(&name, &tests, &opts).await?;
            out.emit(&report, print_review)?;
            Ok(report.recommendation != Recommendation::Reset)
        }
    }
}

fn print_sync_all(report: &SyncAllReport) {
    println!("Synced:  {}", join_or_dash(&report.synced));
    println!("Skipped: {}", join_or_dash(&report.skipped));
    for failure in &report.failed {
        println!("Failed:  {}", failure.task);
        print_operator_error(&failure.error);
    }
}

fn print_accept(report: &AcceptReport) {
    println!("{}", report.message);
    for step in &report.steps {
        let mark = if step.completed { "ok" } else { "FAILED" };
        match &step.error {
            Some(error) => println!("  [{mark}] {}: {error}", step.name.as_str()),
            None => println!("  [{mark}] {}", step.name.as_str()),
        }
    }
    for warning in &report.warnings {
        println!("  warning: {warning}");
    }
    match report.rolled_back {
        Some(true) => println!("Rolled back to the checkpoint."),
        Some(false) => {
            println!("Rollback INCOMPLETE; fix by hand:");
            for error in &report.rollback_errors {
                println!("  - {error}");
            }
        }
        None => {}
    }
    if let Some(error) = &report.error {
        print_operator_error(error);
    }
}

fn print_status(status: &TaskStatusReport) {
    if !status.exists {
        println!("Task '{}' does not exist ({})", status.task_name, status.task_dir.display());
        return;
    }
    println!("Task '{}'", status.task_name);
    println!(
        "  files:    spec={} feedback={} results={}",
        status.files.spec, status.files.feedback, status.files.results
    );
    if !status.has_worktree {
        println!("  worktree: missing");
    }
    if let Some(branch) = &status.branch {
        println!("  branch:   {branch}");
    }
    if let Some(total) = status.total_commits {
        println!("  commits:  {total}");
    }
    if let Some(last) = &status.last_commit {
        println!("  last:     {last}");
    }
    println!("  uncommitted: {}", status.uncommitted_changes);
    for file in &status.uncommitted_files {
        println!("    {file}");
    }
    if let Some(summary) = &status.results_summary {
        println!("  results:  {summary}");
    }
    if let Some(agent) = &status.subagent {
        println!("  agent:    {} ({})", agent.status, agent.progress);
    }
}

fn print_conflicts(report: &ConflictReport) {
    match report.operation {
        Some(op) => println!("Task '{}': {op} in progress", report.task_name),
        None => println!("Task '{}': no rebase or merge in progress", report.task_name),
    }
    if !report.has_conflicts {
        println!("  no conflicted files");
        return;
    }
    for file in &report.files {
        println!("  {} ({} conflict(s))", file.path, file.markers.conflict_count);
        for line in file.markers.preview.lines() {
            println!("    | {line}");
        }
    }
    println!("Resolve with: operator task resolve {} <ours|theirs|manual> [files...]", report.task_name);
    println!("Or give up:   operator task abort {}", report.task_name);
}

fn print_resolve(report: &ResolveReport) {
    println!("{}", report.message);
    for path in &report.resolved {
        println!("  resolved: {path}");
    }
    for path in &report.manual {
        println!("  manual:   {path}");
    }
    for failure in &report.failed {
        println!("  failed:   {} ({})", failure.path, failure.error);
    }
    if report.success && !report.resolved.is_empty() {
        println!("Next: operator task continue {}", report.task_name);
    }
}

fn print_continue(report: &ContinueReport) {
    println!("{}", report.message);
    for path in &report.conflicted_files {
        println!("  conflict: {path}");
    }
}

fn print_review(report: &QualityReport) {
    println!(
        "Task '{}': {} (score {:.1})",
        report.task_name, report.recommendation, report.score
    );
    let criteria = &report.acceptance_criteria;
    println!("  criteria: {}/{} met ({:.0})", criteria.met, criteria.total, criteria.score);
    for criterion in criteria.unmet() {
        println!("    [ ] {}", criterion.text);
    }
    println!("  tests:    {:?} ({:.0}) {}", report.tests.status, report.tests.score, report.tests.message);
    println!(
        "  diff:     +{} -{} in {} file(s), {:?} ({:.0})",
        report.diff.lines_added,
        report.diff.lines_removed,
        report.diff.files_changed,
        report.diff.assessment,
        report.diff.score
    );
    println!(
        "  scope:    {} out of scope ({:.0})",
        report.scope.out_of_scope.len(),
        report.scope.score
    );
    for reason in &report.reasoning {
        println!("  - {reason}");
    }
}
