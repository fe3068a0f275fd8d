mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::Instrument;
use wo_core::Workspace;

use commands::Output;

/// worktree operator -- coordinate parallel tasks in git worktrees.
#[derive(Parser)]
#[command(name = "operator", version, about)]
struct Cli {
    /// Workspace root (holds `repo/`, `plan.md` and the `task-*` folders).
    #[arg(short, long, global = true, default_value = ".")]
    workspace: PathBuf,

    /// Print results as JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect or manage the workspace lock.
    #[command(subcommand)]
    Lock(commands::lock::LockCommand),

    /// Create, sync, accept, review and repair tasks.
    #[command(subcommand)]
    Task(commands::task::TaskCommand),

    /// Query the dependency graph in plan.md.
    #[command(subcommand)]
    Plan(commands::plan::PlanCommand),

    /// Read and write sub-agent health records.
    #[command(subcommand)]
    Health(commands::health::HealthCommand),

    /// Create or launch many tasks from plan.md.
    #[command(subcommand)]
    Batch(commands::batch::BatchCommand),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let out = Output::new(cli.json);

    let opened = Workspace::open(&cli.workspace);
    let level = opened
        .as_ref()
        .map(|ws| ws.config().log_level.clone())
        .unwrap_or_else(|_| "info".to_string());
    if cli.log_json {
        wo_telemetry::logging::init_logging_json("operator", &level);
    } else {
        wo_telemetry::logging::init_logging("operator", &level);
    }

    let result = match opened {
        Ok(ws) => {
            let span = ws.span().clone();
            dispatch(&ws, cli.command, out).instrument(span).await
        }
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            commands::report_error(&err, out);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(ws: &Workspace, command: Commands, out: Output) -> commands::Outcome {
    match command {
        Commands::Lock(cmd) => commands::lock::run(ws, cmd, out).await,
        Commands::Task(cmd) => commands::task::run(ws, cmd, out).await,
        Commands::Plan(cmd) => commands::plan::run(ws, cmd, out),
        Commands::Health(cmd) => commands::health::run(ws, cmd, out),
        Commands::Batch(cmd) => commands::batch::run(ws, cmd, out).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commands::task::TaskCommand;
    use wo_core::conflict::Resolution;

    #[test]
    fn resolve_takes_strategy_and_files() {
        let cli = Cli::try_parse_from(["operator", "task", "resolve", "a", "Theirs", "x.txt", "y.txt"]).unwrap();
        match cli.command {
            Commands::Task(TaskCommand::Resolve { name, strategy, files }) => {
                assert_eq!(name, "a");
                assert_eq!(strategy, Resolution::Theirs);
                assert_eq!(files, vec!["x.txt", "y.txt"]);
            }
            _ => panic!("expected task resolve"),
        }
        assert!(Cli::try_parse_from(["operator", "task", "resolve", "a", "mine"]).is_err());
    }

    #[test]
    fn review_flags() {
        let cli = Cli::try_parse_from(["operator", "--json", "task", "review", "a", "--no-tests"]).unwrap();
        assert!(cli.json);
        assert!(matches!(
            cli.command,
            Commands::Task(TaskCommand::Review { no_tests: true, test_command: None, .. })
        ));
    }
}
