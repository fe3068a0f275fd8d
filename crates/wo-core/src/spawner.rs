use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::errors::{ErrorCode, OperatorError};

/// Everything a spawner needs to launch one sub-agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub task_name: String,
    pub ticket: String,
    pub task_dir: PathBuf,
    pub worktree: PathBuf,
}

impl SpawnRequest {
    /// A task is being iterated when its feedback file holds real review
    /// notes rather than the scaffold placeholder.
    pub fn is_iteration(&self) -> bool {
        std::fs::read_to_string(self.task_dir.join("feedback.md"))
            .map(|content| !content.contains("No feedback yet") && content.trim().len() > 50)
            .unwrap_or(false)
    }

    pub fn prompt(&self) -> String {
        let task_dir = self.task_dir.display();
        let worktree = self.worktree.display();
        let (iteration, feedback_step) = if self.is_iteration() {
            (
                "\nThis is a follow-up iteration: read feedback.md FIRST and build on your previous commits.\n",
                format!("Read {task_dir}/feedback.md and address every point"),
            )
        } else {
            ("", "Check feedback.md for any notes".to_string())
        };
        format!(
            "You are a sub-agent working on task '{task}'.\n\
             \n\
             Task folder: {task_dir}\n\
             Worktree: {worktree} (work ONLY here)\n\
             {iteration}\n\
             1. Read ../spec.md ({task_dir}/spec.md) to understand the task\n\
             2. {feedback_step}\n\
             3. Make changes in {worktree}, run the tests, commit as \"{ticket}: <summary>\"\n\
             4. Write {task_dir}/results.md: summary, files touched, test results, risks, commits\n\
             5. Exit when complete\n\
             \n\
             Do NOT modify files outside the worktree, merge branches, push, or edit plan.md.\n",
            task = self.task_name,
            ticket = self.ticket,
        )
    }
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Failed to launch `{command}` for task '{task}': {source}")]
    Launch {
        task: String,
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<SpawnError> for OperatorError {
    fn from(err: SpawnError) -> Self {
        OperatorError::new(ErrorCode::SubagentSpawnFailed, err.to_string())
            .with_hint("Check that spawn_command in workspace.toml is installed and on PATH.")
    }
}

/// Launches a sub-agent process. Only success or failure of the launch is
/// observed; the agent reports progress through its health record.
pub trait Spawner: Send + Sync {
    /// Returns the launched process id.
    fn spawn(&self, request: &SpawnRequest) -> Result<u32, SpawnError>;
}

/// Runs `<command> <args...> <prompt>` detached, inside the worktree.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    command: String,
    args: Vec<String>,
}

impl CommandSpawner {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Spawner for CommandSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<u32, SpawnError> {
        let mut command = std::process::Command::new(&self.command);
        command
            .args(&self.args)
            .arg(request.prompt())
            .current_dir(&request.worktree)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // Own process group: Ctrl-C on the operator must not reach the agent.
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut command, 0);

        let mut child = command.spawn().map_err(|source| SpawnError::Launch {
            task: request.task_name.clone(),
            command: self.command_line(),
            source,
        })?;
        let pid = child.id();
        info!(task = %request.task_name, pid, command = %self.command, "sub-agent launched");

        // Reap the agent if it exits while we are still running. When the
        // operator exits first, init adopts the agent.
        let task = request.task_name.clone();
        let reaper = std::thread::Builder::new()
            .name(format!("reap-{pid}"))
            .spawn(move || match child.wait() {
                Ok(status) => debug!(task = %task, pid, %status, "sub-agent exited"),
                Err(e) => warn!(task = %task, pid, error = %e, "could not wait for sub-agent"),
            });
        if let Err(e) = reaper {
            warn!(task = %request.task_name, pid, error = %e, "no reaper thread; sub-agent stays a zombie until exit");
        }
        Ok(pid)
    }
}

/// Convenience for building a request from the workspace layout.
pub fn request_for(task_dir: &Path, task_name: &str, ticket: &str) -> SpawnRequest {
    SpawnRequest {
        task_name: task_name.to_string(),
        ticket: ticket.to_string(),
        task_dir: task_dir.to_path_buf(),
        worktree: task_dir.join("worktree"),
    }
}
