//! Shared fixtures: a recording git runner, scripted test gates and a
//! recording spawner.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use wo_core::config::WorkspaceConfig;
use wo_core::git::{GitOutput, GitRunner};
use wo_core::spawner::{SpawnError, SpawnRequest, Spawner};
use wo_core::test_runner::{TestOutcome, TestRunError, TestRunner};
use wo_core::Workspace;

// ===========================================================================
// Mock GitRunner
// ===========================================================================

struct Rule {
    /// Only match commands run in a directory ending with this.
    dir_suffix: Option<String>,
    prefix: Vec<String>,
    output: GitOutput,
    once: bool,
}

/// Records every git command and answers from prefix rules. The first
/// matching rule wins; `once` rules are consumed. Unmatched commands
/// succeed with empty output.
pub struct MockGitRunner {
    rules: Mutex<Vec<Rule>>,
    commands: Mutex<Vec<(String, Vec<String>)>>,
}

impl MockGitRunner {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
        }
    }

    /// Answers for the commands the accept checkpoint issues.
    pub fn with_checkpoint() -> Self {
        let git = Self::new();
        git.respond(&["rev-parse", "main"], GitOutput::ok("m0\n"));
        git.respond(&["rev-parse", "HEAD"], GitOutput::ok("w0\n"));
        git.respond(&["branch", "--show-current"], GitOutput::ok("main\n"));
        git
    }

    fn push_rule(&self, dir_suffix: Option<&str>, prefix: &[&str], output: GitOutput, once: bool) {
        self.rules.lock().unwrap().push(Rule {
            dir_suffix: dir_suffix.map(str::to_string),
            prefix: prefix.iter().map(|s| s.to_string()).collect(),
            output,
            once,
        });
    }

    pub fn respond(&self, prefix: &[&str], output: GitOutput) {
        self.push_rule(None, prefix, output, false);
    }

    /// Answer once, taking priority over earlier persistent rules.
    pub fn respond_once(&self, prefix: &[&str], output: GitOutput) {
        let mut rules = self.rules.lock().unwrap();
        rules.insert(
            0,
            Rule {
                dir_suffix: None,
                prefix: prefix.iter().map(|s| s.to_string()).collect(),
                output,
                once: true,
            },
        );
    }

    pub fn respond_in(&self, dir_suffix: &str, prefix: &[&str], output: GitOutput) {
        self.push_rule(Some(dir_suffix), prefix, output, false);
    }

    pub fn fail(&self, prefix: &[&str], stderr: &str) {
        self.respond(prefix, GitOutput::failed(stderr));
    }

    pub fn commands(&self) -> Vec<(String, Vec<String>)> {
        self.commands.lock().unwrap().clone()
    }

    /// Commands as `"<last dir component>: <args>"`, for readable asserts.
    pub fn transcript(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .map(|(dir, args)| {
                let dir = Path::new(&dir)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                format!("{dir}: {}", args.join(" "))
            })
            .collect()
    }

    /// Index of the first command whose args start with `prefix`.
    pub fn position(&self, prefix: &[&str]) -> Option<usize> {
        self.commands()
            .iter()
            .position(|(_, args)| starts_with(args, prefix))
    }

    pub fn ran(&self, prefix: &[&str]) -> bool {
        self.position(prefix).is_some()
    }

    pub fn count(&self, prefix: &[&str]) -> usize {
        self.commands()
            .iter()
            .filter(|(_, args)| starts_with(args, prefix))
            .count()
    }
}

fn starts_with(args: &[String], prefix: &[&str]) -> bool {
    args.len() >= prefix.len() && args.iter().zip(prefix).all(|(a, p)| a == p)
}

impl GitRunner for MockGitRunner {
    fn run_git(&self, dir: &str, args: &[&str]) -> std::result::Result<GitOutput, String> {
        let owned: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.commands
            .lock()
            .unwrap()
            .push((dir.to_string(), owned.clone()));

        let mut rules = self.rules.lock().unwrap();
        let hit = rules.iter().position(|rule| {
            starts_with(&owned, &rule.prefix.iter().map(String::as_str).collect::<Vec<_>>())
                && rule.dir_suffix.as_deref().map_or(true, |suffix| dir.ends_with(suffix))
        });
        match hit {
            Some(i) if rules[i].once => Ok(rules.remove(i).output),
            Some(i) => Ok(rules[i].output.clone()),
            None => Ok(GitOutput::ok("")),
        }
    }
}

// ===========================================================================
// Scripted TestRunner
// ===========================================================================

/// Test gate that passes or fails in a fixed order, recording where it ran.
/// Runs beyond the script pass.
pub struct ScriptedTests {
    script: Mutex<Vec<bool>>,
    pub runs: Mutex<Vec<PathBuf>>,
}

impl ScriptedTests {
    pub fn new(script: &[bool]) -> Self {
        Self {
            script: Mutex::new(script.to_vec()),
            runs: Mutex::new(Vec::new()),
        }
    }

    pub fn passing() -> Self {
        Self::new(&[])
    }

    pub fn runs(&self) -> Vec<PathBuf> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl TestRunner for ScriptedTests {
    async fn run(&self, dir: &Path, command: Option<&str>, _timeout: Duration) -> TestOutcome {
        self.runs.lock().unwrap().push(dir.to_path_buf());
        let passed = {
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                true
            } else {
                script.remove(0)
            }
        };
        let command = command.unwrap_or("scripted").to_string();
        if passed {
            TestOutcome::passed(command, Duration::from_millis(5))
        } else {
            TestOutcome::failed(
                TestRunError::Failed {
                    command,
                    exit_code: Some(1),
                },
                Duration::from_millis(5),
            )
        }
    }
}

// ===========================================================================
// Recording Spawner
// ===========================================================================

pub struct RecordingSpawner {
    fail_for: Vec<String>,
    pub spawned: Mutex<Vec<SpawnRequest>>,
}

impl RecordingSpawner {
    pub fn new() -> Self {
        Self::failing_for(&[])
    }

    pub fn failing_for(tasks: &[&str]) -> Self {
        Self {
            fail_for: tasks.iter().map(|s| s.to_string()).collect(),
            spawned: Mutex::new(Vec::new()),
        }
    }

    pub fn spawned_names(&self) -> Vec<String> {
        self.spawned
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.task_name.clone())
            .collect()
    }
}

impl Spawner for RecordingSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<u32, SpawnError> {
        if self.fail_for.contains(&request.task_name) {
            return Err(SpawnError::Launch {
                task: request.task_name.clone(),
                command: "scripted-agent".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted failure"),
            });
        }
        self.spawned.lock().unwrap().push(request.clone());
        Ok(4242)
    }
}

// ===========================================================================
// Workspace fixtures
// ===========================================================================

pub fn test_config() -> WorkspaceConfig {
    WorkspaceConfig {
        lock_timeout_secs: 1,
        ..WorkspaceConfig::default()
    }
}

/// Temp workspace with an (empty) `repo/` and the mock runner installed.
pub fn mock_workspace(git: Arc<MockGitRunner>) -> (TempDir, Workspace) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("repo")).unwrap();
    let ws = Workspace::with_config(dir.path(), test_config()).with_git_runner(git);
    (dir, ws)
}

/// Lay out `task-<name>/` with scaffold files and an empty worktree dir.
pub fn add_task(ws: &Workspace, name: &str) {
    std::fs::create_dir_all(ws.worktree_path(name)).unwrap();
    std::fs::write(
        ws.spec_path(name),
        format!("# Task: {name}\n\n## Objective\n\nMake {name} work\n"),
    )
    .unwrap();
    std::fs::write(
        ws.task_dir(name).join("feedback.md"),
        "# Feedback\n\n_No feedback yet_\n",
    )
    .unwrap();
    std::fs::write(ws.task_dir(name).join("results.md"), "# Results\n").unwrap();
}

pub fn write_plan(ws: &Workspace, content: &str) {
    std::fs::write(ws.plan_path(), content).unwrap();
}
