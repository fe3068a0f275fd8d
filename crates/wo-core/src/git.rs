use std::path::Path;

use tracing::debug;

// ---------------------------------------------------------------------------
// GitRunner trait (for testability)
// ---------------------------------------------------------------------------

/// Abstraction over git CLI operations so they can be mocked in tests.
pub trait GitRunner: Send + Sync {
    /// Run a git command in the given directory.
    ///
    /// `Err` means git could not be executed at all; a git command that ran
    /// and failed is `Ok` with `success == false`.
    fn run_git(&self, dir: &str, args: &[&str]) -> std::result::Result<GitOutput, String>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// The most useful single-line diagnostic: stderr if present, else stdout.
    pub fn message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }

    /// Whether git's own output reports a conflict.
    pub fn mentions_conflict(&self) -> bool {
        self.stdout.to_ascii_uppercase().contains("CONFLICT")
            || self.stderr.to_ascii_uppercase().contains("CONFLICT")
    }
}

/// Real git runner that shells out to the `git` binary.
pub struct RealGitRunner;

impl GitRunner for RealGitRunner {
    fn run_git(&self, dir: &str, args: &[&str]) -> std::result::Result<GitOutput, String> {
        debug!(dir, ?args, "git");
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .map_err(|e| e.to_string())?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Run git and fold "could not execute" into a failed [`GitOutput`], for
/// call sites that only care whether the command succeeded.
pub fn run(git: &dyn GitRunner, dir: &Path, args: &[&str]) -> GitOutput {
    match git.run_git(&dir.to_string_lossy(), args) {
        Ok(output) => output,
        Err(e) => GitOutput::failed(format!("failed to execute git: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Conflict detection
// ---------------------------------------------------------------------------

/// Paths git currently reports as unmerged in `dir`.
pub fn unmerged_paths(git: &dyn GitRunner, dir: &Path) -> Vec<String> {
    let output = run(git, dir, &["diff", "--name-only", "--diff-filter=U"]);
    if !output.success {
        return Vec::new();
    }
    output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Classify a failed rebase/merge. Returns `Some(paths)` when the failure
/// is a conflict, either because git said so or because unmerged paths
/// exist; the list falls back to git's `CONFLICT` lines when no paths
/// could be listed.
pub fn detect_conflict(git: &dyn GitRunner, dir: &Path, failed: &GitOutput) -> Option<Vec<String>> {
    let unmerged = unmerged_paths(git, dir);
    if !unmerged.is_empty() {
        return Some(unmerged);
    }
    if failed.mentions_conflict() {
        let lines = failed
            .stdout
            .lines()
            .chain(failed.stderr.lines())
            .filter(|l| l.to_ascii_uppercase().contains("CONFLICT"))
            .map(|l| l.trim().to_string())
            .collect();
        return Some(lines);
    }
    None
}

/// Tracked files with uncommitted changes in `dir`, as porcelain lines.
/// Untracked files are ignored; rebase, merge and `reset --hard` leave them
/// alone.
pub fn uncommitted_tracked(git: &dyn GitRunner, dir: &Path) -> Result<Vec<String>, String> {
    let output = run(git, dir, &["status", "--porcelain", "--untracked-files=no"]);
    if !output.success {
        return Err(format!("git status failed: {}", output.message()));
    }
    Ok(output
        .stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.trim_end().to_string())
        .collect())
}

/// Current commit of `rev` in `dir`, e.g. `rev_parse(git, repo, "main")`.
pub fn rev_parse(git: &dyn GitRunner, dir: &Path, rev: &str) -> Result<String, String> {
    let output = run(git, dir, &["rev-parse", rev]);
    if output.success && !output.stdout.trim().is_empty() {
        Ok(output.stdout.trim().to_string())
    } else {
        Err(format!("git rev-parse {rev} failed: {}", output.message()))
    }
}

/// Name of the checked-out branch, `None` when HEAD is detached.
pub fn current_branch(git: &dyn GitRunner, dir: &Path) -> Option<String> {
    let output = run(git, dir, &["branch", "--show-current"]);
    let name = output.stdout.trim();
    if output.success && !name.is_empty() {
        Some(name.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedGit {
        responses: Mutex<Vec<GitOutput>>,
    }

    impl GitRunner for ScriptedGit {
        fn run_git(&self, _dir: &str, _args: &[&str]) -> std::result::Result<GitOutput, String> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(GitOutput::ok(""))
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    fn scripted(responses: Vec<GitOutput>) -> ScriptedGit {
        ScriptedGit {
            responses: Mutex::new(responses),
        }
    }

    #[test]
    fn conflict_substring_is_case_insensitive() {
        assert!(GitOutput::failed("Conflict in src/lib.rs").mentions_conflict());
        assert!(GitOutput {
            success: false,
            stdout: "CONFLICT (content): Merge conflict in a.txt".into(),
            stderr: String::new(),
        }
        .mentions_conflict());
        assert!(!GitOutput::failed("fatal: not a git repository").mentions_conflict());
    }

    #[test]
    fn unmerged_paths_win_over_stderr() {
        let git = scripted(vec![GitOutput::ok("a.txt\nb.txt\n")]);
        let failed = GitOutput::failed("error: could not apply 1234");
        let paths = detect_conflict(&git, Path::new("/tmp"), &failed).unwrap();
        assert_eq!(paths, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn falls_back_to_conflict_lines() {
        let git = scripted(vec![GitOutput::ok("")]);
        let failed = GitOutput {
            success: false,
            stdout: "Auto-merging a.txt\nCONFLICT (content): Merge conflict in a.txt\n".into(),
            stderr: String::new(),
        };
        let paths = detect_conflict(&git, Path::new("/tmp"), &failed).unwrap();
        assert_eq!(paths, vec!["CONFLICT (content): Merge conflict in a.txt"]);
    }

    #[test]
    fn plain_failure_is_not_a_conflict() {
        let git = scripted(vec![GitOutput::ok("")]);
        let failed = GitOutput::failed("fatal: invalid upstream 'nope'");
        assert!(detect_conflict(&git, Path::new("/tmp"), &failed).is_none());
    }

    #[test]
    fn rev_parse_and_current_branch() {
        let git = scripted(vec![
            GitOutput::ok("abc123\n"),
            GitOutput::failed("fatal: bad revision"),
            GitOutput::ok("main\n"),
            GitOutput::ok("\n"),
        ]);
        let dir = Path::new("/tmp");
        assert_eq!(rev_parse(&git, dir, "main").unwrap(), "abc123");
        assert!(rev_parse(&git, dir, "nope").is_err());
        assert_eq!(current_branch(&git, dir).as_deref(), Some("main"));
        assert_eq!(current_branch(&git, dir), None);
    }

    #[test]
    fn uncommitted_tracked_lists_porcelain_lines() {
        let git = scripted(vec![
            GitOutput::ok(" M README.md\nA  src/new.rs\n"),
            GitOutput::ok(""),
            GitOutput::failed("fatal: not a git repository"),
        ]);
        let dir = Path::new("/tmp");
        assert_eq!(
            uncommitted_tracked(&git, dir).unwrap(),
            vec![" M README.md", "A  src/new.rs"]
        );
        assert!(uncommitted_tracked(&git, dir).unwrap().is_empty());
        assert!(uncommitted_tracked(&git, dir).is_err());
    }

    #[test]
    fn message_prefers_stderr() {
        let out = GitOutput {
            success: false,
            stdout: "out".into(),
            stderr: "  err \n".into(),
        };
        assert_eq!(out.message(), "err");
        assert_eq!(GitOutput::ok(" only out ").message(), "only out");
    }
}
