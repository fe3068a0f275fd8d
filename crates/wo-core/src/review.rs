//! Quality review of a task's branch before it is accepted.
//!
//! Four checks are scored 0–100 and combined with fixed weights:
//! acceptance criteria ticked in `spec.md`, the test suite, the size of the
//! diff against the main branch, and whether the changed files stay inside
//! the spec's "Files to Modify/Create" list. The weighted score maps to a
//! recommendation: accept, iterate or reset.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, Instrument};
use wo_telemetry::operation::OperationTimer;

use crate::errors::{ErrorCode, Result};
use crate::git::{self, GitRunner};
use crate::test_runner::TestRunner;
use crate::validation::validate_task_name;
use crate::workspace::Workspace;

const WEIGHT_CRITERIA: f64 = 0.40;
const WEIGHT_TESTS: f64 = 0.30;
const WEIGHT_DIFF: f64 = 0.15;
const WEIGHT_SCOPE: f64 = 0.15;

const ACCEPT_SCORE: f64 = 90.0;
const ITERATE_SCORE: f64 = 50.0;
/// More files than this outside the expected scope forces a reset.
const MAX_OUT_OF_SCOPE: usize = 5;
const OUT_OF_SCOPE_PENALTY: f64 = 20.0;
const MAX_SCOPE_PENALTY: f64 = 80.0;

/// The scaffold's example entry under "Files to Modify".
const PLACEHOLDER_PATH: &str = "path/to/file";

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criterion {
    pub text: String,
    pub met: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriteriaCheck {
    pub total: usize,
    pub met: usize,
    pub criteria: Vec<Criterion>,
    pub score: f64,
}

impl CriteriaCheck {
    pub fn unmet(&self) -> impl Iterator<Item = &Criterion> {
        self.criteria.iter().filter(|c| !c.met)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Passing,
    Failing,
    /// Skipped on request, or no test command could be found.
    NotRun,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCheck {
    pub status: TestStatus,
    pub score: f64,
    pub command: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffAssessment {
    NoChanges,
    Small,
    Reasonable,
    Large,
    Excessive,
    /// The diff could not be computed.
    Error,
}

impl DiffAssessment {
    fn for_lines(total: u64) -> Self {
        match total {
            0 => Self::NoChanges,
            1..=99 => Self::Small,
            100..=499 => Self::Reasonable,
            500..=999 => Self::Large,
            _ => Self::Excessive,
        }
    }

    pub fn score(&self) -> f64 {
        match self {
            Self::NoChanges | Self::Small => 100.0,
            Self::Reasonable => 90.0,
            Self::Large => 70.0,
            Self::Excessive | Self::Error => 50.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffCheck {
    pub files_changed: usize,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub assessment: DiffAssessment,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeCheck {
    pub expected: Vec<String>,
    pub out_of_scope: Vec<String>,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ScopeCheck {
    pub fn in_scope(&self) -> bool {
        self.out_of_scope.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    Accept,
    Iterate,
    Reset,
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Accept => "ACCEPT",
            Self::Iterate => "ITERATE",
            Self::Reset => "RESET",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub task_name: String,
    pub ticket: Option<String>,
    pub branch: Option<String>,
    pub compared_to: String,
    /// Weighted 0–100, one decimal.
    pub score: f64,
    pub recommendation: Recommendation,
    pub reasoning: Vec<String>,
    pub acceptance_criteria: CriteriaCheck,
    pub tests: TestCheck,
    pub diff: DiffCheck,
    pub scope: ScopeCheck,
}

#[derive(Debug, Clone, Default)]
pub struct ReviewOptions {
    pub skip_tests: bool,
    pub test_command: Option<String>,
}

// ---------------------------------------------------------------------------
// spec.md parsing
// ---------------------------------------------------------------------------

/// Lines of the `## <title>...` section, up to the next `##` heading.
/// `title` matches case-insensitively against the start of the heading.
fn section<'a>(spec: &'a str, titles: &[&str]) -> Option<Vec<&'a str>> {
    let mut lines = spec.lines();
    lines.by_ref().find(|line| {
        line.strip_prefix("##")
            .map(|rest| {
                let rest = rest.trim_start().to_ascii_lowercase();
                titles.iter().any(|t| rest.starts_with(t))
            })
            .unwrap_or(false)
    })?;
    Some(lines.take_while(|line| !line.starts_with("##")).collect())
}

/// `- [ ] text` / `* [x] text` checkbox items of the acceptance criteria.
pub fn parse_criteria(spec: &str) -> CriteriaCheck {
    let criteria: Vec<Criterion> = section(spec, &["acceptance criteria"])
        .unwrap_or_default()
        .into_iter()
        .filter_map(|line| {
            let item = line.trim_start();
            let item = item.strip_prefix('-').or_else(|| item.strip_prefix('*'))?.trim_start();
            let (met, text) = if let Some(text) = item.strip_prefix("[ ]") {
                (false, text)
            } else if let Some(text) = item.strip_prefix("[x]").or_else(|| item.strip_prefix("[X]")) {
                (true, text)
            } else {
                return None;
            };
            let text = text.trim();
            (!text.is_empty()).then(|| Criterion {
                text: text.to_string(),
                met,
            })
        })
        .collect();

    let total = criteria.len();
    let met = criteria.iter().filter(|c| c.met).count();
    let score = if total == 0 {
        100.0
    } else {
        met as f64 / total as f64 * 100.0
    };
    CriteriaCheck {
        total,
        met,
        criteria,
        score,
    }
}

/// Backticked paths listed under "Files to Modify" or "Files to Create".
/// `None` when the spec has neither section.
pub fn parse_expected_files(spec: &str) -> Option<Vec<String>> {
    let mut found = false;
    let mut files = Vec::new();
    for title in ["files to modify", "files to create"] {
        let Some(lines) = section(spec, &[title]) else {
            continue;
        };
        found = true;
        for line in lines {
            let mut rest = line;
            while let Some(start) = rest.find('`') {
                let after = &rest[start + 1..];
                let Some(end) = after.find('`') else {
                    break;
                };
                let path = after[..end].trim();
                if !path.is_empty() && path != PLACEHOLDER_PATH && !files.iter().any(|f| f == path) {
                    files.push(path.to_string());
                }
                rest = &after[end + 1..];
            }
        }
    }
    found.then_some(files)
}

/// The `## Ticket: X` line of a task spec.
pub fn parse_ticket(spec: &str) -> Option<String> {
    spec.lines()
        .find_map(|line| line.strip_prefix("## Ticket:"))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Whether `changed` is covered by an expected entry: the same path, a file
/// under an expected directory, or a match for a trailing-`*` prefix.
fn covered(changed: &str, expected: &str) -> bool {
    if let Some(prefix) = expected.strip_suffix('*') {
        return changed.starts_with(prefix);
    }
    let expected = expected.trim_end_matches('/');
    changed == expected
        || changed
            .strip_prefix(expected)
            .is_some_and(|rest| rest.starts_with('/'))
}

pub fn check_scope(expected: Option<Vec<String>>, changed: &[String]) -> ScopeCheck {
    let Some(expected) = expected else {
        return ScopeCheck {
            expected: Vec::new(),
            out_of_scope: Vec::new(),
            score: 100.0,
            warnings: vec!["spec.md lists no files to modify; scope not checked".to_string()],
        };
    };
    let out_of_scope: Vec<String> = changed
        .iter()
        .filter(|file| !expected.iter().any(|e| covered(file, e)))
        .cloned()
        .collect();
    let penalty = (out_of_scope.len() as f64 * OUT_OF_SCOPE_PENALTY).min(MAX_SCOPE_PENALTY);
    ScopeCheck {
        expected,
        score: 100.0 - penalty,
        out_of_scope,
        warnings: Vec::new(),
    }
}

/// `git diff --numstat` output into a size check and the changed paths.
/// Binary files count as changed with no lines.
pub fn check_diff(numstat: &str) -> (DiffCheck, Vec<String>) {
    let mut added = 0u64;
    let mut removed = 0u64;
    let mut files = Vec::new();
    for line in numstat.lines() {
        let mut fields = line.splitn(3, '\t');
        let (Some(a), Some(r), Some(path)) = (fields.next(), fields.next(), fields.next()) else {
            continue;
        };
        added += a.parse::<u64>().unwrap_or(0);
        removed += r.parse::<u64>().unwrap_or(0);
        files.push(path.to_string());
    }
    let assessment = if files.is_empty() {
        DiffAssessment::NoChanges
    } else {
        DiffAssessment::for_lines(added + removed)
    };
    let check = DiffCheck {
        files_changed: files.len(),
        lines_added: added,
        lines_removed: removed,
        score: assessment.score(),
        assessment,
        error: None,
    };
    (check, files)
}

fn diff_error(message: String) -> DiffCheck {
    DiffCheck {
        files_changed: 0,
        lines_added: 0,
        lines_removed: 0,
        assessment: DiffAssessment::Error,
        score: DiffAssessment::Error.score(),
        error: Some(message),
    }
}

fn changed_since(git: &dyn GitRunner, worktree: &Path, main: &str) -> (DiffCheck, Vec<String>) {
    let range = format!("{main}...HEAD");
    let output = git::run(git, worktree, &["diff", "--numstat", "--no-renames", &range]);
    if output.success {
        check_diff(&output.stdout)
    } else {
        (diff_error(format!("git diff {range} failed: {}", output.message())), Vec::new())
    }
}

pub fn weighted_score(criteria: f64, tests: f64, diff: f64, scope: f64) -> f64 {
    let raw = criteria * WEIGHT_CRITERIA + tests * WEIGHT_TESTS + diff * WEIGHT_DIFF + scope * WEIGHT_SCOPE;
    (raw * 10.0).round() / 10.0
}

pub fn recommend(
    score: f64,
    criteria: &CriteriaCheck,
    tests: &TestCheck,
    diff: &DiffCheck,
    scope: &ScopeCheck,
) -> (Recommendation, Vec<String>) {
    let mut reasoning = Vec::new();
    let recommendation = if tests.status == TestStatus::Failing {
        reasoning.push("Tests are failing; fix them before accepting".to_string());
        Recommendation::Iterate
    } else if scope.out_of_scope.len() > MAX_OUT_OF_SCOPE {
        reasoning.push(format!(
            "{} files changed outside the expected scope; the approach has drifted",
            scope.out_of_scope.len()
        ));
        Recommendation::Reset
    } else if score >= ACCEPT_SCORE {
        reasoning.push(format!("Quality score {score} meets the acceptance bar of {ACCEPT_SCORE}"));
        Recommendation::Accept
    } else if score >= ITERATE_SCORE {
        reasoning.push(format!("Quality score {score} is below {ACCEPT_SCORE}; another iteration should close the gap"));
        Recommendation::Iterate
    } else {
        reasoning.push(format!("Quality score {score} is below {ITERATE_SCORE}; starting over is likely cheaper"));
        Recommendation::Reset
    };

    let unmet = criteria.total - criteria.met;
    if unmet > 0 {
        reasoning.push(format!("{unmet} of {} acceptance criteria not met", criteria.total));
    }
    if tests.status == TestStatus::NotRun {
        reasoning.push(tests.message.clone());
    }
    if matches!(diff.assessment, DiffAssessment::Large | DiffAssessment::Excessive) {
        reasoning.push(format!(
            "Diff is {} ({} lines across {} files)",
            if diff.assessment == DiffAssessment::Large { "large" } else { "excessive" },
            diff.lines_added + diff.lines_removed,
            diff.files_changed
        ));
    }
    if let Some(error) = &diff.error {
        reasoning.push(format!("Diff size unknown: {error}"));
    }
    if !scope.out_of_scope.is_empty() && recommendation != Recommendation::Reset {
        reasoning.push(format!("Out of scope: {}", scope.out_of_scope.join(", ")));
    }
    (recommendation, reasoning)
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

impl Workspace {
    /// Score a task's branch against its spec. Read-only apart from running
    /// the test suite in the worktree.
    pub async fn review_task(
        &self,
        name: &str,
        runner: &dyn TestRunner,
        opts: &ReviewOptions,
    ) -> Result<QualityReport> {
        let name = validate_task_name(name)?;
        let worktree = self.existing_worktree(&name)?;
        let main = self.config().main_branch.clone();
        let timer = OperationTimer::start("review_task");

        let spec = std::fs::read_to_string(self.spec_path(&name)).unwrap_or_default();
        let acceptance_criteria = parse_criteria(&spec);

        let tests = if opts.skip_tests {
            TestCheck {
                status: TestStatus::NotRun,
                score: 50.0,
                command: None,
                message: "Tests skipped by request".to_string(),
            }
        } else {
            let outcome = runner
                .run(&worktree, opts.test_command.as_deref(), self.test_timeout())
                .instrument(timer.span().clone())
                .await;
            if outcome.passed {
                TestCheck {
                    status: TestStatus::Passing,
                    score: 100.0,
                    command: outcome.command,
                    message: "Tests pass".to_string(),
                }
            } else if outcome.error_code() == Some(ErrorCode::TestDetectionFailed) {
                TestCheck {
                    status: TestStatus::NotRun,
                    score: 50.0,
                    command: None,
                    message: "No test command detected; tests not run".to_string(),
                }
            } else {
                TestCheck {
                    status: TestStatus::Failing,
                    score: 0.0,
                    message: outcome
                        .error
                        .map(|e| e.message)
                        .unwrap_or_else(|| "Tests failed".to_string()),
                    command: outcome.command,
                }
            }
        };

        let (diff, changed) = changed_since(self.git(), &worktree, &main);
        let scope = check_scope(parse_expected_files(&spec), &changed);

        let score = weighted_score(acceptance_criteria.score, tests.score, diff.score, scope.score);
        let (recommendation, reasoning) = recommend(score, &acceptance_criteria, &tests, &diff, &scope);

        info!(task = %name, score, %recommendation, "task reviewed");
        timer.finish(true);
        Ok(QualityReport {
            task_name: name,
            ticket: parse_ticket(&spec),
            branch: git::current_branch(self.git(), &worktree),
            compared_to: main,
            score,
            recommendation,
            reasoning,
            acceptance_criteria,
            tests,
            diff,
            scope,
        })
    }
}
