//! Input validation for task names, ticket ids and git branch names.
//!
//! Everything here runs before any side effect: a rejected value never
//! reaches git or the filesystem. Validators return the normalized value
//! (trimmed; tickets upper-cased) so callers use exactly what was checked.

use thiserror::Error;

use crate::errors::OperatorError;

const TASK_NAME_MAX: usize = 50;
const BRANCH_NAME_MAX: usize = 200;
const TICKET_PREFIX_MAX: usize = 10;
const TICKET_NUMBER_MAX: usize = 10;

const BRANCH_FORBIDDEN_CHARS: &[char] = &['~', '^', ':', '?', '*', '[', '\\', ' '];
const BRANCH_FORBIDDEN_SEQUENCES: &[&str] = &["..", "@{", "//"];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{what} cannot be empty")]
    Empty { what: &'static str },
    #[error("Invalid task name: '{0}'. Must be 1-50 characters, start with alphanumeric, and contain only letters, numbers, hyphens, and underscores.")]
    TaskName(String),
    #[error("Invalid ticket ID: '{0}'. Must be in format: PREFIX-NUMBER (e.g., K-123, PROJ-456) or a bare PREFIX")]
    Ticket(String),
    #[error("Invalid branch name: '{branch}'. Contains forbidden character: '{ch}'")]
    BranchChar { branch: String, ch: char },
    #[error("Invalid branch name: '{branch}'. Contains forbidden sequence: '{seq}'")]
    BranchSequence { branch: String, seq: &'static str },
    #[error("Invalid branch name: '{0}'. Must be 1-200 characters, start with alphanumeric.")]
    BranchPattern(String),
    #[error("Invalid branch name: '{branch}'. Cannot end with '{suffix}'")]
    BranchSuffix { branch: String, suffix: &'static str },
}

impl ValidationError {
    pub fn hint(&self) -> &'static str {
        match self {
            ValidationError::Empty { .. } => "Provide a non-empty value",
            ValidationError::TaskName(_) => "Examples: 'fix-logging', 'add_auth', 'refactor-api-v2'",
            ValidationError::Ticket(_) => "Use uppercase letters for prefix, numbers for ID",
            ValidationError::BranchChar { .. } => {
                "Git branch names cannot contain: ~ ^ : ? * [ \\ or spaces"
            }
            ValidationError::BranchSequence { .. } => "Git branch names cannot contain: .. @{ //",
            ValidationError::BranchPattern(_) => {
                "Examples: 'main', 'feature/K-123/fix-bug', 'release-1.0'"
            }
            ValidationError::BranchSuffix { .. } => "Remove the trailing '.lock' or '/'",
        }
    }
}

impl From<ValidationError> for OperatorError {
    fn from(err: ValidationError) -> Self {
        let hint = err.hint();
        OperatorError::invalid_input(err.to_string(), hint)
    }
}

// ---------------------------------------------------------------------------
// Validators
// ---------------------------------------------------------------------------

/// `^[a-zA-Z0-9][a-zA-Z0-9_-]{0,49}$`
pub fn validate_task_name(name: &str) -> Result<String, ValidationError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::Empty { what: "Task name" });
    }
    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !first_ok || !rest_ok || name.len() > TASK_NAME_MAX {
        return Err(ValidationError::TaskName(name.to_string()));
    }
    Ok(name.to_string())
}

/// `^[A-Z]{1,10}(-[0-9]{1,10})?$`, after trimming and upper-casing.
pub fn validate_ticket(ticket: &str) -> Result<String, ValidationError> {
    let ticket = ticket.trim().to_ascii_uppercase();
    if ticket.is_empty() {
        return Err(ValidationError::Empty { what: "Ticket ID" });
    }
    let (prefix, number) = match ticket.split_once('-') {
        Some((prefix, number)) => (prefix, Some(number)),
        None => (ticket.as_str(), None),
    };
    let prefix_ok = (1..=TICKET_PREFIX_MAX).contains(&prefix.len())
        && prefix.chars().all(|c| c.is_ascii_uppercase());
    let number_ok = number.map_or(true, |n| {
        (1..=TICKET_NUMBER_MAX).contains(&n.len()) && n.chars().all(|c| c.is_ascii_digit())
    });
    if !prefix_ok || !number_ok {
        return Err(ValidationError::Ticket(ticket));
    }
    Ok(ticket)
}

/// Git-safe branch name check (a conservative subset of
/// `git check-ref-format`).
pub fn validate_branch_name(branch: &str) -> Result<String, ValidationError> {
    let branch = branch.trim();
    if branch.is_empty() {
        return Err(ValidationError::Empty { what: "Branch name" });
    }
    if let Some(ch) = branch.chars().find(|c| BRANCH_FORBIDDEN_CHARS.contains(c)) {
        return Err(ValidationError::BranchChar {
            branch: branch.to_string(),
            ch,
        });
    }
    if let Some(&seq) = BRANCH_FORBIDDEN_SEQUENCES
        .iter()
        .find(|seq| branch.contains(**seq))
    {
        return Err(ValidationError::BranchSequence {
            branch: branch.to_string(),
            seq,
        });
    }
    let mut chars = branch.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || "/_.-".contains(c));
    if !first_ok || !rest_ok || branch.len() > BRANCH_NAME_MAX {
        return Err(ValidationError::BranchPattern(branch.to_string()));
    }
    for suffix in [".lock", "/"] {
        if branch.ends_with(suffix) {
            return Err(ValidationError::BranchSuffix {
                branch: branch.to_string(),
                suffix,
            });
        }
    }
    Ok(branch.to_string())
}

/// Branch convention for task sub-branches: `feature/<ticket>/<task>`.
pub fn task_branch(ticket: &str, task_name: &str) -> String {
    format!("feature/{ticket}/{task_name}")
}
