//! Core of the worktree operator: workspace locking, the plan dependency
//! graph, sub-agent health records, the accept transaction, conflict
//! resolution, quality review and batch create/spawn.

pub mod accept;
pub mod batch;
pub mod config;
pub mod conflict;
pub mod errors;
pub mod git;
pub mod health;
pub mod lock;
pub mod plan;
pub mod review;
pub mod spawner;
pub mod task;
pub mod test_runner;
pub mod validation;
pub mod workspace;

pub use errors::{ErrorCode, OperatorError, Result};
pub use workspace::Workspace;
