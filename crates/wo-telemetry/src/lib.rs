//! Observability helpers shared by the worktree operator crates.
//!
//! - **Logging**: human-readable and JSON output via `tracing-subscriber`
//! - **Operations**: timed spans around a named unit of work (create, accept,
//!   batch spawn, ...) that log their outcome and elapsed time

pub mod logging;
pub mod operation;
