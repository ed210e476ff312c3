//! Adapters Layer - Drivers and Collaborators
//!
//! Plugs concrete behavior into the domain ports:
//!
//! ```text
//!   DfsSearch ──drives──▶ Vm<E> ◀──executes── ScriptedProgram (E)
//! ```
//!
//! # Responsibilities
//! - A scripted [`ExecutionEngine`](crate::domain::vm::ExecutionEngine)
//!   with built-in concurrency scenarios
//! - Depth-first search with property checks and error traces

pub mod scripted;
pub mod search;

// Re-exports
pub use scripted::{scenario, Op, Operand, Program, ScriptedProgram, SCENARIOS};
pub use search::{DfsSearch, ErrorReport, Finding, SearchStats};
