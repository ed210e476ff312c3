//! Statespace Exploration Core
//!
//! # Overview
//!
//! `statespace` is the backtrackable core of an explicit-state model
//! checker for multi-threaded programs. It decides *where* a thread
//! switch may happen, remembers *which* alternatives are left, and can
//! restore any earlier program state exactly.
//!
//! # Layered Architecture
//!
//! - **Domain**: choice generators, scheduling policies, the transition
//!   engine and the kernel state (heap, statics, threads)
//! - **Infrastructure**: property files, choice trace files, state dumps
//! - **Adapters**: a scripted execution collaborator and a depth-first
//!   search driver
//!
//! # Core Guarantees
//!
//! - **Restorability**: `restore(memento(s))` yields a state with the same
//!   fingerprint as `s`, in any order
//! - **Enumeration**: a cascade of choice generators enumerates the full
//!   cartesian product of its choices, the newest one varying fastest
//! - **Determinism**: for a fixed configuration the same choice path
//!   reproduces the same states, so stored traces replay exactly
//!
//! # Usage
//!
//! ```rust
//! use statespace::adapters::{scenario, DfsSearch, Finding, ScriptedProgram};
//! use statespace::domain::ClassRegistry;
//! use statespace::infrastructure::CoreConfig;
//! use std::sync::Arc;
//!
//! let program = scenario("abba").unwrap();
//! let mut search = DfsSearch::with_engine(
//!     &CoreConfig::default(),
//!     Arc::new(ClassRegistry::new()),
//!     ScriptedProgram::new(program),
//! )
//! .unwrap();
//!
//! let reports = search.run().unwrap();
//! assert!(matches!(reports[0].finding, Finding::Deadlock { .. }));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

// Layers
pub mod domain;
pub mod infrastructure;
pub mod adapters;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Re-export Primary Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

// Exploration
pub use domain::{ExecutionEngine, Step, TransitionOutcome, Vm, VmConfig, VmCore, VmSnapshot};

// Choices
pub use domain::{ChoiceGenerator, ChoicePoint, ChoiceValue, ThreadChoiceFromSet};

// Kernel state
pub use domain::{ClassRegistry, KernelState, ObjRef, ThreadId, ThreadStatus, Value};

// Errors
pub use domain::{ConfigError, EngineError, HeapError, TraceError};

// Configuration and traces
pub use infrastructure::{Config, CoreConfig, TraceFile};

// Drivers
pub use adapters::{DfsSearch, Finding, ScriptedProgram};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_defined() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_primary_types_exported() {
        let _tid = ThreadId::new(0);
        let _value = Value::Int(1);
        let _config = VmConfig::default();
        let _step = Step::Continue;
    }
}
