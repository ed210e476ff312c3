//! Depth-First Search Driver
//!
//! Drives a [`Vm`] through its state space with the plain
//! forward/backtrack protocol:
//!
//! ```text
//!            ┌──────────── forward() ────────────┐
//!            │                                   ▼
//!   ┌────────┴───────┐   new state     ┌─────────────────┐
//!   │  current node  │ ──────────────▶ │ check findings  │
//!   └────────┬───────┘                 └────────┬────────┘
//!            │ Ok(None) / visited / end          │ finding
//!            ▼                                   ▼
//!       backtrack()                     record ErrorReport
//!   (false at root = done)          (stop, or backtrack if
//!                                      multiple_errors)
//! ```
//!
//! # Design Notes
//!
//! The driver owns no exploration state of its own; the choice generators
//! on the VM path carry the remaining alternatives. A finding is reported
//! once per state, together with the choice trace that reproduces it.

use crate::domain::classes::ClassRegistry;
use crate::domain::error::EngineError;
use crate::domain::threads::{ThreadId, ThreadStatus};
use crate::domain::vm::{ExecutionEngine, Vm};
use crate::infrastructure::config::{CoreConfig, SearchConfig};
use crate::infrastructure::trace_file::TraceFile;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Property violation found in a state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    /// Live threads exist but none can run
    Deadlock {
        /// Live threads and their statuses
        threads: Vec<(ThreadId, ThreadStatus)>,
    },
    /// A thread blocked while holding an atomic section
    BlockedInAtomic {
        /// Thread that executed the last transition
        thread: ThreadId,
    },
    /// A thread terminated with an exception
    UncaughtException {
        /// Terminated thread
        thread: ThreadId,
        /// Exception text
        message: String,
    },
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deadlock { threads } => {
                f.write_str("deadlock:")?;
                for (tid, status) in threads {
                    write!(f, " {tid}={status}")?;
                }
                Ok(())
            }
            Self::BlockedInAtomic { thread } => write!(f, "{thread} blocked inside atomic section"),
            Self::UncaughtException { thread, message } => write!(f, "uncaught exception in {thread}: {message}"),
        }
    }
}

/// A finding plus the trace leading to it
#[derive(Debug, Clone)]
pub struct ErrorReport {
    /// What went wrong
    pub finding: Finding,
    /// Choices from the initial state, commented with the finding
    pub trace: TraceFile,
    /// Path length at detection
    pub depth: usize,
}

/// Exploration counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchStats {
    /// Executed transitions
    pub transitions: usize,
    /// Transitions that reached an unseen state
    pub new_states: usize,
    /// Distinct states at the end of the search
    pub visited_states: usize,
    /// Performed backtracks
    pub backtracks: usize,
    /// End states reached
    pub end_states: usize,
    /// Longest path
    pub max_depth: usize,
    /// Transitions marked ignored
    pub ignored: usize,
    /// Paths cut at the depth limit
    pub depth_limited: usize,
}

/// Depth-first exploration of a [`Vm`]
pub struct DfsSearch<E: ExecutionEngine> {
    vm: Vm<E>,
    config: SearchConfig,
    application: String,
    stats: SearchStats,
    reports: Vec<ErrorReport>,
}

impl<E: ExecutionEngine> DfsSearch<E> {
    /// Search over an initialized VM
    pub fn new(vm: Vm<E>, config: SearchConfig, application: String) -> Self {
        Self {
            vm,
            config,
            application,
            stats: SearchStats::default(),
            reports: Vec::new(),
        }
    }

    /// Create and initialize the VM for `engine`, then wrap it
    pub fn with_engine(config: &CoreConfig, classes: Arc<ClassRegistry>, engine: E) -> Result<Self, EngineError> {
        let mut vm = Vm::new(&config.vm, classes, engine)?;
        vm.initialize()?;
        Ok(Self::new(vm, config.search.clone(), config.target.clone()))
    }

    /// Explored VM
    pub const fn vm(&self) -> &Vm<E> {
        &self.vm
    }

    /// Explored VM, modifiable
    pub fn vm_mut(&mut self) -> &mut Vm<E> {
        &mut self.vm
    }

    /// Counters so far
    pub const fn stats(&self) -> &SearchStats {
        &self.stats
    }

    /// Findings so far, in detection order
    pub fn reports(&self) -> &[ErrorReport] {
        &self.reports
    }

    /// Trace application name
    pub fn application(&self) -> &str {
        &self.application
    }

    /// Explore until the space is exhausted, or until the first finding
    /// unless `multiple_errors` is set
    pub fn run(&mut self) -> Result<&[ErrorReport], EngineError> {
        info!(
            application = self.application.as_str(),
            depth_limit = ?self.config.depth_limit,
            "search started"
        );
        loop {
            if self.at_depth_limit() {
                self.stats.depth_limited += 1;
                if !self.backtrack() {
                    break;
                }
                continue;
            }

            let Some(outcome) = self.vm.forward()? else {
                if !self.backtrack() {
                    break;
                }
                continue;
            };
            self.stats.transitions += 1;
            self.stats.max_depth = self.stats.max_depth.max(self.vm.depth());

            if outcome.is_ignored {
                self.stats.ignored += 1;
                self.backtrack();
                continue;
            }
            if !outcome.is_new {
                self.backtrack();
                continue;
            }
            self.stats.new_states += 1;

            if let Some(finding) = self.check_state(outcome.thread) {
                warn!(depth = self.vm.depth(), state = outcome.state_id, %finding, "property violated");
                self.record(finding);
                if !self.config.multiple_errors {
                    break;
                }
                self.backtrack();
                continue;
            }
            if outcome.is_end {
                self.stats.end_states += 1;
                self.backtrack();
            }
        }

        self.stats.visited_states = self.vm.visited_states();
        info!(
            transitions = self.stats.transitions,
            states = self.stats.visited_states,
            backtracks = self.stats.backtracks,
            max_depth = self.stats.max_depth,
            findings = self.reports.len(),
            "search finished"
        );
        Ok(&self.reports)
    }

    fn at_depth_limit(&self) -> bool {
        self.config
            .depth_limit
            .is_some_and(|limit| self.vm.depth() as u64 >= limit)
    }

    fn backtrack(&mut self) -> bool {
        let backtracked = self.vm.backtrack();
        if backtracked {
            self.stats.backtracks += 1;
        }
        backtracked
    }

    /// First violated property of the current state
    fn check_state(&self, last: ThreadId) -> Option<Finding> {
        let kernel = self.vm.kernel();
        if let Some(ti) = kernel.threads.iter().find(|ti| ti.uncaught_exception.is_some()) {
            return Some(Finding::UncaughtException {
                thread: ti.id,
                message: ti.uncaught_exception.as_deref().unwrap_or_default().to_string(),
            });
        }
        if self.vm.system().is_blocked_in_atomic() {
            return Some(Finding::BlockedInAtomic { thread: last });
        }
        if self.vm.is_deadlocked() {
            let threads = kernel
                .threads
                .iter()
                .filter(|ti| ti.is_alive())
                .map(|ti| (ti.id, ti.status))
                .collect();
            return Some(Finding::Deadlock { threads });
        }
        None
    }

    fn record(&mut self, finding: Finding) {
        let trace = TraceFile::from_system(self.application.as_str(), self.vm.system()).with_comment(finding.to_string());
        debug!(choices = trace.len(), "error trace captured");
        self.reports.push(ErrorReport {
            finding,
            trace,
            depth: self.vm.depth(),
        });
    }
}
