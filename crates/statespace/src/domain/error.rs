//! Engine Error Types
//!
//! Errors are split by who can cause them:
//!
//! ```text
//! ConfigError  ── bad property file / unknown policy class   (load time)
//! TraceError   ── malformed or mismatching trace file        (load / replay)
//! HeapError    ── dangling refs, lock protocol misuse        (collaborator bug)
//! EngineError  ── anything that breaks backtracking integrity (fatal)
//! ```
//!
//! Modeled-program findings (deadlock, blocked-in-atomic) are *not* errors;
//! see [`crate::adapters::search::Finding`].

use crate::domain::classes::ClassId;
use crate::domain::heap::ObjRef;
use crate::domain::threads::ThreadId;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Configuration failures. Always raised before the search starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Property file could not be read
    #[error("cannot read config file {path}: {source}")]
    Io {
        /// File that failed
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A line that is neither a comment nor `key = value`
    #[error("malformed property at line {line}: {text}")]
    MalformedLine {
        /// 1-based line number
        line: usize,
        /// Offending text
        text: String,
    },

    /// Value does not parse as the requested type
    #[error("invalid value for {key}: expected {expected}, got '{value}'")]
    InvalidValue {
        /// Property key
        key: String,
        /// Expected type description
        expected: &'static str,
        /// Raw value
        value: String,
    },

    /// `${key}` expansion refers to itself
    #[error("recursive expansion of ${{{0}}}")]
    RecursiveExpansion(String),

    /// Scheduler / heap strategy that does not exist
    #[error("unknown {kind} class: {name}")]
    UnknownClass {
        /// Which plug-in slot (`vm.scheduler.sync.class`, ...)
        kind: &'static str,
        /// Requested class name
        name: String,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trace files
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trace file read / replay failures.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    /// File could not be read or written
    #[error("tracefile I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Expected token not found
    #[error("tracefile error - expected {expected}, got: {found}")]
    Expected {
        /// What the reader wanted
        expected: String,
        /// What it found
        found: String,
    },

    /// `#n` back-reference that was never defined
    #[error("tracefile error - unknown ChoicePoint class id: {0}")]
    UnknownClassId(String),

    /// Header names a different application
    #[error("tracefile error - application mismatch: expected {expected}, got: {found}")]
    ApplicationMismatch {
        /// Configured application
        expected: String,
        /// Application in the file
        found: String,
    },

    /// Replay hit a choice generator of another type than recorded
    #[error("trace replay mismatch at [{index}]: expected {expected}, got {found}")]
    ReplayMismatch {
        /// Trace position
        index: usize,
        /// Recorded type
        expected: String,
        /// Actual choice generator type
        found: String,
    },

    /// Recorded choice index beyond what the generator offers
    #[error("trace replay at [{index}]: choice {choice} out of range for {cg} ({total} choices)")]
    ChoiceOutOfRange {
        /// Trace position
        index: usize,
        /// Recorded choice
        choice: usize,
        /// Choice generator type
        cg: String,
        /// Available choices
        total: usize,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Heap / lock protocol
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Heap and monitor misuse by the execution collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    /// Reference does not denote a live object
    #[error("dangling reference {0}")]
    Dangling(ObjRef),

    /// Pin-down request for an object that is not alive
    #[error("cannot pin down dead object {0}")]
    PinDownDead(ObjRef),

    /// Allocation identity produced a slot that is already occupied
    #[error("allocation slot {0} already in use")]
    SlotInUse(ObjRef),

    /// Lock owned by another thread
    #[error("{thread} tries to lock {obj} which is locked by {owner}")]
    LockedByOther {
        /// Requesting thread
        thread: ThreadId,
        /// Object
        obj: ObjRef,
        /// Current owner
        owner: ThreadId,
    },

    /// Release of a lock the thread does not hold
    #[error("{thread} tries to release non-owned lock of {obj}")]
    NotOwner {
        /// Releasing thread
        thread: ThreadId,
        /// Object
        obj: ObjRef,
    },

    /// Unknown thread id
    #[error("unknown thread {0}")]
    UnknownThread(ThreadId),

    /// Class id not registered
    #[error("unknown class {0}")]
    UnknownClass(ClassId),

    /// Field index outside the object
    #[error("field index {index} out of bounds for {obj}")]
    FieldIndex {
        /// Object
        obj: ObjRef,
        /// Requested index
        index: usize,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fatal engine failures. The search aborts on any of these.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A mandatory choice point was refused by the policy layer
    #[error("mandatory choice generator not set: {0}")]
    MandatoryChoiceRefused(String),

    /// Transition requested but no choice generator is current
    #[error("no choice generator for new transition")]
    NoChoiceGenerator,

    /// Handle refers to a collected or never-allocated choice generator
    #[error("stale choice generator handle {0}")]
    StaleChoiceGenerator(String),

    /// No thread to run in the transition
    #[error("no thread scheduled for transition")]
    NoExecThread,

    /// Heap misuse surfaced through the engine
    #[error(transparent)]
    Heap(#[from] HeapError),

    /// Replay failure
    #[error(transparent)]
    Trace(#[from] TraceError),

    /// Configuration failure surfaced at start-up
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Execution collaborator reported a failure it cannot recover from
    #[error("execution failed in {thread}: {message}")]
    Execution {
        /// Executing thread
        thread: ThreadId,
        /// Collaborator message
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_error_messages_keep_prefix() {
        let err = TraceError::UnknownClassId("#3".into());
        assert_eq!(
            err.to_string(),
            "tracefile error - unknown ChoicePoint class id: #3"
        );
    }

    #[test]
    fn test_heap_error_converts_into_engine_error() {
        let err: EngineError = HeapError::Dangling(ObjRef::new(7)).into();
        assert!(matches!(err, EngineError::Heap(HeapError::Dangling(_))));
        assert_eq!(err.to_string(), "dangling reference @7");
    }
}
