//! Snapshot / Restore Contract
//!
//! Every stateful container of the VM (heap, thread list, statics, the
//! transition state) implements [`Restorable`]. A memento is an immutable
//! value; restoring it never consumes it, so the same memento can be
//! restored any number of times.
//!
//! # Snapshot kinds
//!
//! The transition state distinguishes two snapshot flavours at the type
//! level:
//!
//! ```text
//!   Backtrack   shallow: shares choice generators with the live state,
//!               valid only for strict depth-first traversal
//!   Restorable  deep:    owns detached copies of the choice generator
//!               chains, valid for any restore order
//! ```
//!
//! Containers below the transition state have a single flavour because their
//! entries are copy-on-write: a captured entry is never mutated in place.

/// Save/restore contract for VM containers.
pub trait Restorable {
    /// Captured state
    type Memento: Clone;

    /// Capture the current state.
    fn memento(&self) -> Self::Memento;

    /// Reset to a previously captured state.
    fn restore(&mut self, memento: &Self::Memento);
}

mod sealed {
    pub trait Sealed {}
}

/// Marker for the two transition snapshot flavours.
pub trait SnapshotKind: sealed::Sealed + Copy + Default + std::fmt::Debug + 'static {
    /// Whether captured choice generators are deep copies
    const DEEP: bool;
    /// Name used in logs
    const NAME: &'static str;
}

/// Shallow snapshot for depth-first backtracking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Backtrack;

/// Deep snapshot that survives out-of-order restoration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Restore;

impl sealed::Sealed for Backtrack {}
impl sealed::Sealed for Restore {}

impl SnapshotKind for Backtrack {
    const DEEP: bool = false;
    const NAME: &'static str = "backtrack";
}

impl SnapshotKind for Restore {
    const DEEP: bool = true;
    const NAME: &'static str = "restore";
}
