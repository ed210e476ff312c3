//! VM Listeners
//!
//! Observers of the exploration. Choice generator callbacks receive the
//! transition state so a listener can veto the choice just advanced
//! (`state.set_ignored(true)`) or drop a generator that was just registered
//! (`state.remove_next_choice_generator()`).
//!
//! Listeners must not touch the kernel state from choice generator
//! callbacks: those run before the state is captured for backtracking.

use super::system_state::SystemState;
use crate::domain::choice::CgHandle;
use crate::domain::heap::{GcStats, ObjRef};
use crate::domain::threads::ThreadId;
use std::fmt;

/// Exploration observer. Every method defaults to a no-op.
#[allow(unused_variables)]
pub trait VmListener: Send {
    /// A generator was registered as next
    fn choice_generator_registered(&mut self, state: &mut SystemState, cg: CgHandle) {}

    /// A generator became current (cascaded parents are reported first)
    fn choice_generator_set(&mut self, state: &mut SystemState, cg: CgHandle) {}

    /// A generator moved to its next choice
    fn choice_generator_advanced(&mut self, state: &mut SystemState, cg: CgHandle) {}

    /// A generator has no choices left
    fn choice_generator_processed(&mut self, state: &mut SystemState, cg: CgHandle) {}

    /// Another thread became the executor
    fn thread_scheduled(&mut self, tid: ThreadId) {}

    /// An object was allocated
    fn object_created(&mut self, tid: ThreadId, obj: ObjRef) {}

    /// An object was swept
    fn object_released(&mut self, obj: ObjRef) {}

    /// A GC cycle starts
    fn gc_begin(&mut self) {}

    /// A GC cycle finished
    fn gc_end(&mut self, stats: &GcStats) {}
}

/// Registered listeners, notified in registration order
#[derive(Default)]
pub struct Listeners {
    listeners: Vec<Box<dyn VmListener>>,
}

impl Listeners {
    /// No listeners
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener
    pub fn add(&mut self, listener: Box<dyn VmListener>) {
        self.listeners.push(listener);
    }

    /// Number of listeners
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// No listeners registered
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub(crate) fn cg_registered(&mut self, state: &mut SystemState, cg: CgHandle) {
        for l in &mut self.listeners {
            l.choice_generator_registered(state, cg);
        }
    }

    pub(crate) fn cg_set(&mut self, state: &mut SystemState, cg: CgHandle) {
        for l in &mut self.listeners {
            l.choice_generator_set(state, cg);
        }
    }

    pub(crate) fn cg_advanced(&mut self, state: &mut SystemState, cg: CgHandle) {
        for l in &mut self.listeners {
            l.choice_generator_advanced(state, cg);
        }
    }

    pub(crate) fn cg_processed(&mut self, state: &mut SystemState, cg: CgHandle) {
        for l in &mut self.listeners {
            l.choice_generator_processed(state, cg);
        }
    }

    pub(crate) fn thread_scheduled(&mut self, tid: ThreadId) {
        for l in &mut self.listeners {
            l.thread_scheduled(tid);
        }
    }

    pub(crate) fn object_created(&mut self, tid: ThreadId, obj: ObjRef) {
        for l in &mut self.listeners {
            l.object_created(tid, obj);
        }
    }

    pub(crate) fn gc(&mut self, stats: &GcStats) {
        for l in &mut self.listeners {
            for obj in &stats.released {
                l.object_released(*obj);
            }
            l.gc_end(stats);
        }
    }

    pub(crate) fn gc_begin(&mut self) {
        for l in &mut self.listeners {
            l.gc_begin();
        }
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Listeners({})", self.listeners.len())
    }
}
