//! Per-object lock state.

use super::types::{ThreadId, ThreadSet};
use std::fmt;

/// Monitor of one heap element.
///
/// `locked` holds every thread that is blocked on, waiting on, or registered
/// to acquire this monitor. Waiters stay in the set until they re-acquire the
/// lock, so a notified thread is still found here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Monitor {
    owner: Option<ThreadId>,
    count: u32,
    locked: ThreadSet,
}

impl Monitor {
    /// Unlocked monitor
    pub fn new() -> Self {
        Self::default()
    }

    /// Current owner
    #[inline]
    pub const fn owner(&self) -> Option<ThreadId> {
        self.owner
    }

    /// Recursion depth of the owner
    #[inline]
    pub const fn lock_count(&self) -> u32 {
        self.count
    }

    /// Locked by anybody
    #[inline]
    pub const fn is_locked(&self) -> bool {
        self.owner.is_some()
    }

    /// `tid` may acquire without blocking
    #[inline]
    pub fn can_lock(&self, tid: ThreadId) -> bool {
        self.owner.map_or(true, |o| o == tid)
    }

    /// Threads blocked, waiting or registered on this monitor
    #[inline]
    pub const fn locked_threads(&self) -> &ThreadSet {
        &self.locked
    }

    /// `tid` is in the contender/waiter set
    #[inline]
    pub fn is_locking(&self, tid: ThreadId) -> bool {
        self.locked.contains(tid)
    }

    pub(crate) fn add_locked(&mut self, tid: ThreadId) {
        self.locked.insert(tid);
    }

    pub(crate) fn remove_locked(&mut self, tid: ThreadId) {
        self.locked.remove(tid);
    }

    pub(crate) fn set_owner(&mut self, owner: Option<ThreadId>, count: u32) {
        self.owner = owner;
        self.count = count;
    }

    pub(crate) fn inc(&mut self) {
        self.count += 1;
    }

    pub(crate) fn dec(&mut self) {
        self.count = self.count.saturating_sub(1);
        if self.count == 0 {
            self.owner = None;
        }
    }
}

impl fmt::Display for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.owner {
            Some(o) => write!(f, "owner={o} count={}", self.count)?,
            None => write!(f, "owner=none")?,
        }
        if !self.locked.is_empty() {
            write!(f, " locked={}", self.locked)?;
        }
        Ok(())
    }
}
