//! Thread Identifiers, Status and Stack Frames

use crate::domain::classes::MethodId;
use crate::domain::heap::Value;
use smallvec::SmallVec;
use std::fmt;

/// Dense, path-local thread identifier
///
/// Ids are either monotonic or reuse the lowest free id, depending on
/// `vm.reuse_tid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ThreadId(pub u32);

impl ThreadId {
    /// Create a new thread ID
    #[inline(always)]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    #[inline(always)]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Thread status
///
/// ```text
///            start            lock contended
///   NEW ──────────────▶ RUNNING ─────────────▶ BLOCKED
///                        │  ▲                    │ unlock
///                 wait() │  │ lock re-acquired   ▼
///                        ▼  │               UNBLOCKED
///                    WAITING ──notify──▶ NOTIFIED ──unlock──▶ UNBLOCKED
///              TIMEOUT_WAITING ─scheduled─▶ TIMEDOUT
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ThreadStatus {
    /// Created, not started
    New,
    /// Running or ready to run
    Running,
    /// Waiting to acquire a monitor
    Blocked,
    /// Monitor released by owner, can re-try acquisition
    Unblocked,
    /// In `wait()` without timeout
    Waiting,
    /// In `wait(timeout)`
    TimeoutWaiting,
    /// Notified, still needs to re-acquire the lock
    Notified,
    /// Interrupted while waiting
    Interrupted,
    /// Timeout elapsed, needs to re-acquire the lock
    TimedOut,
    /// Finished
    Terminated,
    /// In `sleep()`
    Sleeping,
}

impl ThreadStatus {
    /// Upper-case name used in dumps
    pub const fn name(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Running => "RUNNING",
            Self::Blocked => "BLOCKED",
            Self::Unblocked => "UNBLOCKED",
            Self::Waiting => "WAITING",
            Self::TimeoutWaiting => "TIMEOUT_WAITING",
            Self::Notified => "NOTIFIED",
            Self::Interrupted => "INTERRUPTED",
            Self::TimedOut => "TIMEDOUT",
            Self::Terminated => "TERMINATED",
            Self::Sleeping => "SLEEPING",
        }
    }

    /// Waiting with or without timeout
    #[inline]
    pub const fn is_waiting(self) -> bool {
        matches!(self, Self::Waiting | Self::TimeoutWaiting)
    }

    /// Waiting, or woken by a timeout but not yet holding the lock
    #[inline]
    pub const fn is_waiting_or_timed_out(self) -> bool {
        matches!(self, Self::Waiting | Self::TimeoutWaiting | Self::TimedOut)
    }

    /// Released from a monitor, about to re-acquire it
    #[inline]
    pub const fn is_unblocked(self) -> bool {
        matches!(self, Self::Unblocked | Self::TimedOut)
    }

    /// Started and not yet terminated
    #[inline]
    pub const fn is_alive(self) -> bool {
        !matches!(self, Self::New | Self::Terminated)
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Small sorted set of thread ids.
///
/// Used for monitor contender lists and referencing-thread sets. Ordering
/// is by id, so two sets with the same members compare equal and hash the
/// same regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ThreadSet(SmallVec<[ThreadId; 4]>);

impl ThreadSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, returns `false` if already present
    pub fn insert(&mut self, tid: ThreadId) -> bool {
        match self.0.binary_search(&tid) {
            Ok(_) => false,
            Err(pos) => {
                self.0.insert(pos, tid);
                true
            }
        }
    }

    /// Remove, returns `false` if absent
    pub fn remove(&mut self, tid: ThreadId) -> bool {
        match self.0.binary_search(&tid) {
            Ok(pos) => {
                self.0.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    /// Membership test
    #[inline]
    pub fn contains(&self, tid: ThreadId) -> bool {
        self.0.binary_search(&tid).is_ok()
    }

    /// Number of members
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// No members
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Members in id order
    pub fn iter(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.0.iter().copied()
    }

    /// Members as a slice
    pub fn as_slice(&self) -> &[ThreadId] {
        &self.0
    }
}

impl FromIterator<ThreadId> for ThreadSet {
    fn from_iter<I: IntoIterator<Item = ThreadId>>(iter: I) -> Self {
        let mut set = Self::new();
        for tid in iter {
            set.insert(tid);
        }
        set
    }
}

impl fmt::Display for ThreadSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, tid) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{tid}")?;
        }
        write!(f, "}}")
    }
}

/// One activation record.
///
/// The core never interprets instructions. It needs the method and program
/// counter for allocation contexts and policy patterns, and the slots for
/// GC roots.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StackFrame {
    /// Executing method
    pub method: MethodId,
    /// Program counter
    pub pc: u32,
    /// Opcode at `pc`
    pub opcode: u16,
    /// Locals and operands
    pub slots: Vec<Value>,
}

impl StackFrame {
    /// Fresh frame at pc 0
    pub const fn new(method: MethodId) -> Self {
        Self {
            method,
            pc: 0,
            opcode: 0,
            slots: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_set_is_sorted_and_unique() {
        let mut set = ThreadSet::new();
        assert!(set.insert(ThreadId::new(3)));
        assert!(set.insert(ThreadId::new(1)));
        assert!(!set.insert(ThreadId::new(3)));
        assert_eq!(set.as_slice(), &[ThreadId::new(1), ThreadId::new(3)]);
        assert_eq!(set.to_string(), "{T1,T3}");

        assert!(set.remove(ThreadId::new(1)));
        assert!(!set.remove(ThreadId::new(1)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_status_predicates() {
        assert!(ThreadStatus::TimedOut.is_unblocked());
        assert!(ThreadStatus::TimedOut.is_waiting_or_timed_out());
        assert!(!ThreadStatus::TimedOut.is_waiting());
        assert!(!ThreadStatus::New.is_alive());
        assert!(ThreadStatus::Blocked.is_alive());
        assert_eq!(ThreadStatus::TimeoutWaiting.to_string(), "TIMEOUT_WAITING");
    }
}
