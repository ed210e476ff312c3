//! Thread registry entry.

use super::types::{StackFrame, ThreadId, ThreadStatus};
use crate::domain::classes::AppId;
use crate::domain::heap::{ObjRef, Value};
use smallvec::SmallVec;
use std::sync::Arc;

/// Per-thread state stored in the [`super::ThreadList`].
///
/// Entries are shared with snapshots through `Arc` and cloned on the first
/// mutation after a capture.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThreadInfo {
    /// Thread id
    pub id: ThreadId,
    /// Thread name
    pub name: Arc<str>,
    /// Scheduling status
    pub status: ThreadStatus,
    /// Nested suspend requests
    pub suspend_count: u32,
    /// Priority
    pub priority: i32,
    /// Daemon threads do not keep the program alive
    pub daemon: bool,
    /// Owning application context
    pub app: AppId,
    /// Heap object representing the thread
    pub thread_obj: Option<ObjRef>,
    /// Call stack, innermost frame last
    pub frames: Vec<StackFrame>,
    /// Object the thread is blocked on or waiting for
    pub lock_ref: Option<ObjRef>,
    /// Lock count given up in `wait()`, restored by `lock_notified`
    pub lock_count: u32,
    /// Monitors currently owned, acquisition order
    pub locked_objects: SmallVec<[ObjRef; 4]>,
    /// Interrupt flag
    pub interrupted: bool,
    /// Uncaught exception that reached the top frame
    pub uncaught_exception: Option<Arc<str>>,
    /// Lets blocking hooks register at the first step of a transition.
    /// Transient: cleared before every step and never fingerprinted.
    pub empty_transition_enabled: bool,
    /// VM-internal thread (finalizer). Only kept alive for end-state checks
    /// while it is runnable.
    pub system: bool,
}

impl ThreadInfo {
    /// New thread in status `NEW`
    pub fn new(id: ThreadId, name: impl Into<Arc<str>>, app: AppId) -> Self {
        Self {
            id,
            name: name.into(),
            status: ThreadStatus::New,
            suspend_count: 0,
            priority: 5,
            daemon: false,
            app,
            thread_obj: None,
            frames: Vec::new(),
            lock_ref: None,
            lock_count: 0,
            locked_objects: SmallVec::new(),
            interrupted: false,
            uncaught_exception: None,
            empty_transition_enabled: false,
            system: false,
        }
    }

    /// Can be scheduled right now
    pub const fn is_runnable(&self) -> bool {
        if self.suspend_count != 0 {
            return false;
        }
        matches!(
            self.status,
            ThreadStatus::Running
                | ThreadStatus::Unblocked
                | ThreadStatus::Sleeping
                | ThreadStatus::TimedOut
        )
    }

    /// Runnable, or timeout-waiting on a monitor it could re-acquire.
    ///
    /// `can_lock` answers whether this thread may lock the given object.
    pub fn is_timeout_runnable(&self, can_lock: impl Fn(ObjRef) -> bool) -> bool {
        if self.suspend_count != 0 {
            return false;
        }
        match self.status {
            ThreadStatus::Running | ThreadStatus::Unblocked | ThreadStatus::Sleeping => true,
            ThreadStatus::TimeoutWaiting => self.lock_ref.map_or(true, can_lock),
            _ => false,
        }
    }

    /// Started and not terminated
    #[inline]
    pub const fn is_alive(&self) -> bool {
        self.status.is_alive()
    }

    /// In `wait(timeout)`
    #[inline]
    pub fn is_timeout_waiting(&self) -> bool {
        self.status == ThreadStatus::TimeoutWaiting
    }

    /// Holds the monitor of `obj`
    pub fn holds_lock(&self, obj: ObjRef) -> bool {
        self.locked_objects.contains(&obj)
    }

    /// Innermost frame
    pub fn top_frame(&self) -> Option<&StackFrame> {
        self.frames.last()
    }

    /// Innermost frame, mutable
    pub fn top_frame_mut(&mut self) -> Option<&mut StackFrame> {
        self.frames.last_mut()
    }

    pub(crate) fn add_locked_object(&mut self, obj: ObjRef) {
        if !self.locked_objects.contains(&obj) {
            self.locked_objects.push(obj);
        }
    }

    pub(crate) fn remove_locked_object(&mut self, obj: ObjRef) {
        self.locked_objects.retain(|o| *o != obj);
    }

    /// References held by this thread (GC roots)
    pub fn roots(&self) -> impl Iterator<Item = ObjRef> + '_ {
        let frames = self
            .frames
            .iter()
            .flat_map(|f| f.slots.iter().filter_map(Value::as_obj));
        self.thread_obj
            .into_iter()
            .chain(self.lock_ref)
            .chain(self.locked_objects.iter().copied())
            .chain(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::classes::MethodId;

    fn thread(status: ThreadStatus) -> ThreadInfo {
        let mut ti = ThreadInfo::new(ThreadId::new(1), "worker", AppId::new(0));
        ti.status = status;
        ti
    }

    #[test]
    fn test_runnable_excludes_suspended() {
        let mut ti = thread(ThreadStatus::Running);
        assert!(ti.is_runnable());
        ti.suspend_count = 1;
        assert!(!ti.is_runnable());
        assert!(!ti.is_timeout_runnable(|_| true));
    }

    #[test]
    fn test_timeout_waiting_depends_on_lock() {
        let mut ti = thread(ThreadStatus::TimeoutWaiting);
        ti.lock_ref = Some(ObjRef::new(4));
        assert!(!ti.is_runnable());
        assert!(ti.is_timeout_runnable(|_| true));
        assert!(!ti.is_timeout_runnable(|_| false));
    }

    #[test]
    fn test_roots_cover_frames_and_thread_object() {
        let mut ti = thread(ThreadStatus::Running);
        ti.thread_obj = Some(ObjRef::new(1));
        let mut frame = StackFrame::new(MethodId::new(0));
        frame.slots = vec![Value::Int(3), Value::Ref(ObjRef::new(9)), Value::Null];
        ti.frames.push(frame);

        let roots: Vec<_> = ti.roots().collect();
        assert_eq!(roots, vec![ObjRef::new(1), ObjRef::new(9)]);
    }
}
