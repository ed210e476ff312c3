//! Monitor and Thread Lifecycle Operations
//!
//! Lock state lives in the [`Monitor`](crate::domain::threads::Monitor) of
//! the locked element, thread status lives in the thread list. Every
//! operation here updates both sides so they never disagree.
//!
//! ```text
//!                 lock()                      unlock() (count -> 0)
//!   RUNNING ─────────────▶ owner      BLOCKED ─────────────────────▶ UNBLOCKED
//!      │  block()                     NOTIFIED / TIMEDOUT / INTERRUPTED ─┘
//!      ▼
//!   BLOCKED                wait()                 notify()
//!                RUNNING ─────────▶ WAITING ─────────────▶ NOTIFIED
//!                                   TIMEOUT_WAITING ──▶ TIMEDOUT
//! ```
//!
//! A monitor's `locked` set holds every thread that is blocked on, waiting
//! for, or about to enter the monitor (registered contenders). Contenders
//! stay in the set after an unlock so the next `lock()` knows whom to block.

use super::KernelState;
use crate::domain::error::HeapError;
use crate::domain::heap::ObjRef;
use crate::domain::threads::{ThreadId, ThreadSet, ThreadStatus};
use tracing::{debug, trace};

/// Outcome of a `notify()` on a monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// No thread was waiting
    NoWaiters,
    /// The given waiter was notified
    Notified(ThreadId),
    /// Several waiters and no choice supplied. The caller has to register a
    /// thread choice over [`KernelState::waiters`] and notify again.
    NeedsChoice,
}

impl KernelState {
    /// `tid` can acquire the monitor of `obj` right now
    pub fn can_lock(&self, tid: ThreadId, obj: ObjRef) -> Result<bool, HeapError> {
        Ok(self.heap.element(obj)?.monitor.can_lock(tid))
    }

    /// Threads waiting (or timed out waiting) on `obj`
    pub fn waiters(&self, obj: ObjRef) -> Result<ThreadSet, HeapError> {
        let ei = self.heap.element(obj)?;
        Ok(ei
            .monitor
            .locked_threads()
            .iter()
            .filter(|t| {
                self.threads
                    .get(*t)
                    .is_some_and(|ti| ti.status.is_waiting_or_timed_out())
            })
            .collect())
    }

    /// Announce that `tid` will enter the monitor of `obj` in its next step
    pub fn register_lock_contender(&mut self, tid: ThreadId, obj: ObjRef) -> Result<(), HeapError> {
        self.heap.element_mut(obj)?.monitor.add_locked(tid);
        Ok(())
    }

    /// Withdraw a contender registration
    pub fn unregister_lock_contender(&mut self, tid: ThreadId, obj: ObjRef) -> Result<(), HeapError> {
        self.heap.element_mut(obj)?.monitor.remove_locked(tid);
        Ok(())
    }

    fn set_blocked(&mut self, tid: ThreadId, obj: ObjRef) -> Result<(), HeapError> {
        let ti = self.thread_mut(tid)?;
        ti.status = ThreadStatus::Blocked;
        ti.lock_ref = Some(obj);
        Ok(())
    }

    /// `tid` failed to acquire the monitor of `obj`
    pub fn block(&mut self, tid: ThreadId, obj: ObjRef) -> Result<(), HeapError> {
        let monitor = &mut self.heap.element_mut(obj)?.monitor;
        match monitor.owner() {
            Some(owner) if owner != tid => monitor.add_locked(tid),
            _ => return Err(HeapError::NotOwner { thread: tid, obj }),
        }
        debug!("{tid} blocked on {obj}");
        self.set_blocked(tid, obj)
    }

    fn block_lock_contenders(&mut self, obj: ObjRef) -> Result<(), HeapError> {
        let contenders = self.heap.element(obj)?.monitor.locked_threads().clone();
        for t in contenders.iter() {
            if self.thread(t)?.is_runnable() {
                self.set_blocked(t, obj)?;
            }
        }
        Ok(())
    }

    /// Acquire (or re-enter) the monitor of `obj`
    pub fn lock(&mut self, tid: ThreadId, obj: ObjRef) -> Result<(), HeapError> {
        let monitor = &mut self.heap.element_mut(obj)?.monitor;
        if let Some(owner) = monitor.owner() {
            if owner != tid {
                return Err(HeapError::LockedByOther { thread: tid, obj, owner });
            }
        }
        let count = monitor.lock_count();
        monitor.remove_locked(tid);
        monitor.set_owner(Some(tid), count);
        monitor.inc();
        let first = monitor.lock_count() == 1;

        let ti = self.thread_mut(tid)?;
        ti.lock_ref = None;
        if ti.status == ThreadStatus::Unblocked {
            ti.status = ThreadStatus::Running;
        }
        if first {
            ti.add_locked_object(obj);
        }
        trace!("{tid} locked {obj}");
        self.block_lock_contenders(obj)
    }

    /// Release one level of the monitor of `obj`. Returns `true` if the
    /// release made any other thread runnable.
    pub fn unlock(&mut self, tid: ThreadId, obj: ObjRef) -> Result<bool, HeapError> {
        let monitor = &mut self.heap.element_mut(obj)?.monitor;
        if monitor.lock_count() == 0 || monitor.owner() != Some(tid) {
            return Err(HeapError::NotOwner { thread: tid, obj });
        }
        if monitor.lock_count() > 1 {
            monitor.dec();
            return Ok(false);
        }

        let contenders = monitor.locked_threads().clone();
        self.thread_mut(tid)?.remove_locked_object(obj);
        let mut did_unblock = false;
        for t in contenders.iter() {
            let ti = self.thread_mut(t)?;
            match ti.status {
                ThreadStatus::Blocked
                | ThreadStatus::Notified
                | ThreadStatus::TimedOut
                | ThreadStatus::Interrupted => {
                    ti.lock_ref = None;
                    ti.status = ThreadStatus::Unblocked;
                    did_unblock = true;
                }
                _ => {}
            }
        }
        let monitor = &mut self.heap.element_mut(obj)?.monitor;
        monitor.set_owner(None, 0);
        trace!("{tid} unlocked {obj} (unblocked others: {did_unblock})");
        Ok(did_unblock)
    }

    /// `tid` waits on `obj`. A `timeout` of `None` waits indefinitely.
    /// Waiters that hold the lock give it up and remember the count.
    pub fn wait(&mut self, tid: ThreadId, obj: ObjRef, timeout: Option<u64>, has_to_hold_lock: bool) -> Result<(), HeapError> {
        let ei = self.heap.element_mut(obj)?;
        let holds_lock = ei.monitor.owner() == Some(tid);
        if has_to_hold_lock && !holds_lock {
            return Err(HeapError::NotOwner { thread: tid, obj });
        }
        ei.monitor.add_locked(tid);
        let count = ei.monitor.lock_count();
        if holds_lock {
            ei.monitor.set_owner(None, 0);
        }
        let contenders = ei.monitor.locked_threads().clone();

        let ti = self.thread_mut(tid)?;
        ti.lock_ref = Some(obj);
        ti.status = if timeout.is_some() {
            ThreadStatus::TimeoutWaiting
        } else {
            ThreadStatus::Waiting
        };
        if holds_lock {
            ti.lock_count = count;
            ti.remove_locked_object(obj);
            for t in contenders.iter().filter(|t| *t != tid) {
                let other = self.thread_mut(t)?;
                if matches!(
                    other.status,
                    ThreadStatus::Notified | ThreadStatus::Blocked | ThreadStatus::Interrupted
                ) {
                    other.lock_ref = None;
                    other.status = ThreadStatus::Unblocked;
                }
            }
        }
        debug!("{tid} waits on {obj} (timeout {timeout:?})");
        Ok(())
    }

    fn notify_waiter(&mut self, waiter: ThreadId, obj: ObjRef) -> Result<(), HeapError> {
        let ti = self.thread_mut(waiter)?;
        if !ti.status.is_waiting_or_timed_out() {
            return Ok(());
        }
        if ti.lock_count > 0 {
            ti.status = ThreadStatus::Notified;
        } else {
            ti.lock_ref = None;
            ti.status = ThreadStatus::Running;
            self.heap.element_mut(obj)?.monitor.remove_locked(waiter);
        }
        debug!("{waiter} notified on {obj}");
        Ok(())
    }

    /// Notify one waiter of `obj`. With several waiters the caller supplies
    /// `choice`, the thread picked by the current thread choice generator.
    pub fn notify(&mut self, tid: ThreadId, obj: ObjRef, choice: Option<ThreadId>, has_to_hold_lock: bool) -> Result<NotifyOutcome, HeapError> {
        if has_to_hold_lock && self.heap.element(obj)?.monitor.owner() != Some(tid) {
            return Err(HeapError::NotOwner { thread: tid, obj });
        }
        let waiters = self.waiters(obj)?;
        let target = match (waiters.len(), choice) {
            (0, _) => return Ok(NotifyOutcome::NoWaiters),
            (1, _) => waiters.as_slice()[0],
            (_, Some(c)) if waiters.contains(c) => c,
            _ => return Ok(NotifyOutcome::NeedsChoice),
        };
        self.notify_waiter(target, obj)?;
        Ok(NotifyOutcome::Notified(target))
    }

    /// Notify every waiter of `obj`. Returns `true` if there were any.
    pub fn notify_all(&mut self, tid: ThreadId, obj: ObjRef, has_to_hold_lock: bool) -> Result<bool, HeapError> {
        if has_to_hold_lock && self.heap.element(obj)?.monitor.owner() != Some(tid) {
            return Err(HeapError::NotOwner { thread: tid, obj });
        }
        let waiters = self.waiters(obj)?;
        for w in waiters.iter() {
            self.notify_waiter(w, obj)?;
        }
        Ok(!waiters.is_empty())
    }

    /// Re-acquire the monitor of `obj` with the count given up in `wait()`
    pub fn lock_notified(&mut self, tid: ThreadId, obj: ObjRef) -> Result<(), HeapError> {
        let ti = self.thread(tid)?;
        if !ti.status.is_unblocked() && ti.status != ThreadStatus::Running {
            return Err(HeapError::NotOwner { thread: tid, obj });
        }
        let count = ti.lock_count.max(1);
        let monitor = &mut self.heap.element_mut(obj)?.monitor;
        if let Some(owner) = monitor.owner() {
            if owner != tid {
                return Err(HeapError::LockedByOther { thread: tid, obj, owner });
            }
        }
        monitor.remove_locked(tid);
        monitor.set_owner(Some(tid), count);

        let ti = self.thread_mut(tid)?;
        ti.lock_count = 0;
        ti.lock_ref = None;
        ti.status = ThreadStatus::Running;
        ti.add_locked_object(obj);
        self.block_lock_contenders(obj)
    }

    /// Resume a waiter that did not own the monitor (park/join style waits)
    pub fn resume_non_locked_waiter(&mut self, tid: ThreadId, obj: ObjRef) -> Result<(), HeapError> {
        self.heap.element_mut(obj)?.monitor.remove_locked(tid);
        let ti = self.thread_mut(tid)?;
        ti.lock_count = 0;
        ti.lock_ref = None;
        ti.status = ThreadStatus::Running;
        Ok(())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Thread lifecycle
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// `NEW` -> `RUNNING`
    pub fn start_thread(&mut self, tid: ThreadId) -> Result<bool, HeapError> {
        let ti = self.thread_mut(tid)?;
        if ti.status != ThreadStatus::New {
            return Ok(false);
        }
        ti.status = ThreadStatus::Running;
        debug!("{tid} started");
        Ok(true)
    }

    /// Terminate `tid`, releasing its monitors and waking joiners that wait
    /// on its thread object
    pub fn terminate(&mut self, tid: ThreadId) -> Result<(), HeapError> {
        let held: Vec<ObjRef> = self.thread(tid)?.locked_objects.to_vec();
        for obj in held {
            while self.heap.get(obj).is_some_and(|ei| ei.monitor.owner() == Some(tid)) {
                self.unlock(tid, obj)?;
            }
        }
        let ti = self.thread_mut(tid)?;
        ti.status = ThreadStatus::Terminated;
        ti.lock_ref = None;
        ti.frames.clear();
        let thread_obj = ti.thread_obj;
        if let Some(obj) = thread_obj {
            if self.heap.is_alive(obj) {
                self.notify_all(tid, obj, false)?;
            }
        }
        debug!("{tid} terminated");
        Ok(())
    }

    /// Timeout elapsed for a `TIMEOUT_WAITING` thread
    pub fn time_out(&mut self, tid: ThreadId) -> Result<bool, HeapError> {
        let ti = self.thread_mut(tid)?;
        if ti.status != ThreadStatus::TimeoutWaiting {
            return Ok(false);
        }
        ti.status = ThreadStatus::TimedOut;
        Ok(true)
    }

    /// Set the interrupt flag and wake a waiting thread
    pub fn interrupt(&mut self, tid: ThreadId) -> Result<(), HeapError> {
        let ti = self.thread(tid)?;
        let (status, lock_ref) = (ti.status, ti.lock_ref);
        match status {
            ThreadStatus::New | ThreadStatus::Terminated => {}
            ThreadStatus::Waiting | ThreadStatus::TimeoutWaiting => {
                let can_lock = match lock_ref {
                    Some(obj) => self.can_lock(tid, obj)?,
                    None => true,
                };
                let ti = self.thread_mut(tid)?;
                ti.interrupted = true;
                if can_lock {
                    ti.lock_ref = None;
                    ti.status = ThreadStatus::Unblocked;
                } else {
                    ti.status = ThreadStatus::Interrupted;
                }
            }
            ThreadStatus::Sleeping => {
                let ti = self.thread_mut(tid)?;
                ti.interrupted = true;
                ti.status = ThreadStatus::Running;
            }
            _ => self.thread_mut(tid)?.interrupted = true,
        }
        Ok(())
    }

    /// `RUNNING` -> `SLEEPING`
    pub fn sleep(&mut self, tid: ThreadId) -> Result<(), HeapError> {
        let ti = self.thread_mut(tid)?;
        if ti.status == ThreadStatus::Running {
            ti.status = ThreadStatus::Sleeping;
        }
        Ok(())
    }

    /// `SLEEPING` -> `RUNNING`
    pub fn wake(&mut self, tid: ThreadId) -> Result<(), HeapError> {
        let ti = self.thread_mut(tid)?;
        if ti.status == ThreadStatus::Sleeping {
            ti.status = ThreadStatus::Running;
        }
        Ok(())
    }

    /// Increment the suspend count. Returns `true` if the thread just became
    /// suspended.
    pub fn suspend(&mut self, tid: ThreadId) -> Result<bool, HeapError> {
        let ti = self.thread_mut(tid)?;
        ti.suspend_count += 1;
        Ok(ti.suspend_count == 1)
    }

    /// Decrement the suspend count. Returns `true` if the thread is no longer
    /// suspended.
    pub fn resume(&mut self, tid: ThreadId) -> Result<bool, HeapError> {
        let ti = self.thread_mut(tid)?;
        if ti.suspend_count == 0 {
            return Ok(false);
        }
        ti.suspend_count -= 1;
        Ok(ti.suspend_count == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::classes::{AppId, ClassDef, ClassRegistry, MethodId};
    use crate::domain::heap::{AllocationStrategy, SlotTable};
    use crate::domain::threads::StackFrame;
    use std::sync::Arc;

    fn setup(n: usize) -> (KernelState, ObjRef, Vec<ThreadId>) {
        let reg = Arc::new(ClassRegistry::new());
        let lock_class = reg.define(ClassDef::new("Lock"));
        let mut ks = KernelState::new(reg, AllocationStrategy::Hashed, SlotTable::new(), false);
        let mut tids = Vec::new();
        for i in 0..n {
            let t = ks.threads.create(&format!("t{i}"), AppId::new(0));
            ks.start_thread(t).unwrap();
            ks.thread_mut(t).unwrap().frames.push(StackFrame::new(MethodId::new(0)));
            tids.push(t);
        }
        let obj = ks.new_system_object(lock_class, 0, AppId::new(0)).unwrap();
        (ks, obj, tids)
    }

    #[test]
    fn test_lock_is_reentrant() {
        let (mut ks, obj, t) = setup(1);
        ks.lock(t[0], obj).unwrap();
        ks.lock(t[0], obj).unwrap();
        assert_eq!(ks.heap.get(obj).unwrap().monitor.lock_count(), 2);
        assert!(!ks.unlock(t[0], obj).unwrap());
        assert!(ks.heap.get(obj).unwrap().monitor.is_locked());
        ks.unlock(t[0], obj).unwrap();
        assert!(!ks.heap.get(obj).unwrap().monitor.is_locked());
        assert!(ks.thread(t[0]).unwrap().locked_objects.is_empty());
    }

    #[test]
    fn test_lock_blocks_registered_contenders() {
        let (mut ks, obj, t) = setup(2);
        ks.register_lock_contender(t[1], obj).unwrap();
        ks.lock(t[0], obj).unwrap();
        assert_eq!(ks.thread(t[1]).unwrap().status, ThreadStatus::Blocked);
        assert_eq!(ks.thread(t[1]).unwrap().lock_ref, Some(obj));

        assert!(ks.unlock(t[0], obj).unwrap());
        assert_eq!(ks.thread(t[1]).unwrap().status, ThreadStatus::Unblocked);
        ks.lock(t[1], obj).unwrap();
        assert_eq!(ks.thread(t[1]).unwrap().status, ThreadStatus::Running);
    }

    #[test]
    fn test_lock_by_other_is_an_error() {
        let (mut ks, obj, t) = setup(2);
        ks.lock(t[0], obj).unwrap();
        assert!(matches!(ks.lock(t[1], obj), Err(HeapError::LockedByOther { .. })));
        assert!(matches!(ks.unlock(t[1], obj), Err(HeapError::NotOwner { .. })));
        ks.block(t[1], obj).unwrap();
        assert!(!ks.is_timeout_runnable(t[1]));
    }

    #[test]
    fn test_wait_notify_handshake() {
        let (mut ks, obj, t) = setup(2);
        ks.lock(t[0], obj).unwrap();
        ks.lock(t[0], obj).unwrap();
        ks.wait(t[0], obj, None, true).unwrap();
        assert_eq!(ks.thread(t[0]).unwrap().status, ThreadStatus::Waiting);
        assert_eq!(ks.thread(t[0]).unwrap().lock_count, 2);
        assert!(!ks.heap.get(obj).unwrap().monitor.is_locked());

        ks.lock(t[1], obj).unwrap();
        assert_eq!(ks.notify(t[1], obj, None, true).unwrap(), NotifyOutcome::Notified(t[0]));
        assert_eq!(ks.thread(t[0]).unwrap().status, ThreadStatus::Notified);
        assert!(ks.unlock(t[1], obj).unwrap());
        assert_eq!(ks.thread(t[0]).unwrap().status, ThreadStatus::Unblocked);

        ks.lock_notified(t[0], obj).unwrap();
        assert_eq!(ks.heap.get(obj).unwrap().monitor.lock_count(), 2);
        assert_eq!(ks.heap.get(obj).unwrap().monitor.owner(), Some(t[0]));
    }

    #[test]
    fn test_notify_with_several_waiters_needs_choice() {
        let (mut ks, obj, t) = setup(3);
        for &w in &t[..2] {
            ks.lock(w, obj).unwrap();
            ks.wait(w, obj, None, true).unwrap();
        }
        ks.lock(t[2], obj).unwrap();
        assert_eq!(ks.waiters(obj).unwrap().len(), 2);
        assert_eq!(ks.notify(t[2], obj, None, true).unwrap(), NotifyOutcome::NeedsChoice);
        assert_eq!(ks.notify(t[2], obj, Some(t[1]), true).unwrap(), NotifyOutcome::Notified(t[1]));
        assert_eq!(ks.thread(t[0]).unwrap().status, ThreadStatus::Waiting);

        assert!(ks.notify_all(t[2], obj, true).unwrap());
        assert_eq!(ks.thread(t[0]).unwrap().status, ThreadStatus::Notified);
    }

    #[test]
    fn test_join_style_wait_resumes_on_terminate() {
        let (mut ks, _, t) = setup(2);
        let thread_class = ks.classes().define(ClassDef::new("lang.Thread"));
        let thread_obj = ks.new_system_object(thread_class, 1, AppId::new(0)).unwrap();
        ks.thread_mut(t[1]).unwrap().thread_obj = Some(thread_obj);

        ks.wait(t[0], thread_obj, None, false).unwrap();
        ks.terminate(t[1]).unwrap();
        assert_eq!(ks.thread(t[0]).unwrap().status, ThreadStatus::Running);
        assert_eq!(ks.thread(t[1]).unwrap().status, ThreadStatus::Terminated);
    }

    #[test]
    fn test_terminate_releases_held_monitors() {
        let (mut ks, obj, t) = setup(2);
        ks.lock(t[0], obj).unwrap();
        ks.lock(t[0], obj).unwrap();
        ks.block(t[1], obj).unwrap();
        ks.terminate(t[0]).unwrap();
        assert!(!ks.heap.get(obj).unwrap().monitor.is_locked());
        assert_eq!(ks.thread(t[1]).unwrap().status, ThreadStatus::Unblocked);
    }

    #[test]
    fn test_timed_wait_and_interrupt() {
        let (mut ks, obj, t) = setup(2);
        ks.lock(t[0], obj).unwrap();
        ks.wait(t[0], obj, Some(10), true).unwrap();
        assert!(ks.is_timeout_runnable(t[0]));
        assert!(ks.time_out(t[0]).unwrap());
        assert_eq!(ks.thread(t[0]).unwrap().status, ThreadStatus::TimedOut);

        ks.lock(t[1], obj).unwrap();
        ks.wait(t[1], obj, None, true).unwrap();
        ks.interrupt(t[1]).unwrap();
        let ti = ks.thread(t[1]).unwrap();
        assert!(ti.interrupted);
        assert_eq!(ti.status, ThreadStatus::Unblocked);
    }

    #[test]
    fn test_suspend_resume_counts() {
        let (mut ks, _, t) = setup(1);
        assert!(ks.suspend(t[0]).unwrap());
        assert!(!ks.suspend(t[0]).unwrap());
        assert!(!ks.thread(t[0]).unwrap().is_runnable());
        assert!(!ks.resume(t[0]).unwrap());
        assert!(ks.resume(t[0]).unwrap());
        assert!(ks.thread(t[0]).unwrap().is_runnable());
    }
}
