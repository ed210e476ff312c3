//! Sync Policy
//!
//! One decision hook per synchronization-relevant operation. The default
//! [`AllRunnablesSyncPolicy`] offers every timeout-runnable thread of the
//! calling thread's application (or of the whole system if that one has
//! none) as the next executor.
//!
//! ```text
//!   hook                     kind             gate
//!   ───────────────────────  ───────────────  ─────────────────────────
//!   blocked thread, wait,    blocking
//!   join, park, terminate,
//!   post-finalize
//!   lock, start, resume,     non-blocking
//!   atomic begin/end,
//!   reschedule
//!   release                  non-blocking     break_lock_release, unblocked
//!   notify / notifyAll       non-blocking     break_notify(all), notified
//!   sleep / yield / priority non-blocking     break_sleep / _yield / _priority
//!   suspend / stop           blocking if self, else non-blocking
//!   interrupt                non-blocking     target waiting
//!   unpark                   non-blocking     target blocked
//! ```

use super::{reasons, SchedCx};
use crate::domain::choice::{ChoiceGenerator, ThreadChoiceFromSet};
use crate::domain::error::EngineError;
use crate::domain::heap::ObjRef;
use crate::domain::threads::{ThreadId, ThreadSet, ThreadStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Scheduling decisions for synchronization operations.
///
/// Every `sets_*_cg` hook returns `true` if it registered a choice
/// generator, in which case the operation has to be re-executed in the
/// next transition.
pub trait SyncPolicy: Send + fmt::Debug {
    /// Policy class name
    fn name(&self) -> &'static str;

    /// Register the mandatory choice over the initially runnable threads
    fn set_root_cg(&mut self, cx: &mut SchedCx<'_>) -> Result<(), EngineError>;

    /// `tid` is about to block on the contended monitor of `lock`
    fn sets_blocked_thread_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, lock: ObjRef) -> bool;
    /// `tid` is about to acquire the free monitor of `lock`
    fn sets_lock_acquisition_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, lock: ObjRef) -> bool;
    /// `tid` released `lock`; `did_unblock` tells whether a contender woke up
    fn sets_lock_release_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, lock: ObjRef, did_unblock: bool) -> bool;
    /// `tid` terminated
    fn sets_terminate_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId) -> bool;
    /// `tid` entered `wait()`
    fn sets_wait_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, timeout: Option<u64>) -> bool;
    /// `tid` called `notify()`
    fn sets_notify_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, did_notify: bool) -> bool;
    /// `tid` called `notifyAll()`
    fn sets_notify_all_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, did_notify: bool) -> bool;
    /// `tid` started `started`
    fn sets_start_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, started: ThreadId) -> bool;
    /// `tid` yields
    fn sets_yield_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId) -> bool;
    /// `tid` changed a priority
    fn sets_priority_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId) -> bool;
    /// `tid` sleeps
    fn sets_sleep_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, millis: u64) -> bool;
    /// `tid` suspends `target`
    fn sets_suspend_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, target: ThreadId) -> bool;
    /// `tid` resumes `target`
    fn sets_resume_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, target: ThreadId) -> bool;
    /// `tid` joins `joinee`
    fn sets_join_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, joinee: ThreadId, timeout: Option<u64>) -> bool;
    /// `tid` stops `target`
    fn sets_stop_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, target: ThreadId) -> bool;
    /// `tid` interrupts `target`
    fn sets_interrupt_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, target: ThreadId) -> bool;
    /// `tid` parks
    fn sets_park_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, is_absolute: bool, timeout: Option<u64>) -> bool;
    /// `tid` unparks `target`
    fn sets_unpark_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, target: ThreadId) -> bool;
    /// `tid` enters an atomic section
    fn sets_begin_atomic_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId) -> bool;
    /// `tid` leaves an atomic section
    fn sets_end_atomic_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId) -> bool;
    /// Generic scheduling point requested by the engine
    fn sets_reschedule_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, reason: &str) -> bool;
    /// The finalizer thread drained its queue
    fn sets_post_finalize_cg(&mut self, cx: &mut SchedCx<'_>, finalizer: ThreadId) -> bool;
}

/// `cg.break_*` switches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Break even if the only candidate is the running thread
    pub break_single_choice: bool,
    /// Break after a release that unblocked a contender
    pub break_lock_release: bool,
    /// Break after a successful `notify()`
    pub break_notify: bool,
    /// Break after a successful `notifyAll()`
    pub break_notifyall: bool,
    /// Break on `sleep()`
    pub break_sleep: bool,
    /// Break on `yield()`
    pub break_yield: bool,
    /// Break on priority changes
    pub break_priority: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            break_single_choice: false,
            break_lock_release: true,
            break_notify: true,
            break_notifyall: true,
            break_sleep: true,
            break_yield: true,
            break_priority: true,
        }
    }
}

/// Offers all runnable threads at every scheduling point
#[derive(Debug, Clone, Default)]
pub struct AllRunnablesSyncPolicy {
    config: SyncConfig,
}

impl AllRunnablesSyncPolicy {
    /// Class name used by `vm.scheduler.sync.class`
    pub const NAME: &'static str = "AllRunnablesSyncPolicy";

    /// Policy with the given switches
    pub const fn new(config: SyncConfig) -> Self {
        Self { config }
    }

    /// Switches
    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Runnable candidates: the caller's application first, everything
    /// (including bounded timeout waits) otherwise
    fn timeout_runnables(cx: &SchedCx<'_>, tid: ThreadId) -> ThreadSet {
        if let Ok(ti) = cx.kernel.thread(tid) {
            let app = ti.app;
            if cx.kernel.has_process_timeout_runnables(app) {
                return cx.kernel.timeout_runnables(Some(app));
            }
        }
        cx.kernel.timeout_runnables(None)
    }

    fn runnable_cg(&self, cx: &SchedCx<'_>, id: &str, tid: ThreadId) -> Option<ThreadChoiceFromSet> {
        let choices = Self::timeout_runnables(cx, tid);
        if choices.is_empty() {
            return None;
        }
        if choices.len() == 1
            && choices.contains(tid)
            && !cx.kernel.thread(tid).is_ok_and(|ti| ti.is_timeout_waiting())
            && !self.config.break_single_choice
        {
            return None;
        }
        let mut cg = ThreadChoiceFromSet::new(id, choices.as_slice(), true);
        let app_local = cx
            .kernel
            .thread(tid)
            .is_ok_and(|ti| cx.kernel.has_process_timeout_runnables(ti.app));
        if !app_local {
            cg.base_mut().set_global();
        }
        Some(cg)
    }

    fn set_blocking_cg(&self, cx: &mut SchedCx<'_>, id: &str, tid: ThreadId) -> bool {
        if cx.suppresses_first_step(tid) {
            return false;
        }
        if cx.is_atomic() {
            warn!(thread = %tid, op = id, "blocking operation inside atomic section");
            cx.system.set_blocked_in_atomic();
        }
        let cg = match self.runnable_cg(cx, id, tid) {
            Some(cg) => cg,
            // an empty candidate set must not hide a deadlock
            None if cx.kernel.threads.has_live_threads() => ThreadChoiceFromSet::blocked_without_choice(),
            None => return false,
        };
        cx.register(Box::new(cg))
    }

    fn set_non_blocking_cg(&self, cx: &mut SchedCx<'_>, id: &str, tid: ThreadId) -> bool {
        if cx.suppresses_first_step(tid) || cx.is_atomic() {
            return false;
        }
        match self.runnable_cg(cx, id, tid) {
            Some(cg) => cx.register(Box::new(cg)),
            None => false,
        }
    }

    fn set_maybe_blocking_cg(&self, cx: &mut SchedCx<'_>, id: &str, tid: ThreadId, target: ThreadId) -> bool {
        if tid == target {
            self.set_blocking_cg(cx, id, tid)
        } else {
            self.set_non_blocking_cg(cx, id, tid)
        }
    }
}

impl SyncPolicy for AllRunnablesSyncPolicy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn set_root_cg(&mut self, cx: &mut SchedCx<'_>) -> Result<(), EngineError> {
        let runnables = cx.kernel.timeout_runnables(None);
        debug!(threads = %runnables, "root thread choice");
        let cg = ThreadChoiceFromSet::new(reasons::ROOT, runnables.as_slice(), true);
        cx.system
            .set_mandatory_next_choice_generator(Box::new(cg), cx.listeners, "no ROOT choice generator")
    }

    fn sets_blocked_thread_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, _lock: ObjRef) -> bool {
        self.set_blocking_cg(cx, reasons::BLOCK, tid)
    }

    fn sets_lock_acquisition_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, _lock: ObjRef) -> bool {
        self.set_non_blocking_cg(cx, reasons::LOCK, tid)
    }

    fn sets_lock_release_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, _lock: ObjRef, did_unblock: bool) -> bool {
        self.config.break_lock_release && did_unblock && self.set_non_blocking_cg(cx, reasons::RELEASE, tid)
    }

    fn sets_terminate_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId) -> bool {
        self.set_blocking_cg(cx, reasons::TERMINATE, tid)
    }

    fn sets_wait_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, _timeout: Option<u64>) -> bool {
        self.set_blocking_cg(cx, reasons::WAIT, tid)
    }

    fn sets_notify_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, did_notify: bool) -> bool {
        self.config.break_notify && did_notify && self.set_non_blocking_cg(cx, reasons::NOTIFY, tid)
    }

    fn sets_notify_all_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, did_notify: bool) -> bool {
        self.config.break_notifyall && did_notify && self.set_non_blocking_cg(cx, reasons::NOTIFYALL, tid)
    }

    fn sets_start_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, _started: ThreadId) -> bool {
        self.set_non_blocking_cg(cx, reasons::START, tid)
    }

    fn sets_yield_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId) -> bool {
        self.config.break_yield && self.set_non_blocking_cg(cx, reasons::YIELD, tid)
    }

    fn sets_priority_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId) -> bool {
        self.config.break_priority && self.set_non_blocking_cg(cx, reasons::PRIORITY, tid)
    }

    fn sets_sleep_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, _millis: u64) -> bool {
        self.config.break_sleep && self.set_non_blocking_cg(cx, reasons::SLEEP, tid)
    }

    fn sets_suspend_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, target: ThreadId) -> bool {
        self.set_maybe_blocking_cg(cx, reasons::SUSPEND, tid, target)
    }

    fn sets_resume_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, _target: ThreadId) -> bool {
        self.set_non_blocking_cg(cx, reasons::RESUME, tid)
    }

    fn sets_join_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, _joinee: ThreadId, _timeout: Option<u64>) -> bool {
        self.set_blocking_cg(cx, reasons::JOIN, tid)
    }

    fn sets_stop_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, target: ThreadId) -> bool {
        self.set_maybe_blocking_cg(cx, reasons::STOP, tid, target)
    }

    fn sets_interrupt_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, target: ThreadId) -> bool {
        let waiting = cx.kernel.thread(target).is_ok_and(|ti| ti.status.is_waiting());
        waiting && self.set_non_blocking_cg(cx, reasons::INTERRUPT, tid)
    }

    fn sets_park_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, _is_absolute: bool, _timeout: Option<u64>) -> bool {
        self.set_blocking_cg(cx, reasons::PARK, tid)
    }

    fn sets_unpark_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, target: ThreadId) -> bool {
        let blocked = cx
            .kernel
            .thread(target)
            .is_ok_and(|ti| ti.status == ThreadStatus::Blocked);
        blocked && self.set_non_blocking_cg(cx, reasons::UNPARK, tid)
    }

    fn sets_begin_atomic_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId) -> bool {
        self.set_non_blocking_cg(cx, reasons::BEGIN_ATOMIC, tid)
    }

    fn sets_end_atomic_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId) -> bool {
        self.set_non_blocking_cg(cx, reasons::END_ATOMIC, tid)
    }

    fn sets_reschedule_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, reason: &str) -> bool {
        self.set_non_blocking_cg(cx, reason, tid)
    }

    fn sets_post_finalize_cg(&mut self, cx: &mut SchedCx<'_>, finalizer: ThreadId) -> bool {
        self.set_blocking_cg(cx, reasons::POST_FINALIZE, finalizer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::choice::BLOCKED_NO_CHOICE;
    use crate::domain::classes::{AppId, ClassDef, ClassRegistry, MethodId};
    use crate::domain::heap::{AllocationStrategy, SlotTable};
    use crate::domain::kernel::KernelState;
    use crate::domain::threads::StackFrame;
    use crate::domain::transition::{Listeners, SystemState};
    use std::sync::Arc;

    struct Fixture {
        kernel: KernelState,
        system: SystemState,
        listeners: Listeners,
        lock: ObjRef,
        t: Vec<ThreadId>,
    }

    impl Fixture {
        fn new(n: usize) -> Self {
            let reg = Arc::new(ClassRegistry::new());
            let lock_class = reg.define(ClassDef::new("Lock"));
            let mut kernel = KernelState::new(reg, AllocationStrategy::Hashed, SlotTable::new(), false);
            let mut t = Vec::new();
            for i in 0..n {
                let tid = kernel.threads.create(&format!("t{i}"), AppId::new(0));
                kernel.start_thread(tid).unwrap();
                kernel.thread_mut(tid).unwrap().frames.push(StackFrame::new(MethodId::new(0)));
                t.push(tid);
            }
            let lock = kernel.new_system_object(lock_class, 0, AppId::new(0)).unwrap();
            Self {
                kernel,
                system: SystemState::default(),
                listeners: Listeners::new(),
                lock,
                t,
            }
        }

        fn cx(&mut self) -> SchedCx<'_> {
            SchedCx::new(&mut self.kernel, &mut self.system, &mut self.listeners)
        }

        fn next_cg(&self) -> Option<&dyn ChoiceGenerator> {
            self.system.next_choice_generator().and_then(|h| self.system.cg(h))
        }
    }

    #[test]
    fn test_root_cg_offers_all_runnables() {
        let mut f = Fixture::new(3);
        let mut policy = AllRunnablesSyncPolicy::default();
        policy.set_root_cg(&mut f.cx()).unwrap();
        let cg = f.next_cg().unwrap().downcast_ref::<ThreadChoiceFromSet>().unwrap();
        assert_eq!(cg.threads(), f.t.as_slice());
        assert_eq!(cg.base().id(), "ROOT");
    }

    #[test]
    fn test_root_cg_refused_is_fatal() {
        let mut f = Fixture::new(1);
        f.system.set_ignored(true);
        let err = AllRunnablesSyncPolicy::default().set_root_cg(&mut f.cx()).unwrap_err();
        assert!(matches!(err, EngineError::MandatoryChoiceRefused(_)));
    }

    #[test]
    fn test_non_blocking_masked_while_atomic() {
        let mut f = Fixture::new(2);
        let mut policy = AllRunnablesSyncPolicy::default();
        let (t0, lock) = (f.t[0], f.lock);
        f.system.inc_atomic();
        assert!(!policy.sets_lock_acquisition_cg(&mut f.cx(), t0, lock));
        assert!(!policy.sets_yield_cg(&mut f.cx(), t0));
        f.system.dec_atomic();
        assert!(policy.sets_lock_acquisition_cg(&mut f.cx(), t0, lock));
    }

    #[test]
    fn test_first_step_never_registers() {
        let mut f = Fixture::new(2);
        let mut policy = AllRunnablesSyncPolicy::default();
        let (t0, t1) = (f.t[0], f.t[1]);
        f.system.set_first_step_insn(true);
        assert!(!policy.sets_wait_cg(&mut f.cx(), t0, None));
        assert!(!policy.sets_start_cg(&mut f.cx(), t0, t1));
    }

    #[test]
    fn test_empty_transition_lets_first_step_block() {
        let mut f = Fixture::new(2);
        let mut policy = AllRunnablesSyncPolicy::default();
        let t0 = f.t[0];
        f.system.set_first_step_insn(true);
        f.kernel.thread_mut(t0).unwrap().status = ThreadStatus::Waiting;
        assert!(!policy.sets_post_finalize_cg(&mut f.cx(), t0));
        assert!(f.next_cg().is_none());

        f.kernel.thread_mut(t0).unwrap().empty_transition_enabled = true;
        assert!(policy.sets_post_finalize_cg(&mut f.cx(), t0));
        let cg = f.next_cg().unwrap();
        assert_eq!(cg.base().id(), reasons::POST_FINALIZE);
        assert_eq!(cg.total_choices(), 1);
    }

    #[test]
    fn test_cross_application_candidates_mark_global_point() {
        let mut f = Fixture::new(2);
        let (t0, lock) = (f.t[0], f.lock);
        let mut policy = AllRunnablesSyncPolicy::default();
        assert!(policy.sets_yield_cg(&mut f.cx(), t0));
        assert!(!f.next_cg().unwrap().base().is_global());
        f.system.remove_next_choice_generator();

        let remote = f.kernel.threads.create("remote", AppId::new(1));
        f.kernel.start_thread(remote).unwrap();
        for t in f.t.clone() {
            f.kernel.thread_mut(t).unwrap().status = ThreadStatus::Blocked;
            f.kernel.thread_mut(t).unwrap().lock_ref = Some(lock);
        }
        assert!(policy.sets_blocked_thread_cg(&mut f.cx(), t0, lock));
        let cg = f.next_cg().unwrap().downcast_ref::<ThreadChoiceFromSet>().unwrap();
        assert_eq!(cg.threads(), &[remote]);
        assert!(cg.base().is_global());
    }

    #[test]
    fn test_blocking_inside_atomic_flags_violation() {
        let mut f = Fixture::new(2);
        let mut policy = AllRunnablesSyncPolicy::default();
        let t0 = f.t[0];
        f.system.inc_atomic();
        assert!(policy.sets_wait_cg(&mut f.cx(), t0, None));
        assert!(f.system.is_blocked_in_atomic());
    }

    #[test]
    fn test_single_self_choice_is_skipped_unless_configured() {
        let mut f = Fixture::new(1);
        let t0 = f.t[0];
        let mut policy = AllRunnablesSyncPolicy::default();
        assert!(!policy.sets_yield_cg(&mut f.cx(), t0));

        let mut eager = AllRunnablesSyncPolicy::new(SyncConfig {
            break_single_choice: true,
            ..SyncConfig::default()
        });
        assert!(eager.sets_yield_cg(&mut f.cx(), t0));
    }

    #[test]
    fn test_empty_candidates_with_live_threads_yield_sentinel() {
        let mut f = Fixture::new(1);
        let (t0, lock) = (f.t[0], f.lock);
        f.kernel.thread_mut(t0).unwrap().status = ThreadStatus::Blocked;
        f.kernel.thread_mut(t0).unwrap().lock_ref = Some(lock);

        let mut policy = AllRunnablesSyncPolicy::default();
        assert!(policy.sets_blocked_thread_cg(&mut f.cx(), t0, lock));
        let cg = f.next_cg().unwrap();
        assert_eq!(cg.base().id(), BLOCKED_NO_CHOICE);
        assert_eq!(cg.total_choices(), 0);
    }

    #[test]
    fn test_break_switches_gate_registration() {
        let mut f = Fixture::new(2);
        let (t0, lock) = (f.t[0], f.lock);
        let mut quiet = AllRunnablesSyncPolicy::new(SyncConfig {
            break_lock_release: false,
            break_notify: false,
            break_sleep: false,
            ..SyncConfig::default()
        });
        assert!(!quiet.sets_lock_release_cg(&mut f.cx(), t0, lock, true));
        assert!(!quiet.sets_notify_cg(&mut f.cx(), t0, true));
        assert!(!quiet.sets_sleep_cg(&mut f.cx(), t0, 10));

        let mut policy = AllRunnablesSyncPolicy::default();
        assert!(!policy.sets_lock_release_cg(&mut f.cx(), t0, lock, false));
        assert!(policy.sets_lock_release_cg(&mut f.cx(), t0, lock, true));
    }

    #[test]
    fn test_suspend_self_is_blocking() {
        let mut f = Fixture::new(2);
        let (t0, t1) = (f.t[0], f.t[1]);
        let mut policy = AllRunnablesSyncPolicy::default();
        f.system.inc_atomic();
        assert!(!policy.sets_suspend_cg(&mut f.cx(), t0, t1));
        assert!(!f.system.is_blocked_in_atomic());
        assert!(policy.sets_suspend_cg(&mut f.cx(), t0, t0));
        assert!(f.system.is_blocked_in_atomic());
    }
}
