//! Scheduler - Choice Point Oracle
//!
//! # Overview
//!
//! The scheduler decides, for every scheduling-relevant operation the
//! execution engine performs, whether a thread choice has to be exposed.
//! It composes two independently configured policies:
//!
//! ```text
//! Scheduler
//!   ├─ sync: Box<dyn SyncPolicy>              lock / wait / notify / start / ...
//!   └─ sharedness: Box<dyn SharednessPolicy>  field / array / static accesses
//! ```
//!
//! Every hook receives a [`SchedCx`] that borrows the kernel state, the
//! transition state and the listeners, and returns whether a choice
//! generator was registered. A `true` return means the engine has to stop
//! the transition before performing the operation and re-execute it as the
//! first step of the next transition.
//!
//! # Blocking vs. non-blocking
//!
//! ```text
//!   non-blocking   skipped while atomic, skipped on the first step
//!   blocking       skipped on the first step; while atomic it flags
//!                  BLOCKED_IN_ATOMIC and registers anyway
//! ```

pub mod sharedness;
pub mod sync;

pub use sharedness::{
    GenericSharednessPolicy, GlobalScope, GlobalSharednessPolicy, PathScope, PathSharednessPolicy,
    SharednessConfig, SharednessPolicy, SharednessScope,
};
pub use sync::{AllRunnablesSyncPolicy, SyncConfig, SyncPolicy};

use crate::domain::choice::ChoiceGenerator;
use crate::domain::classes::{ClassId, LoaderId};
use crate::domain::error::{ConfigError, EngineError};
use crate::domain::heap::ObjRef;
use crate::domain::kernel::{ElementRef, KernelState};
use crate::domain::threads::ThreadId;
use crate::domain::transition::{Listeners, SystemState};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// Choice generator ids used by the policies
pub mod reasons {
    /// Initial thread choice
    pub const ROOT: &str = "ROOT";
    /// Contended lock
    pub const BLOCK: &str = "BLOCK";
    /// Lock acquisition
    pub const LOCK: &str = "LOCK";
    /// Lock release that unblocked a contender
    pub const RELEASE: &str = "RELEASE";
    /// Thread termination
    pub const TERMINATE: &str = "TERMINATE";
    /// `wait()`
    pub const WAIT: &str = "WAIT";
    /// `notify()`
    pub const NOTIFY: &str = "NOTIFY";
    /// `notifyAll()`
    pub const NOTIFYALL: &str = "NOTIFYALL";
    /// Thread start
    pub const START: &str = "START";
    /// `yield()`
    pub const YIELD: &str = "YIELD";
    /// Priority change
    pub const PRIORITY: &str = "PRIORITY";
    /// `sleep()`
    pub const SLEEP: &str = "SLEEP";
    /// `suspend()`
    pub const SUSPEND: &str = "SUSPEND";
    /// `resume()`
    pub const RESUME: &str = "RESUME";
    /// `join()`
    pub const JOIN: &str = "JOIN";
    /// `stop()`
    pub const STOP: &str = "STOP";
    /// `interrupt()`
    pub const INTERRUPT: &str = "INTERRUPT";
    /// `park()`
    pub const PARK: &str = "PARK";
    /// `unpark()`
    pub const UNPARK: &str = "UNPARK";
    /// Atomic section entry
    pub const BEGIN_ATOMIC: &str = "BEGIN_ATOMIC";
    /// Atomic section exit
    pub const END_ATOMIC: &str = "END_ATOMIC";
    /// Finalizer thread woken for queued objects
    pub const FINALIZE: &str = "FINALIZE";
    /// Finalizer thread done with its queue
    pub const POST_FINALIZE: &str = "POST_FINALIZE";
    /// Access of a shared object field
    pub const SHARED_OBJECT: &str = "SHARED_OBJECT";
    /// Access of a shared static field
    pub const SHARED_CLASS: &str = "SHARED_CLASS";
    /// Access of a shared array element
    pub const SHARED_ARRAY: &str = "SHARED_ARRAY";
    /// Unshared object stored into a shared one
    pub const EXPOSE: &str = "EXPOSE";
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hook context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Borrowed VM state handed to every policy hook
pub struct SchedCx<'a> {
    /// Heap, threads and statics
    pub kernel: &'a mut KernelState,
    /// Transition state the choice generators are registered with
    pub system: &'a mut SystemState,
    /// Notified about registrations
    pub listeners: &'a mut Listeners,
}

impl<'a> SchedCx<'a> {
    /// Bundle the three borrows
    pub fn new(kernel: &'a mut KernelState, system: &'a mut SystemState, listeners: &'a mut Listeners) -> Self {
        Self {
            kernel,
            system,
            listeners,
        }
    }

    /// Register `cg` as the next choice generator
    pub fn register(&mut self, cg: Box<dyn ChoiceGenerator>) -> bool {
        self.system.set_next_choice_generator(cg, self.listeners)
    }

    /// The executing instruction is the re-executed first step
    pub fn is_first_step(&self) -> bool {
        self.system.is_first_step_insn()
    }

    /// Inside an atomic section
    pub fn is_atomic(&self) -> bool {
        self.system.is_atomic()
    }

    /// `tid` may register a blocking choice at the first step of its
    /// transition
    pub fn is_empty_transition_enabled(&self, tid: ThreadId) -> bool {
        self.kernel
            .threads
            .get(tid)
            .is_some_and(|ti| ti.empty_transition_enabled)
    }

    /// Hooks stay silent at the first step unless `tid` allows an empty
    /// transition
    pub fn suppresses_first_step(&self, tid: ThreadId) -> bool {
        self.is_first_step() && !self.is_empty_transition_enabled(tid)
    }
}

impl fmt::Debug for SchedCx<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedCx")
            .field("exec_thread", &self.system.exec_thread())
            .field("atomic", &self.system.is_atomic())
            .finish_non_exhaustive()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Composite
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Policy selection and settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// `vm.scheduler.sync.class`
    pub sync_class: String,
    /// `vm.scheduler.sharedness.class`
    pub sharedness_class: String,
    /// Sync policy switches
    pub sync: SyncConfig,
    /// Sharedness policy switches
    pub sharedness: SharednessConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sync_class: AllRunnablesSyncPolicy::NAME.to_string(),
            sharedness_class: PathSharednessPolicy::NAME.to_string(),
            sync: SyncConfig::default(),
            sharedness: SharednessConfig::default(),
        }
    }
}

/// One sync policy plus one sharedness policy behind a single interface
#[derive(Debug)]
pub struct Scheduler {
    sync: Box<dyn SyncPolicy>,
    sharedness: Box<dyn SharednessPolicy>,
}

impl Scheduler {
    /// Compose explicit policy instances
    pub fn new(sync: Box<dyn SyncPolicy>, sharedness: Box<dyn SharednessPolicy>) -> Self {
        Self { sync, sharedness }
    }

    /// Instantiate the configured policy classes
    pub fn from_config(config: &SchedulerConfig) -> Result<Self, ConfigError> {
        let sync: Box<dyn SyncPolicy> = match short_name(&config.sync_class) {
            name if name == AllRunnablesSyncPolicy::NAME => {
                Box::new(AllRunnablesSyncPolicy::new(config.sync.clone()))
            }
            _ => {
                return Err(ConfigError::UnknownClass {
                    kind: "sync policy",
                    name: config.sync_class.clone(),
                })
            }
        };
        let sharedness: Box<dyn SharednessPolicy> = match short_name(&config.sharedness_class) {
            name if name == PathSharednessPolicy::NAME => {
                Box::new(PathSharednessPolicy::new(config.sharedness.clone()))
            }
            name if name == GlobalSharednessPolicy::NAME => {
                Box::new(GlobalSharednessPolicy::new(config.sharedness.clone()))
            }
            _ => {
                return Err(ConfigError::UnknownClass {
                    kind: "sharedness policy",
                    name: config.sharedness_class.clone(),
                })
            }
        };
        info!(sync = sync.name(), sharedness = sharedness.name(), "scheduler policies");
        Ok(Self::new(sync, sharedness))
    }

    /// Sync policy
    pub fn sync(&self) -> &dyn SyncPolicy {
        &*self.sync
    }

    /// Sharedness policy
    pub fn sharedness(&self) -> &dyn SharednessPolicy {
        &*self.sharedness
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(
            Box::new(AllRunnablesSyncPolicy::default()),
            Box::new(PathSharednessPolicy::default()),
        )
    }
}

/// `some.pkg.AllRunnablesSyncPolicy` and `AllRunnablesSyncPolicy` select
/// the same policy
fn short_name(class: &str) -> &str {
    class.rsplit('.').next().unwrap_or(class).trim()
}

impl SyncPolicy for Scheduler {
    fn name(&self) -> &'static str {
        self.sync.name()
    }
    fn set_root_cg(&mut self, cx: &mut SchedCx<'_>) -> Result<(), EngineError> {
        self.sync.set_root_cg(cx)
    }
    fn sets_blocked_thread_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, lock: ObjRef) -> bool {
        self.sync.sets_blocked_thread_cg(cx, tid, lock)
    }
    fn sets_lock_acquisition_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, lock: ObjRef) -> bool {
        self.sync.sets_lock_acquisition_cg(cx, tid, lock)
    }
    fn sets_lock_release_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, lock: ObjRef, did_unblock: bool) -> bool {
        self.sync.sets_lock_release_cg(cx, tid, lock, did_unblock)
    }
    fn sets_terminate_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId) -> bool {
        self.sync.sets_terminate_cg(cx, tid)
    }
    fn sets_wait_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, timeout: Option<u64>) -> bool {
        self.sync.sets_wait_cg(cx, tid, timeout)
    }
    fn sets_notify_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, did_notify: bool) -> bool {
        self.sync.sets_notify_cg(cx, tid, did_notify)
    }
    fn sets_notify_all_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, did_notify: bool) -> bool {
        self.sync.sets_notify_all_cg(cx, tid, did_notify)
    }
    fn sets_start_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, started: ThreadId) -> bool {
        self.sync.sets_start_cg(cx, tid, started)
    }
    fn sets_yield_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId) -> bool {
        self.sync.sets_yield_cg(cx, tid)
    }
    fn sets_priority_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId) -> bool {
        self.sync.sets_priority_cg(cx, tid)
    }
    fn sets_sleep_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, millis: u64) -> bool {
        self.sync.sets_sleep_cg(cx, tid, millis)
    }
    fn sets_suspend_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, target: ThreadId) -> bool {
        self.sync.sets_suspend_cg(cx, tid, target)
    }
    fn sets_resume_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, target: ThreadId) -> bool {
        self.sync.sets_resume_cg(cx, tid, target)
    }
    fn sets_join_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, joinee: ThreadId, timeout: Option<u64>) -> bool {
        self.sync.sets_join_cg(cx, tid, joinee, timeout)
    }
    fn sets_stop_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, target: ThreadId) -> bool {
        self.sync.sets_stop_cg(cx, tid, target)
    }
    fn sets_interrupt_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, target: ThreadId) -> bool {
        self.sync.sets_interrupt_cg(cx, tid, target)
    }
    fn sets_park_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, is_absolute: bool, timeout: Option<u64>) -> bool {
        self.sync.sets_park_cg(cx, tid, is_absolute, timeout)
    }
    fn sets_unpark_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, target: ThreadId) -> bool {
        self.sync.sets_unpark_cg(cx, tid, target)
    }
    fn sets_begin_atomic_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId) -> bool {
        self.sync.sets_begin_atomic_cg(cx, tid)
    }
    fn sets_end_atomic_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId) -> bool {
        self.sync.sets_end_atomic_cg(cx, tid)
    }
    fn sets_reschedule_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, reason: &str) -> bool {
        self.sync.sets_reschedule_cg(cx, tid, reason)
    }
    fn sets_post_finalize_cg(&mut self, cx: &mut SchedCx<'_>, finalizer: ThreadId) -> bool {
        self.sync.sets_post_finalize_cg(cx, finalizer)
    }
}

impl SharednessPolicy for Scheduler {
    fn name(&self) -> &'static str {
        self.sharedness.name()
    }
    fn initialize_object_sharedness(&mut self, kernel: &mut KernelState, tid: ThreadId, obj: ObjRef) {
        self.sharedness.initialize_object_sharedness(kernel, tid, obj);
    }
    fn initialize_class_sharedness(&mut self, kernel: &mut KernelState, tid: ThreadId, loader: LoaderId, class: ClassId) {
        self.sharedness.initialize_class_sharedness(kernel, tid, loader, class);
    }
    fn sets_shared_object_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, obj: ObjRef, field: usize) -> bool {
        self.sharedness.sets_shared_object_cg(cx, tid, obj, field)
    }
    fn sets_shared_class_cg(
        &mut self,
        cx: &mut SchedCx<'_>,
        tid: ThreadId,
        loader: LoaderId,
        class: ClassId,
        field: usize,
    ) -> bool {
        self.sharedness.sets_shared_class_cg(cx, tid, loader, class, field)
    }
    fn sets_shared_array_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, array: ObjRef, index: usize) -> bool {
        self.sharedness.sets_shared_array_cg(cx, tid, array, index)
    }
    fn sets_exposure_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, owner: ElementRef, exposed: ObjRef) -> bool {
        self.sharedness.sets_exposure_cg(cx, tid, owner, exposed)
    }
    fn is_shared(&self, kernel: &KernelState, eref: ElementRef) -> bool {
        self.sharedness.is_shared(kernel, eref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_selects_policies() {
        let config = SchedulerConfig {
            sharedness_class: "gov.nasa.GlobalSharednessPolicy".into(),
            ..SchedulerConfig::default()
        };
        let scheduler = Scheduler::from_config(&config).unwrap();
        assert_eq!(SyncPolicy::name(&scheduler), "AllRunnablesSyncPolicy");
        assert_eq!(SharednessPolicy::name(&scheduler), "GlobalSharednessPolicy");
    }

    #[test]
    fn test_unknown_policy_class_fails_fast() {
        let config = SchedulerConfig {
            sync_class: "RoundRobinSyncPolicy".into(),
            ..SchedulerConfig::default()
        };
        let err = Scheduler::from_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownClass { kind: "sync policy", .. }));
    }
}
