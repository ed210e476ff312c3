//! Virtual Machine - Search Node Driver
//!
//! # Overview
//!
//! [`Vm`] owns exactly one live search node: the kernel state, the
//! transition state, the scheduler and the listeners. A search driver moves
//! it through the state space with three operations:
//!
//! ```text
//!            forward()                          backtrack()
//!   state ─────────────────▶ state'    state' ─────────────────▶ state
//!     │ initialize_next_transition       │ pop path entry
//!     │ push kernel memento              │ restore kernel (pre-transition)
//!     │ run executor until break         │ backtrack transition state
//!     │ push transition memento          │   (current CG keeps its cursor)
//!     │ gc_if_needed, state matching     │ collect unreachable CGs
//!     ▼                                  ▼
//! ```
//!
//! [`Vm::snapshot`] / [`Vm::restore`] capture and reinstate a node
//! independent of traversal order (deep choice generator copies).
//!
//! # Execution collaborator
//!
//! Instruction semantics live outside the core behind [`ExecutionEngine`].
//! The engine executes one instruction per [`ExecutionEngine::step`] and
//! calls back into the scheduling hooks through [`VmCore`]:
//!
//! ```text
//!   step(tid)
//!     ├─ not first step and a hook registered a CG ─▶ Step::Reexecute
//!     ├─ instruction done                           ─▶ Step::Continue
//!     └─ thread cannot go on (terminated, blocked)  ─▶ Step::Exit
//! ```
//!
//! A re-executed instruction runs again as the first step of the next
//! transition, where hooks do not register, so its bottom half executes.
//! An engine that needs a scheduling point right at the first step calls
//! [`VmCore::enable_empty_transition`]; the resulting transition executed
//! nothing and is forced to count as new.
//!
//! # Design Notes
//!
//! The engine type is a parameter of [`Vm`] rather than a trait object: one
//! search drives one program, and the step loop is the hottest path.

use crate::domain::classes::{ClassId, ClassRegistry, LoaderId};
use crate::domain::error::{ConfigError, EngineError};
use crate::domain::heap::{AllocationStrategy, ObjRef, SlotTable};
use crate::domain::kernel::{KernelMemento, KernelState};
use crate::domain::scheduler::{SchedCx, Scheduler, SchedulerConfig, SharednessPolicy, SyncPolicy};
use crate::domain::snapshot::{Backtrack, Restorable, Restore};
use crate::domain::threads::ThreadId;
use crate::domain::transition::{
    ChoicePoint, Listeners, SystemMemento, SystemState, TransitionConfig, VmListener,
};
use rustc_hash::{FxHashMap, FxHasher};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, error, info};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Settings of one VM instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Transition engine
    pub transition: TransitionConfig,
    /// Policy selection
    pub scheduler: SchedulerConfig,
    /// `vm.heap.allocation`
    pub allocation: AllocationStrategy,
    /// `vm.reuse_tid`
    pub reuse_tid: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution collaborator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Result of executing one instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Instruction completed, keep going
    Continue,
    /// A choice generator was registered, run the instruction again as the
    /// first step of the next transition
    Reexecute,
    /// The thread cannot continue in this transition
    Exit,
}

/// Instruction-level semantics driven by the VM
pub trait ExecutionEngine: Send {
    /// Create the initial threads and classes
    fn initialize(&mut self, core: &mut VmCore) -> Result<(), EngineError>;

    /// Execute the next instruction of `tid`
    fn step(&mut self, core: &mut VmCore, tid: ThreadId) -> Result<Step, EngineError>;

    /// Run the finalizers queued by the last GC.
    ///
    /// Without a finalizer thread the objects are just marked finalized.
    fn process_finalizers(&mut self, core: &mut VmCore, queue: Vec<ObjRef>) -> Result<(), EngineError> {
        for obj in queue {
            core.kernel.heap.finalized(obj)?;
        }
        Ok(())
    }
}

/// Everything an engine may touch while executing
#[derive(Debug)]
pub struct VmCore {
    /// Heap, threads, statics
    pub kernel: KernelState,
    /// Choice generators and transition bookkeeping
    pub system: SystemState,
    /// Exploration observers
    pub listeners: Listeners,
    /// Sync and sharedness policies
    pub scheduler: Scheduler,
}

impl VmCore {
    /// Run a policy hook with the split borrows it needs
    pub fn with_scheduler<R>(&mut self, f: impl FnOnce(&mut Scheduler, &mut SchedCx<'_>) -> R) -> R {
        let mut cx = SchedCx::new(&mut self.kernel, &mut self.system, &mut self.listeners);
        f(&mut self.scheduler, &mut cx)
    }

    /// Allocate an object for `tid`, notify listeners and record sharedness.
    ///
    /// An on-the-fly GC triggered by the allocation threshold runs before the
    /// object exists, so the fresh reference is never collected before the
    /// engine stores it. Objects it queues for finalization are handed to the
    /// engine once the transition ends.
    pub fn new_object(&mut self, tid: ThreadId, class: ClassId, site: u32) -> Result<ObjRef, EngineError> {
        if let Some(stats) = self.system.check_gc(&mut self.kernel, &mut self.listeners) {
            debug!(
                thread = %tid,
                released = stats.released.len(),
                finalizable = stats.queued_for_finalization,
                "allocation triggered gc"
            );
        }
        let obj = self.kernel.new_object(tid, class, site)?;
        self.listeners.object_created(tid, obj);
        self.scheduler.initialize_object_sharedness(&mut self.kernel, tid, obj);
        self.system.activate_gc();
        Ok(obj)
    }

    /// Create the statics of `class` on behalf of `tid`
    pub fn register_class(
        &mut self,
        tid: ThreadId,
        loader: LoaderId,
        class: ClassId,
        class_object_class: ClassId,
    ) -> Result<ObjRef, EngineError> {
        let class_object = self.kernel.register_class(loader, class, class_object_class)?;
        self.scheduler
            .initialize_class_sharedness(&mut self.kernel, tid, loader, class);
        Ok(class_object)
    }

    /// Program counter of the top frame of `tid`
    pub fn pc(&self, tid: ThreadId) -> Result<u32, EngineError> {
        Ok(self.kernel.thread(tid)?.top_frame().map_or(0, |f| f.pc))
    }

    /// Move the top frame of `tid` to the next instruction
    pub fn advance_pc(&mut self, tid: ThreadId) -> Result<(), EngineError> {
        if let Some(frame) = self.kernel.thread_mut(tid)?.top_frame_mut() {
            frame.pc += 1;
        }
        Ok(())
    }

    /// The running instruction is the first of its transition
    pub const fn is_first_step(&self) -> bool {
        self.system.is_first_step_insn()
    }

    /// Let blocking hooks called by the current step of `tid` register even
    /// though it is the first step. If one does, the transition executed no
    /// instruction and its target state counts as new.
    pub fn enable_empty_transition(&mut self, tid: ThreadId) -> Result<(), EngineError> {
        self.kernel.thread_mut(tid)?.empty_transition_enabled = true;
        Ok(())
    }

    fn reset_empty_transition(&mut self, tid: ThreadId) -> Result<bool, EngineError> {
        if !self.kernel.thread(tid)?.empty_transition_enabled {
            return Ok(false);
        }
        self.kernel.thread_mut(tid)?.empty_transition_enabled = false;
        Ok(true)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Vm
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What one [`Vm::forward`] produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionOutcome {
    /// Thread that executed the transition
    pub thread: ThreadId,
    /// Id of the reached state
    pub state_id: u64,
    /// State not seen before (or forced)
    pub is_new: bool,
    /// No non-daemon thread left
    pub is_end: bool,
    /// A listener asked to drop the transition
    pub is_ignored: bool,
}

/// Order-independent capture of a search node
#[derive(Debug, Clone)]
pub struct VmSnapshot {
    kernel: KernelMemento,
    system: SystemMemento<Restore>,
}

impl VmSnapshot {
    /// State id at capture
    pub const fn state_id(&self) -> Option<u64> {
        self.system.id()
    }
}

#[derive(Debug)]
struct PathEntry {
    /// Kernel before the transition
    kernel: KernelMemento,
    /// Transition state after the transition
    system: SystemMemento<Backtrack>,
}

/// One live search node plus its backtrack path
#[derive(Debug)]
pub struct Vm<E: ExecutionEngine> {
    core: VmCore,
    engine: E,
    path: Vec<PathEntry>,
    visited: FxHashMap<u64, u64>,
    is_new_state: bool,
}

impl<E: ExecutionEngine> Vm<E> {
    /// VM for `engine` with the configured policies
    pub fn new(config: &VmConfig, classes: Arc<ClassRegistry>, engine: E) -> Result<Self, ConfigError> {
        let scheduler = Scheduler::from_config(&config.scheduler)?;
        let kernel = KernelState::new(classes, config.allocation, SlotTable::new(), config.reuse_tid);
        Ok(Self {
            core: VmCore {
                kernel,
                system: SystemState::new(&config.transition),
                listeners: Listeners::new(),
                scheduler,
            },
            engine,
            path: Vec::new(),
            visited: FxHashMap::default(),
            is_new_state: true,
        })
    }

    /// Register an exploration observer
    pub fn add_listener(&mut self, listener: Box<dyn VmListener>) {
        self.core.listeners.add(listener);
    }

    /// Build the initial state and register the root choice
    pub fn initialize(&mut self) -> Result<(), EngineError> {
        self.engine.initialize(&mut self.core)?;
        self.core.with_scheduler(|s, cx| s.set_root_cg(cx))?;
        let fp = self.fingerprint();
        self.visited.insert(fp, 0);
        self.core.system.set_id(0);
        info!(
            threads = self.core.kernel.threads.len(),
            sync = self.core.scheduler.sync().name(),
            sharedness = self.core.scheduler.sharedness().name(),
            "vm initialized"
        );
        Ok(())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Accessors
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Live node
    pub const fn core(&self) -> &VmCore {
        &self.core
    }

    /// Live node, modifiable
    pub fn core_mut(&mut self) -> &mut VmCore {
        &mut self.core
    }

    /// Kernel state
    pub const fn kernel(&self) -> &KernelState {
        &self.core.kernel
    }

    /// Transition state
    pub const fn system(&self) -> &SystemState {
        &self.core.system
    }

    /// Execution collaborator
    pub const fn engine(&self) -> &E {
        &self.engine
    }

    /// Transitions on the backtrack path
    pub fn depth(&self) -> usize {
        self.path.len()
    }

    /// Id of the current state
    pub const fn state_id(&self) -> Option<u64> {
        self.core.system.id()
    }

    /// The last forward reached an unseen state
    pub const fn is_new_state(&self) -> bool {
        self.is_new_state
    }

    /// Distinct states seen so far
    pub fn visited_states(&self) -> usize {
        self.visited.len()
    }

    /// Live threads exist but none can run
    pub fn is_deadlocked(&self) -> bool {
        self.core.kernel.is_deadlocked()
    }

    /// No non-daemon thread left
    pub fn is_end_state(&self) -> bool {
        self.core.kernel.is_end_state()
    }

    /// Recorded choices leading to the current state
    pub fn choice_path(&self) -> Vec<ChoicePoint> {
        self.core.system.choice_path()
    }

    /// State fingerprint: kernel state plus atomic nesting
    pub fn fingerprint(&self) -> u64 {
        let mut h = FxHasher::default();
        self.core.kernel.fingerprint().hash(&mut h);
        self.core.system.atomic_level().hash(&mut h);
        h.finish()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Exploration
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Execute the next transition.
    ///
    /// `Ok(None)` means the choices of the current state are exhausted and
    /// the driver has to backtrack.
    pub fn forward(&mut self) -> Result<Option<TransitionOutcome>, EngineError> {
        if !self.core.system.initialize_next_transition(&mut self.core.listeners)? {
            return Ok(None);
        }
        let kernel = self.core.kernel.memento();
        let thread = self.execute_transition()?;
        self.path.push(PathEntry {
            kernel,
            system: self.core.system.memento::<Backtrack>(),
        });

        let is_ignored = self.core.system.is_ignored();
        let (state_id, is_new) = if is_ignored {
            (self.core.system.id().unwrap_or_default(), false)
        } else {
            self.core
                .system
                .gc_if_needed(&mut self.core.kernel, &mut self.core.listeners);
            // also covers objects queued by allocation-triggered collections
            let queue = self.core.kernel.heap.finalizer_queue().to_vec();
            if !queue.is_empty() {
                self.engine.process_finalizers(&mut self.core, queue)?;
            }
            self.match_state()
        };
        self.is_new_state = is_new;

        let outcome = TransitionOutcome {
            thread,
            state_id,
            is_new,
            is_end: self.core.kernel.is_end_state(),
            is_ignored,
        };
        debug!(
            depth = self.path.len(),
            thread = %thread,
            state = state_id,
            new = is_new,
            "transition done"
        );
        Ok(Some(outcome))
    }

    fn match_state(&mut self) -> (u64, bool) {
        let fp = self.fingerprint();
        let next_id = self.visited.len() as u64;
        let id = *self.visited.entry(fp).or_insert(next_id);
        let is_new = id == next_id || self.core.system.is_forced();
        self.core.system.set_id(id);
        (id, is_new)
    }

    fn execute_transition(&mut self) -> Result<ThreadId, EngineError> {
        let core = &mut self.core;
        let mut tid = core.system.set_exec_thread(&mut core.kernel, &mut core.listeners)?;
        core.system.set_first_step_insn(true);

        loop {
            let pc = core.pc(tid)?;
            core.system.set_current_insn(Some(pc));
            core.reset_empty_transition(tid)?;
            let step = self.engine.step(core, tid)?;
            if core.reset_empty_transition(tid)? && core.is_first_step() && core.system.next_choice_generator().is_some() {
                debug!(thread = %tid, pc, "empty transition");
                core.system.set_forced(true);
            }
            match step {
                Step::Continue => core.system.set_first_step_insn(false),
                Step::Reexecute if !core.system.break_transition() => {
                    error!(thread = %tid, pc, "re-execution without a pending choice generator");
                    return Err(EngineError::Execution {
                        thread: tid,
                        message: format!("instruction {pc} requested re-execution without a choice point"),
                    });
                }
                Step::Reexecute | Step::Exit => {}
            }

            if core.system.break_transition() {
                if core.system.extend_transition(&mut core.listeners)? {
                    tid = core.system.set_exec_thread(&mut core.kernel, &mut core.listeners)?;
                    core.system.set_first_step_insn(true);
                    continue;
                }
                break;
            }
            if step == Step::Exit || !core.kernel.thread(tid)?.is_runnable() {
                break;
            }
        }
        Ok(tid)
    }

    /// Return to the state before the last transition.
    ///
    /// Returns `false` at the root.
    pub fn backtrack(&mut self) -> bool {
        let Some(entry) = self.path.pop() else {
            return false;
        };
        self.core.kernel.restore(&entry.kernel);
        self.core.system.backtrack(&entry.system);
        let roots: Vec<_> = self.path.iter().flat_map(|e| e.system.handles()).collect();
        let freed = self.core.system.collect_choice_generators(roots);
        debug!(depth = self.path.len(), state = ?self.core.system.id(), freed, "backtracked");
        true
    }

    /// Capture the current node for out-of-order restoration
    pub fn snapshot(&self) -> VmSnapshot {
        VmSnapshot {
            kernel: self.core.kernel.memento(),
            system: Restorable::memento(&self.core.system),
        }
    }

    /// Reinstate a captured node. The backtrack path is discarded.
    pub fn restore(&mut self, snapshot: &VmSnapshot) {
        self.core.kernel.restore(&snapshot.kernel);
        Restorable::restore(&mut self.core.system, &snapshot.system);
        self.path.clear();
        self.core.system.collect_choice_generators(std::iter::empty());
        debug!(state = ?snapshot.state_id(), "restored vm");
    }

    /// Replay a recorded choice path from the current state.
    ///
    /// Stops when the trace is consumed or no transition is left.
    pub fn replay(&mut self, points: Vec<ChoicePoint>) -> Result<Vec<TransitionOutcome>, EngineError> {
        self.core.system.start_replay(points);
        let mut outcomes = Vec::new();
        let result = loop {
            if self.core.system.replay().map_or(true, |r| r.is_exhausted()) {
                break Ok(());
            }
            match self.forward() {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.core.system.stop_replay();
        result.map(|()| outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::classes::{AppId, ClassDef, MethodFlags, MethodId};
    use crate::domain::heap::{ElementAttrs, Value};
    use crate::domain::scheduler::reasons;
    use crate::domain::threads::{StackFrame, ThreadStatus};

    /// Every thread executes `steps` instructions, yielding before each
    /// one except its first, then terminates.
    #[derive(Debug)]
    struct YieldEngine {
        threads: usize,
        steps: u32,
    }

    impl ExecutionEngine for YieldEngine {
        fn initialize(&mut self, core: &mut VmCore) -> Result<(), EngineError> {
            let reg = Arc::clone(core.kernel.classes());
            let class = reg.define(ClassDef::new("Worker"));
            let run = reg.define_method(class, "run", MethodFlags::default());
            for i in 0..self.threads {
                let tid = core.kernel.threads.create(&format!("t{i}"), AppId::new(0));
                core.kernel.start_thread(tid)?;
                core.kernel.thread_mut(tid)?.frames.push(StackFrame::new(run));
            }
            Ok(())
        }

        fn step(&mut self, core: &mut VmCore, tid: ThreadId) -> Result<Step, EngineError> {
            if core.pc(tid)? >= self.steps {
                core.kernel.terminate(tid)?;
                core.with_scheduler(|s, cx| s.sets_terminate_cg(cx, tid));
                return Ok(Step::Exit);
            }
            if !core.is_first_step() && core.with_scheduler(|s, cx| s.sets_yield_cg(cx, tid)) {
                return Ok(Step::Reexecute);
            }
            core.advance_pc(tid)?;
            Ok(Step::Continue)
        }
    }

    fn vm(threads: usize, steps: u32) -> Vm<YieldEngine> {
        let mut vm = Vm::new(
            &VmConfig::default(),
            Arc::new(ClassRegistry::new()),
            YieldEngine { threads, steps },
        )
        .unwrap();
        vm.initialize().unwrap();
        vm
    }

    fn explore(vm: &mut Vm<YieldEngine>) -> Vec<TransitionOutcome> {
        let mut outcomes = Vec::new();
        loop {
            match vm.forward().unwrap() {
                Some(o) if o.is_new && !o.is_end => outcomes.push(o),
                Some(o) => {
                    outcomes.push(o);
                    vm.backtrack();
                }
                None => {
                    if !vm.backtrack() {
                        return outcomes;
                    }
                }
            }
        }
    }

    #[test]
    fn test_initial_state_has_root_choice() {
        let vm = vm(2, 1);
        assert_eq!(vm.state_id(), Some(0));
        let next = vm.system().next_choice_generator().unwrap();
        assert_eq!(vm.system().cg(next).unwrap().base().id(), reasons::ROOT);
        assert_eq!(vm.visited_states(), 1);
    }

    #[test]
    fn test_two_threads_explore_both_orders() {
        let mut vm = vm(2, 1);
        let outcomes = explore(&mut vm);
        assert_eq!(outcomes.len(), 4);
        assert_eq!(outcomes.iter().filter(|o| o.is_new).count(), 3);
        assert_eq!(outcomes.iter().filter(|o| o.is_end).count(), 2);
        assert_eq!(vm.depth(), 0);
    }

    #[test]
    fn test_yield_breaks_transition_and_reexecutes() {
        let mut vm = vm(2, 2);
        let first = vm.forward().unwrap().unwrap();
        assert_eq!(first.thread, ThreadId::new(0));
        assert_eq!(vm.core().pc(first.thread).unwrap(), 1);
        let next = vm.system().next_choice_generator().unwrap();
        assert_eq!(vm.system().cg(next).unwrap().base().id(), reasons::YIELD);

        let second = vm.forward().unwrap().unwrap();
        assert_eq!(second.thread, ThreadId::new(0));
        assert_eq!(vm.kernel().thread(second.thread).unwrap().status, ThreadStatus::Terminated);
    }

    #[test]
    fn test_backtrack_restores_pre_transition_kernel() {
        let mut vm = vm(2, 1);
        let before = vm.fingerprint();
        vm.forward().unwrap().unwrap();
        assert_ne!(vm.fingerprint(), before);
        assert!(vm.backtrack());
        assert_eq!(vm.fingerprint(), before);
        assert_eq!(vm.state_id(), Some(0));

        // the root choice continues with the other thread
        let o = vm.forward().unwrap().unwrap();
        assert_eq!(o.thread, ThreadId::new(1));
        assert!(vm.backtrack());
        assert!(vm.forward().unwrap().is_none());
        assert!(!vm.backtrack());
    }

    #[test]
    fn test_snapshot_restore_out_of_order() {
        let mut vm = vm(2, 2);
        vm.forward().unwrap().unwrap();
        let snap = vm.snapshot();
        let fp = vm.fingerprint();
        let first = vm.forward().unwrap().unwrap();

        vm.forward().unwrap();
        vm.restore(&snap);
        assert_eq!(vm.fingerprint(), fp);
        assert_eq!(vm.depth(), 0);
        let again = vm.forward().unwrap().unwrap();
        assert_eq!(again.thread, first.thread);
        assert_eq!(again.state_id, first.state_id);
    }

    #[test]
    fn test_replay_reproduces_state_ids() {
        let mut original = vm(2, 2);
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(original.forward().unwrap().unwrap().state_id);
        }
        let trace = original.choice_path();

        let mut replayed = vm(2, 2);
        let outcomes = replayed.replay(trace.clone()).unwrap();
        assert_eq!(outcomes.iter().map(|o| o.state_id).collect::<Vec<_>>(), ids);
        assert_eq!(replayed.fingerprint(), original.fingerprint());
        assert_eq!(replayed.choice_path(), trace);
    }

    #[test]
    fn test_empty_transition_is_forced_new() {
        #[derive(Debug)]
        struct EmptyFirst {
            inner: YieldEngine,
            pending: bool,
        }
        impl ExecutionEngine for EmptyFirst {
            fn initialize(&mut self, core: &mut VmCore) -> Result<(), EngineError> {
                self.inner.initialize(core)
            }
            fn step(&mut self, core: &mut VmCore, tid: ThreadId) -> Result<Step, EngineError> {
                if std::mem::take(&mut self.pending) {
                    core.enable_empty_transition(tid)?;
                    if core.with_scheduler(|s, cx| s.sets_yield_cg(cx, tid)) {
                        return Ok(Step::Reexecute);
                    }
                }
                self.inner.step(core, tid)
            }
        }

        let engine = EmptyFirst {
            inner: YieldEngine { threads: 2, steps: 1 },
            pending: true,
        };
        let mut vm = Vm::new(&VmConfig::default(), Arc::new(ClassRegistry::new()), engine).unwrap();
        vm.initialize().unwrap();
        let root = vm.fingerprint();

        let o = vm.forward().unwrap().unwrap();
        assert_eq!(vm.fingerprint(), root);
        assert_eq!(o.state_id, 0);
        assert!(o.is_new);
        assert_eq!(vm.core().pc(o.thread).unwrap(), 0);
        assert!(!vm.kernel().thread(o.thread).unwrap().empty_transition_enabled);
        let next = vm.system().next_choice_generator().unwrap();
        assert_eq!(vm.system().cg(next).unwrap().base().id(), reasons::YIELD);

        // without the override the re-executed first step runs normally
        let o = vm.forward().unwrap().unwrap();
        assert_eq!(o.thread, ThreadId::new(0));
        assert_eq!(vm.kernel().thread(o.thread).unwrap().status, ThreadStatus::Terminated);
    }

    #[test]
    fn test_allocation_gc_queue_is_finalized_then_released() {
        /// Drops one finalizable object, keeps a second one in a local,
        /// then yields and terminates.
        #[derive(Debug)]
        struct Allocator {
            class: Option<ClassId>,
            dropped: Option<ObjRef>,
        }
        impl ExecutionEngine for Allocator {
            fn initialize(&mut self, core: &mut VmCore) -> Result<(), EngineError> {
                let reg = Arc::clone(core.kernel.classes());
                self.class = Some(reg.define(ClassDef::new("Resource").finalizer()));
                let run = reg.define_method(self.class.unwrap(), "run", MethodFlags::default());
                for name in ["owner", "other"] {
                    let tid = core.kernel.threads.create(name, AppId::new(0));
                    core.kernel.start_thread(tid)?;
                    core.kernel.thread_mut(tid)?.frames.push(StackFrame::new(run));
                }
                Ok(())
            }

            fn step(&mut self, core: &mut VmCore, tid: ThreadId) -> Result<Step, EngineError> {
                let class = self.class.unwrap();
                let pc = core.pc(tid)?;
                if tid != ThreadId::new(0) || pc >= 3 {
                    core.kernel.terminate(tid)?;
                    core.system.activate_gc();
                    core.with_scheduler(|s, cx| s.sets_terminate_cg(cx, tid));
                    return Ok(Step::Exit);
                }
                match pc {
                    0 => self.dropped = Some(core.new_object(tid, class, 0)?),
                    1 => {
                        let kept = core.new_object(tid, class, 1)?;
                        if let Some(frame) = core.kernel.thread_mut(tid)?.top_frame_mut() {
                            frame.slots.push(Value::Ref(kept));
                        }
                    }
                    _ if !core.is_first_step() && core.with_scheduler(|s, cx| s.sets_yield_cg(cx, tid)) => {
                        return Ok(Step::Reexecute);
                    }
                    _ => {}
                }
                core.advance_pc(tid)?;
                Ok(Step::Continue)
            }
        }

        let mut config = VmConfig::default();
        config.transition.max_alloc_gc = Some(1);
        let engine = Allocator { class: None, dropped: None };
        let mut vm = Vm::new(&config, Arc::new(ClassRegistry::new()), engine).unwrap();
        vm.initialize().unwrap();

        // the second allocation collects and queues the dropped object
        let o = vm.forward().unwrap().unwrap();
        assert_eq!(o.thread, ThreadId::new(0));
        let dropped = vm.engine().dropped.unwrap();
        let ei = vm.kernel().heap.get(dropped).unwrap();
        assert!(ei.attrs.contains(ElementAttrs::FINALIZED));
        assert!(vm.kernel().heap.finalizer_queue().is_empty());

        let o = vm.forward().unwrap().unwrap();
        assert_eq!(vm.kernel().thread(o.thread).unwrap().status, ThreadStatus::Terminated);
        assert!(vm.kernel().heap.get(dropped).is_none());
    }

    #[test]
    fn test_reexecute_without_choice_is_fatal() {
        #[derive(Debug)]
        struct Broken;
        impl ExecutionEngine for Broken {
            fn initialize(&mut self, core: &mut VmCore) -> Result<(), EngineError> {
                let tid = core.kernel.threads.create("main", AppId::new(0));
                core.kernel.start_thread(tid)?;
                core.kernel.thread_mut(tid)?.frames.push(StackFrame::new(MethodId::new(0)));
                Ok(())
            }
            fn step(&mut self, _core: &mut VmCore, _tid: ThreadId) -> Result<Step, EngineError> {
                Ok(Step::Reexecute)
            }
        }
        let mut vm = Vm::new(&VmConfig::default(), Arc::new(ClassRegistry::new()), Broken).unwrap();
        vm.initialize().unwrap();
        assert!(matches!(vm.forward(), Err(EngineError::Execution { .. })));
    }
}
