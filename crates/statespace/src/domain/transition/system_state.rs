//! Transition State
//!
//! [`SystemState`] owns every choice generator of the run and tracks which
//! one is current (selected the running transition) and which ones are
//! pending (registered during it).
//!
//! ```text
//!   forward:
//!     initialize_next_transition   next chain ──▶ cur, advance cascade
//!     set_exec_thread              thread of the latest scheduling point
//!     ... engine steps until break_transition() ...
//!
//!   advance order for a cascade  A ◀─ B ◀─ C (C current):
//!     fresh:      A, B, C                  (oldest first)
//!     C done:     B.next (or A.next, reset B, B.next), reset C, C.next
//! ```
//!
//! # Design Notes
//!
//! - Generators live in a [`CgArena`]; the state holds handles. Shallow
//!   mementos copy handles, deep ones detach the chain.
//! - Listeners are passed in rather than owned so their callbacks can take
//!   `&mut SystemState`.

use super::flags::TransitionFlags;
use super::listener::Listeners;
use super::memento::{CgSnapshot, Restorer, Restorers, SystemMemento};
use super::replay::{ChoicePoint, ReplayCursor};
use crate::domain::choice::{
    BreakGenerator, CgArena, CgHandle, ChoiceGenerator, ChoiceRandomizer, RandomizationPolicy,
    ThreadChoiceFromSet,
};
use crate::domain::classes::glob_match;
use crate::domain::error::EngineError;
use crate::domain::heap::GcStats;
use crate::domain::kernel::KernelState;
use crate::domain::snapshot::{Restorable, Restore, SnapshotKind};
use crate::domain::threads::ThreadId;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use tracing::{debug, error, info};

/// Transition engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitionConfig {
    /// Generator type or id patterns eligible for transition extension
    pub extend_transitions: Vec<String>,
    /// Shuffle generators on registration
    pub randomize_choices: RandomizationPolicy,
    /// Seed for `FixedSeed`
    pub seed: u64,
    /// Collect garbage between transitions
    pub gc: bool,
    /// Allocations after which a GC runs inside a transition
    pub max_alloc_gc: Option<u64>,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            extend_transitions: Vec::new(),
            randomize_choices: RandomizationPolicy::None,
            seed: 42,
            gc: true,
            max_alloc_gc: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct GcSchedule {
    enabled: bool,
    needed: bool,
    max_alloc: Option<u64>,
    allocated: u64,
}

/// Choice generators and per-transition bookkeeping of a run
#[derive(Debug)]
pub struct SystemState {
    cgs: CgArena,
    cur: Option<CgHandle>,
    next: Option<CgHandle>,
    atomic_level: u32,
    entry_atomic_level: u32,
    id: Option<u64>,
    exec_thread: Option<ThreadId>,
    current_insn: Option<u32>,
    restorers: Restorers,
    flags: TransitionFlags,
    first_step_insn: bool,
    n_advanced: usize,
    extend_patterns: Vec<String>,
    randomizer: ChoiceRandomizer,
    gc: GcSchedule,
    replay: Option<ReplayCursor>,
}

impl SystemState {
    /// Initial state: no generator, no id
    pub fn new(config: &TransitionConfig) -> Self {
        let randomizer = ChoiceRandomizer::new(config.randomize_choices, config.seed);
        if randomizer.is_active() {
            info!(policy = ?randomizer.policy(), seed = randomizer.seed(), "randomizing choice generators");
        }
        Self {
            cgs: CgArena::new(),
            cur: None,
            next: None,
            atomic_level: 0,
            entry_atomic_level: 0,
            id: None,
            exec_thread: None,
            current_insn: None,
            restorers: Restorers::default(),
            flags: TransitionFlags::empty(),
            first_step_insn: false,
            n_advanced: 0,
            extend_patterns: config.extend_transitions.clone(),
            randomizer,
            gc: GcSchedule {
                enabled: config.gc,
                needed: false,
                max_alloc: config.max_alloc_gc,
                allocated: 0,
            },
            replay: None,
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Accessors
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Generator storage
    pub const fn cgs(&self) -> &CgArena {
        &self.cgs
    }

    /// Generator behind `h`
    pub fn cg(&self, h: CgHandle) -> Option<&dyn ChoiceGenerator> {
        self.cgs.get(h)
    }

    /// Modifiable generator behind `h`
    pub fn cg_mut(&mut self, h: CgHandle) -> Option<&mut (dyn ChoiceGenerator + 'static)> {
        self.cgs.get_mut(h)
    }

    /// Generator that selected the running transition
    pub const fn current_choice_generator(&self) -> Option<CgHandle> {
        self.cur
    }

    /// Newest generator registered in the running transition
    pub const fn next_choice_generator(&self) -> Option<CgHandle> {
        self.next
    }

    /// State id, `None` before the first state was stored
    pub const fn id(&self) -> Option<u64> {
        self.id
    }

    /// Set the state id and propagate it to the pending cascade
    pub fn set_id(&mut self, id: u64) {
        self.id = Some(id);
        if let Some(next) = self.next {
            for h in self.cgs.cascade(next) {
                if let Some(cg) = self.cgs.get_mut(h) {
                    cg.base_mut().set_state_id(Some(id));
                }
            }
        }
    }

    /// Thread executing the running transition
    pub const fn exec_thread(&self) -> Option<ThreadId> {
        self.exec_thread
    }

    pub(crate) fn set_current_insn(&mut self, insn: Option<u32>) {
        self.current_insn = insn;
    }

    /// The instruction being executed is the first of its transition
    pub const fn is_first_step_insn(&self) -> bool {
        self.first_step_insn
    }

    pub(crate) fn set_first_step_insn(&mut self, first: bool) {
        self.first_step_insn = first;
    }

    /// Run-scoped random source
    pub fn randomizer(&mut self) -> &mut ChoiceRandomizer {
        &mut self.randomizer
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Atomic sections
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Inside an atomic section
    pub const fn is_atomic(&self) -> bool {
        self.atomic_level > 0
    }

    /// Current nesting
    pub const fn atomic_level(&self) -> u32 {
        self.atomic_level
    }

    /// Nesting when the running transition started
    pub const fn entry_atomic_level(&self) -> u32 {
        self.entry_atomic_level
    }

    /// Enter an atomic section
    pub fn inc_atomic(&mut self) {
        self.atomic_level += 1;
    }

    /// Leave an atomic section
    pub fn dec_atomic(&mut self) {
        self.atomic_level = self.atomic_level.saturating_sub(1);
    }

    /// Leave every atomic section (e.g. the thread terminated inside one)
    pub fn clear_atomic(&mut self) {
        self.atomic_level = 0;
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Flags
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// All flags
    pub const fn flags(&self) -> TransitionFlags {
        self.flags
    }

    /// The transition is reverted and its state not explored
    pub const fn is_ignored(&self) -> bool {
        self.flags.contains(TransitionFlags::IGNORED)
    }

    /// Mark the transition ignored (clears forced)
    pub fn set_ignored(&mut self, ignored: bool) {
        self.flags
            .set_exclusive(TransitionFlags::IGNORED, TransitionFlags::FORCED, ignored);
    }

    /// The resulting state counts as new
    pub const fn is_forced(&self) -> bool {
        self.flags.contains(TransitionFlags::FORCED)
    }

    /// Mark the resulting state new (clears ignored)
    pub fn set_forced(&mut self, forced: bool) {
        self.flags
            .set_exclusive(TransitionFlags::FORCED, TransitionFlags::IGNORED, forced);
    }

    /// Heuristic hint: explore first
    pub const fn is_interesting(&self) -> bool {
        self.flags.contains(TransitionFlags::INTERESTING)
    }

    /// Set the interesting hint (clears boring)
    pub fn set_interesting(&mut self, on: bool) {
        self.flags
            .set_exclusive(TransitionFlags::INTERESTING, TransitionFlags::BORING, on);
    }

    /// Heuristic hint: explore last
    pub const fn is_boring(&self) -> bool {
        self.flags.contains(TransitionFlags::BORING)
    }

    /// Set the boring hint (clears interesting)
    pub fn set_boring(&mut self, on: bool) {
        self.flags
            .set_exclusive(TransitionFlags::BORING, TransitionFlags::INTERESTING, on);
    }

    /// Keep the flags into the next transition
    pub fn retain_attributes(&mut self, retain: bool) {
        self.flags.set(TransitionFlags::RETAIN_ATTRIBUTES, retain);
    }

    /// A blocking operation was hit inside an atomic section
    pub const fn is_blocked_in_atomic(&self) -> bool {
        self.flags.contains(TransitionFlags::BLOCKED_IN_ATOMIC)
    }

    /// Record a blocking operation inside an atomic section
    pub fn set_blocked_in_atomic(&mut self) {
        self.flags.insert(TransitionFlags::BLOCKED_IN_ATOMIC);
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Restorers
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Register a callback run when the search returns to the state this
    /// transition produces. Returns `true` if it replaced one with the same
    /// key.
    pub fn put_restorer(&mut self, key: impl Into<std::sync::Arc<str>>, restorer: Restorer) -> bool {
        self.restorers.insert(key, restorer)
    }

    /// A restorer for `key` is registered in this transition
    pub fn has_restorer(&self, key: &str) -> bool {
        self.restorers.contains(key)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Registration
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Register `cg` as the next generator. A generator registered while
    /// another one is pending cascades the pending one.
    ///
    /// Returns `false` if the transition is ignored or a listener removed
    /// every pending generator.
    pub fn set_next_choice_generator(
        &mut self,
        mut cg: Box<dyn ChoiceGenerator>,
        listeners: &mut Listeners,
    ) -> bool {
        if self.is_ignored() {
            return false;
        }
        if self.randomizer.is_active() {
            cg.randomize(self.randomizer.rng());
        }
        cg.base_mut().set_context(self.exec_thread, self.current_insn);

        let prev = match self.next {
            Some(pending) => {
                if let Some(p) = self.cgs.get_mut(pending) {
                    p.base_mut().set_cascaded(true);
                }
                Some(pending)
            }
            None => self.cur,
        };
        cg.base_mut().set_prev(prev);

        let h = self.cgs.insert(cg);
        self.next = Some(h);
        if let Some(cg) = self.cgs.get(h) {
            debug!(
                cg = %cg,
                thread = ?self.exec_thread,
                global = cg.base().is_global(),
                "registered choice generator"
            );
        }
        listeners.cg_registered(self, h);
        self.next.is_some()
    }

    /// Like [`Self::set_next_choice_generator`], but refusal is fatal
    pub fn set_mandatory_next_choice_generator(
        &mut self,
        cg: Box<dyn ChoiceGenerator>,
        listeners: &mut Listeners,
        msg: &str,
    ) -> Result<(), EngineError> {
        if self.set_next_choice_generator(cg, listeners) {
            Ok(())
        } else {
            error!(msg, "mandatory choice generator refused");
            Err(EngineError::MandatoryChoiceRefused(msg.to_string()))
        }
    }

    /// Drop the newest pending generator. The one before it, if it was
    /// registered in the same transition, becomes the pending one again.
    pub fn remove_next_choice_generator(&mut self) -> bool {
        let Some(next) = self.next else {
            return false;
        };
        self.next = match self.cgs.prev(next) {
            Some(p) if Some(p) != self.cur => {
                if let Some(cg) = self.cgs.get_mut(p) {
                    cg.base_mut().set_cascaded(false);
                }
                Some(p)
            }
            _ => None,
        };
        true
    }

    /// Drop every pending generator
    pub fn remove_all_next_choice_generators(&mut self) {
        while self.remove_next_choice_generator() {}
    }

    /// The executing instruction must end the transition
    pub const fn break_transition(&self) -> bool {
        self.next.is_some() || self.is_ignored()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Queries
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Newest scheduling point on the current path
    pub fn current_scheduling_point(&self) -> Option<CgHandle> {
        let cur = self.cur?;
        self.cgs.last_matching(cur, |cg| cg.is_scheduling_point())
    }

    /// Every generator of the current path, oldest first
    pub fn choice_generators(&self) -> Vec<CgHandle> {
        self.cur.map(|c| self.cgs.all(c)).unwrap_or_default()
    }

    /// Newest generator on the current path with registration id `id`
    pub fn choice_generator_by_id(&self, id: &str) -> Option<CgHandle> {
        let cur = self.cur?;
        self.cgs.last_matching(cur, |cg| cg.base().id() == id)
    }

    /// Newest generator of type `T` on the current path
    pub fn last_choice_generator_of_type<T: ChoiceGenerator>(&self) -> Option<CgHandle> {
        self.cgs.last_of_type::<T>(self.cur?)
    }

    /// Generator of type `T` within the current cascade
    pub fn current_choice_generator_of_type<T: ChoiceGenerator>(&self) -> Option<CgHandle> {
        self.cgs.cascade_of_type::<T>(self.cur?).last().copied()
    }

    /// Recorded choices of the current path, oldest first
    pub fn choice_path(&self) -> Vec<ChoicePoint> {
        self.choice_generators()
            .into_iter()
            .filter_map(|h| self.cgs.get(h).and_then(|cg| ChoicePoint::of(cg)))
            .collect()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Transitions
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Make the pending generators current and advance to the next choice.
    ///
    /// Returns `Ok(false)` if nothing could be advanced: the current path is
    /// exhausted and the search has to backtrack.
    pub fn initialize_next_transition(&mut self, listeners: &mut Listeners) -> Result<bool, EngineError> {
        if !self.flags.contains(TransitionFlags::RETAIN_ATTRIBUTES) {
            self.flags.remove(TransitionFlags::TRANSIENT);
        }
        self.restorers = Restorers::default();

        while let Some(next) = self.next.take() {
            self.cur = Some(next);
            self.cgs.try_get_mut(next)?.set_current();
            for h in self.cgs.cascade(next) {
                listeners.cg_set(self, h);
            }
        }

        let Some(cur) = self.cur else {
            error!("no choice generator for new transition");
            return Err(EngineError::NoChoiceGenerator);
        };
        self.advance_cur_cg(cur, listeners)
    }

    fn advance_cur_cg(&mut self, cur: CgHandle, listeners: &mut Listeners) -> Result<bool, EngineError> {
        self.n_advanced = 0;
        let parent = self.cgs.cascaded_parent(cur);

        if self.cgs.try_get(cur)?.has_more_choices() {
            // freshly registered cascade: parents get their first choice
            if let Some(p) = parent {
                if self.cgs.try_get(p)?.processed_choices() == 0 {
                    for h in self.cgs.cascade(p) {
                        self.advance(h, listeners)?;
                    }
                }
            }
            self.advance(cur, listeners)?;
        } else {
            listeners.cg_processed(self, cur);
            if let Some(p) = parent {
                if self.advance_cascaded_parent(p, listeners)? {
                    self.cgs.try_get_mut(cur)?.reset();
                    self.advance(cur, listeners)?;
                }
            }
        }
        Ok(self.n_advanced > 0)
    }

    fn advance_cascaded_parent(&mut self, h: CgHandle, listeners: &mut Listeners) -> Result<bool, EngineError> {
        if self.cgs.try_get(h)?.has_more_choices() {
            self.advance(h, listeners)?;
            return Ok(true);
        }
        listeners.cg_processed(self, h);
        if let Some(parent) = self.cgs.cascaded_parent(h) {
            if self.advance_cascaded_parent(parent, listeners)? {
                self.cgs.try_get_mut(h)?.reset();
                self.advance(h, listeners)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Advance `h` to its next choice that no listener ignores
    fn advance(&mut self, h: CgHandle, listeners: &mut Listeners) -> Result<(), EngineError> {
        loop {
            if !self.cgs.try_get(h)?.has_more_choices() {
                listeners.cg_processed(self, h);
                return Ok(());
            }
            self.advance_one(h)?;
            self.flags.remove(TransitionFlags::IGNORED);
            listeners.cg_advanced(self, h);
            if !self.is_ignored() {
                let cg = self.cgs.try_get(h)?;
                if cg.next_choice().is_some() {
                    self.n_advanced += 1;
                }
                debug!(cg = %cg, "advanced choice generator");
                return Ok(());
            }
        }
    }

    fn advance_one(&mut self, h: CgHandle) -> Result<(), EngineError> {
        let cg = self.cgs.try_get_mut(h)?;
        if let Some(replay) = self.replay.as_mut() {
            if replay.apply(cg)? {
                return Ok(());
            }
        }
        cg.advance();
        Ok(())
    }

    /// Pick the executor from the newest scheduling point, time out a
    /// timeout-waiting executor and remember the atomic level at entry.
    pub fn set_exec_thread(
        &mut self,
        kernel: &mut KernelState,
        listeners: &mut Listeners,
    ) -> Result<ThreadId, EngineError> {
        if let Some(sp) = self.current_scheduling_point() {
            if let Some(tid) = self.cgs.try_get(sp)?.next_thread() {
                if self.exec_thread != Some(tid) {
                    debug!(thread = %tid, "thread scheduled");
                    listeners.thread_scheduled(tid);
                    self.exec_thread = Some(tid);
                }
            }
        }
        let tid = self.exec_thread.ok_or(EngineError::NoExecThread)?;

        if kernel.thread(tid)?.is_timeout_waiting() {
            kernel.time_out(tid)?;
        }
        let ti = kernel.thread(tid)?;
        if !ti.is_runnable() {
            error!(thread = %tid, status = %ti.status, "transition thread not runnable");
            return Err(EngineError::Execution {
                thread: tid,
                message: format!("next transition thread not runnable: {}", ti.status),
            });
        }
        self.entry_atomic_level = self.atomic_level;
        Ok(tid)
    }

    /// Continue the running transition through a pending generator that
    /// cannot change the outcome: marked extendable (or matching
    /// `vm.extend_transitions`), a single choice, no cascade, and, for a
    /// thread choice, keeping the current executor.
    pub fn extend_transition(&mut self, listeners: &mut Listeners) -> Result<bool, EngineError> {
        let Some(next) = self.next else {
            return Ok(false);
        };
        let cg = self.cgs.try_get(next)?;
        let marked = cg.base().is_extendable()
            || self
                .extend_patterns
                .iter()
                .any(|p| glob_match(p, cg.type_name()) || glob_match(p, cg.base().id()));
        if !marked || cg.total_choices() != 1 || self.cgs.cascaded_parent(next).is_some() {
            return Ok(false);
        }
        if cg.is::<BreakGenerator>() {
            return Ok(false);
        }
        if let Some(tcg) = cg.downcast_ref::<ThreadChoiceFromSet>() {
            if tcg.is_scheduling_point() && !self.exec_thread.is_some_and(|t| tcg.contains(t)) {
                return Ok(false);
            }
        }
        debug!(cg = %cg, "extending transition");
        self.initialize_next_transition(listeners)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Garbage collection scheduling
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Request a GC at the next opportunity
    pub fn activate_gc(&mut self) {
        self.gc.needed = true;
    }

    /// A GC was requested
    pub const fn is_gc_needed(&self) -> bool {
        self.gc.needed
    }

    /// Count an allocation and collect once `vm.max_alloc_gc` is exceeded
    pub fn check_gc(&mut self, kernel: &mut KernelState, listeners: &mut Listeners) -> Option<GcStats> {
        self.gc.allocated += 1;
        match self.gc.max_alloc {
            Some(max) if self.gc.allocated > max => {
                self.activate_gc();
                self.gc_if_needed(kernel, listeners)
            }
            _ => None,
        }
    }

    /// Collect if requested and enabled
    pub fn gc_if_needed(&mut self, kernel: &mut KernelState, listeners: &mut Listeners) -> Option<GcStats> {
        self.gc.allocated = 0;
        if !(self.gc.enabled && self.gc.needed) {
            return None;
        }
        self.gc.needed = false;
        listeners.gc_begin();
        let stats = kernel.gc();
        listeners.gc(&stats);
        info!(
            marked = stats.marked,
            released = stats.released.len(),
            finalizable = stats.queued_for_finalization,
            "gc cycle"
        );
        Some(stats)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Replay
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Force the following advances to the recorded choices
    pub fn start_replay(&mut self, points: Vec<ChoicePoint>) {
        info!(choices = points.len(), "replaying choice trace");
        self.replay = Some(ReplayCursor::new(points));
    }

    /// Active replay
    pub const fn replay(&self) -> Option<&ReplayCursor> {
        self.replay.as_ref()
    }

    /// Back to regular enumeration
    pub fn stop_replay(&mut self) -> Option<ReplayCursor> {
        self.replay.take()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Snapshots
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Capture the transition state
    pub fn memento<K: SnapshotKind>(&self) -> SystemMemento<K> {
        let cgs = if K::DEEP {
            let chain = self
                .next
                .or(self.cur)
                .map(|top| self.cgs.detach(top))
                .unwrap_or_default();
            CgSnapshot::Detached {
                chain,
                cur_len: self.cur.map_or(0, |c| self.cgs.all(c).len()),
                has_next: self.next.is_some(),
            }
        } else {
            CgSnapshot::Shared {
                cur: self.cur,
                next: self.next,
            }
        };
        SystemMemento {
            cgs,
            entry_atomic_level: self.entry_atomic_level,
            id: self.id,
            exec_thread: self.exec_thread,
            restorers: self.restorers.clone(),
            kind: PhantomData,
        }
    }

    /// Return to the state after the captured transition so that the next
    /// [`Self::initialize_next_transition`] tries the current generator's
    /// next choice. Pending generators are dropped.
    pub fn backtrack<K: SnapshotKind>(&mut self, m: &SystemMemento<K>) {
        self.next = None;
        self.cur = match &m.cgs {
            CgSnapshot::Shared { cur, .. } => *cur,
            CgSnapshot::Detached { chain, cur_len, .. } => {
                self.cgs.attach_prefix(chain, *cur_len).last().copied()
            }
        };
        self.restore_common(m);
        debug!(kind = K::NAME, id = ?self.id, "backtracked transition state");
    }

    fn restore_common<K: SnapshotKind>(&mut self, m: &SystemMemento<K>) {
        self.atomic_level = m.entry_atomic_level;
        self.entry_atomic_level = m.entry_atomic_level;
        self.id = m.id;
        self.exec_thread = m.exec_thread;
        m.restorers.replay();
        self.restorers = Restorers::default();
    }

    /// Free generators unreachable from the live state and `snapshots`
    pub fn collect_choice_generators(&mut self, snapshots: impl IntoIterator<Item = CgHandle>) -> usize {
        let roots = self.cur.into_iter().chain(self.next).chain(snapshots);
        self.cgs.collect(roots)
    }
}

impl Restorable for SystemState {
    type Memento = SystemMemento<Restore>;

    fn memento(&self) -> Self::Memento {
        Self::memento::<Restore>(self)
    }

    /// Reinstate both the current and the pending generators as fresh
    /// copies, independent of traversal order.
    fn restore(&mut self, m: &Self::Memento) {
        match &m.cgs {
            CgSnapshot::Shared { cur, next } => {
                self.cur = *cur;
                self.next = *next;
            }
            CgSnapshot::Detached {
                chain,
                cur_len,
                has_next,
            } => {
                let handles = self.cgs.attach(chain);
                self.cur = cur_len.checked_sub(1).and_then(|i| handles.get(i).copied());
                self.next = if *has_next { handles.last().copied() } else { None };
            }
        }
        self.restore_common(m);
        debug!(id = ?self.id, "restored transition state");
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new(&TransitionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::choice::{BooleanChoiceGenerator, ChoiceValue};
    use crate::domain::snapshot::Backtrack;
    use crate::domain::transition::VmListener;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn tids(ids: &[u32]) -> Vec<ThreadId> {
        ids.iter().map(|i| ThreadId::new(*i)).collect()
    }

    fn thread_cg(id: &str, ids: &[u32]) -> Box<dyn ChoiceGenerator> {
        Box::new(ThreadChoiceFromSet::new(id, &tids(ids), true))
    }

    fn choices(ss: &SystemState) -> Vec<Option<ChoiceValue>> {
        ss.choice_generators()
            .into_iter()
            .map(|h| ss.cg(h).and_then(|cg| cg.next_choice()))
            .collect()
    }

    /// Enumerates every transition leaving the state with the given
    /// pending cascade, depth one, backtracking after each.
    fn enumerate(ss: &mut SystemState, l: &mut Listeners) -> Vec<Vec<Option<ChoiceValue>>> {
        let mut out = Vec::new();
        while ss.initialize_next_transition(l).unwrap() {
            out.push(choices(ss));
            let m = ss.memento::<Backtrack>();
            ss.backtrack(&m);
        }
        out
    }

    #[test]
    fn test_three_cascaded_thread_choices_yield_two_transitions() {
        let mut ss = SystemState::default();
        let mut l = Listeners::new();
        assert!(ss.set_next_choice_generator(thread_cg("A", &[1, 2]), &mut l));
        assert!(ss.set_next_choice_generator(thread_cg("B", &[1]), &mut l));
        assert!(ss.set_next_choice_generator(thread_cg("C", &[3]), &mut l));

        let next = ss.next_choice_generator().unwrap();
        let cascade = ss.cgs().cascade(next);
        let flags: Vec<bool> = cascade
            .iter()
            .map(|h| ss.cg(*h).unwrap().base().is_cascaded())
            .collect();
        assert_eq!(flags, vec![true, true, false]);

        let seen = enumerate(&mut ss, &mut l);
        let t = |i| Some(ChoiceValue::Thread(ThreadId::new(i)));
        assert_eq!(seen, vec![vec![t(1), t(1), t(3)], vec![t(2), t(1), t(3)]]);
    }

    #[test]
    fn test_no_generator_is_an_error() {
        let mut ss = SystemState::default();
        let err = ss.initialize_next_transition(&mut Listeners::new()).unwrap_err();
        assert!(matches!(err, EngineError::NoChoiceGenerator));
    }

    #[test]
    fn test_ignored_transition_refuses_registration() {
        let mut ss = SystemState::default();
        let mut l = Listeners::new();
        ss.set_ignored(true);
        assert!(!ss.set_next_choice_generator(thread_cg("X", &[1]), &mut l));
        let err = ss
            .set_mandatory_next_choice_generator(thread_cg("ROOT", &[1]), &mut l, "no root")
            .unwrap_err();
        assert!(matches!(err, EngineError::MandatoryChoiceRefused(m) if m == "no root"));
    }

    #[test]
    fn test_remove_next_uncascades_previous() {
        let mut ss = SystemState::default();
        let mut l = Listeners::new();
        ss.set_next_choice_generator(thread_cg("A", &[1]), &mut l);
        let a = ss.next_choice_generator().unwrap();
        ss.set_next_choice_generator(thread_cg("B", &[2]), &mut l);
        assert!(ss.cg(a).unwrap().base().is_cascaded());

        assert!(ss.remove_next_choice_generator());
        assert_eq!(ss.next_choice_generator(), Some(a));
        assert!(!ss.cg(a).unwrap().base().is_cascaded());

        ss.remove_all_next_choice_generators();
        assert!(!ss.break_transition());
    }

    struct SkipFirst {
        skipped: bool,
    }

    impl VmListener for SkipFirst {
        fn choice_generator_advanced(&mut self, state: &mut SystemState, _cg: CgHandle) {
            if !self.skipped {
                self.skipped = true;
                state.set_ignored(true);
            }
        }
    }

    #[test]
    fn test_listener_can_veto_a_choice() {
        let mut ss = SystemState::default();
        let mut l = Listeners::new();
        l.add(Box::new(SkipFirst { skipped: false }));
        ss.set_next_choice_generator(thread_cg("ROOT", &[1, 2]), &mut l);
        assert!(ss.initialize_next_transition(&mut l).unwrap());
        let cur = ss.current_choice_generator().unwrap();
        assert_eq!(ss.cg(cur).unwrap().next_thread(), Some(ThreadId::new(2)));
        assert!(!ss.is_ignored());
    }

    #[test]
    fn test_restorers_replay_on_backtrack() {
        let mut ss = SystemState::default();
        let mut l = Listeners::new();
        let counter = Arc::new(Mutex::new(0));
        ss.set_next_choice_generator(thread_cg("ROOT", &[1, 2]), &mut l);
        ss.initialize_next_transition(&mut l).unwrap();

        let c = Arc::clone(&counter);
        assert!(!ss.put_restorer("count", Arc::new(move || *c.lock() += 1)));
        let m = ss.memento::<Backtrack>();
        ss.backtrack(&m);
        ss.backtrack(&m);
        assert_eq!(*counter.lock(), 2);
        assert!(!ss.has_restorer("count"));
    }

    #[test]
    fn test_deep_memento_survives_generator_mutation() {
        let mut ss = SystemState::default();
        let mut l = Listeners::new();
        ss.set_next_choice_generator(thread_cg("ROOT", &[1, 2, 3]), &mut l);
        ss.initialize_next_transition(&mut l).unwrap();
        ss.set_next_choice_generator(Box::new(BooleanChoiceGenerator::new("B")), &mut l);
        let deep = Restorable::memento(&ss);

        // exhaust the live root generator
        let root = ss.current_choice_generator().unwrap();
        ss.cg_mut(root).unwrap().advance_by(5);

        ss.restore(&deep);
        let cur = ss.current_choice_generator().unwrap();
        assert_ne!(cur, root);
        assert_eq!(ss.cg(cur).unwrap().processed_choices(), 1);
        let next = ss.next_choice_generator().unwrap();
        assert_eq!(ss.cgs().prev(next), Some(cur));

        // backtrack from the deep memento resumes enumeration of the copy
        ss.backtrack(&deep);
        assert!(ss.initialize_next_transition(&mut l).unwrap());
        let cur = ss.current_choice_generator().unwrap();
        assert_eq!(ss.cg(cur).unwrap().next_thread(), Some(ThreadId::new(2)));
    }

    #[test]
    fn test_state_id_propagates_to_pending_cascade() {
        let mut ss = SystemState::default();
        let mut l = Listeners::new();
        ss.set_next_choice_generator(thread_cg("A", &[1]), &mut l);
        ss.set_next_choice_generator(thread_cg("B", &[1]), &mut l);
        ss.set_id(7);
        let next = ss.next_choice_generator().unwrap();
        for h in ss.cgs().cascade(next) {
            assert_eq!(ss.cg(h).unwrap().base().state_id(), Some(7));
        }
    }

    #[test]
    fn test_extend_transition_only_for_marked_single_choice() {
        let config = TransitionConfig {
            extend_transitions: vec!["Boolean*".into()],
            ..TransitionConfig::default()
        };
        let mut ss = SystemState::new(&config);
        let mut l = Listeners::new();
        ss.set_next_choice_generator(thread_cg("ROOT", &[1]), &mut l);
        ss.initialize_next_transition(&mut l).unwrap();

        ss.set_next_choice_generator(Box::new(BooleanChoiceGenerator::new("B")), &mut l);
        assert!(!ss.extend_transition(&mut l).unwrap(), "two choices never extend");
        ss.remove_next_choice_generator();

        let mut single: Box<dyn ChoiceGenerator> =
            Box::new(ThreadChoiceFromSet::new("YIELD", &tids(&[1]), false));
        single.base_mut().set_extendable(true);
        ss.set_next_choice_generator(single, &mut l);
        assert!(ss.extend_transition(&mut l).unwrap());
        assert!(ss.next_choice_generator().is_none());
        assert_eq!(
            ss.cg(ss.current_choice_generator().unwrap()).unwrap().base().id(),
            "YIELD"
        );
    }

    #[test]
    fn test_collect_keeps_snapshot_roots() {
        let mut ss = SystemState::default();
        let mut l = Listeners::new();
        ss.set_next_choice_generator(thread_cg("ROOT", &[1, 2]), &mut l);
        ss.initialize_next_transition(&mut l).unwrap();
        let m = ss.memento::<Backtrack>();
        ss.set_next_choice_generator(thread_cg("A", &[1]), &mut l);
        ss.remove_all_next_choice_generators();
        assert_eq!(ss.collect_choice_generators(m.handles()), 1);
        assert_eq!(ss.cgs().len(), 1);
    }

    #[test]
    fn test_choice_path_and_queries() {
        let mut ss = SystemState::default();
        let mut l = Listeners::new();
        ss.set_next_choice_generator(thread_cg("ROOT", &[1, 2]), &mut l);
        ss.initialize_next_transition(&mut l).unwrap();
        ss.set_next_choice_generator(Box::new(BooleanChoiceGenerator::new("flag")), &mut l);
        ss.initialize_next_transition(&mut l).unwrap();

        let path = ss.choice_path();
        assert_eq!(path.len(), 2);
        assert_eq!(&*path[0].cg_type, "ThreadChoiceFromSet");
        assert_eq!(path[1].choice, 0);

        assert!(ss.choice_generator_by_id("ROOT").is_some());
        assert!(ss.last_choice_generator_of_type::<ThreadChoiceFromSet>().is_some());
        assert!(ss.current_choice_generator_of_type::<ThreadChoiceFromSet>().is_none());
        assert_eq!(
            ss.current_scheduling_point(),
            ss.choice_generator_by_id("ROOT")
        );
    }
}
