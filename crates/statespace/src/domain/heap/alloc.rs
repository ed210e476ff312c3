//! Allocation Identity
//!
//! Assigns heap slots so that "the same" allocation on different search
//! paths lands in the same slot, which keeps references canonical and makes
//! states comparable.
//!
//! ```text
//!   context = f(class, thread, call chain, site)
//!   count   = per-path number of allocations with this context   (snapshotted)
//!   slot    = sgoids[(context, count)]  or  ++next_sgoid          (search-global)
//! ```
//!
//! # Variants
//!
//! - **Hashed**: the context is a one-at-a-time hash of its components. Fast
//!   and lossy. Two different contexts can collide; they then share one count
//!   sequence. Every `(context, count)` pair still maps to a fresh slot and a
//!   path never allocates the same pair twice, so slots stay unique within a
//!   state. A collision only makes slot numbers depend on the interleaving of
//!   the colliding allocation sites, i.e. it weakens cross-path canonicity.
//! - **Precise**: the context keeps every component. Exact, costlier to hash
//!   and compare.

use super::types::ObjRef;
use crate::domain::classes::{ClassId, MethodId};
use crate::domain::threads::{ThreadId, ThreadInfo};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Salt mixed into system allocations in place of a thread stack
const SYSTEM_SALT: u32 = 0x1404_0118;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// One-at-a-time hashing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Mix one component into a one-at-a-time hash
#[inline(always)]
pub const fn oat_mix(mut h: u32, k: u32) -> u32 {
    h = h.wrapping_add(k);
    h = h.wrapping_add(h << 10);
    h ^= h >> 6;
    h
}

/// Final avalanche of a one-at-a-time hash
#[inline(always)]
pub const fn oat_finalize(mut h: u32) -> u32 {
    h = h.wrapping_add(h << 3);
    h ^= h >> 11;
    h = h.wrapping_add(h << 15);
    h
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Contexts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Full allocation context kept by the precise variant
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PreciseContext {
    /// Allocated class
    pub class: ClassId,
    /// Allocating thread (none for system allocations)
    pub thread: Option<ThreadId>,
    /// `(method, pc, opcode)` per frame, innermost first
    pub call_chain: Vec<(MethodId, u32, u16)>,
    /// Anchor of a system allocation
    pub anchor: Option<u32>,
    /// Caller-supplied allocation site
    pub site: u32,
    /// Nested extensions `(class, anchor)`
    pub extensions: Vec<(ClassId, u32)>,
}

/// Allocation context
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AllocContext {
    /// Rolled-up hash
    Hashed(u32),
    /// All components
    Precise(Arc<PreciseContext>),
}

/// Which context variant a heap uses (`vm.heap.allocation`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStrategy {
    /// Collision-tolerant hash
    #[default]
    Hashed,
    /// Exact context
    Precise,
}

impl AllocationStrategy {
    /// Parse a config value
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hashed" => Some(Self::Hashed),
            "precise" => Some(Self::Precise),
            _ => None,
        }
    }

    /// Context of an allocation performed by a modeled thread
    pub fn sut_context(self, class: ClassId, thread: &ThreadInfo, site: u32) -> AllocContext {
        match self {
            Self::Hashed => {
                let mut h = oat_mix(0, class.0);
                h = oat_mix(h, thread.id.0);
                for frame in thread.frames.iter().rev() {
                    h = oat_mix(h, frame.method.0);
                    h = oat_mix(h, frame.pc);
                    h = oat_mix(h, u32::from(frame.opcode));
                }
                h = oat_mix(h, site);
                AllocContext::Hashed(oat_finalize(h))
            }
            Self::Precise => AllocContext::Precise(Arc::new(PreciseContext {
                class,
                thread: Some(thread.id),
                call_chain: thread
                    .frames
                    .iter()
                    .rev()
                    .map(|f| (f.method, f.pc, f.opcode))
                    .collect(),
                anchor: None,
                site,
                extensions: Vec::new(),
            })),
        }
    }

    /// Context of an allocation not attributable to a thread stack
    /// (class objects, interned constants, startup objects)
    pub fn system_context(self, class: ClassId, anchor: u32, site: u32) -> AllocContext {
        match self {
            Self::Hashed => {
                let mut h = oat_mix(0, class.0);
                h = oat_mix(h, SYSTEM_SALT);
                h = oat_mix(h, anchor);
                h = oat_mix(h, site);
                AllocContext::Hashed(oat_finalize(h))
            }
            Self::Precise => AllocContext::Precise(Arc::new(PreciseContext {
                class,
                thread: None,
                call_chain: Vec::new(),
                anchor: Some(anchor),
                site,
                extensions: Vec::new(),
            })),
        }
    }
}

impl AllocContext {
    /// Derive a context for a dependent allocation (e.g. the backing array of
    /// a string) from this one
    #[must_use]
    pub fn extend(&self, class: ClassId, anchor: u32) -> Self {
        match self {
            Self::Hashed(h) => {
                let mut x = oat_mix(*h, anchor);
                x = oat_mix(x, class.0);
                Self::Hashed(oat_finalize(x))
            }
            Self::Precise(ctx) => {
                let mut ext = (**ctx).clone();
                ext.extensions.push((class, anchor));
                Self::Precise(Arc::new(ext))
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Slot tables
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default)]
struct SgoidTable {
    slots: FxHashMap<(AllocContext, u32), u32>,
    next: u32,
}

/// Search-global `(context, count) -> slot` table.
///
/// Shared by every state of one run and never restored. Created per run,
/// cleared with [`SlotTable::reset`].
#[derive(Debug, Clone, Default)]
pub struct SlotTable {
    inner: Arc<Mutex<SgoidTable>>,
}

impl SlotTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot for the `count`-th allocation with `ctx`
    pub fn slot(&self, ctx: &AllocContext, count: u32) -> ObjRef {
        let mut table = self.inner.lock();
        if let Some(&slot) = table.slots.get(&(ctx.clone(), count)) {
            return ObjRef::new(slot);
        }
        table.next += 1;
        let slot = table.next;
        table.slots.insert((ctx.clone(), count), slot);
        ObjRef::new(slot)
    }

    /// Number of distinct allocations seen in this run
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// No allocation seen yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every allocation (end of run)
    pub fn reset(&self) {
        *self.inner.lock() = SgoidTable::default();
    }
}

/// Per-path allocation counters, shared with snapshots until modified
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocCounts(Arc<FxHashMap<AllocContext, u32>>);

impl AllocCounts {
    /// Increment and return the new count (first allocation is 1)
    pub fn next(&mut self, ctx: &AllocContext) -> u32 {
        let map = Arc::make_mut(&mut self.0);
        let cnt = map.entry(ctx.clone()).or_insert(0);
        *cnt += 1;
        *cnt
    }

    /// Current count for `ctx`
    pub fn get(&self, ctx: &AllocContext) -> u32 {
        self.0.get(ctx).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::classes::AppId;
    use crate::domain::threads::StackFrame;

    fn thread_at(pc: u32) -> ThreadInfo {
        let mut ti = ThreadInfo::new(ThreadId::new(1), "t", AppId::new(0));
        let mut frame = StackFrame::new(MethodId::new(3));
        frame.pc = pc;
        ti.frames.push(frame);
        ti
    }

    #[test]
    fn test_oat_hash_known_values() {
        assert_eq!(oat_mix(0, 0), 0);
        assert_eq!(oat_mix(0, 1), 1025 ^ (1025 >> 6));
        assert_eq!(oat_finalize(0), 0);
    }

    #[test]
    fn test_hashed_context_depends_on_call_site() {
        let s = AllocationStrategy::Hashed;
        let a = s.sut_context(ClassId::new(1), &thread_at(4), 0);
        let b = s.sut_context(ClassId::new(1), &thread_at(4), 0);
        let c = s.sut_context(ClassId::new(1), &thread_at(5), 0);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_precise_context_keeps_components() {
        let s = AllocationStrategy::Precise;
        let AllocContext::Precise(ctx) = s.sut_context(ClassId::new(2), &thread_at(9), 7) else {
            panic!("expected precise context");
        };
        assert_eq!(ctx.call_chain, vec![(MethodId::new(3), 9, 0)]);
        assert_eq!(ctx.thread, Some(ThreadId::new(1)));
        assert_eq!(ctx.site, 7);
    }

    #[test]
    fn test_extend_differs_from_base() {
        for s in [AllocationStrategy::Hashed, AllocationStrategy::Precise] {
            let base = s.system_context(ClassId::new(1), 0, 0);
            assert_ne!(base.extend(ClassId::new(2), 0), base);
            assert_eq!(base.extend(ClassId::new(2), 0), base.extend(ClassId::new(2), 0));
        }
    }

    #[test]
    fn test_slot_table_is_stable_across_paths() {
        let table = SlotTable::new();
        let ctx = AllocationStrategy::Hashed.system_context(ClassId::new(1), 0, 0);

        let mut path_a = AllocCounts::default();
        let first = table.slot(&ctx, path_a.next(&ctx));
        let second = table.slot(&ctx, path_a.next(&ctx));
        assert_eq!(first, ObjRef::new(1));
        assert_eq!(second, ObjRef::new(2));

        let mut path_b = AllocCounts::default();
        assert_eq!(table.slot(&ctx, path_b.next(&ctx)), first);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_counts_are_copy_on_write() {
        let ctx = AllocContext::Hashed(5);
        let mut counts = AllocCounts::default();
        counts.next(&ctx);
        let snapshot = counts.clone();
        counts.next(&ctx);
        assert_eq!(snapshot.get(&ctx), 1);
        assert_eq!(counts.get(&ctx), 2);
    }
}
