//! Mark-Sweep Garbage Collection
//!
//! ```text
//!   1. toggle live value
//!   2. mark      pinned ∪ roots ∪ finalizer queue       (iterative worklist)
//!   3. rescue    unmarked objects with a pending finalizer are queued and
//!                marked, together with everything they reach
//!   4. sweep     every other unmarked object is released
//!   5. weak refs referents that died are cleared
//!   6. cleanup   dead candidate locks are dropped from lock infos
//! ```
//!
//! GC only runs between transitions, never observably inside one.

use super::store::Heap;
use super::types::{ObjRef, Value};
use rustc_hash::FxHashSet;
use std::sync::Arc;
use tracing::{debug, trace};

/// Provider of the root set outside the heap
pub trait GcRoots {
    /// Call `f` for every root reference
    fn for_each_root(&self, f: &mut dyn FnMut(ObjRef));
}

impl GcRoots for &[ObjRef] {
    fn for_each_root(&self, f: &mut dyn FnMut(ObjRef)) {
        for r in self.iter() {
            f(*r);
        }
    }
}

/// Result of one GC cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Objects found reachable
    pub marked: usize,
    /// Released objects, slot order
    pub released: Vec<ObjRef>,
    /// Objects newly queued for finalization
    pub queued_for_finalization: usize,
    /// Weak referents cleared
    pub weak_cleared: usize,
}

impl Heap {
    fn mark_from(&mut self, work: &mut Vec<ObjRef>) -> usize {
        let mut marked = 0;
        while let Some(obj) = work.pop() {
            marked += 1;
            let Some(ei) = self.elements.get(obj.as_usize()) else {
                continue;
            };
            for child in ei.traced_refs() {
                if self.elements.contains(child.as_usize()) && self.live.test_and_mark(child.as_usize()) {
                    work.push(child);
                }
            }
        }
        marked
    }

    fn seed(&mut self, obj: ObjRef, work: &mut Vec<ObjRef>) {
        if self.elements.contains(obj.as_usize()) && self.live.test_and_mark(obj.as_usize()) {
            work.push(obj);
        }
    }

    /// Run one mark-sweep cycle
    pub fn gc(&mut self, roots: &dyn GcRoots) -> GcStats {
        let mut stats = GcStats::default();

        if self.live_stale {
            let indices = self.elements.indices();
            self.live.normalize(indices);
            self.live_stale = false;
        }
        self.live.toggle();

        let mut work = Vec::new();
        let pinned: Vec<ObjRef> = self
            .iter()
            .filter(|(_, ei)| ei.is_pinned())
            .map(|(r, _)| r)
            .collect();
        for obj in pinned {
            self.seed(obj, &mut work);
        }
        let mut root_refs = Vec::new();
        roots.for_each_root(&mut |r| root_refs.push(r));
        for obj in root_refs {
            self.seed(obj, &mut work);
        }
        let queued: Vec<ObjRef> = self.finalizer_queue.to_vec();
        for obj in queued {
            self.seed(obj, &mut work);
        }
        stats.marked = self.mark_from(&mut work);

        let finalizable: Vec<ObjRef> = self
            .iter()
            .filter(|(r, ei)| !self.live.is_live(r.as_usize()) && ei.needs_finalization())
            .map(|(r, _)| r)
            .collect();
        if !finalizable.is_empty() {
            let queue = Arc::make_mut(&mut self.finalizer_queue);
            for obj in &finalizable {
                if !queue.contains(obj) {
                    queue.push(*obj);
                }
            }
            stats.queued_for_finalization = finalizable.len();
            for obj in finalizable {
                self.seed(obj, &mut work);
            }
            stats.marked += self.mark_from(&mut work);
        }

        for idx in self.elements.indices() {
            if !self.live.is_live(idx) {
                self.elements.remove(idx);
                trace!("released @{idx}");
                stats.released.push(ObjRef::new(idx as u32));
            }
        }

        if !self.weak_refs.is_empty() {
            let mut kept = Vec::with_capacity(self.weak_refs.len());
            for &w in self.weak_refs.iter() {
                let Some(ei) = self.elements.get(w.as_usize()) else {
                    continue;
                };
                kept.push(w);
                let Some(field) = ei.weak_field else {
                    continue;
                };
                let dead = ei
                    .field(field)
                    .and_then(|v| v.as_obj())
                    .is_some_and(|referent| !self.elements.contains(referent.as_usize()));
                if dead {
                    if let Some(ei) = self.elements.get_mut(w.as_usize()) {
                        ei.set_field(field, Value::Null);
                        stats.weak_cleared += 1;
                    }
                }
            }
            if kept.len() != self.weak_refs.len() {
                self.weak_refs = Arc::new(kept);
            }
        }

        let dead_locks: FxHashSet<ObjRef> = self
            .elements
            .iter()
            .flat_map(|(_, ei)| ei.lock_infos.iter().flat_map(|(_, fli)| fli.locks().iter().copied()))
            .filter(|l| !self.elements.contains(l.as_usize()))
            .collect();
        if !dead_locks.is_empty() {
            let holders: Vec<usize> = self
                .elements
                .iter()
                .filter(|(_, ei)| {
                    ei.lock_infos
                        .iter()
                        .any(|(_, fli)| fli.locks().iter().any(|l| dead_locks.contains(l)))
                })
                .map(|(i, _)| i)
                .collect();
            for idx in holders {
                if let Some(ei) = self.elements.get_mut(idx) {
                    ei.cleanup_lock_infos(|l| !dead_locks.contains(&l));
                }
            }
        }

        if !stats.released.is_empty() {
            self.attrs |= super::store::HeapAttrs::ELEMENTS_CHANGED;
        }
        debug!(
            marked = stats.marked,
            released = stats.released.len(),
            finalizable = stats.queued_for_finalization,
            "gc cycle"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::classes::{AppId, ClassDef, ClassId, ClassRegistry};
    use crate::domain::heap::alloc::{AllocationStrategy, SlotTable};
    use crate::domain::snapshot::Restorable;

    struct Fixture {
        heap: Heap,
        reg: ClassRegistry,
        next: u32,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                heap: Heap::new(AllocationStrategy::Hashed, SlotTable::new()),
                reg: ClassRegistry::new(),
                next: 0,
            }
        }

        fn alloc(&mut self, def: ClassDef) -> ObjRef {
            let class = self.reg.class(self.reg.define(def)).unwrap();
            self.next += 1;
            let ctx = AllocationStrategy::Hashed.system_context(ClassId::new(0), self.next, 0);
            self.heap.new_object(&class, &ctx, AppId::new(0)).unwrap()
        }

        fn node(&mut self) -> ObjRef {
            self.alloc(ClassDef::new("Node").ref_field("next"))
        }
    }

    #[test]
    fn test_unreachable_objects_are_released() {
        let mut f = Fixture::new();
        let a = f.node();
        let b = f.node();
        let c = f.node();
        f.heap.set_field(a, 0, Value::Ref(b)).unwrap();

        let stats = f.heap.gc(&&[a][..]);
        assert_eq!(stats.marked, 2);
        assert_eq!(stats.released, vec![c]);
        assert!(f.heap.is_alive(a) && f.heap.is_alive(b));
        assert!(!f.heap.is_alive(c));
    }

    #[test]
    fn test_consecutive_gcs_are_stable() {
        let mut f = Fixture::new();
        let a = f.node();
        let b = f.node();
        f.heap.set_field(a, 0, Value::Ref(b)).unwrap();
        f.heap.set_field(b, 0, Value::Ref(a)).unwrap();
        let _garbage = f.node();

        f.heap.gc(&&[a][..]);
        let live: Vec<_> = f.heap.iter().map(|(r, _)| r).collect();
        let stats = f.heap.gc(&&[a][..]);
        assert!(stats.released.is_empty());
        assert_eq!(f.heap.iter().map(|(r, _)| r).collect::<Vec<_>>(), live);
    }

    #[test]
    fn test_pinned_objects_survive() {
        let mut f = Fixture::new();
        let a = f.node();
        f.heap.pin_down(a).unwrap();
        f.heap.gc(&&[][..]);
        assert!(f.heap.is_alive(a));
        f.heap.unpin(a).unwrap();
        f.heap.gc(&&[][..]);
        assert!(!f.heap.is_alive(a));
    }

    #[test]
    fn test_finalizable_object_survives_one_cycle() {
        let mut f = Fixture::new();
        let fin = f.alloc(ClassDef::new("Res").ref_field("payload").finalizer());
        let payload = f.node();
        f.heap.set_field(fin, 0, Value::Ref(payload)).unwrap();

        let stats = f.heap.gc(&&[][..]);
        assert_eq!(stats.queued_for_finalization, 1);
        assert!(f.heap.is_alive(fin));
        assert!(f.heap.is_alive(payload));
        assert_eq!(f.heap.finalizer_queue(), &[fin]);

        f.heap.gc(&&[][..]);
        assert!(f.heap.is_alive(fin), "queue is a root until finalized");

        f.heap.finalized(fin).unwrap();
        let stats = f.heap.gc(&&[][..]);
        assert_eq!(stats.released.len(), 2);
        assert!(f.heap.finalizer_queue().is_empty());
    }

    #[test]
    fn test_weak_referent_is_cleared() {
        let mut f = Fixture::new();
        let weak = f.alloc(ClassDef::new("WeakRef").weak_referent("referent"));
        let target = f.node();
        f.heap.set_field(weak, 0, Value::Ref(target)).unwrap();

        let stats = f.heap.gc(&&[weak][..]);
        assert_eq!(stats.weak_cleared, 1);
        assert!(!f.heap.is_alive(target));
        assert_eq!(f.heap.field(weak, 0).unwrap(), Value::Null);
    }

    #[test]
    fn test_gc_after_restore_keeps_restored_graph() {
        let mut f = Fixture::new();
        let a = f.node();
        let b = f.node();
        f.heap.set_field(a, 0, Value::Ref(b)).unwrap();
        f.heap.gc(&&[a][..]);
        let m = f.heap.memento();

        f.heap.set_field(a, 0, Value::Null).unwrap();
        f.heap.gc(&&[a][..]);
        f.heap.gc(&&[a][..]);
        assert!(!f.heap.is_alive(b));

        f.heap.restore(&m);
        let stats = f.heap.gc(&&[a][..]);
        assert!(stats.released.is_empty());
        assert!(f.heap.is_alive(b));
    }
}
