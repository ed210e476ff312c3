//! Choice Generator Arena
//!
//! Generators link to their predecessor by handle, forming chains that
//! share tails across the search tree:
//!
//! ```text
//!   slot:   0        1        2        3
//!          ROOT ◀── LOCK ◀── NOTIFY ◀── LOCK
//!                     ▲        (cascaded)
//!                     └──────── WAIT          (other branch)
//! ```
//!
//! A cascade is a run of generators registered for the same instruction:
//! every member except the newest carries the cascaded flag.
//!
//! # Design Notes
//!
//! - Slots carry a generation; freeing a slot bumps it so outstanding
//!   handles stop resolving instead of aliasing a new generator.
//! - [`CgArena::collect`] frees everything not reachable from the given
//!   roots. The search calls it with the handles its backtrack stack holds.
//! - [`DetachedChain`] is an owned deep copy used by restorable snapshots.

use super::generator::ChoiceGenerator;
use super::types::CgHandle;
use crate::domain::error::EngineError;

type Cg = dyn ChoiceGenerator;

#[derive(Debug)]
struct Slot {
    generation: u32,
    cg: Option<Box<Cg>>,
}

/// Owner of every live choice generator
#[derive(Debug, Default)]
pub struct CgArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl CgArena {
    /// Empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a generator
    pub fn insert(&mut self, cg: Box<Cg>) -> CgHandle {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.cg = Some(cg);
            return CgHandle::new(index, slot.generation);
        }
        let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Slot {
            generation: 0,
            cg: Some(cg),
        });
        CgHandle::new(index, 0)
    }

    /// Generator behind `h`, if still live
    pub fn get(&self, h: CgHandle) -> Option<&Cg> {
        let slot = self.slots.get(h.as_usize())?;
        if slot.generation != h.generation() {
            return None;
        }
        slot.cg.as_deref()
    }

    /// Modifiable generator behind `h`
    pub fn get_mut(&mut self, h: CgHandle) -> Option<&mut Cg> {
        let slot = self.slots.get_mut(h.as_usize())?;
        if slot.generation != h.generation() {
            return None;
        }
        slot.cg.as_deref_mut()
    }

    /// Like [`Self::get`] but stale handles are an error
    pub fn try_get(&self, h: CgHandle) -> Result<&Cg, EngineError> {
        self.get(h)
            .ok_or_else(|| EngineError::StaleChoiceGenerator(h.to_string()))
    }

    /// Like [`Self::get_mut`] but stale handles are an error
    pub fn try_get_mut(&mut self, h: CgHandle) -> Result<&mut Cg, EngineError> {
        self.get_mut(h)
            .ok_or_else(|| EngineError::StaleChoiceGenerator(h.to_string()))
    }

    /// Live generators
    pub const fn len(&self) -> usize {
        self.live
    }

    /// No live generators
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Chain queries
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Predecessor of `h`
    pub fn prev(&self, h: CgHandle) -> Option<CgHandle> {
        self.get(h)?.base().prev()
    }

    /// Predecessor of `h` if it belongs to the same cascade
    pub fn cascaded_parent(&self, h: CgHandle) -> Option<CgHandle> {
        let prev = self.prev(h)?;
        self.get(prev)?.base().is_cascaded().then_some(prev)
    }

    /// The cascade ending in `h`, oldest first
    pub fn cascade(&self, h: CgHandle) -> Vec<CgHandle> {
        let mut out = vec![h];
        let mut cur = h;
        while let Some(parent) = self.cascaded_parent(cur) {
            out.push(parent);
            cur = parent;
        }
        out.reverse();
        out
    }

    /// Every generator of the chain ending in `h`, oldest first
    pub fn all(&self, h: CgHandle) -> Vec<CgHandle> {
        let mut out = Vec::new();
        let mut cur = Some(h);
        while let Some(c) = cur {
            if self.get(c).is_none() {
                break;
            }
            out.push(c);
            cur = self.prev(c);
        }
        out.reverse();
        out
    }

    /// Members of the cascade ending in `h` whose concrete type is `T`
    pub fn cascade_of_type<T: ChoiceGenerator>(&self, h: CgHandle) -> Vec<CgHandle> {
        self.cascade(h)
            .into_iter()
            .filter(|c| self.get(*c).is_some_and(|cg| cg.is::<T>()))
            .collect()
    }

    /// Members of the whole chain ending in `h` whose concrete type is `T`
    pub fn all_of_type<T: ChoiceGenerator>(&self, h: CgHandle) -> Vec<CgHandle> {
        self.all(h)
            .into_iter()
            .filter(|c| self.get(*c).is_some_and(|cg| cg.is::<T>()))
            .collect()
    }

    /// Newest generator at or before `h` matching `pred`
    pub fn last_matching(&self, h: CgHandle, mut pred: impl FnMut(&Cg) -> bool) -> Option<CgHandle> {
        let mut cur = Some(h);
        while let Some(c) = cur {
            let cg = self.get(c)?;
            if pred(cg) {
                return Some(c);
            }
            cur = cg.base().prev();
        }
        None
    }

    /// Newest generator at or before `h` of type `T`
    pub fn last_of_type<T: ChoiceGenerator>(&self, h: CgHandle) -> Option<CgHandle> {
        self.last_matching(h, |cg| cg.is::<T>())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Deep copies
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    /// Owned copy of the chain ending in `h`
    pub fn detach(&self, h: CgHandle) -> DetachedChain {
        let cgs = self
            .all(h)
            .into_iter()
            .filter_map(|c| self.get(c).map(ChoiceGenerator::clone_box))
            .collect();
        DetachedChain { cgs }
    }

    /// Insert a copy of `chain`, relinking predecessors. Returns the new
    /// handles, oldest first.
    pub fn attach(&mut self, chain: &DetachedChain) -> Vec<CgHandle> {
        self.attach_prefix(chain, chain.len())
    }

    /// Like [`Self::attach`] but only the `len` oldest generators
    pub fn attach_prefix(&mut self, chain: &DetachedChain, len: usize) -> Vec<CgHandle> {
        let mut handles = Vec::with_capacity(len);
        let mut prev = None;
        for cg in chain.cgs.iter().take(len) {
            let mut copy = cg.clone();
            copy.base_mut().set_prev(prev);
            let h = self.insert(copy);
            handles.push(h);
            prev = Some(h);
        }
        handles
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Collection
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Free every generator not reachable from `roots` through predecessor
    /// links. Returns the number freed.
    pub fn collect(&mut self, roots: impl IntoIterator<Item = CgHandle>) -> usize {
        let mut marked = vec![false; self.slots.len()];
        for root in roots {
            let mut cur = Some(root);
            while let Some(c) = cur {
                if self.get(c).is_none() || marked[c.as_usize()] {
                    break;
                }
                marked[c.as_usize()] = true;
                cur = self.prev(c);
            }
        }

        let mut freed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.cg.is_some() && !marked[index] {
                slot.cg = None;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(u32::try_from(index).unwrap_or(u32::MAX));
                freed += 1;
            }
        }
        self.live -= freed;
        if freed > 0 {
            tracing::trace!(freed, live = self.live, "collected choice generators");
        }
        freed
    }
}

/// Owned deep copy of a generator chain, oldest first
#[derive(Debug, Clone, Default)]
pub struct DetachedChain {
    cgs: Vec<Box<Cg>>,
}

impl DetachedChain {
    /// Number of generators
    pub fn len(&self) -> usize {
        self.cgs.len()
    }

    /// Empty chain
    pub fn is_empty(&self) -> bool {
        self.cgs.is_empty()
    }

    /// Generators, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &Cg> + '_ {
        self.cgs.iter().map(AsRef::as_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::choice::{BooleanChoiceGenerator, ThreadChoiceFromSet};
    use crate::domain::threads::ThreadId;

    fn thread_cg(id: &str) -> Box<Cg> {
        Box::new(ThreadChoiceFromSet::new(id, &[ThreadId::new(1), ThreadId::new(2)], true))
    }

    fn link(arena: &mut CgArena, cg: Box<Cg>, prev: Option<CgHandle>, cascade_prev: bool) -> CgHandle {
        if cascade_prev {
            if let Some(p) = prev {
                arena.get_mut(p).unwrap().base_mut().set_cascaded(true);
            }
        }
        let h = arena.insert(cg);
        arena.get_mut(h).unwrap().base_mut().set_prev(prev);
        h
    }

    #[test]
    fn test_cascade_and_all() {
        let mut arena = CgArena::new();
        let root = link(&mut arena, thread_cg("ROOT"), None, false);
        let a = link(&mut arena, thread_cg("LOCK"), Some(root), false);
        let b = link(&mut arena, Box::new(BooleanChoiceGenerator::new("B")), Some(a), true);

        assert_eq!(arena.cascade(b), vec![a, b]);
        assert_eq!(arena.all(b), vec![root, a, b]);
        assert_eq!(arena.cascaded_parent(b), Some(a));
        assert_eq!(arena.cascaded_parent(a), None);
        assert_eq!(arena.cascade_of_type::<ThreadChoiceFromSet>(b), vec![a]);
        assert_eq!(arena.all_of_type::<ThreadChoiceFromSet>(b), vec![root, a]);
        assert_eq!(arena.last_of_type::<ThreadChoiceFromSet>(b), Some(a));
    }

    #[test]
    fn test_collect_frees_unreachable_and_invalidates_handles() {
        let mut arena = CgArena::new();
        let root = link(&mut arena, thread_cg("ROOT"), None, false);
        let keep = link(&mut arena, thread_cg("KEEP"), Some(root), false);
        let drop = link(&mut arena, thread_cg("DROP"), Some(root), false);

        assert_eq!(arena.collect([keep]), 1);
        assert_eq!(arena.len(), 2);
        assert!(arena.get(drop).is_none());
        assert!(matches!(arena.try_get(drop), Err(EngineError::StaleChoiceGenerator(_))));

        let reused = arena.insert(thread_cg("NEW"));
        assert_eq!(reused.as_usize(), drop.as_usize());
        assert_ne!(reused.generation(), drop.generation());
        assert!(arena.get(drop).is_none());
    }

    #[test]
    fn test_detach_attach_is_deep() {
        let mut arena = CgArena::new();
        let root = link(&mut arena, thread_cg("ROOT"), None, false);
        let next = link(&mut arena, thread_cg("LOCK"), Some(root), false);
        arena.get_mut(next).unwrap().advance();

        let chain = arena.detach(next);
        arena.get_mut(next).unwrap().advance();

        let copies = arena.attach(&chain);
        assert_eq!(copies.len(), 2);
        let copy = arena.get(copies[1]).unwrap();
        assert_eq!(copy.processed_choices(), 1);
        assert_eq!(copy.base().prev(), Some(copies[0]));
        assert_eq!(arena.get(next).unwrap().processed_choices(), 2);
    }
}
