//! Heap
//!
//! Object store of one search node. Slots come from the allocation identity
//! (see [`super::alloc`]); entries are copy-on-write so a memento is a cheap
//! table copy.
//!
//! ```text
//!   Heap ──┬── elements        PersistentSlots<ElementInfo>   (snapshotted)
//!          ├── alloc counts    per-path                        (snapshotted)
//!          ├── interned        (app, text) -> ref              (snapshotted)
//!          ├── finalizer queue GC root                         (snapshotted)
//!          ├── weak refs       objects with a weak referent    (snapshotted)
//!          ├── slot table      (ctx, count) -> slot            (search-global)
//!          └── live bits       toggled per GC cycle            (not snapshotted)
//! ```

use super::alloc::{AllocContext, AllocCounts, AllocationStrategy, SlotTable};
use super::element::{ElementAttrs, ElementInfo, ElementKind};
use super::live_bits::LiveBits;
use super::slots::PersistentSlots;
use super::types::{ObjRef, Value};
use crate::domain::classes::{AppId, ClassId, ClassInfo};
use crate::domain::error::HeapError;
use crate::domain::snapshot::Restorable;
use crate::domain::threads::ThreadList;
use bitflags::bitflags;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::trace;

bitflags! {
    /// Heap-wide attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HeapAttrs: u8 {
        /// An allocation failed for lack of memory
        const OUT_OF_MEMORY      = 1 << 0;
        /// Elements were added, removed or modified since the last capture
        const ELEMENTS_CHANGED   = 1 << 1;
        /// Pin-down counts changed since the last capture
        const PINDOWN_CHANGED    = 1 << 2;
        /// Intern table changed since the last capture
        const INTERN_CHANGED     = 1 << 3;
    }
}

/// Object store
#[derive(Debug, Clone)]
pub struct Heap {
    pub(super) elements: PersistentSlots<ElementInfo>,
    counts: AllocCounts,
    interned: Arc<FxHashMap<(AppId, Arc<str>), ObjRef>>,
    pub(super) finalizer_queue: Arc<Vec<ObjRef>>,
    pub(super) weak_refs: Arc<Vec<ObjRef>>,
    pub(super) attrs: HeapAttrs,
    strategy: AllocationStrategy,
    slots: SlotTable,
    pub(super) live: LiveBits,
    pub(super) live_stale: bool,
}

/// Captured heap
#[derive(Debug, Clone)]
pub struct HeapMemento {
    elements: PersistentSlots<ElementInfo>,
    counts: AllocCounts,
    interned: Arc<FxHashMap<(AppId, Arc<str>), ObjRef>>,
    finalizer_queue: Arc<Vec<ObjRef>>,
    weak_refs: Arc<Vec<ObjRef>>,
    out_of_memory: bool,
}

impl HeapMemento {
    /// Number of objects in the captured heap
    pub const fn len(&self) -> usize {
        self.elements.len()
    }

    /// Captured heap is empty
    pub const fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

impl Heap {
    /// Empty heap using `strategy` and the run's slot table
    pub fn new(strategy: AllocationStrategy, slots: SlotTable) -> Self {
        Self {
            elements: PersistentSlots::new(),
            counts: AllocCounts::default(),
            interned: Arc::default(),
            finalizer_queue: Arc::default(),
            weak_refs: Arc::default(),
            attrs: HeapAttrs::empty(),
            strategy,
            slots,
            live: LiveBits::new(),
            live_stale: false,
        }
    }

    /// Allocation context variant
    pub const fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    /// Search-global slot table
    pub const fn slot_table(&self) -> &SlotTable {
        &self.slots
    }

    /// Heap attributes
    pub const fn attrs(&self) -> HeapAttrs {
        self.attrs
    }

    /// Out-of-memory flag
    pub const fn is_out_of_memory(&self) -> bool {
        self.attrs.contains(HeapAttrs::OUT_OF_MEMORY)
    }

    /// Set or clear the out-of-memory flag
    pub fn set_out_of_memory(&mut self, oom: bool) {
        self.attrs.set(HeapAttrs::OUT_OF_MEMORY, oom);
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Allocation
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    fn allocate(&mut self, ctx: &AllocContext, ei: ElementInfo) -> Result<ObjRef, HeapError> {
        let count = self.counts.next(ctx);
        let obj = self.slots.slot(ctx, count);
        if self.elements.contains(obj.as_usize()) {
            return Err(HeapError::SlotInUse(obj));
        }
        if ei.weak_field.is_some() {
            Arc::make_mut(&mut self.weak_refs).push(obj);
        }
        self.elements.insert(obj.as_usize(), ei);
        self.live.mark(obj.as_usize());
        self.attrs |= HeapAttrs::ELEMENTS_CHANGED;
        trace!("allocated {obj} (count {count})");
        Ok(obj)
    }

    /// Allocate an instance of `class`
    pub fn new_object(&mut self, class: &ClassInfo, ctx: &AllocContext, app: AppId) -> Result<ObjRef, HeapError> {
        let mut ei = ElementInfo::new(class.id, ElementKind::Object, class.instance_fields.len(), app);
        if class.is_immutable {
            ei.attrs |= ElementAttrs::IMMUTABLE;
        }
        if class.has_finalizer {
            ei.attrs |= ElementAttrs::HAS_FINALIZER;
        }
        ei.weak_field = class.weak_referent;
        self.allocate(ctx, ei)
    }

    /// Allocate an array of `len` null elements
    pub fn new_array(&mut self, class: ClassId, len: usize, ctx: &AllocContext, app: AppId) -> Result<ObjRef, HeapError> {
        self.allocate(ctx, ElementInfo::new(class, ElementKind::Array, len, app))
    }

    /// Allocate a string
    pub fn new_string(&mut self, string_class: ClassId, text: &str, ctx: &AllocContext, app: AppId) -> Result<ObjRef, HeapError> {
        let mut ei = ElementInfo::new(string_class, ElementKind::Str(Arc::from(text)), 0, app);
        ei.attrs |= ElementAttrs::IMMUTABLE | ElementAttrs::CONSTRUCTED;
        self.allocate(ctx, ei)
    }

    /// Interned string for `(app, text)`.
    ///
    /// A cached entry is revalidated: it must still denote a string with the
    /// same text, otherwise a fresh pinned string is allocated.
    pub fn new_intern_string(
        &mut self,
        string_class: ClassId,
        text: &str,
        ctx: &AllocContext,
        app: AppId,
    ) -> Result<ObjRef, HeapError> {
        let key = (app, Arc::<str>::from(text));
        if let Some(&obj) = self.interned.get(&key) {
            if self.get(obj).and_then(ElementInfo::as_str) == Some(text) {
                return Ok(obj);
            }
        }
        let obj = self.new_string(string_class, text, ctx, app)?;
        if let Some(ei) = self.elements.get_mut(obj.as_usize()) {
            ei.attrs |= ElementAttrs::INTERNED;
        }
        self.pin_down(obj)?;
        Arc::make_mut(&mut self.interned).insert(key, obj);
        self.attrs |= HeapAttrs::INTERN_CHANGED;
        Ok(obj)
    }

    /// Interned string lookup without allocation
    pub fn interned(&self, app: AppId, text: &str) -> Option<ObjRef> {
        self.interned.get(&(app, Arc::<str>::from(text))).copied()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Access
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Element for `obj`
    #[inline]
    pub fn get(&self, obj: ObjRef) -> Option<&ElementInfo> {
        self.elements.get(obj.as_usize())
    }

    /// Modifiable element for `obj` (clones a frozen entry)
    #[inline]
    pub fn get_mut(&mut self, obj: ObjRef) -> Option<&mut ElementInfo> {
        let ei = self.elements.get_mut(obj.as_usize())?;
        self.attrs |= HeapAttrs::ELEMENTS_CHANGED;
        Some(ei)
    }

    /// Element or [`HeapError::Dangling`]
    pub fn element(&self, obj: ObjRef) -> Result<&ElementInfo, HeapError> {
        self.get(obj).ok_or(HeapError::Dangling(obj))
    }

    /// Modifiable element or [`HeapError::Dangling`]
    pub fn element_mut(&mut self, obj: ObjRef) -> Result<&mut ElementInfo, HeapError> {
        self.get_mut(obj).ok_or(HeapError::Dangling(obj))
    }

    /// Entry is shared with a snapshot
    pub fn is_frozen(&self, obj: ObjRef) -> bool {
        self.elements.is_frozen(obj.as_usize())
    }

    /// Field value
    pub fn field(&self, obj: ObjRef, index: usize) -> Result<Value, HeapError> {
        self.element(obj)?
            .field(index)
            .ok_or(HeapError::FieldIndex { obj, index })
    }

    /// Store a field value
    pub fn set_field(&mut self, obj: ObjRef, index: usize, value: Value) -> Result<(), HeapError> {
        if self.element(obj)?.field(index) == Some(value) {
            return Ok(());
        }
        if self.element_mut(obj)?.set_field(index, value) {
            Ok(())
        } else {
            Err(HeapError::FieldIndex { obj, index })
        }
    }

    /// Object exists in this state
    #[inline]
    pub fn is_alive(&self, obj: ObjRef) -> bool {
        self.elements.contains(obj.as_usize())
    }

    /// Number of objects
    pub const fn len(&self) -> usize {
        self.elements.len()
    }

    /// No objects
    pub const fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// All objects in slot order
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, &ElementInfo)> + '_ {
        self.elements
            .iter()
            .map(|(i, ei)| (ObjRef::new(i as u32), ei))
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Pinning / finalization
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Keep `obj` alive regardless of reachability. Returns `true` if the
    /// object just became pinned.
    pub fn pin_down(&mut self, obj: ObjRef) -> Result<bool, HeapError> {
        let ei = self.get_mut(obj).ok_or(HeapError::PinDownDead(obj))?;
        ei.pin_down_count += 1;
        let first = ei.pin_down_count == 1;
        self.attrs |= HeapAttrs::PINDOWN_CHANGED;
        Ok(first)
    }

    /// Release one pin. Returns `true` if the object is no longer pinned.
    pub fn unpin(&mut self, obj: ObjRef) -> Result<bool, HeapError> {
        let ei = self.element_mut(obj)?;
        if ei.pin_down_count == 0 {
            return Ok(false);
        }
        ei.pin_down_count -= 1;
        let released = ei.pin_down_count == 0;
        self.attrs |= HeapAttrs::PINDOWN_CHANGED;
        Ok(released)
    }

    /// Objects waiting for their finalizer
    pub fn finalizer_queue(&self) -> &[ObjRef] {
        &self.finalizer_queue
    }

    /// Remove `obj` from the finalizer queue and mark it finalized.
    ///
    /// Called by the finalizer thread after running the finalizer. The
    /// object is released by the next GC if it is still unreachable.
    pub fn finalized(&mut self, obj: ObjRef) -> Result<(), HeapError> {
        self.element_mut(obj)?.attrs |= ElementAttrs::FINALIZED;
        Arc::make_mut(&mut self.finalizer_queue).retain(|o| *o != obj);
        Ok(())
    }

    /// Objects with a weak referent field
    pub fn weak_refs(&self) -> &[ObjRef] {
        &self.weak_refs
    }

    /// Drop thread ids from referencing-thread sets that do not exist in
    /// `threads`. Requires the thread list to be restored first.
    pub fn cleanup_dangling(&mut self, threads: &ThreadList) {
        let stale: Vec<usize> = self
            .elements
            .iter()
            .filter(|(_, ei)| ei.referencing_threads.iter().any(|t| threads.get(t).is_none()))
            .map(|(i, _)| i)
            .collect();
        for idx in stale {
            if let Some(ei) = self.elements.get_mut(idx) {
                ei.referencing_threads = ei
                    .referencing_threads
                    .iter()
                    .filter(|t| threads.get(*t).is_some())
                    .collect();
            }
        }
    }
}

impl Restorable for Heap {
    type Memento = HeapMemento;

    fn memento(&self) -> HeapMemento {
        HeapMemento {
            elements: self.elements.clone(),
            counts: self.counts.clone(),
            interned: Arc::clone(&self.interned),
            finalizer_queue: Arc::clone(&self.finalizer_queue),
            weak_refs: Arc::clone(&self.weak_refs),
            out_of_memory: self.is_out_of_memory(),
        }
    }

    fn restore(&mut self, memento: &HeapMemento) {
        self.elements = memento.elements.clone();
        self.counts = memento.counts.clone();
        self.interned = Arc::clone(&memento.interned);
        self.finalizer_queue = Arc::clone(&memento.finalizer_queue);
        self.weak_refs = Arc::clone(&memento.weak_refs);
        self.attrs = HeapAttrs::empty();
        self.set_out_of_memory(memento.out_of_memory);
        self.live_stale = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::classes::{ClassDef, ClassRegistry};

    fn setup() -> (Heap, ClassRegistry) {
        (
            Heap::new(AllocationStrategy::Hashed, SlotTable::new()),
            ClassRegistry::new(),
        )
    }

    fn ctx(anchor: u32) -> AllocContext {
        AllocationStrategy::Hashed.system_context(ClassId::new(0), anchor, 0)
    }

    #[test]
    fn test_allocation_is_canonical_across_restore() {
        let (mut heap, reg) = setup();
        let node = reg.class(reg.define(ClassDef::new("Node").ref_field("next"))).unwrap();
        let app = AppId::new(0);

        let m = heap.memento();
        let a = heap.new_object(&node, &ctx(1), app).unwrap();
        let b = heap.new_object(&node, &ctx(1), app).unwrap();
        assert_ne!(a, b);

        heap.restore(&m);
        assert!(heap.is_empty());
        let a2 = heap.new_object(&node, &ctx(1), app).unwrap();
        assert_eq!(a, a2);
    }

    #[test]
    fn test_restore_undoes_field_writes() {
        let (mut heap, reg) = setup();
        let c = reg.class(reg.define(ClassDef::new("C").field("x"))).unwrap();
        let obj = heap.new_object(&c, &ctx(0), AppId::new(0)).unwrap();

        let m = heap.memento();
        assert!(heap.is_frozen(obj));
        heap.set_field(obj, 0, Value::Int(42)).unwrap();
        assert!(!heap.is_frozen(obj));
        assert_eq!(heap.field(obj, 0).unwrap(), Value::Int(42));

        heap.restore(&m);
        assert_eq!(heap.field(obj, 0).unwrap(), Value::Null);
        assert_eq!(
            heap.field(obj, 3),
            Err(HeapError::FieldIndex { obj, index: 3 })
        );
    }

    #[test]
    fn test_intern_string_is_revalidated() {
        let (mut heap, reg) = setup();
        let sc = reg.string_class();
        let app = AppId::new(0);

        let s1 = heap.new_intern_string(sc, "hello", &ctx(5), app).unwrap();
        let s2 = heap.new_intern_string(sc, "hello", &ctx(5), app).unwrap();
        assert_eq!(s1, s2);
        assert!(heap.get(s1).unwrap().is_pinned());
        assert_eq!(heap.interned(app, "hello"), Some(s1));
        assert_eq!(heap.interned(AppId::new(1), "hello"), None);
    }

    #[test]
    fn test_pin_down_dead_object_fails() {
        let (mut heap, _) = setup();
        assert_eq!(
            heap.pin_down(ObjRef::new(99)),
            Err(HeapError::PinDownDead(ObjRef::new(99)))
        );
    }

    #[test]
    fn test_pin_counts_nest() {
        let (mut heap, reg) = setup();
        let c = reg.class(reg.define(ClassDef::new("C"))).unwrap();
        let obj = heap.new_object(&c, &ctx(0), AppId::new(0)).unwrap();
        assert!(heap.pin_down(obj).unwrap());
        assert!(!heap.pin_down(obj).unwrap());
        assert!(!heap.unpin(obj).unwrap());
        assert!(heap.unpin(obj).unwrap());
        assert!(!heap.unpin(obj).unwrap());
    }

    #[test]
    fn test_out_of_memory_flag_is_snapshotted() {
        let (mut heap, _) = setup();
        let m = heap.memento();
        heap.set_out_of_memory(true);
        assert!(heap.is_out_of_memory());
        heap.restore(&m);
        assert!(!heap.is_out_of_memory());
    }
}
