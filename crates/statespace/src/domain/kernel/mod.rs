//! Aggregate VM State
//!
//! [`KernelState`] owns the heap, the thread list and the class loader list
//! of one search node and snapshots them as a unit.
//!
//! # Restore order
//!
//! ```text
//!   restore(m):  threads ──▶ statics ──▶ heap ──▶ heap.cleanup_dangling(threads)
//! ```
//!
//! Threads come first because heap cleanup inspects the restored thread list.
//!
//! # Fingerprint
//!
//! [`KernelState::fingerprint`] hashes the program-visible state (thread
//! stacks and statuses, static fields, objects with their fields and
//! monitors) in slot order. Sharedness bookkeeping is left out, so two
//! states that differ only in race-detection statistics match.

pub mod sync;

use crate::domain::classes::{AppId, ClassId, ClassRegistry, LoaderId};
use crate::domain::error::HeapError;
use crate::domain::heap::alloc::{oat_finalize, oat_mix};
use crate::domain::heap::{
    AllocContext, AllocationStrategy, ElementInfo, ElementKind, GcRoots, GcStats, Heap, HeapMemento, ObjRef, SlotTable,
};
use crate::domain::snapshot::Restorable;
use crate::domain::statics::{ClassLoaderList, ClassLoaderListMemento};
use crate::domain::threads::{ThreadId, ThreadInfo, ThreadList, ThreadListMemento, ThreadSet};
use rustc_hash::FxHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// The system class loader every kernel starts with
pub const SYSTEM_LOADER: LoaderId = LoaderId::new(0);

/// Address of a heap object or a static class area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ElementRef {
    /// Heap object
    Object(ObjRef),
    /// Statics of a class as seen from a loader
    Static(LoaderId, ClassId),
}

impl fmt::Display for ElementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object(r) => write!(f, "{r}"),
            Self::Static(l, c) => write!(f, "static {c}@{l}"),
        }
    }
}

/// Heap + threads + statics of one search node
#[derive(Debug, Clone)]
pub struct KernelState {
    /// Object store
    pub heap: Heap,
    /// Thread registry
    pub threads: ThreadList,
    /// Class loaders and their statics
    pub statics: ClassLoaderList,
    classes: Arc<ClassRegistry>,
}

/// Captured kernel state
#[derive(Debug, Clone)]
pub struct KernelMemento {
    threads: ThreadListMemento,
    statics: ClassLoaderListMemento,
    heap: HeapMemento,
}

impl KernelMemento {
    /// Heap part
    pub const fn heap(&self) -> &HeapMemento {
        &self.heap
    }
}

struct KernelRoots<'a> {
    threads: &'a ThreadList,
    statics: &'a ClassLoaderList,
}

impl GcRoots for KernelRoots<'_> {
    fn for_each_root(&self, f: &mut dyn FnMut(ObjRef)) {
        for ti in self.threads.iter() {
            if ti.is_alive() {
                for r in ti.roots() {
                    f(r);
                }
            } else if let Some(obj) = ti.thread_obj {
                f(obj);
            }
        }
        self.statics.for_each_root(f);
    }
}

impl KernelState {
    /// Fresh state with the system class loader registered
    pub fn new(classes: Arc<ClassRegistry>, strategy: AllocationStrategy, slots: SlotTable, reuse_tid: bool) -> Self {
        let mut statics = ClassLoaderList::new();
        statics.add_loader(None, AppId::new(0));
        Self {
            heap: Heap::new(strategy, slots),
            threads: ThreadList::new(reuse_tid),
            statics,
            classes,
        }
    }

    /// Run-scoped class registry
    pub const fn classes(&self) -> &Arc<ClassRegistry> {
        &self.classes
    }

    /// Thread or [`HeapError::UnknownThread`]
    pub fn thread(&self, tid: ThreadId) -> Result<&ThreadInfo, HeapError> {
        self.threads.get(tid).ok_or(HeapError::UnknownThread(tid))
    }

    /// Modifiable thread or [`HeapError::UnknownThread`]
    pub fn thread_mut(&mut self, tid: ThreadId) -> Result<&mut ThreadInfo, HeapError> {
        self.threads.get_mut(tid).ok_or(HeapError::UnknownThread(tid))
    }

    /// Heap object or static area
    pub fn element(&self, eref: ElementRef) -> Option<&ElementInfo> {
        match eref {
            ElementRef::Object(r) => self.heap.get(r),
            ElementRef::Static(l, c) => self.statics.static_element(l, c),
        }
    }

    /// Modifiable heap object or static area
    pub fn element_mut(&mut self, eref: ElementRef) -> Option<&mut ElementInfo> {
        match eref {
            ElementRef::Object(r) => self.heap.get_mut(r),
            ElementRef::Static(l, c) => self.statics.static_element_mut(l, c),
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Scheduling queries that need the heap
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    fn can_lock_obj(&self, tid: ThreadId, obj: ObjRef) -> bool {
        self.heap.get(obj).map_or(true, |ei| ei.monitor.can_lock(tid))
    }

    /// Thread is runnable or could leave a timed wait right now
    pub fn is_timeout_runnable(&self, tid: ThreadId) -> bool {
        self.threads
            .get(tid)
            .is_some_and(|ti| ti.is_timeout_runnable(|obj| self.can_lock_obj(tid, obj)))
    }

    /// Timeout-runnable threads, optionally restricted to one application
    pub fn timeout_runnables(&self, app: Option<AppId>) -> ThreadSet {
        self.threads.matching(|ti| {
            app.map_or(true, |a| ti.app == a) && ti.is_timeout_runnable(|obj| self.can_lock_obj(ti.id, obj))
        })
    }

    /// Some thread of `app` is timeout-runnable
    pub fn has_process_timeout_runnables(&self, app: AppId) -> bool {
        !self.timeout_runnables(Some(app)).is_empty()
    }

    /// Live threads exist but none can be scheduled
    pub fn is_deadlocked(&self) -> bool {
        self.threads.has_live_threads() && self.timeout_runnables(None).is_empty()
    }

    /// No non-daemon thread is alive anymore and no pending finalizer work
    pub fn is_end_state(&self) -> bool {
        !self.threads.has_live_non_daemons() && !self.threads.has_runnable_system_threads()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Allocation
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Allocation context of thread `tid` at its current stack position
    pub fn alloc_context(&self, tid: ThreadId, class: ClassId, site: u32) -> Result<AllocContext, HeapError> {
        let ti = self.thread(tid)?;
        Ok(self.heap.strategy().sut_context(class, ti, site))
    }

    /// Allocate an instance of `class` on behalf of `tid`
    pub fn new_object(&mut self, tid: ThreadId, class: ClassId, site: u32) -> Result<ObjRef, HeapError> {
        let ci = self.classes.class(class).ok_or(HeapError::UnknownClass(class))?;
        let ctx = self.alloc_context(tid, class, site)?;
        let app = self.thread(tid)?.app;
        self.heap.new_object(&ci, &ctx, app)
    }

    /// Allocate an array on behalf of `tid`
    pub fn new_array(&mut self, tid: ThreadId, class: ClassId, len: usize, site: u32) -> Result<ObjRef, HeapError> {
        let ctx = self.alloc_context(tid, class, site)?;
        let app = self.thread(tid)?.app;
        self.heap.new_array(class, len, &ctx, app)
    }

    /// Allocate a string on behalf of `tid`
    pub fn new_string(&mut self, tid: ThreadId, text: &str, site: u32) -> Result<ObjRef, HeapError> {
        let class = self.classes.string_class();
        let ctx = self.alloc_context(tid, class, site)?;
        let app = self.thread(tid)?.app;
        self.heap.new_string(class, text, &ctx, app)
    }

    /// Interned string constant of `app`
    pub fn intern_string(&mut self, app: AppId, text: &str) -> Result<ObjRef, HeapError> {
        let class = self.classes.string_class();
        let anchor = oat_finalize(
            text.bytes().fold(0u32, |h, b| oat_mix(h, u32::from(b))),
        );
        let ctx = self.heap.strategy().system_context(class, anchor, app.0);
        self.heap.new_intern_string(class, text, &ctx, app)
    }

    /// Allocate an object outside any thread context (startup, class objects)
    pub fn new_system_object(&mut self, class: ClassId, anchor: u32, app: AppId) -> Result<ObjRef, HeapError> {
        let ci = self.classes.class(class).ok_or(HeapError::UnknownClass(class))?;
        let ctx = self.heap.strategy().system_context(class, anchor, 0);
        self.heap.new_object(&ci, &ctx, app)
    }

    /// Create the static area of `class` in `loader`, allocating its class
    /// object first. Returns the class object.
    pub fn register_class(&mut self, loader: LoaderId, class: ClassId, class_object_class: ClassId) -> Result<ObjRef, HeapError> {
        let ci = self.classes.class(class).ok_or(HeapError::UnknownClass(class))?;
        if let Some(ElementKind::Static { class_object: Some(obj) }) =
            self.statics.static_element(loader, class).map(|ei| &ei.kind)
        {
            return Ok(*obj);
        }
        let app = self.statics.loader(loader).map_or(AppId::new(0), |l| l.app);
        let class_object = self.new_system_object(class_object_class, class.0, app)?;
        self.statics.register_class(loader, &ci, Some(class_object));
        Ok(class_object)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // GC / fingerprint
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Collect garbage, then drop dead lock candidates from statics
    pub fn gc(&mut self) -> GcStats {
        let roots = KernelRoots {
            threads: &self.threads,
            statics: &self.statics,
        };
        let stats = self.heap.gc(&roots);
        let heap = &self.heap;
        self.statics.cleanup(|obj| heap.is_alive(obj));
        stats
    }

    /// Deterministic hash of the program-visible state
    pub fn fingerprint(&self) -> u64 {
        let mut h = FxHasher::default();
        for ti in self.threads.iter() {
            ti.id.hash(&mut h);
            ti.status.hash(&mut h);
            ti.suspend_count.hash(&mut h);
            ti.frames.hash(&mut h);
            ti.lock_ref.hash(&mut h);
            ti.lock_count.hash(&mut h);
            ti.locked_objects.hash(&mut h);
            ti.interrupted.hash(&mut h);
        }
        for li in self.statics.iter() {
            li.id.hash(&mut h);
            for (class, ei) in li.classes() {
                class.hash(&mut h);
                hash_element(ei, &mut h);
            }
        }
        for (obj, ei) in self.heap.iter() {
            obj.hash(&mut h);
            hash_element(ei, &mut h);
        }
        h.finish()
    }
}

fn hash_element(ei: &ElementInfo, h: &mut FxHasher) {
    ei.class.hash(h);
    ei.kind.hash(h);
    ei.fields.hash(h);
    ei.monitor.hash(h);
    ei.pin_down_count.hash(h);
}

impl Restorable for KernelState {
    type Memento = KernelMemento;

    fn memento(&self) -> KernelMemento {
        KernelMemento {
            threads: self.threads.memento(),
            statics: self.statics.memento(),
            heap: self.heap.memento(),
        }
    }

    fn restore(&mut self, memento: &KernelMemento) {
        self.threads.restore(&memento.threads);
        self.statics.restore(&memento.statics);
        self.heap.restore(&memento.heap);
        self.heap.cleanup_dangling(&self.threads);
    }
}
