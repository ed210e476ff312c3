//! Sharedness Policy - Race Exposure Oracle
//!
//! # Overview
//!
//! For every field, static or array element access the engine asks the
//! sharedness policy whether the access can race. If the accessed element
//! is reachable from more than one live thread and its field is not
//! covered by a consistently held lock, the policy registers a thread
//! choice so the access is re-executed under every interleaving.
//!
//! ```text
//!   access(tid, element, field)
//!     │
//!     ├─ verdict: Never ────────────────────────────────▶ no choice
//!     │           (first step, single runnable, patterns,
//!     │            immutable, finals, constructors)
//!     ├─ update referencing threads ─▶ SHARED if > 1 live
//!     ├─ update FieldLockInfo (sync detection)
//!     └─ Always, or SHARED and not lock protected ──────▶ SHARED_* choice
//! ```
//!
//! # Scopes
//!
//! The policy is generic over where sharedness data lives, the same way
//! the algorithm is kept separate from its storage backend elsewhere:
//!
//! ```text
//! GenericSharednessPolicy<S: SharednessScope>
//!   ├─ PathScope    data stored in the element, restored with the state
//!   └─ GlobalScope  DashMap caches that survive backtracking
//! ```
//!
//! A global scope reports sharedness observed on *any* explored path, so it
//! also exposes races between threads whose lifetimes never overlap on the
//! current one.

use super::{reasons, SchedCx};
use crate::domain::choice::ThreadChoiceFromSet;
use crate::domain::classes::{glob_match, ClassId, ClassInfo, ClassRegistry, FieldInfo, LoaderId, MethodInfo};
use crate::domain::heap::{ElementAttrs, ElementKind, FieldLockInfo, FieldLockInfoFactory, FieldOwner, ObjRef};
use crate::domain::kernel::{ElementRef, KernelState};
use crate::domain::threads::{ThreadId, ThreadInfo, ThreadSet};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Race-exposure decisions for heap and static accesses
pub trait SharednessPolicy: Send + fmt::Debug {
    /// Policy class name
    fn name(&self) -> &'static str;

    /// `tid` allocated `obj`
    fn initialize_object_sharedness(&mut self, kernel: &mut KernelState, tid: ThreadId, obj: ObjRef);

    /// `tid` caused the static area of `class` to be created
    fn initialize_class_sharedness(&mut self, kernel: &mut KernelState, tid: ThreadId, loader: LoaderId, class: ClassId);

    /// `tid` is about to access instance field `field` of `obj`
    fn sets_shared_object_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, obj: ObjRef, field: usize) -> bool;

    /// `tid` is about to access static field `field` of `class`
    fn sets_shared_class_cg(
        &mut self,
        cx: &mut SchedCx<'_>,
        tid: ThreadId,
        loader: LoaderId,
        class: ClassId,
        field: usize,
    ) -> bool;

    /// `tid` is about to access element `index` of `array`
    fn sets_shared_array_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, array: ObjRef, index: usize) -> bool;

    /// `tid` is about to store `exposed` into a field of `owner`
    fn sets_exposure_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, owner: ElementRef, exposed: ObjRef) -> bool;

    /// Element is currently considered shared
    fn is_shared(&self, kernel: &KernelState, eref: ElementRef) -> bool;
}

/// `vm.shared.*` and `vm.por.sync_detection.*` settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharednessConfig {
    /// Final instance fields never race
    pub skip_finals: bool,
    /// Final fields of constructed objects never race
    pub skip_constructed_finals: bool,
    /// Final static fields never race
    pub skip_static_finals: bool,
    /// Accesses from constructors never race
    pub skip_inits: bool,
    /// Break when an unshared object is stored into a shared one
    pub break_on_exposure: bool,
    /// Track lock protection of shared fields
    pub sync_detection: bool,
    /// Consistent checks before a field counts as lock protected
    pub lock_threshold: u32,
    /// Pin down locks that became protecting
    pub pindown: bool,
    /// Assume protection immediately for obvious lock candidates
    pub aggressive: bool,
    /// Type patterns that never break
    pub never_break_types: Vec<String>,
    /// Type patterns that always break
    pub always_break_types: Vec<String>,
    /// `Class.field` patterns that never break
    pub never_break_fields: Vec<String>,
    /// `Class.field` patterns that always break
    pub always_break_fields: Vec<String>,
    /// `Class.method` patterns under which nothing breaks
    pub never_break_methods: Vec<String>,
}

impl Default for SharednessConfig {
    fn default() -> Self {
        Self {
            skip_finals: true,
            skip_constructed_finals: false,
            skip_static_finals: true,
            skip_inits: true,
            break_on_exposure: true,
            sync_detection: true,
            lock_threshold: 5,
            pindown: false,
            aggressive: false,
            never_break_types: Vec::new(),
            always_break_types: Vec::new(),
            never_break_fields: Vec::new(),
            always_break_fields: Vec::new(),
            never_break_methods: Vec::new(),
        }
    }
}

impl SharednessConfig {
    /// Lock info factory for these settings
    pub const fn lock_info_factory(&self) -> FieldLockInfoFactory {
        FieldLockInfoFactory {
            threshold: self.lock_threshold,
            pindown: self.pindown,
            aggressive: self.aggressive,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scopes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Storage backend for referencing-thread sets and field lock infos
pub trait SharednessScope: Send + Sync + fmt::Debug + Default {
    /// Policy class name of the scope
    const NAME: &'static str;

    /// Whether a race choice is worth considering at all for `tid`
    fn check_other_runnables(&self, kernel: &KernelState, tid: ThreadId) -> bool;

    /// Record the allocating thread
    fn initialize(&self, kernel: &mut KernelState, eref: ElementRef, tid: ThreadId);

    /// Add `tid` to the referencing set and return the updated set
    fn add_referencing_thread(&self, kernel: &mut KernelState, eref: ElementRef, tid: ThreadId) -> ThreadSet;

    /// Lock info of `field`
    fn lock_info(&self, kernel: &KernelState, eref: ElementRef, field: usize) -> Option<FieldLockInfo>;

    /// Store the lock info of `field`
    fn set_lock_info(&self, kernel: &mut KernelState, eref: ElementRef, field: usize, info: FieldLockInfo);
}

/// Sharedness data kept in the elements themselves
#[derive(Debug, Clone, Copy, Default)]
pub struct PathScope;

impl SharednessScope for PathScope {
    const NAME: &'static str = "PathSharednessPolicy";

    fn check_other_runnables(&self, kernel: &KernelState, tid: ThreadId) -> bool {
        kernel.threads.has_other_runnables(tid)
    }

    fn initialize(&self, kernel: &mut KernelState, eref: ElementRef, tid: ThreadId) {
        if let Some(ei) = kernel.element_mut(eref) {
            ei.referencing_threads = std::iter::once(tid).collect();
        }
    }

    fn add_referencing_thread(&self, kernel: &mut KernelState, eref: ElementRef, tid: ThreadId) -> ThreadSet {
        match kernel.element(eref) {
            Some(ei) if ei.referencing_threads.contains(tid) => return ei.referencing_threads.clone(),
            None => return ThreadSet::new(),
            Some(_) => {}
        }
        kernel.element_mut(eref).map_or_else(ThreadSet::new, |ei| {
            ei.referencing_threads.insert(tid);
            ei.referencing_threads.clone()
        })
    }

    fn lock_info(&self, kernel: &KernelState, eref: ElementRef, field: usize) -> Option<FieldLockInfo> {
        kernel.element(eref)?.lock_info(field).cloned()
    }

    fn set_lock_info(&self, kernel: &mut KernelState, eref: ElementRef, field: usize, info: FieldLockInfo) {
        if let Some(ei) = kernel.element_mut(eref) {
            ei.set_lock_info(field, info);
        }
    }
}

/// Search-global sharedness caches
#[derive(Debug, Default)]
pub struct GlobalScope {
    threads: DashMap<ElementRef, ThreadSet>,
    lock_infos: DashMap<(ElementRef, usize), FieldLockInfo>,
}

impl GlobalScope {
    /// Elements with a recorded referencing set
    pub fn tracked_elements(&self) -> usize {
        self.threads.len()
    }
}

impl SharednessScope for GlobalScope {
    const NAME: &'static str = "GlobalSharednessPolicy";

    fn check_other_runnables(&self, _kernel: &KernelState, _tid: ThreadId) -> bool {
        true
    }

    fn initialize(&self, _kernel: &mut KernelState, eref: ElementRef, tid: ThreadId) {
        self.threads
            .entry(eref)
            .or_insert_with(|| std::iter::once(tid).collect());
    }

    fn add_referencing_thread(&self, _kernel: &mut KernelState, eref: ElementRef, tid: ThreadId) -> ThreadSet {
        let mut set = self.threads.entry(eref).or_default();
        set.insert(tid);
        set.clone()
    }

    fn lock_info(&self, _kernel: &KernelState, eref: ElementRef, field: usize) -> Option<FieldLockInfo> {
        self.lock_infos.get(&(eref, field)).map(|fli| fli.clone())
    }

    fn set_lock_info(&self, _kernel: &mut KernelState, eref: ElementRef, field: usize, info: FieldLockInfo) {
        self.lock_infos.insert((eref, field), info);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Generic policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Path-local sharedness
pub type PathSharednessPolicy = GenericSharednessPolicy<PathScope>;

/// Search-global sharedness
pub type GlobalSharednessPolicy = GenericSharednessPolicy<GlobalScope>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Never,
    Always,
    Undecided,
}

/// Sharedness algorithm over a storage scope
#[derive(Debug)]
pub struct GenericSharednessPolicy<S: SharednessScope> {
    config: SharednessConfig,
    factory: FieldLockInfoFactory,
    scope: S,
}

impl<S: SharednessScope> Default for GenericSharednessPolicy<S> {
    fn default() -> Self {
        Self::new(SharednessConfig::default())
    }
}

impl<S: SharednessScope> GenericSharednessPolicy<S> {
    /// Class name used by `vm.scheduler.sharedness.class`
    pub const NAME: &'static str = S::NAME;

    /// Policy with the given settings
    pub fn new(config: SharednessConfig) -> Self {
        Self {
            factory: config.lock_info_factory(),
            config,
            scope: S::default(),
        }
    }

    /// Settings
    pub const fn config(&self) -> &SharednessConfig {
        &self.config
    }

    /// Storage scope
    pub const fn scope(&self) -> &S {
        &self.scope
    }

    // ── verdicts ────────────────────────────────────────────────────────────

    fn precondition(&self, cx: &SchedCx<'_>, classes: &ClassRegistry, tid: ThreadId) -> bool {
        if cx.suppresses_first_step(tid) || !self.scope.check_other_runnables(cx.kernel, tid) {
            return false;
        }
        if self.config.never_break_methods.is_empty() {
            return true;
        }
        let Ok(ti) = cx.kernel.thread(tid) else {
            return false;
        };
        !ti.frames.iter().any(|frame| {
            classes
                .qualified_method(frame.method)
                .is_some_and(|m| matches_any(&self.config.never_break_methods, &m))
        })
    }

    fn type_verdict(&self, classes: &ClassRegistry, class: ClassId) -> Verdict {
        let lineage = classes.lineage(class);
        if lineage
            .iter()
            .any(|ci| matches_any(&self.config.never_break_types, &ci.name))
        {
            return Verdict::Never;
        }
        if lineage
            .iter()
            .any(|ci| matches_any(&self.config.always_break_types, &ci.name))
        {
            return Verdict::Always;
        }
        Verdict::Undecided
    }

    fn field_verdict(&self, ci: &ClassInfo, fi: &FieldInfo) -> Verdict {
        let name = ci.qualified_field(fi);
        if matches_any(&self.config.never_break_fields, &name) {
            Verdict::Never
        } else if matches_any(&self.config.always_break_fields, &name) {
            Verdict::Always
        } else {
            Verdict::Undecided
        }
    }

    fn object_verdict(&self, cx: &SchedCx<'_>, tid: ThreadId, obj: ObjRef, field: usize) -> Verdict {
        let classes = Arc::clone(cx.kernel.classes());
        if !self.precondition(cx, &classes, tid) {
            return Verdict::Never;
        }
        let Some(ei) = cx.kernel.heap.get(obj) else {
            return Verdict::Never;
        };
        let Some(ci) = classes.class(ei.class) else {
            return Verdict::Never;
        };
        let fi = ci.instance_fields.iter().find(|f| f.index == field);

        let mut verdict = self.type_verdict(&classes, ei.class);
        if verdict == Verdict::Undecided {
            if let Some(fi) = fi {
                verdict = self.field_verdict(&ci, fi);
            }
        }
        if verdict != Verdict::Undecided {
            return verdict;
        }

        let is_final = fi.is_some_and(|f| f.is_final);
        if ei.is_immutable()
            || (self.config.skip_finals && is_final)
            || (self.config.skip_constructed_finals && is_final && ei.attrs.contains(ElementAttrs::CONSTRUCTED))
        {
            return Verdict::Never;
        }
        if self.config.skip_inits && top_method(cx.kernel, &classes, tid).is_some_and(|m| m.is_init) {
            return Verdict::Never;
        }
        Verdict::Undecided
    }

    fn class_verdict(&self, cx: &SchedCx<'_>, tid: ThreadId, class: ClassId, field: usize) -> Verdict {
        let classes = Arc::clone(cx.kernel.classes());
        if !self.precondition(cx, &classes, tid) {
            return Verdict::Never;
        }
        let Some(ci) = classes.class(class) else {
            return Verdict::Never;
        };
        let fi = ci.static_fields.iter().find(|f| f.index == field);

        let mut verdict = self.type_verdict(&classes, class);
        if verdict == Verdict::Undecided {
            if let Some(fi) = fi {
                verdict = self.field_verdict(&ci, fi);
            }
        }
        if verdict != Verdict::Undecided {
            return verdict;
        }

        if ci.is_immutable || (self.config.skip_static_finals && fi.is_some_and(|f| f.is_final)) {
            return Verdict::Never;
        }
        // the static initializer of the class itself runs before anyone else
        // can see the statics
        if top_method(cx.kernel, &classes, tid).is_some_and(|m| m.is_clinit && m.class == class) {
            return Verdict::Never;
        }
        Verdict::Undecided
    }

    fn array_verdict(&self, cx: &SchedCx<'_>, tid: ThreadId, array: ObjRef) -> Verdict {
        let classes = Arc::clone(cx.kernel.classes());
        if !self.precondition(cx, &classes, tid) {
            return Verdict::Never;
        }
        let Some(ei) = cx.kernel.heap.get(array) else {
            return Verdict::Never;
        };
        if ei.is_immutable() {
            return Verdict::Never;
        }
        self.type_verdict(&classes, ei.class)
    }

    // ── sharedness and lock protection ──────────────────────────────────────

    /// Record the access and return `(shared, lock_protected)`
    fn update_sharedness(
        &self,
        kernel: &mut KernelState,
        tid: ThreadId,
        eref: ElementRef,
        field: Option<usize>,
    ) -> (bool, bool) {
        let set = self.scope.add_referencing_thread(kernel, eref, tid);
        let live = set
            .iter()
            .filter(|t| kernel.threads.get(*t).is_some_and(ThreadInfo::is_alive))
            .count();

        let shared = match kernel.element(eref) {
            Some(ei) if live > 1 && !ei.attrs.intersects(ElementAttrs::SHARED | ElementAttrs::FREEZE_SHARED) => {
                if let Some(ei) = kernel.element_mut(eref) {
                    ei.attrs.insert(ElementAttrs::SHARED);
                }
                debug!(element = %eref, threads = %set, "element became shared");
                true
            }
            Some(ei) => ei.is_shared(),
            None => false,
        };

        let protected = match field {
            Some(field) if shared && self.config.sync_detection => self.update_lock_info(kernel, tid, eref, field),
            _ => false,
        };
        (shared, protected)
    }

    fn update_lock_info(&self, kernel: &mut KernelState, tid: ThreadId, eref: ElementRef, field: usize) -> bool {
        let held: Vec<ObjRef> = kernel
            .thread(tid)
            .map(|ti| ti.locked_objects.to_vec())
            .unwrap_or_default();

        let info = match self.scope.lock_info(kernel, eref, field) {
            None => {
                let Some(ei) = kernel.element(eref) else {
                    return false;
                };
                let owner = FieldOwner {
                    object: match eref {
                        ElementRef::Object(obj) => Some(obj),
                        ElementRef::Static(..) => None,
                    },
                    class_object: match ei.kind {
                        ElementKind::Static { class_object } => class_object,
                        _ => None,
                    },
                    fields: &ei.fields,
                };
                let heap = &kernel.heap;
                self.factory.create(tid, &held, owner, |lock, obj| {
                    heap.get(lock)
                        .is_some_and(|l| l.fields.iter().any(|v| v.as_obj() == Some(obj)))
                })
            }
            Some(fli) => {
                let name = field_name(kernel, eref, field);
                let check = fli.check_protection(tid, &held, &name, self.factory.pindown);
                if let Some(lock) = check.pin_down {
                    if let Err(e) = kernel.heap.pin_down(lock) {
                        warn!(lock = %lock, error = %e, "cannot pin down protecting lock");
                    }
                }
                check.info
            }
        };
        let protected = info.is_protected();
        self.scope.set_lock_info(kernel, eref, field, info);
        protected
    }

    /// Thread choice over the runnables of the caller's application;
    /// nothing if atomic or there is no alternative
    fn set_shared_cg(&self, cx: &mut SchedCx<'_>, id: &str, tid: ThreadId) -> bool {
        if cx.is_atomic() {
            return false;
        }
        let app = cx.kernel.thread(tid).map(|ti| ti.app).ok();
        let choices = match app {
            Some(app) if cx.kernel.has_process_timeout_runnables(app) => cx.kernel.timeout_runnables(Some(app)),
            _ => cx.kernel.timeout_runnables(None),
        };
        if choices.len() <= 1 {
            return false;
        }
        cx.register(Box::new(ThreadChoiceFromSet::new(id, choices.as_slice(), true)))
    }

    fn sets_shared_cg(
        &self,
        cx: &mut SchedCx<'_>,
        id: &str,
        tid: ThreadId,
        eref: ElementRef,
        field: Option<usize>,
        verdict: Verdict,
    ) -> bool {
        if verdict == Verdict::Never {
            return false;
        }
        let (shared, protected) = self.update_sharedness(cx.kernel, tid, eref, field);
        if verdict == Verdict::Always || (shared && !protected) {
            self.set_shared_cg(cx, id, tid)
        } else {
            false
        }
    }
}

impl<S: SharednessScope> SharednessPolicy for GenericSharednessPolicy<S> {
    fn name(&self) -> &'static str {
        S::NAME
    }

    fn initialize_object_sharedness(&mut self, kernel: &mut KernelState, tid: ThreadId, obj: ObjRef) {
        self.scope.initialize(kernel, ElementRef::Object(obj), tid);
    }

    fn initialize_class_sharedness(&mut self, kernel: &mut KernelState, tid: ThreadId, loader: LoaderId, class: ClassId) {
        let eref = ElementRef::Static(loader, class);
        self.scope.initialize(kernel, eref, tid);
        // statics are reachable from every thread
        if let Some(ei) = kernel.element_mut(eref) {
            ei.attrs.insert(ElementAttrs::EXPOSED);
        }
    }

    fn sets_shared_object_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, obj: ObjRef, field: usize) -> bool {
        let verdict = self.object_verdict(cx, tid, obj, field);
        self.sets_shared_cg(cx, reasons::SHARED_OBJECT, tid, ElementRef::Object(obj), Some(field), verdict)
    }

    fn sets_shared_class_cg(
        &mut self,
        cx: &mut SchedCx<'_>,
        tid: ThreadId,
        loader: LoaderId,
        class: ClassId,
        field: usize,
    ) -> bool {
        let verdict = self.class_verdict(cx, tid, class, field);
        let eref = ElementRef::Static(loader, class);
        self.sets_shared_cg(cx, reasons::SHARED_CLASS, tid, eref, Some(field), verdict)
    }

    fn sets_shared_array_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, array: ObjRef, _index: usize) -> bool {
        let verdict = self.array_verdict(cx, tid, array);
        self.sets_shared_cg(cx, reasons::SHARED_ARRAY, tid, ElementRef::Object(array), None, verdict)
    }

    fn sets_exposure_cg(&mut self, cx: &mut SchedCx<'_>, tid: ThreadId, owner: ElementRef, exposed: ObjRef) -> bool {
        const VISIBLE: ElementAttrs = ElementAttrs::EXPOSED.union(ElementAttrs::SHARED);

        if !self.config.break_on_exposure || cx.suppresses_first_step(tid) {
            return false;
        }
        if !cx.kernel.element(owner).is_some_and(|ei| ei.attrs.intersects(VISIBLE)) {
            return false;
        }
        match cx.kernel.heap.get(exposed) {
            Some(ei) if !ei.is_immutable() && !ei.attrs.intersects(VISIBLE) => {}
            _ => return false,
        }
        if let Some(ei) = cx.kernel.heap.get_mut(exposed) {
            ei.attrs.insert(ElementAttrs::EXPOSED);
        }
        debug!(owner = %owner, exposed = %exposed, "object exposed");
        self.set_shared_cg(cx, reasons::EXPOSE, tid)
    }

    fn is_shared(&self, kernel: &KernelState, eref: ElementRef) -> bool {
        kernel.element(eref).is_some_and(|ei| ei.is_shared())
    }
}

fn matches_any(patterns: &[String], text: &str) -> bool {
    patterns.iter().any(|p| glob_match(p, text))
}

fn top_method(
    kernel: &KernelState,
    classes: &ClassRegistry,
    tid: ThreadId,
) -> Option<Arc<MethodInfo>> {
    let frame = kernel.thread(tid).ok()?.top_frame()?;
    classes.method(frame.method)
}

fn field_name(kernel: &KernelState, eref: ElementRef, field: usize) -> String {
    let class = match eref {
        ElementRef::Object(obj) => kernel.heap.get(obj).map(|ei| ei.class),
        ElementRef::Static(_, class) => Some(class),
    };
    let ci = class.and_then(|c| kernel.classes().class(c));
    let fi = ci.as_ref().and_then(|ci| {
        let fields = match eref {
            ElementRef::Object(_) => &ci.instance_fields,
            ElementRef::Static(..) => &ci.static_fields,
        };
        fields.iter().find(|f| f.index == field)
    });
    match (ci.as_ref(), fi) {
        (Some(ci), Some(fi)) => ci.qualified_field(fi),
        _ => format!("{eref}[{field}]"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::classes::{AppId, ClassDef, MethodFlags};
    use crate::domain::heap::{AllocationStrategy, SlotTable};
    use crate::domain::kernel::SYSTEM_LOADER;
    use crate::domain::snapshot::Restorable;
    use crate::domain::threads::StackFrame;
    use crate::domain::transition::{Listeners, SystemState};

    struct Fixture {
        kernel: KernelState,
        system: SystemState,
        listeners: Listeners,
        counter: ClassId,
        lock: ObjRef,
        t: Vec<ThreadId>,
    }

    impl Fixture {
        fn new(n: usize) -> Self {
            let reg = Arc::new(ClassRegistry::new());
            let counter = reg.define(
                ClassDef::new("app.Counter")
                    .field("count")
                    .final_field("limit")
                    .ref_field("next")
                    .static_field("instances")
                    .static_final_field("MAX"),
            );
            let lock_class = reg.define(ClassDef::new("app.Lock"));
            let run = reg.define_method(counter, "run", MethodFlags::default());
            let mut kernel = KernelState::new(reg, AllocationStrategy::Hashed, SlotTable::new(), false);
            let mut t = Vec::new();
            for i in 0..n {
                let tid = kernel.threads.create(&format!("t{i}"), AppId::new(0));
                kernel.start_thread(tid).unwrap();
                kernel.thread_mut(tid).unwrap().frames.push(StackFrame::new(run));
                t.push(tid);
            }
            let lock = kernel.new_system_object(lock_class, 0, AppId::new(0)).unwrap();
            Self {
                kernel,
                system: SystemState::default(),
                listeners: Listeners::new(),
                counter,
                lock,
                t,
            }
        }

        fn cx(&mut self) -> SchedCx<'_> {
            SchedCx::new(&mut self.kernel, &mut self.system, &mut self.listeners)
        }

        fn new_counter<P: SharednessPolicy>(&mut self, policy: &mut P, tid: ThreadId) -> ObjRef {
            let obj = self.kernel.new_object(tid, self.counter, 7).unwrap();
            policy.initialize_object_sharedness(&mut self.kernel, tid, obj);
            obj
        }

        fn clear(&mut self) {
            self.system.remove_all_next_choice_generators();
        }
    }

    #[test]
    fn test_second_thread_makes_object_shared() {
        let mut f = Fixture::new(2);
        let mut policy = PathSharednessPolicy::default();
        let (t0, t1) = (f.t[0], f.t[1]);
        let obj = f.new_counter(&mut policy, t0);

        assert!(!policy.sets_shared_object_cg(&mut f.cx(), t0, obj, 0));
        assert!(!policy.is_shared(&f.kernel, ElementRef::Object(obj)));

        assert!(policy.sets_shared_object_cg(&mut f.cx(), t1, obj, 0));
        assert!(policy.is_shared(&f.kernel, ElementRef::Object(obj)));
        let next = f.system.next_choice_generator().unwrap();
        assert_eq!(f.system.cg(next).unwrap().base().id(), "SHARED_OBJECT");
    }

    #[test]
    fn test_final_fields_are_skipped() {
        let mut f = Fixture::new(2);
        let mut policy = PathSharednessPolicy::default();
        let (t0, t1) = (f.t[0], f.t[1]);
        let obj = f.new_counter(&mut policy, t0);
        policy.sets_shared_object_cg(&mut f.cx(), t1, obj, 0);
        f.clear();
        assert!(!policy.sets_shared_object_cg(&mut f.cx(), t0, obj, 1));
    }

    #[test]
    fn test_single_runnable_never_breaks_on_path_scope() {
        let mut f = Fixture::new(2);
        let mut policy = PathSharednessPolicy::default();
        let (t0, t1) = (f.t[0], f.t[1]);
        let obj = f.new_counter(&mut policy, t0);
        f.kernel.terminate(t1).unwrap();
        assert!(!policy.sets_shared_object_cg(&mut f.cx(), t0, obj, 0));
    }

    #[test]
    fn test_lock_protection_suppresses_choice_until_violated() {
        let mut f = Fixture::new(2);
        let mut policy = PathSharednessPolicy::new(SharednessConfig {
            lock_threshold: 1,
            ..SharednessConfig::default()
        });
        let (t0, t1, lock) = (f.t[0], f.t[1], f.lock);
        let obj = f.new_counter(&mut policy, t0);

        f.kernel.lock(t1, lock).unwrap();
        assert!(policy.sets_shared_object_cg(&mut f.cx(), t1, obj, 0), "first shared access");
        f.kernel.unlock(t1, lock).unwrap();
        f.clear();

        f.kernel.lock(t0, lock).unwrap();
        assert!(!policy.sets_shared_object_cg(&mut f.cx(), t0, obj, 0), "protected after threshold");
        f.kernel.unlock(t0, lock).unwrap();

        assert!(policy.sets_shared_object_cg(&mut f.cx(), t1, obj, 0), "unprotected access");
        let eref = ElementRef::Object(obj);
        assert!(f.kernel.element(eref).unwrap().lock_info(0).is_some_and(|fli| !fli.is_protected()));
    }

    #[test]
    fn test_never_and_always_patterns() {
        let mut f = Fixture::new(2);
        let (t0, t1) = (f.t[0], f.t[1]);

        let mut quiet = PathSharednessPolicy::new(SharednessConfig {
            never_break_types: vec!["app.*".into()],
            ..SharednessConfig::default()
        });
        let obj = f.new_counter(&mut quiet, t0);
        assert!(!quiet.sets_shared_object_cg(&mut f.cx(), t1, obj, 0));

        let mut loud = PathSharednessPolicy::new(SharednessConfig {
            always_break_fields: vec!["app.Counter.count".into()],
            ..SharednessConfig::default()
        });
        let obj = f.new_counter(&mut loud, t0);
        assert!(loud.sets_shared_object_cg(&mut f.cx(), t0, obj, 0));
    }

    #[test]
    fn test_never_break_methods_mask_accesses() {
        let mut f = Fixture::new(2);
        let (t0, t1) = (f.t[0], f.t[1]);
        let mut policy = PathSharednessPolicy::new(SharednessConfig {
            never_break_methods: vec!["app.Counter.run".into()],
            ..SharednessConfig::default()
        });
        let obj = f.new_counter(&mut policy, t0);
        assert!(!policy.sets_shared_object_cg(&mut f.cx(), t1, obj, 0));
    }

    #[test]
    fn test_constructor_accesses_are_skipped() {
        let mut f = Fixture::new(2);
        let (t0, t1) = (f.t[0], f.t[1]);
        let init = f
            .kernel
            .classes()
            .define_method(f.counter, "<init>", MethodFlags { is_init: true, ..MethodFlags::default() });
        let mut policy = PathSharednessPolicy::default();
        let obj = f.new_counter(&mut policy, t0);
        f.kernel.thread_mut(t1).unwrap().frames.push(StackFrame::new(init));
        assert!(!policy.sets_shared_object_cg(&mut f.cx(), t1, obj, 0));
        f.kernel.thread_mut(t1).unwrap().frames.pop();
        assert!(policy.sets_shared_object_cg(&mut f.cx(), t1, obj, 0));
    }

    #[test]
    fn test_static_finals_and_statics() {
        let mut f = Fixture::new(2);
        let (t0, t1) = (f.t[0], f.t[1]);
        let class_class = f.kernel.classes().define(ClassDef::new("Class"));
        f.kernel.register_class(SYSTEM_LOADER, f.counter, class_class).unwrap();
        let mut policy = PathSharednessPolicy::default();
        policy.initialize_class_sharedness(&mut f.kernel, t0, SYSTEM_LOADER, f.counter);

        let counter = f.counter;
        assert!(!policy.sets_shared_class_cg(&mut f.cx(), t1, SYSTEM_LOADER, counter, 1));
        assert!(policy.sets_shared_class_cg(&mut f.cx(), t1, SYSTEM_LOADER, counter, 0));
        let next = f.system.next_choice_generator().unwrap();
        assert_eq!(f.system.cg(next).unwrap().base().id(), "SHARED_CLASS");
    }

    #[test]
    fn test_exposure_through_static_owner() {
        let mut f = Fixture::new(2);
        let t0 = f.t[0];
        let class_class = f.kernel.classes().define(ClassDef::new("Class"));
        f.kernel.register_class(SYSTEM_LOADER, f.counter, class_class).unwrap();
        let mut policy = PathSharednessPolicy::default();
        policy.initialize_class_sharedness(&mut f.kernel, t0, SYSTEM_LOADER, f.counter);
        let obj = f.new_counter(&mut policy, t0);

        let owner = ElementRef::Static(SYSTEM_LOADER, f.counter);
        assert!(policy.sets_exposure_cg(&mut f.cx(), t0, owner, obj));
        assert!(f.kernel.heap.get(obj).unwrap().attrs.contains(ElementAttrs::EXPOSED));
        f.clear();
        assert!(!policy.sets_exposure_cg(&mut f.cx(), t0, owner, obj), "already exposed");
    }

    #[test]
    fn test_global_scope_survives_restore() {
        let mut f = Fixture::new(2);
        let (t0, t1) = (f.t[0], f.t[1]);
        let mut path = PathSharednessPolicy::default();
        let mut global = GlobalSharednessPolicy::default();
        let obj = f.new_counter(&mut path, t0);
        global.initialize_object_sharedness(&mut f.kernel, t0, obj);
        let before = f.kernel.memento();

        path.sets_shared_object_cg(&mut f.cx(), t1, obj, 0);
        f.clear();
        global.sets_shared_object_cg(&mut f.cx(), t1, obj, 0);
        f.clear();

        f.kernel.restore(&before);
        assert!(!path.sets_shared_object_cg(&mut f.cx(), t0, obj, 0));
        assert!(global.sets_shared_object_cg(&mut f.cx(), t0, obj, 0));
        assert_eq!(global.scope().tracked_elements(), 1);
    }
}
