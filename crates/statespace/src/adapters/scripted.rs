//! Scripted Execution Collaborator
//!
//! Interprets small per-thread operation lists on top of the core. Every
//! operation follows the two-phase protocol of the transition engine:
//!
//! ```text
//!  top half (not first step)            bottom half (first step)
//!  ─────────────────────────            ─────────────────────────
//!  Lock      block / register contender  lock, pc++
//!            + BLOCK / LOCK choice
//!  Unlock    unlock + RELEASE choice      pc++
//!  Wait      wait + WAIT choice           re-acquire, pc++
//!  Notify    pick waiter (NOTIFY, non-    notify picked waiter, pc++
//!            scheduling) or notify +
//!            NOTIFY choice
//!  Read      SHARED_OBJECT choice         load field, pc++
//!  Write     SHARED_OBJECT / EXPOSE       store field, pc++
//! ```
//!
//! When a hook registers a choice generator the operation returns
//! [`Step::Reexecute`] without moving the program counter; the next
//! transition of that thread runs the same operation as its first step.
//!
//! # Program model
//!
//! - Globals are heap objects referenced from static fields of
//!   [`GLOBALS_CLASS`], so they are static GC roots.
//! - Each thread runs one frame; its program counter lives in the frame
//!   (pc 0 is the thread entry, operation `i` sits at pc `i + 1`), its
//!   registers are the frame slots. The interpreter itself is stateless.
//! - Thread 0 (`main`) is started at initialization, all others by
//!   [`Op::Start`].
//! - Programs declaring a class with a finalizer get a daemon system thread
//!   named [`FINALIZER_THREAD`]. It parks on a semaphore object and is
//!   scheduled through a [`reasons::FINALIZE`] break whenever the GC queued
//!   unreachable finalizable objects:
//!
//! ```text
//!   gc queues obj ─▶ process_finalizers ─▶ FINALIZE break ─▶ pc 0: finalize queue
//!                                                              pc 1: park + POST_FINALIZE
//! ```

use crate::domain::choice::{BreakGenerator, ChoiceGenerator, ThreadChoiceFromSet};
use crate::domain::classes::{AppId, ClassDef, ClassId, ClassRegistry, MethodFlags};
use crate::domain::error::EngineError;
use crate::domain::heap::{ObjRef, Value};
use crate::domain::kernel::sync::NotifyOutcome;
use crate::domain::kernel::{ElementRef, SYSTEM_LOADER};
use crate::domain::scheduler::{reasons, SchedCx, Scheduler, SharednessPolicy, SyncPolicy};
use crate::domain::threads::{StackFrame, ThreadId, ThreadStatus};
use crate::domain::vm::{ExecutionEngine, Step, VmCore};
use std::sync::Arc;
use tracing::debug;

/// Class holding one static reference per global
pub const GLOBALS_CLASS: &str = "app.Globals";
/// Class declaring one method per scripted thread
pub const SCRIPT_CLASS: &str = "app.Script";
/// Name of the finalizer thread and its method in [`SCRIPT_CLASS`]
pub const FINALIZER_THREAD: &str = "finalizer";
const THREAD_CLASS: &str = "lang.Thread";
const CLASS_CLASS: &str = "lang.Class";
const SEMAPHORE_CLASS: &str = "lang.Semaphore";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Program
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Value source of a [`Op::Write`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// Literal integer
    Const(i64),
    /// Register content
    Slot(usize),
    /// Register content plus a constant (integers only)
    SlotPlus(usize, i64),
    /// Another global
    Global(usize),
}

/// One scripted operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Enter the monitor of a global
    Lock(usize),
    /// Leave the monitor of a global
    Unlock(usize),
    /// `wait()` on a global (monitor must be held)
    Wait(usize),
    /// `notify()` on a global (monitor must be held)
    Notify(usize),
    /// `notifyAll()` on a global (monitor must be held)
    NotifyAll(usize),
    /// Load a field of a global into a register
    Read {
        /// Global index
        global: usize,
        /// Field name
        field: String,
        /// Destination register
        slot: usize,
    },
    /// Store into a field of a global
    Write {
        /// Global index
        global: usize,
        /// Field name
        field: String,
        /// Stored value
        value: Operand,
    },
    /// Terminate with an uncaught exception unless the register holds `equals`
    Assert {
        /// Checked register
        slot: usize,
        /// Expected integer
        equals: i64,
        /// Exception message
        message: String,
    },
    /// Allocate an instance of a program class into a register
    Alloc {
        /// Class name
        class: String,
        /// Destination register
        slot: usize,
    },
    /// `Thread.yield()`
    Yield,
    /// `Thread.sleep()`
    Sleep,
    /// Start thread with the given index
    Start(usize),
    /// Join thread with the given index
    Join(usize),
    /// Enter an atomic section
    BeginAtomic,
    /// Leave an atomic section
    EndAtomic,
}

/// A program class: name plus instance fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDecl {
    /// Fully qualified name
    pub name: String,
    /// Instance fields (all may hold references)
    pub fields: Vec<String>,
    /// Fields that are final
    pub final_fields: Vec<String>,
    /// Instances are finalized before they are released
    pub finalizer: bool,
}

/// A named global object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalDecl {
    /// Static field name in [`GLOBALS_CLASS`]
    pub name: String,
    /// Class of the object
    pub class: String,
}

/// One scripted thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadScript {
    /// Thread name (also the method name in [`SCRIPT_CLASS`])
    pub name: String,
    /// Operations, executed in order
    pub ops: Vec<Op>,
}

/// Classes, globals and threads of a scripted program
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
    /// Name, used as the trace application name
    pub name: String,
    /// Program classes
    pub classes: Vec<ClassDecl>,
    /// Global objects
    pub globals: Vec<GlobalDecl>,
    /// Threads; index 0 is started automatically
    pub threads: Vec<ThreadScript>,
}

impl Program {
    /// Empty program
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Declare a class
    #[must_use]
    pub fn class(mut self, name: &str, fields: &[&str]) -> Self {
        self.classes.push(ClassDecl {
            name: name.to_string(),
            fields: fields.iter().map(|f| (*f).to_string()).collect(),
            final_fields: Vec::new(),
            finalizer: false,
        });
        self
    }

    /// Mark fields of the last declared class final
    #[must_use]
    pub fn with_final(mut self, fields: &[&str]) -> Self {
        if let Some(last) = self.classes.last_mut() {
            last.final_fields.extend(fields.iter().map(|f| (*f).to_string()));
        }
        self
    }

    /// Give the last declared class a finalizer
    #[must_use]
    pub fn with_finalizer(mut self) -> Self {
        if let Some(last) = self.classes.last_mut() {
            last.finalizer = true;
        }
        self
    }

    /// Any class needs the finalizer thread
    pub fn has_finalizers(&self) -> bool {
        self.classes.iter().any(|c| c.finalizer)
    }

    /// Declare a global instance of `class`
    #[must_use]
    pub fn global(mut self, name: &str, class: &str) -> Self {
        self.globals.push(GlobalDecl {
            name: name.to_string(),
            class: class.to_string(),
        });
        self
    }

    /// Add a thread
    #[must_use]
    pub fn thread(mut self, name: &str, ops: Vec<Op>) -> Self {
        self.threads.push(ThreadScript {
            name: name.to_string(),
            ops,
        });
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Built-in scenarios
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Names accepted by [`scenario`]
pub const SCENARIOS: &[&str] = &[
    "abba",
    "racy-counter",
    "locked-counter",
    "wait-notify",
    "publish",
    "finalize",
];

/// Built-in program by name
pub fn scenario(name: &str) -> Option<Program> {
    let program = match name {
        // two threads taking two locks in opposite order
        "abba" => Program::new(name)
            .class("app.Lock", &[])
            .global("a", "app.Lock")
            .global("b", "app.Lock")
            .thread("main", vec![Op::Start(1), Op::Start(2)])
            .thread("t1", vec![Op::Lock(0), Op::Lock(1), Op::Unlock(1), Op::Unlock(0)])
            .thread("t2", vec![Op::Lock(1), Op::Lock(0), Op::Unlock(0), Op::Unlock(1)]),
        "racy-counter" => counter_program(name, false),
        "locked-counter" => counter_program(name, true),
        // notify before wait loses the wakeup
        "wait-notify" => Program::new(name)
            .class("app.Monitor", &[])
            .global("m", "app.Monitor")
            .thread("main", vec![Op::Start(1), Op::Start(2)])
            .thread("waiter", vec![Op::Lock(0), Op::Wait(0), Op::Unlock(0)])
            .thread("notifier", vec![Op::Lock(0), Op::Notify(0), Op::Unlock(0)]),
        // a freshly allocated node escapes through a shared holder
        "publish" => Program::new(name)
            .class("app.Holder", &["node"])
            .class("app.Node", &["value"])
            .global("holder", "app.Holder")
            .thread("main", vec![Op::Start(1), Op::Start(2)])
            .thread(
                "producer",
                vec![
                    Op::Alloc {
                        class: "app.Node".into(),
                        slot: 0,
                    },
                    Op::Write {
                        global: 0,
                        field: "node".into(),
                        value: Operand::Slot(0),
                    },
                ],
            )
            .thread(
                "consumer",
                vec![Op::Read {
                    global: 0,
                    field: "node".into(),
                    slot: 0,
                }],
            ),
        // main drops a finalizable resource before starting the worker
        "finalize" => Program::new(name)
            .class("app.Resource", &[])
            .with_finalizer()
            .class("app.Node", &["value"])
            .global("holder", "app.Node")
            .thread(
                "main",
                vec![
                    Op::Alloc {
                        class: "app.Resource".into(),
                        slot: 0,
                    },
                    Op::Alloc {
                        class: "app.Node".into(),
                        slot: 0,
                    },
                    Op::Start(1),
                    Op::Join(1),
                ],
            )
            .thread("worker", vec![Op::Yield]),
        _ => return None,
    };
    Some(program)
}

fn counter_program(name: &str, locked: bool) -> Program {
    let increment = |locked: bool| {
        let mut ops = vec![
            Op::Read {
                global: 0,
                field: "count".into(),
                slot: 0,
            },
            Op::Write {
                global: 0,
                field: "count".into(),
                value: Operand::SlotPlus(0, 1),
            },
        ];
        if locked {
            ops.insert(0, Op::Lock(0));
            ops.push(Op::Unlock(0));
        }
        ops
    };
    Program::new(name)
        .class("app.Counter", &["count"])
        .global("counter", "app.Counter")
        .thread(
            "main",
            vec![
                Op::Write {
                    global: 0,
                    field: "count".into(),
                    value: Operand::Const(0),
                },
                Op::Start(1),
                Op::Start(2),
                Op::Join(1),
                Op::Join(2),
                Op::Read {
                    global: 0,
                    field: "count".into(),
                    slot: 0,
                },
                Op::Assert {
                    slot: 0,
                    equals: 2,
                    message: "lost update".into(),
                },
            ],
        )
        .thread("inc1", increment(locked))
        .thread("inc2", increment(locked))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Interpreter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy)]
struct Finalizer {
    tid: ThreadId,
    /// Parked on while the queue is empty, also kept in frame slot 0
    semaphore: ObjRef,
}

#[derive(Debug, Clone)]
struct Layout {
    globals_class: ClassId,
    threads: Vec<ThreadId>,
    finalizer: Option<Finalizer>,
}

/// [`ExecutionEngine`] running a [`Program`]
#[derive(Debug, Clone)]
pub struct ScriptedProgram {
    program: Arc<Program>,
    layout: Option<Layout>,
}

impl ScriptedProgram {
    /// Interpreter for `program`
    pub fn new(program: Program) -> Self {
        Self {
            program: Arc::new(program),
            layout: None,
        }
    }

    /// Interpreted program
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Thread id of the thread with script index `index`
    pub fn thread_id(&self, index: usize) -> Option<ThreadId> {
        self.layout.as_ref()?.threads.get(index).copied()
    }

    /// Thread running the finalizers, if the program declares any
    pub fn finalizer_thread(&self) -> Option<ThreadId> {
        Some(self.layout.as_ref()?.finalizer?.tid)
    }

    /// Object referenced by global `index` in the current state
    pub fn global(&self, core: &VmCore, index: usize) -> Result<ObjRef, EngineError> {
        let layout = self.layout()?;
        core.kernel
            .statics
            .static_element(SYSTEM_LOADER, layout.globals_class)
            .and_then(|ei| ei.field(index))
            .and_then(|v| v.as_obj())
            .ok_or_else(|| setup_error(format!("global #{index} is not initialized")))
    }

    fn layout(&self) -> Result<&Layout, EngineError> {
        self.layout
            .as_ref()
            .ok_or_else(|| setup_error("program not initialized".to_string()))
    }

    fn script_index(&self, tid: ThreadId) -> Result<usize, EngineError> {
        self.layout()?
            .threads
            .iter()
            .position(|t| *t == tid)
            .ok_or_else(|| EngineError::Execution {
                thread: tid,
                message: "thread is not part of the program".to_string(),
            })
    }

    fn field_index(core: &VmCore, tid: ThreadId, obj: ObjRef, field: &str) -> Result<usize, EngineError> {
        let class = core.kernel.heap.element(obj)?.class;
        core.kernel
            .classes()
            .class(class)
            .and_then(|ci| ci.instance_field(field).map(|f| f.index))
            .ok_or_else(|| EngineError::Execution {
                thread: tid,
                message: format!("no field '{field}' in {obj}"),
            })
    }

    fn operand(&self, core: &VmCore, tid: ThreadId, operand: &Operand) -> Result<Value, EngineError> {
        Ok(match operand {
            Operand::Const(v) => Value::Int(*v),
            Operand::Slot(slot) => slot_value(core, tid, *slot)?,
            Operand::SlotPlus(slot, delta) => match slot_value(core, tid, *slot)? {
                Value::Int(v) => Value::Int(v + delta),
                other => {
                    return Err(EngineError::Execution {
                        thread: tid,
                        message: format!("arithmetic on non-integer register value {other}"),
                    })
                }
            },
            Operand::Global(g) => Value::Ref(self.global(core, *g)?),
        })
    }

    fn thread_target(&self, index: usize) -> Result<ThreadId, EngineError> {
        self.thread_id(index)
            .ok_or_else(|| setup_error(format!("no thread with index {index}")))
    }

    fn create_finalizer(
        core: &mut VmCore,
        registry: &ClassRegistry,
        script_class: ClassId,
        thread_class: ClassId,
        anchor: u32,
    ) -> Result<Finalizer, EngineError> {
        let app = AppId::new(0);
        let semaphore_class = registry.define(ClassDef::new(SEMAPHORE_CLASS));
        let method = registry.define_method(script_class, FINALIZER_THREAD, MethodFlags::default());
        let tid = core.kernel.threads.create(FINALIZER_THREAD, app);
        let thread_obj = core.kernel.new_system_object(thread_class, anchor, app)?;
        let semaphore = core.kernel.new_system_object(semaphore_class, anchor, app)?;

        let ti = core.kernel.thread_mut(tid)?;
        ti.thread_obj = Some(thread_obj);
        ti.daemon = true;
        ti.system = true;
        let mut frame = StackFrame::new(method);
        frame.slots.push(Value::Ref(semaphore));
        ti.frames.push(frame);
        core.kernel.start_thread(tid)?;
        core.kernel.wait(tid, semaphore, None, false)?;
        Ok(Finalizer { tid, semaphore })
    }

    /// pc 0 finalizes everything queued, pc 1 parks again and offers the
    /// application threads a scheduling point
    fn run_finalizer(core: &mut VmCore, fin: Finalizer) -> Result<Step, EngineError> {
        if core.pc(fin.tid)? == 0 {
            let queue = core.kernel.heap.finalizer_queue().to_vec();
            for obj in &queue {
                core.kernel.heap.finalized(*obj)?;
            }
            debug!(thread = %fin.tid, finalized = queue.len(), "finalizers ran");
            core.system.activate_gc();
            return advance(core, fin.tid);
        }

        if let Some(frame) = core.kernel.thread_mut(fin.tid)?.top_frame_mut() {
            frame.pc = 0;
        }
        core.kernel.wait(fin.tid, fin.semaphore, None, false)?;
        if !core.with_scheduler(|s, cx| s.sets_post_finalize_cg(cx, fin.tid)) {
            debug!(thread = %fin.tid, "no application thread left after finalization");
        }
        Ok(Step::Exit)
    }

    fn finish(core: &mut VmCore, tid: ThreadId) -> Result<Step, EngineError> {
        core.kernel.terminate(tid)?;
        core.system.activate_gc();
        core.with_scheduler(|s, cx| s.sets_terminate_cg(cx, tid));
        Ok(Step::Exit)
    }

    fn execute(&self, core: &mut VmCore, tid: ThreadId, op: &Op) -> Result<Step, EngineError> {
        let first = core.is_first_step();
        match op {
            Op::Lock(g) => {
                let obj = self.global(core, *g)?;
                if !core.kernel.can_lock(tid, obj)? {
                    core.kernel.block(tid, obj)?;
                    return reexecute_or_fail(core, tid, |s, cx| s.sets_blocked_thread_cg(cx, tid, obj));
                }
                let reentrant = core.kernel.thread(tid)?.holds_lock(obj);
                if !first && !reentrant && core.with_scheduler(|s, cx| s.sets_lock_acquisition_cg(cx, tid, obj)) {
                    core.kernel.register_lock_contender(tid, obj)?;
                    return Ok(Step::Reexecute);
                }
                core.kernel.lock(tid, obj)?;
                advance(core, tid)
            }
            Op::Unlock(g) => {
                if first {
                    return advance(core, tid);
                }
                let obj = self.global(core, *g)?;
                let did_unblock = core.kernel.unlock(tid, obj)?;
                if core.with_scheduler(|s, cx| s.sets_lock_release_cg(cx, tid, obj, did_unblock)) {
                    return Ok(Step::Reexecute);
                }
                advance(core, tid)
            }
            Op::Wait(g) => {
                let obj = self.global(core, *g)?;
                if first && core.kernel.thread(tid)?.lock_count > 0 {
                    core.kernel.lock_notified(tid, obj)?;
                    return advance(core, tid);
                }
                core.kernel.wait(tid, obj, None, true)?;
                reexecute_or_fail(core, tid, |s, cx| s.sets_wait_cg(cx, tid, None))
            }
            Op::Notify(g) => {
                let obj = self.global(core, *g)?;
                if first {
                    if let Some(waiter) = picked_waiter(core) {
                        core.kernel.notify(tid, obj, Some(waiter), true)?;
                    }
                    return advance(core, tid);
                }
                match core.kernel.notify(tid, obj, None, true)? {
                    NotifyOutcome::NeedsChoice => {
                        let waiters = core.kernel.waiters(obj)?;
                        let cg = ThreadChoiceFromSet::new(reasons::NOTIFY, waiters.as_slice(), false);
                        if core.with_scheduler(|_, cx| cx.register(Box::new(cg))) {
                            return Ok(Step::Reexecute);
                        }
                        // ignored transition, nothing to pick
                        advance(core, tid)
                    }
                    outcome => {
                        let did_notify = matches!(outcome, NotifyOutcome::Notified(_));
                        if core.with_scheduler(|s, cx| s.sets_notify_cg(cx, tid, did_notify)) {
                            return Ok(Step::Reexecute);
                        }
                        advance(core, tid)
                    }
                }
            }
            Op::NotifyAll(g) => {
                if first {
                    return advance(core, tid);
                }
                let obj = self.global(core, *g)?;
                let did_notify = core.kernel.notify_all(tid, obj, true)?;
                if core.with_scheduler(|s, cx| s.sets_notify_all_cg(cx, tid, did_notify)) {
                    return Ok(Step::Reexecute);
                }
                advance(core, tid)
            }
            Op::Read { global, field, slot } => {
                let obj = self.global(core, *global)?;
                let index = Self::field_index(core, tid, obj, field)?;
                if !first && core.with_scheduler(|s, cx| s.sets_shared_object_cg(cx, tid, obj, index)) {
                    return Ok(Step::Reexecute);
                }
                let value = core.kernel.heap.field(obj, index)?;
                set_slot(core, tid, *slot, value)?;
                advance(core, tid)
            }
            Op::Write { global, field, value } => {
                let obj = self.global(core, *global)?;
                let index = Self::field_index(core, tid, obj, field)?;
                let value = self.operand(core, tid, value)?;
                if !first {
                    if core.with_scheduler(|s, cx| s.sets_shared_object_cg(cx, tid, obj, index)) {
                        return Ok(Step::Reexecute);
                    }
                    if let Some(exposed) = value.as_obj() {
                        let owner = ElementRef::Object(obj);
                        if core.with_scheduler(|s, cx| s.sets_exposure_cg(cx, tid, owner, exposed)) {
                            return Ok(Step::Reexecute);
                        }
                    }
                }
                core.kernel.heap.set_field(obj, index, value)?;
                advance(core, tid)
            }
            Op::Assert { slot, equals, message } => {
                if slot_value(core, tid, *slot)? == Value::Int(*equals) {
                    return advance(core, tid);
                }
                debug!(thread = %tid, message = message.as_str(), "assertion failed");
                core.kernel.thread_mut(tid)?.uncaught_exception =
                    Some(Arc::from(format!("lang.AssertionError: {message}")));
                Self::finish(core, tid)
            }
            Op::Alloc { class, slot } => {
                let class_id = core
                    .kernel
                    .classes()
                    .class_by_name(class)
                    .map(|ci| ci.id)
                    .ok_or_else(|| setup_error(format!("unknown class {class}")))?;
                let site = core.pc(tid)?;
                let obj = core.new_object(tid, class_id, site)?;
                set_slot(core, tid, *slot, Value::Ref(obj))?;
                advance(core, tid)
            }
            Op::Yield => {
                if !first && core.with_scheduler(|s, cx| s.sets_yield_cg(cx, tid)) {
                    return Ok(Step::Reexecute);
                }
                advance(core, tid)
            }
            Op::Sleep => {
                if first {
                    core.kernel.wake(tid)?;
                    return advance(core, tid);
                }
                core.kernel.sleep(tid)?;
                if core.with_scheduler(|s, cx| s.sets_sleep_cg(cx, tid, 0)) {
                    return Ok(Step::Reexecute);
                }
                core.kernel.wake(tid)?;
                advance(core, tid)
            }
            Op::Start(index) => {
                if first {
                    return advance(core, tid);
                }
                let target = self.thread_target(*index)?;
                core.kernel.start_thread(target)?;
                if core.with_scheduler(|s, cx| s.sets_start_cg(cx, tid, target)) {
                    return Ok(Step::Reexecute);
                }
                advance(core, tid)
            }
            Op::Join(index) => {
                let target = self.thread_target(*index)?;
                let joinee = core.kernel.thread(target)?;
                if joinee.status == ThreadStatus::Terminated {
                    return advance(core, tid);
                }
                let thread_obj = joinee.thread_obj.ok_or_else(|| setup_error(format!("{target} has no thread object")))?;
                core.kernel.wait(tid, thread_obj, None, false)?;
                reexecute_or_fail(core, tid, |s, cx| s.sets_join_cg(cx, tid, target, None))
            }
            Op::BeginAtomic => {
                if !first && core.with_scheduler(|s, cx| s.sets_begin_atomic_cg(cx, tid)) {
                    return Ok(Step::Reexecute);
                }
                core.system.inc_atomic();
                advance(core, tid)
            }
            Op::EndAtomic => {
                if first {
                    return advance(core, tid);
                }
                core.system.dec_atomic();
                if core.with_scheduler(|s, cx| s.sets_end_atomic_cg(cx, tid)) {
                    return Ok(Step::Reexecute);
                }
                advance(core, tid)
            }
        }
    }
}

impl ExecutionEngine for ScriptedProgram {
    fn initialize(&mut self, core: &mut VmCore) -> Result<(), EngineError> {
        let registry = Arc::clone(core.kernel.classes());
        let class_class = registry.define(ClassDef::new(CLASS_CLASS));
        let thread_class = registry.define(ClassDef::new(THREAD_CLASS));
        let script_class = registry.define(ClassDef::new(SCRIPT_CLASS));
        for decl in &self.program.classes {
            let mut def = ClassDef::new(decl.name.as_str());
            if decl.finalizer {
                def = def.finalizer();
            }
            for field in &decl.fields {
                def = if decl.final_fields.contains(field) {
                    def.final_field(field)
                } else {
                    def.ref_field(field)
                };
            }
            registry.define(def);
        }
        let globals_class = registry.define(
            self.program
                .globals
                .iter()
                .fold(ClassDef::new(GLOBALS_CLASS), |def, g| def.static_ref_field(&g.name)),
        );

        let app = AppId::new(0);
        let mut threads = Vec::with_capacity(self.program.threads.len());
        for (i, script) in self.program.threads.iter().enumerate() {
            let tid = core.kernel.threads.create(&script.name, app);
            let method = registry.define_method(script_class, &script.name, MethodFlags::default());
            let anchor = u32::try_from(i).unwrap_or(u32::MAX);
            let thread_obj = core.kernel.new_system_object(thread_class, anchor, app)?;
            let ti = core.kernel.thread_mut(tid)?;
            ti.thread_obj = Some(thread_obj);
            ti.frames.push(StackFrame::new(method));
            threads.push(tid);
        }
        let main = *threads
            .first()
            .ok_or_else(|| setup_error("program has no threads".to_string()))?;
        core.kernel.start_thread(main)?;
        let finalizer = if self.program.has_finalizers() {
            let anchor = u32::try_from(threads.len()).unwrap_or(u32::MAX);
            Some(Self::create_finalizer(core, &registry, script_class, thread_class, anchor)?)
        } else {
            None
        };

        core.register_class(main, SYSTEM_LOADER, globals_class, class_class)?;
        for (i, global) in self.program.globals.iter().enumerate() {
            let class = registry
                .class_by_name(&global.class)
                .ok_or_else(|| setup_error(format!("unknown class {}", global.class)))?;
            let site = u32::try_from(i).unwrap_or(u32::MAX);
            let obj = core.new_object(main, class.id, site)?;
            let statics = core
                .kernel
                .statics
                .static_element_mut(SYSTEM_LOADER, globals_class)
                .ok_or_else(|| setup_error("globals not registered".to_string()))?;
            statics.set_field(i, Value::Ref(obj));
        }

        debug!(
            program = self.program.name.as_str(),
            threads = threads.len(),
            globals = self.program.globals.len(),
            "scripted program initialized"
        );
        self.layout = Some(Layout {
            globals_class,
            threads,
            finalizer,
        });
        Ok(())
    }

    fn step(&mut self, core: &mut VmCore, tid: ThreadId) -> Result<Step, EngineError> {
        if let Some(fin) = self.layout()?.finalizer.filter(|f| f.tid == tid) {
            return Self::run_finalizer(core, fin);
        }
        let pc = core.pc(tid)?;
        if pc == 0 {
            return advance(core, tid);
        }
        let program = Arc::clone(&self.program);
        let index = self.script_index(tid)?;
        match program.threads[index].ops.get(pc as usize - 1) {
            Some(op) => self.execute(core, tid, op),
            None => Self::finish(core, tid),
        }
    }

    /// Wake the parked finalizer thread. It only replaces a pending plain
    /// scheduling point; otherwise the queue waits for a later transition.
    fn process_finalizers(&mut self, core: &mut VmCore, queue: Vec<ObjRef>) -> Result<(), EngineError> {
        let Some(fin) = self.layout()?.finalizer else {
            for obj in queue {
                core.kernel.heap.finalized(obj)?;
            }
            return Ok(());
        };
        let ti = core.kernel.thread(fin.tid)?;
        if ti.status != ThreadStatus::Waiting || ti.lock_ref != Some(fin.semaphore) {
            return Ok(());
        }
        if let Some(next) = core.system.next_choice_generator() {
            let replaceable = core
                .system
                .cg(next)
                .is_some_and(|cg| cg.is_scheduling_point() && !cg.base().is_cascaded());
            if !replaceable {
                return Ok(());
            }
            core.system.remove_next_choice_generator();
        }

        core.kernel.resume_non_locked_waiter(fin.tid, fin.semaphore)?;
        let cg = BreakGenerator::new(reasons::FINALIZE, fin.tid);
        core.system
            .set_mandatory_next_choice_generator(Box::new(cg), &mut core.listeners, "finalizer wakeup")?;
        debug!(thread = %fin.tid, queued = queue.len(), "finalizer scheduled");
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn setup_error(message: String) -> EngineError {
    EngineError::Execution {
        thread: ThreadId::new(0),
        message,
    }
}

fn advance(core: &mut VmCore, tid: ThreadId) -> Result<Step, EngineError> {
    core.advance_pc(tid)?;
    Ok(Step::Continue)
}

/// Run a blocking hook. A thread left runnable without a scheduling point
/// would spin on the same operation.
fn reexecute_or_fail(
    core: &mut VmCore,
    tid: ThreadId,
    hook: impl FnOnce(&mut Scheduler, &mut SchedCx<'_>) -> bool,
) -> Result<Step, EngineError> {
    if core.with_scheduler(hook) || core.system.is_ignored() {
        return Ok(Step::Reexecute);
    }
    if !core.kernel.thread(tid)?.is_runnable() {
        return Ok(Step::Exit);
    }
    Err(EngineError::Execution {
        thread: tid,
        message: "blocking operation left the thread runnable".to_string(),
    })
}

fn slot_value(core: &VmCore, tid: ThreadId, slot: usize) -> Result<Value, EngineError> {
    Ok(core
        .kernel
        .thread(tid)?
        .top_frame()
        .and_then(|f| f.slots.get(slot).copied())
        .unwrap_or_default())
}

fn set_slot(core: &mut VmCore, tid: ThreadId, slot: usize, value: Value) -> Result<(), EngineError> {
    let frame = core
        .kernel
        .thread_mut(tid)?
        .top_frame_mut()
        .ok_or_else(|| EngineError::Execution {
            thread: tid,
            message: "no frame".to_string(),
        })?;
    if frame.slots.len() <= slot {
        frame.slots.resize(slot + 1, Value::Null);
    }
    frame.slots[slot] = value;
    Ok(())
}

/// Waiter picked by a pending non-scheduling NOTIFY choice
fn picked_waiter(core: &VmCore) -> Option<ThreadId> {
    let cur = core.system.current_choice_generator()?;
    let cg = core.system.cg(cur)?;
    if cg.is_scheduling_point() || cg.base().id() != reasons::NOTIFY {
        return None;
    }
    if !cg.is::<ThreadChoiceFromSet>() {
        return None;
    }
    cg.next_thread()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::classes::ClassRegistry;
    use crate::domain::vm::{Vm, VmConfig};

    fn vm(program: Program) -> Vm<ScriptedProgram> {
        let mut vm = Vm::new(
            &VmConfig::default(),
            Arc::new(ClassRegistry::new()),
            ScriptedProgram::new(program),
        )
        .unwrap();
        vm.initialize().unwrap();
        vm
    }

    /// Follow the first choice everywhere until the path ends
    fn run_first_path(vm: &mut Vm<ScriptedProgram>) {
        while let Some(outcome) = vm.forward().unwrap() {
            if outcome.is_end {
                break;
            }
        }
    }

    #[test]
    fn test_every_scenario_initializes() {
        for name in SCENARIOS {
            let program = scenario(name).unwrap();
            let vm = vm(program);
            assert_eq!(vm.state_id(), Some(0), "{name}");
            assert!(vm.engine().global(vm.core(), 0).is_ok(), "{name}");
        }
        assert!(scenario("nope").is_none());
    }

    #[test]
    fn test_globals_are_static_roots() {
        let mut vm = vm(scenario("abba").unwrap());
        let a = vm.engine().global(vm.core(), 0).unwrap();
        let stats = vm.core_mut().kernel.gc();
        assert!(!stats.released.contains(&a));
        assert!(vm.kernel().heap.is_alive(a));
    }

    #[test]
    fn test_main_starts_other_threads() {
        let mut vm = vm(scenario("abba").unwrap());
        let t1 = vm.engine().thread_id(1).unwrap();
        assert_eq!(vm.kernel().thread(t1).unwrap().status, ThreadStatus::New);
        vm.forward().unwrap().unwrap();
        assert_eq!(vm.kernel().thread(t1).unwrap().status, ThreadStatus::Running);
    }

    #[test]
    fn test_locked_counter_first_path_counts_two() {
        let mut vm = vm(scenario("locked-counter").unwrap());
        run_first_path(&mut vm);
        let counter = vm.engine().global(vm.core(), 0).unwrap();
        assert_eq!(vm.kernel().heap.field(counter, 0).unwrap(), Value::Int(2));
        assert!(vm.kernel().threads.iter().all(|t| t.uncaught_exception.is_none()));
        assert!(vm.is_end_state());
    }

    #[test]
    fn test_lock_blocks_contender() {
        let program = Program::new("block")
            .class("app.Lock", &[])
            .global("l", "app.Lock")
            .thread("main", vec![Op::Lock(0), Op::Start(1), Op::Unlock(0)])
            .thread("t", vec![Op::Lock(0), Op::Unlock(0)]);
        let mut vm = vm(program);
        let main = vm.engine().thread_id(0).unwrap();
        let t = vm.engine().thread_id(1).unwrap();
        let l = vm.engine().global(vm.core(), 0).unwrap();

        // main locks and starts t, START offers main first, then t
        vm.forward().unwrap().unwrap();
        vm.forward().unwrap().unwrap();
        assert!(vm.backtrack());
        let outcome = vm.forward().unwrap().unwrap();
        assert_eq!(outcome.thread, t);
        assert_eq!(vm.kernel().thread(t).unwrap().status, ThreadStatus::Blocked);
        assert_eq!(vm.kernel().heap.element(l).unwrap().monitor.owner(), Some(main));
    }

    #[test]
    fn test_assert_failure_sets_uncaught_exception() {
        let program = Program::new("assert")
            .class("app.Cell", &["v"])
            .global("c", "app.Cell")
            .thread(
                "main",
                vec![
                    Op::Read {
                        global: 0,
                        field: "v".into(),
                        slot: 0,
                    },
                    Op::Assert {
                        slot: 0,
                        equals: 1,
                        message: "v must be 1".into(),
                    },
                ],
            );
        let mut vm = vm(program);
        run_first_path(&mut vm);
        let main = vm.engine().thread_id(0).unwrap();
        let ti = vm.kernel().thread(main).unwrap();
        assert_eq!(ti.status, ThreadStatus::Terminated);
        assert!(ti.uncaught_exception.as_deref().unwrap().contains("v must be 1"));
    }

    #[test]
    fn test_alloc_stores_reference_in_register() {
        let program = Program::new("alloc")
            .class("app.Node", &["value"])
            .class("app.Holder", &["node"])
            .global("h", "app.Holder")
            .thread(
                "main",
                vec![
                    Op::Alloc {
                        class: "app.Node".into(),
                        slot: 1,
                    },
                    Op::Write {
                        global: 0,
                        field: "node".into(),
                        value: Operand::Slot(1),
                    },
                ],
            );
        let mut vm = vm(program);
        run_first_path(&mut vm);
        let holder = vm.engine().global(vm.core(), 0).unwrap();
        let node = vm.kernel().heap.field(holder, 0).unwrap().as_obj().unwrap();
        assert!(vm.kernel().heap.is_alive(node));
    }

    #[test]
    fn test_wait_without_lock_is_a_heap_error() {
        let program = Program::new("bad-wait")
            .class("app.Monitor", &[])
            .global("m", "app.Monitor")
            .thread("main", vec![Op::Wait(0)]);
        let mut vm = vm(program);
        assert!(matches!(vm.forward(), Err(EngineError::Heap(_))));
    }

    #[test]
    fn test_finalizer_thread_finalizes_then_gc_releases() {
        let mut vm = vm(scenario("finalize").unwrap());
        let fin = vm.engine().finalizer_thread().unwrap();
        let worker = vm.engine().thread_id(1).unwrap();
        assert_eq!(vm.kernel().thread(fin).unwrap().status, ThreadStatus::Waiting);

        // the dropped resource survives the gc in the finalizer queue
        vm.forward().unwrap().unwrap();
        let queued = vm.kernel().heap.finalizer_queue().to_vec();
        assert_eq!(queued.len(), 1);
        let resource = queued[0];
        assert!(vm.kernel().heap.is_alive(resource));
        assert_eq!(vm.kernel().thread(fin).unwrap().status, ThreadStatus::Running);
        let next = vm.system().next_choice_generator().unwrap();
        assert_eq!(vm.system().cg(next).unwrap().base().id(), reasons::FINALIZE);

        let outcome = vm.forward().unwrap().unwrap();
        assert_eq!(outcome.thread, fin);
        assert_eq!(vm.kernel().thread(fin).unwrap().status, ThreadStatus::Waiting);
        assert!(vm.kernel().heap.finalizer_queue().is_empty());
        assert!(vm.kernel().heap.get(resource).is_none());
        let next = vm.system().next_choice_generator().unwrap();
        let cg = vm.system().cg(next).unwrap();
        assert_eq!(cg.base().id(), reasons::POST_FINALIZE);
        assert!(cg.all_choices().iter().any(|c| c.as_thread() == Some(worker)));

        run_first_path(&mut vm);
        assert!(vm.is_end_state());
        assert!(!vm.is_deadlocked());
    }

    #[test]
    fn test_programs_without_finalizers_have_no_finalizer_thread() {
        let vm = vm(scenario("publish").unwrap());
        assert!(vm.engine().finalizer_thread().is_none());
        assert!(vm.kernel().threads.iter().all(|t| !t.system));
    }

    #[test]
    fn test_join_waits_for_termination() {
        let program = Program::new("join")
            .thread("main", vec![Op::Start(1), Op::Join(1)])
            .thread("worker", vec![Op::Yield]);
        let mut vm = vm(program);
        run_first_path(&mut vm);
        assert!(vm.is_end_state());
        assert!(vm
            .kernel()
            .threads
            .iter()
            .all(|t| t.status == ThreadStatus::Terminated));
    }
}
