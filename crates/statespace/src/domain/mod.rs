//! Domain Layer - State Space Exploration Core
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Vm<E>                                │
//! │   forward / backtrack / snapshot / restore / replay         │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │ transition::SystemState      │ scheduler::Scheduler         │
//! │  ├─ cur / next CG chain      │  ├─ SyncPolicy               │
//! │  ├─ atomic level, flags      │  └─ SharednessPolicy<Scope>  │
//! │  └─ restorers, replay        │                              │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │ choice: CgArena + ChoiceGenerator family                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │ kernel::KernelState                                         │
//! │  ├─ threads::ThreadList   (statuses, stacks)                │
//! │  ├─ statics::ClassLoaderList                                │
//! │  └─ heap::Heap            (COW slots, GC, allocation ids)   │
//! ├─────────────────────────────────────────────────────────────┤
//! │ snapshot::Restorable    classes::ClassRegistry    error     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything below [`vm`] is a plain data structure with an explicit
//! save/restore contract. Nothing in the domain layer performs I/O.

pub mod choice;
pub mod classes;
pub mod error;
pub mod heap;
pub mod kernel;
pub mod scheduler;
pub mod snapshot;
pub mod statics;
pub mod threads;
pub mod transition;
pub mod vm;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Re-exports
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub use choice::{CgArena, CgHandle, ChoiceGenerator, ChoiceValue, RandomizationPolicy, ThreadChoiceFromSet};
pub use classes::{AppId, ClassDef, ClassId, ClassRegistry, LoaderId, MethodFlags, MethodId};
pub use error::{ConfigError, EngineError, HeapError, TraceError};
pub use heap::{AllocationStrategy, ElementAttrs, ElementInfo, Heap, ObjRef, Value};
pub use kernel::{ElementRef, KernelState, SYSTEM_LOADER};
pub use scheduler::{SchedCx, Scheduler, SchedulerConfig, SharednessPolicy, SyncPolicy};
pub use snapshot::{Backtrack, Restorable, Restore, SnapshotKind};
pub use threads::{ThreadId, ThreadInfo, ThreadSet, ThreadStatus};
pub use transition::{ChoicePoint, Listeners, SystemState, TransitionConfig, VmListener};
pub use vm::{ExecutionEngine, Step, TransitionOutcome, Vm, VmConfig, VmCore, VmSnapshot};
