//! Heap Domain
//!
//! Backtrackable object store with canonical references.
//!
//! # Components
//!
//! - [`types`]: `ObjRef` and `Value`
//! - [`slots`]: copy-on-write slot table shared with snapshots
//! - [`element`]: object header, fields, monitor, sharedness data
//! - [`field_lock`]: lock-protection heuristic per shared field
//! - [`alloc`]: allocation identity (hashed / precise contexts, slot tables)
//! - [`store`]: the [`Heap`] itself
//! - [`gc`]: mark-sweep with toggling live bits
//!
//! # Design Notes
//!
//! References are slot indices chosen by the allocation identity, so two
//! states that performed equivalent allocations agree on every reference and
//! can be compared field by field.

pub mod alloc;
pub mod element;
pub mod field_lock;
pub mod gc;
pub mod live_bits;
pub mod slots;
pub mod store;
pub mod types;

pub use alloc::{AllocContext, AllocationStrategy, SlotTable};
pub use element::{ElementAttrs, ElementInfo, ElementKind};
pub use field_lock::{FieldLockInfo, FieldLockInfoFactory, FieldOwner};
pub use gc::{GcRoots, GcStats};
pub use store::{Heap, HeapAttrs, HeapMemento};
pub use types::{ObjRef, Value};
