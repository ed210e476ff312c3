//! Thread Registry and Lock State
//!
//! Thread bookkeeping for the modeled program: dense ids, scheduling status,
//! call stacks (as GC roots and allocation contexts) and the per-object
//! [`Monitor`]. The lock *operations* that couple threads and monitors live
//! in [`crate::domain::kernel`], since they touch both the thread list and
//! the heap.

pub mod monitor;
pub mod registry;
pub mod thread_info;
pub mod types;

pub use monitor::Monitor;
pub use registry::{ThreadList, ThreadListMemento};
pub use thread_info::ThreadInfo;
pub use types::{StackFrame, ThreadId, ThreadSet, ThreadStatus};
