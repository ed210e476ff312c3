//! Thread List
//!
//! Dense, path-local registry of [`ThreadInfo`] entries. Entries are held in
//! `Arc`s so a memento is a shallow vector copy; the first mutation of an
//! entry after a capture clones just that entry.
//!
//! ```text
//!   live list:   [Arc(T0)] [Arc(T1)] [Arc(T2)]
//!                    │         │         │
//!   memento:     [Arc(T0)] [Arc(T1)] [Arc(T2)]      (shared)
//!
//!   get_mut(T1) ─▶ Arc::make_mut clones T1 only
//! ```

use super::thread_info::ThreadInfo;
use super::types::{ThreadId, ThreadSet, ThreadStatus};
use crate::domain::classes::AppId;
use crate::domain::snapshot::Restorable;
use std::sync::Arc;

/// Registry of all threads on the current path.
#[derive(Debug, Clone, Default)]
pub struct ThreadList {
    threads: Vec<Arc<ThreadInfo>>,
    max_tid: u32,
    reuse_tid: bool,
}

/// Captured thread list
#[derive(Debug, Clone)]
pub struct ThreadListMemento {
    threads: Vec<Arc<ThreadInfo>>,
    max_tid: u32,
}

impl ThreadList {
    /// Empty list. With `reuse_tid`, terminated threads can be removed and
    /// their ids handed out again.
    pub fn new(reuse_tid: bool) -> Self {
        Self {
            threads: Vec::new(),
            max_tid: 0,
            reuse_tid,
        }
    }

    /// Register a new thread in status `NEW` and return its id.
    pub fn create(&mut self, name: &str, app: AppId) -> ThreadId {
        let id = if self.reuse_tid {
            let mut candidate = 0u32;
            while self.threads.iter().any(|t| t.id.0 == candidate) {
                candidate += 1;
            }
            candidate
        } else {
            self.max_tid
        };
        self.max_tid = self.max_tid.max(id + 1);

        let tid = ThreadId::new(id);
        let pos = self.threads.partition_point(|t| t.id < tid);
        self.threads
            .insert(pos, Arc::new(ThreadInfo::new(tid, name, app)));
        tid
    }

    /// Drop a terminated thread (only meaningful with `reuse_tid`)
    pub fn remove(&mut self, tid: ThreadId) -> bool {
        match self.position(tid) {
            Some(pos) if self.threads[pos].status == ThreadStatus::Terminated => {
                self.threads.remove(pos);
                true
            }
            _ => false,
        }
    }

    fn position(&self, tid: ThreadId) -> Option<usize> {
        self.threads.binary_search_by_key(&tid, |t| t.id).ok()
    }

    /// Thread by id
    pub fn get(&self, tid: ThreadId) -> Option<&ThreadInfo> {
        self.position(tid).map(|p| &*self.threads[p])
    }

    /// Thread by id, cloned first if shared with a snapshot
    pub fn get_mut(&mut self, tid: ThreadId) -> Option<&mut ThreadInfo> {
        let pos = self.position(tid)?;
        Some(Arc::make_mut(&mut self.threads[pos]))
    }

    /// Thread entry is shared with a snapshot
    pub fn is_frozen(&self, tid: ThreadId) -> bool {
        self.position(tid)
            .is_some_and(|p| Arc::strong_count(&self.threads[p]) > 1)
    }

    /// All threads in id order
    pub fn iter(&self) -> impl Iterator<Item = &ThreadInfo> + '_ {
        self.threads.iter().map(|t| &**t)
    }

    /// Number of registered threads
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// No threads registered
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Highest id ever handed out, plus one
    pub const fn max_tid(&self) -> u32 {
        self.max_tid
    }

    /// Thread ids matching `pred`
    pub fn matching(&self, pred: impl Fn(&ThreadInfo) -> bool) -> ThreadSet {
        self.iter().filter(|t| pred(t)).map(|t| t.id).collect()
    }

    /// Runnable threads
    pub fn runnables(&self) -> ThreadSet {
        self.matching(ThreadInfo::is_runnable)
    }

    /// At least one thread besides `tid` is runnable
    pub fn has_other_runnables(&self, tid: ThreadId) -> bool {
        self.iter().any(|t| t.id != tid && t.is_runnable())
    }

    /// Any application thread started and not terminated. System threads
    /// (the finalizer) do not count.
    pub fn has_live_threads(&self) -> bool {
        self.iter().any(|t| t.is_alive() && !t.system)
    }

    /// A system thread has work to do
    pub fn has_runnable_system_threads(&self) -> bool {
        self.iter().any(|t| t.system && t.is_runnable())
    }

    /// Any non-daemon thread started and not terminated
    pub fn has_live_non_daemons(&self) -> bool {
        self.iter().any(|t| t.is_alive() && !t.daemon)
    }

    /// Number of live threads
    pub fn live_count(&self) -> usize {
        self.iter().filter(|t| t.is_alive()).count()
    }

    /// Distinct application contexts with live threads
    pub fn apps(&self) -> Vec<AppId> {
        let mut apps: Vec<AppId> = self.iter().filter(|t| t.is_alive()).map(|t| t.app).collect();
        apps.sort_unstable();
        apps.dedup();
        apps
    }
}

impl Restorable for ThreadList {
    type Memento = ThreadListMemento;

    fn memento(&self) -> ThreadListMemento {
        ThreadListMemento {
            threads: self.threads.clone(),
            max_tid: self.max_tid,
        }
    }

    fn restore(&mut self, memento: &ThreadListMemento) {
        self.threads.clone_from(&memento.threads);
        self.max_tid = memento.max_tid;
    }
}
