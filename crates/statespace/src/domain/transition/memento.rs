//! Transition State Mementos
//!
//! ```text
//!   SystemMemento<Backtrack>   cur/next handles shared with the live arena
//!   SystemMemento<Restore>     detached deep copy of the generator chain,
//!                              copied again on every restore
//! ```
//!
//! Restorers are captured by reference: the map is replaced (never mutated)
//! at the start of each transition, so sharing it is safe.

use crate::domain::choice::{CgHandle, DetachedChain};
use crate::domain::snapshot::SnapshotKind;
use crate::domain::threads::ThreadId;
use indexmap::IndexMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Callback that restores state living outside the VM on backtrack
pub type Restorer = Arc<dyn Fn() + Send + Sync>;

/// Per-transition restore callbacks, keyed and replayed in insertion order
#[derive(Clone, Default)]
pub struct Restorers(Arc<IndexMap<Arc<str>, Restorer>>);

impl Restorers {
    /// Register or replace the restorer for `key`. Returns `true` if one
    /// was replaced.
    pub fn insert(&mut self, key: impl Into<Arc<str>>, restorer: Restorer) -> bool {
        Arc::make_mut(&mut self.0).insert(key.into(), restorer).is_some()
    }

    /// A restorer for `key` is registered
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of restorers
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// None registered
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Run every restorer
    pub fn replay(&self) {
        for restorer in self.0.values() {
            restorer();
        }
    }
}

impl fmt::Debug for Restorers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.keys()).finish()
    }
}

#[derive(Debug, Clone)]
pub(crate) enum CgSnapshot {
    Shared {
        cur: Option<CgHandle>,
        next: Option<CgHandle>,
    },
    Detached {
        chain: DetachedChain,
        /// Generators up to and including the current one
        cur_len: usize,
        has_next: bool,
    },
}

/// Captured transition state
#[derive(Debug, Clone)]
pub struct SystemMemento<K: SnapshotKind> {
    pub(crate) cgs: CgSnapshot,
    pub(crate) entry_atomic_level: u32,
    pub(crate) id: Option<u64>,
    pub(crate) exec_thread: Option<ThreadId>,
    pub(crate) restorers: Restorers,
    pub(crate) kind: PhantomData<K>,
}

impl<K: SnapshotKind> SystemMemento<K> {
    /// State id at capture
    pub const fn id(&self) -> Option<u64> {
        self.id
    }

    /// Executing thread at capture
    pub const fn exec_thread(&self) -> Option<ThreadId> {
        self.exec_thread
    }

    /// Atomic nesting at transition entry
    pub const fn entry_atomic_level(&self) -> u32 {
        self.entry_atomic_level
    }

    /// Arena handles this memento keeps alive. Deep mementos own their
    /// generators and hold none.
    pub fn handles(&self) -> impl Iterator<Item = CgHandle> {
        let (cur, next) = match &self.cgs {
            CgSnapshot::Shared { cur, next } => (*cur, *next),
            CgSnapshot::Detached { .. } => (None, None),
        };
        cur.into_iter().chain(next)
    }
}
