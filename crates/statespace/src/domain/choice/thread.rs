//! Thread Choice Generators
//!
//! - [`ThreadChoiceFromSet`]: one choice per candidate thread. With the
//!   scheduling-point flag set the chosen thread becomes the executor of the
//!   next transition; without it the choice is consumed by an operation
//!   (e.g. which waiter a `notify()` wakes).
//! - [`BreakGenerator`]: single-choice break that keeps the current thread.
//!   A terminator variant offers no choice at all and ends the path.

use super::generator::{cg_plumbing, ChoiceGenerator};
use super::types::{CgBase, ChoiceValue, Cursor};
use crate::domain::threads::ThreadId;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::cmp::Ordering;
use std::sync::Arc;

/// Id of the sentinel generator registered when no thread can run
pub const BLOCKED_NO_CHOICE: &str = "BLOCKED_NO_CHOICE";

/// Choice over an explicit set of threads
#[derive(Debug, Clone)]
pub struct ThreadChoiceFromSet {
    base: CgBase,
    values: Arc<[ThreadId]>,
    cursor: Cursor,
    is_scheduling_point: bool,
}

impl ThreadChoiceFromSet {
    /// Generator over `threads`, in the given order
    pub fn new(id: impl Into<Arc<str>>, threads: &[ThreadId], is_scheduling_point: bool) -> Self {
        Self {
            base: CgBase::new(id),
            values: threads.into(),
            cursor: Cursor::new(threads.len()),
            is_scheduling_point,
        }
    }

    /// Sentinel with no choices: keeps a transition boundary when every live
    /// thread is blocked, so a deadlock is not mistaken for exhaustion
    pub fn blocked_without_choice() -> Self {
        Self::new(BLOCKED_NO_CHOICE, &[], true)
    }

    /// Candidate threads
    pub fn threads(&self) -> &[ThreadId] {
        &self.values
    }

    /// `tid` is a candidate
    pub fn contains(&self, tid: ThreadId) -> bool {
        self.values.contains(&tid)
    }

    /// Sort the candidates. Only valid before the first advance; returns
    /// `false` (and leaves the order unchanged) afterwards.
    pub fn reorder(&mut self, mut cmp: impl FnMut(&ThreadId, &ThreadId) -> Ordering) -> bool {
        if self.cursor.processed() > 0 {
            return false;
        }
        let mut sorted = self.values.to_vec();
        sorted.sort_by(|a, b| cmp(a, b));
        self.values = sorted.into();
        true
    }
}

impl ChoiceGenerator for ThreadChoiceFromSet {
    cg_plumbing!();

    fn type_name(&self) -> &'static str {
        "ThreadChoiceFromSet"
    }

    fn total_choices(&self) -> usize {
        self.cursor.total()
    }

    fn processed_choices(&self) -> usize {
        self.cursor.processed()
    }

    fn advance(&mut self) {
        self.cursor.advance();
    }

    fn reset(&mut self) {
        self.cursor.reset();
        self.base.clear_done();
    }

    fn next_choice(&self) -> Option<ChoiceValue> {
        self.cursor
            .index()
            .and_then(|i| self.values.get(i))
            .map(|t| ChoiceValue::Thread(*t))
    }

    fn randomize(&mut self, rng: &mut StdRng) {
        if self.cursor.processed() > 0 {
            return;
        }
        let mut shuffled = self.values.to_vec();
        shuffled.shuffle(rng);
        self.values = shuffled.into();
    }

    fn is_scheduling_point(&self) -> bool {
        self.is_scheduling_point
    }

    fn all_choices(&self) -> Vec<ChoiceValue> {
        self.values.iter().map(|t| ChoiceValue::Thread(*t)).collect()
    }
}

/// Explicit transition break without a context switch
#[derive(Debug, Clone)]
pub struct BreakGenerator {
    base: CgBase,
    thread: ThreadId,
    cursor: Cursor,
}

impl BreakGenerator {
    /// Break that continues with `thread`
    pub fn new(id: impl Into<Arc<str>>, thread: ThreadId) -> Self {
        Self {
            base: CgBase::new(id),
            thread,
            cursor: Cursor::new(1),
        }
    }

    /// Break that ends the path (no choice)
    pub fn terminator(id: impl Into<Arc<str>>, thread: ThreadId) -> Self {
        Self {
            base: CgBase::new(id),
            thread,
            cursor: Cursor::new(0),
        }
    }

    /// Thread that continues
    pub const fn thread(&self) -> ThreadId {
        self.thread
    }
}

impl ChoiceGenerator for BreakGenerator {
    cg_plumbing!();

    fn type_name(&self) -> &'static str {
        "BreakGenerator"
    }

    fn total_choices(&self) -> usize {
        self.cursor.total()
    }

    fn processed_choices(&self) -> usize {
        self.cursor.processed()
    }

    fn advance(&mut self) {
        self.cursor.advance();
    }

    fn reset(&mut self) {
        self.cursor.reset();
        self.base.clear_done();
    }

    fn next_choice(&self) -> Option<ChoiceValue> {
        self.cursor.index().map(|_| ChoiceValue::Thread(self.thread))
    }

    fn is_scheduling_point(&self) -> bool {
        true
    }

    fn all_choices(&self) -> Vec<ChoiceValue> {
        if self.cursor.total() == 0 {
            Vec::new()
        } else {
            vec![ChoiceValue::Thread(self.thread)]
        }
    }
}
