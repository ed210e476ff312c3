//! Choice Generator Contract
//!
//! ```text
//!   registered ──▶ set_current() ──▶ advance() ... advance() ──▶ exhausted
//!                                     │
//!                     select(i) ──────┘  (replay: reset + advance to i, done)
//! ```
//!
//! `advance`/`advance_by` are the only operations that move the cursor.
//! `randomize` and `reorder` (where supported) must run before the first
//! advance since they reset the enumeration.
//!
//! # Design Notes
//!
//! Generators are stored as `Box<dyn ChoiceGenerator>` in a
//! [`super::CgArena`]. Type-filtered queries downcast through
//! [`ChoiceGenerator::as_any`].

use super::types::{CgBase, ChoiceValue};
use rand::rngs::StdRng;
use std::any::Any;
use std::fmt;

/// Enumerator of the alternatives at one scheduling point.
pub trait ChoiceGenerator: fmt::Debug + Send + Sync + Any {
    /// Common header
    fn base(&self) -> &CgBase;

    /// Modifiable common header
    fn base_mut(&mut self) -> &mut CgBase;

    /// Type name used in traces and extension filters
    fn type_name(&self) -> &'static str;

    /// Number of choices
    fn total_choices(&self) -> usize;

    /// Advances since the last reset
    fn processed_choices(&self) -> usize;

    /// Move to the next choice
    fn advance(&mut self);

    /// Back to before the first choice, clearing the done flag
    fn reset(&mut self);

    /// Current choice, `None` before the first advance
    fn next_choice(&self) -> Option<ChoiceValue>;

    /// Boxed copy
    fn clone_box(&self) -> Box<dyn ChoiceGenerator>;

    /// Downcast support
    fn as_any(&self) -> &dyn Any;

    /// Downcast support
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Whether another advance would yield a choice
    fn has_more_choices(&self) -> bool {
        !self.base().is_done() && self.processed_choices() < self.total_choices()
    }

    /// Advance `n` times, stopping early when exhausted
    fn advance_by(&mut self, n: usize) {
        for _ in 0..n {
            if !self.has_more_choices() {
                break;
            }
            self.advance();
        }
    }

    /// Reset, advance to the absolute `index` and mark done. Returns `false`
    /// if `index` is out of range.
    fn select(&mut self, index: usize) -> bool {
        if index >= self.total_choices() {
            return false;
        }
        self.reset();
        self.advance_by(index + 1);
        self.base_mut().set_done();
        true
    }

    /// Index of the current choice
    fn choice_index(&self) -> Option<usize> {
        self.processed_choices().checked_sub(1)
    }

    /// Context hook invoked before the first advance of a transition
    fn set_current(&mut self) {}

    /// Shuffle the choices. Generators without a meaningful order ignore it.
    fn randomize(&mut self, _rng: &mut StdRng) {}

    /// Thread choice that selects the next executing thread
    fn is_scheduling_point(&self) -> bool {
        false
    }

    /// Every choice in enumeration order
    fn all_choices(&self) -> Vec<ChoiceValue>;
}

impl dyn ChoiceGenerator + '_ {
    /// Concrete type is `T`
    pub fn is<T: ChoiceGenerator>(&self) -> bool {
        self.as_any().is::<T>()
    }

    /// Downcast to `T`
    pub fn downcast_ref<T: ChoiceGenerator>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Downcast to `T`
    pub fn downcast_mut<T: ChoiceGenerator>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }

    /// Current choice as a thread
    pub fn next_thread(&self) -> Option<crate::domain::threads::ThreadId> {
        self.next_choice().and_then(ChoiceValue::as_thread)
    }
}

impl fmt::Display for dyn ChoiceGenerator + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {{id:\"{}\" ,", self.type_name(), self.base().id())?;
        write!(f, "{}/{},", self.processed_choices(), self.total_choices())?;
        if self.base().is_cascaded() {
            write!(f, "isCascaded,")?;
        }
        for (i, c) in self.all_choices().iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            if Some(i) == self.choice_index() {
                write!(f, ">{c}")?;
            } else {
                write!(f, "{c}")?;
            }
        }
        write!(f, "}}")
    }
}

impl Clone for Box<dyn ChoiceGenerator> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Implements the boxing/downcast plumbing of [`ChoiceGenerator`] for a
/// struct with a `base: CgBase` field.
macro_rules! cg_plumbing {
    () => {
        fn base(&self) -> &$crate::domain::choice::CgBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut $crate::domain::choice::CgBase {
            &mut self.base
        }

        fn clone_box(&self) -> Box<dyn $crate::domain::choice::ChoiceGenerator> {
            Box::new(self.clone())
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    };
}

pub(crate) use cg_plumbing;
