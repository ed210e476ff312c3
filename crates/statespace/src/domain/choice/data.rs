//! Data Choice Generators
//!
//! Non-scheduling choices a program draws from its environment:
//!
//! | Generator                     | Choices                               |
//! |-------------------------------|---------------------------------------|
//! | [`BooleanChoiceGenerator`]    | `false, true` (or `true, false`)      |
//! | [`IntIntervalGenerator`]      | `min..=max` by `delta`, either way    |
//! | [`NumberChoiceFromList`]      | explicit values                       |
//! | [`RandomIntIntervalGenerator`]| `n` seeded picks from `min..=max`     |

use super::generator::{cg_plumbing, ChoiceGenerator};
use super::types::{CgBase, ChoiceValue, Cursor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Boolean
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `false` then `true`, unless configured to start with `true`
#[derive(Debug, Clone)]
pub struct BooleanChoiceGenerator {
    base: CgBase,
    false_first: bool,
    cursor: Cursor,
}

impl BooleanChoiceGenerator {
    /// Generator enumerating `false` first
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self::with_order(id, true)
    }

    /// Generator with explicit order
    pub fn with_order(id: impl Into<Arc<str>>, false_first: bool) -> Self {
        Self {
            base: CgBase::new(id),
            false_first,
            cursor: Cursor::new(2),
        }
    }

    const fn value_at(&self, i: usize) -> bool {
        (i == 0) != self.false_first
    }
}

impl ChoiceGenerator for BooleanChoiceGenerator {
    cg_plumbing!();

    fn type_name(&self) -> &'static str {
        "BooleanChoiceGenerator"
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
        self.cursor.index().map(|i| ChoiceValue::Bool(self.value_at(i)))
    }

    fn randomize(&mut self, rng: &mut StdRng) {
        if self.cursor.processed() == 0 {
            self.false_first = rng.gen();
        }
    }

    fn all_choices(&self) -> Vec<ChoiceValue> {
        (0..2).map(|i| ChoiceValue::Bool(self.value_at(i))).collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Integer interval
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Integers of `min..=max` stepping by `delta`. A negative `delta` walks
/// from `max` down to `min`.
#[derive(Debug, Clone)]
pub struct IntIntervalGenerator {
    base: CgBase,
    min: i64,
    max: i64,
    delta: i64,
    cursor: Cursor,
}

impl IntIntervalGenerator {
    /// Ascending interval with step 1
    pub fn new(id: impl Into<Arc<str>>, min: i64, max: i64) -> Self {
        Self::with_delta(id, min, max, 1)
    }

    /// Interval with an explicit step. A zero step is treated as 1; an empty
    /// interval (`min > max`) has no choices.
    pub fn with_delta(id: impl Into<Arc<str>>, min: i64, max: i64, delta: i64) -> Self {
        let delta = if delta == 0 { 1 } else { delta };
        let total = if min > max {
            0
        } else {
            usize::try_from((max - min) / delta.abs() + 1).unwrap_or(usize::MAX)
        };
        Self {
            base: CgBase::new(id),
            min,
            max,
            delta,
            cursor: Cursor::new(total),
        }
    }

    fn value_at(&self, i: usize) -> i64 {
        let step = self.delta.abs() * i as i64;
        if self.delta > 0 {
            self.min + step
        } else {
            self.max - step
        }
    }
}

impl ChoiceGenerator for IntIntervalGenerator {
    cg_plumbing!();

    fn type_name(&self) -> &'static str {
        "IntIntervalGenerator"
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
        self.cursor.index().map(|i| ChoiceValue::Int(self.value_at(i)))
    }

    fn all_choices(&self) -> Vec<ChoiceValue> {
        (0..self.cursor.total()).map(|i| ChoiceValue::Int(self.value_at(i))).collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Explicit values
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Choice over an explicit list of numbers
#[derive(Debug, Clone)]
pub struct NumberChoiceFromList {
    base: CgBase,
    values: Arc<[i64]>,
    cursor: Cursor,
}

impl NumberChoiceFromList {
    /// Generator over `values`
    pub fn new(id: impl Into<Arc<str>>, values: &[i64]) -> Self {
        Self {
            base: CgBase::new(id),
            values: values.into(),
            cursor: Cursor::new(values.len()),
        }
    }

    /// Values in enumeration order
    pub fn values(&self) -> &[i64] {
        &self.values
    }
}

impl ChoiceGenerator for NumberChoiceFromList {
    cg_plumbing!();

    fn type_name(&self) -> &'static str {
        "NumberChoiceFromList"
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
            .map(|v| ChoiceValue::Int(*v))
    }

    fn randomize(&mut self, rng: &mut StdRng) {
        if self.cursor.processed() == 0 {
            let mut shuffled = self.values.to_vec();
            shuffled.shuffle(rng);
            self.values = shuffled.into();
        }
    }

    fn all_choices(&self) -> Vec<ChoiceValue> {
        self.values.iter().map(|v| ChoiceValue::Int(*v)).collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Random picks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `n` values drawn from `min..=max` with a fixed seed. The picks are made
/// once at construction so every enumeration sees the same sequence.
#[derive(Debug, Clone)]
pub struct RandomIntIntervalGenerator {
    base: CgBase,
    seed: u64,
    values: Arc<[i64]>,
    cursor: Cursor,
}

impl RandomIntIntervalGenerator {
    /// `n` seeded picks from `min..=max`
    pub fn new(id: impl Into<Arc<str>>, min: i64, max: i64, n: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let values: Vec<i64> = if min > max {
            Vec::new()
        } else {
            (0..n).map(|_| rng.gen_range(min..=max)).collect()
        };
        Self {
            base: CgBase::new(id),
            seed,
            cursor: Cursor::new(values.len()),
            values: values.into(),
        }
    }

    /// Seed the picks were drawn with
    pub const fn seed(&self) -> u64 {
        self.seed
    }
}

impl ChoiceGenerator for RandomIntIntervalGenerator {
    cg_plumbing!();

    fn type_name(&self) -> &'static str {
        "RandomIntIntervalGenerator"
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
            .map(|v| ChoiceValue::Int(*v))
    }

    fn all_choices(&self) -> Vec<ChoiceValue> {
        self.values.iter().map(|v| ChoiceValue::Int(*v)).collect()
    }
}
