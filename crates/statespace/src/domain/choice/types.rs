//! Choice Generator Types
//!
//! Handles, choice values, the common header every generator embeds, the
//! enumeration cursor shared by list-like generators, and the randomization
//! policy.

use super::attrs::AttrBag;
use crate::domain::threads::ThreadId;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Generational handle of a choice generator in a [`super::CgArena`].
///
/// A handle whose slot was freed and reused no longer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CgHandle {
    index: u32,
    generation: u32,
}

impl CgHandle {
    /// Create a handle
    #[inline(always)]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index
    #[inline(always)]
    pub const fn as_usize(self) -> usize {
        self.index as usize
    }

    /// Slot generation
    #[inline(always)]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for CgHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CG({}v{})", self.index, self.generation)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Choice values
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Value a generator currently offers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChoiceValue {
    /// Thread to schedule
    Thread(ThreadId),
    /// Boolean data choice
    Bool(bool),
    /// Integer data choice
    Int(i64),
}

impl ChoiceValue {
    /// Thread of a thread choice
    pub const fn as_thread(self) -> Option<ThreadId> {
        match self {
            Self::Thread(t) => Some(t),
            _ => None,
        }
    }

    /// Value of a boolean choice
    pub const fn as_bool(self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(b),
            _ => None,
        }
    }

    /// Value of an integer choice
    pub const fn as_int(self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(i),
            _ => None,
        }
    }
}

impl fmt::Display for ChoiceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thread(t) => write!(f, "{t}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Common header
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fields shared by every choice generator.
///
/// The previous-generator link is a handle into the owning arena, set when
/// the generator is registered with the transition state.
#[derive(Debug, Clone)]
pub struct CgBase {
    id: Arc<str>,
    prev: Option<CgHandle>,
    is_cascaded: bool,
    is_global: bool,
    is_done: bool,
    state_id: Option<u64>,
    thread: Option<ThreadId>,
    insn: Option<u32>,
    extendable: bool,
    /// Free attribute payload
    pub attrs: AttrBag,
}

impl CgBase {
    /// Header for a generator with the given id (e.g. `"LOCK"`)
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self {
            id: id.into(),
            prev: None,
            is_cascaded: false,
            is_global: false,
            is_done: false,
            state_id: None,
            thread: None,
            insn: None,
            extendable: false,
            attrs: AttrBag::new(),
        }
    }

    /// Registration id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Previously registered generator
    pub const fn prev(&self) -> Option<CgHandle> {
        self.prev
    }

    pub(crate) fn set_prev(&mut self, prev: Option<CgHandle>) {
        self.prev = prev;
    }

    /// Registered for the same instruction as a later generator
    pub const fn is_cascaded(&self) -> bool {
        self.is_cascaded
    }

    pub(crate) fn set_cascaded(&mut self, cascaded: bool) {
        self.is_cascaded = cascaded;
    }

    /// Scheduling point whose candidates span every application context,
    /// because the registering thread's own context had none runnable
    pub const fn is_global(&self) -> bool {
        self.is_global
    }

    /// Mark as a global scheduling point
    pub fn set_global(&mut self) {
        self.is_global = true;
    }

    /// No further choices will be produced
    pub const fn is_done(&self) -> bool {
        self.is_done
    }

    /// Stop enumerating
    pub fn set_done(&mut self) {
        self.is_done = true;
    }

    pub(crate) fn clear_done(&mut self) {
        self.is_done = false;
    }

    /// State the generator was created in
    pub const fn state_id(&self) -> Option<u64> {
        self.state_id
    }

    pub(crate) fn set_state_id(&mut self, id: Option<u64>) {
        self.state_id = id;
    }

    /// Thread that registered the generator
    pub const fn thread(&self) -> Option<ThreadId> {
        self.thread
    }

    /// Instruction (program counter) that registered the generator
    pub const fn insn(&self) -> Option<u32> {
        self.insn
    }

    pub(crate) fn set_context(&mut self, thread: Option<ThreadId>, insn: Option<u32>) {
        self.thread = thread;
        self.insn = insn;
    }

    /// Marked as a candidate for transition extension
    pub const fn is_extendable(&self) -> bool {
        self.extendable
    }

    /// Mark or unmark for transition extension
    pub fn set_extendable(&mut self, extendable: bool) {
        self.extendable = extendable;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cursor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Enumeration position over `total` choices.
///
/// `processed` counts advances since the last reset; the current choice is
/// `processed - 1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    processed: usize,
    total: usize,
}

impl Cursor {
    /// Cursor before the first of `total` choices
    pub const fn new(total: usize) -> Self {
        Self { processed: 0, total }
    }

    /// Number of choices
    pub const fn total(self) -> usize {
        self.total
    }

    /// Advances since the last reset
    pub const fn processed(self) -> usize {
        self.processed
    }

    /// Index of the current choice
    pub const fn index(self) -> Option<usize> {
        self.processed.checked_sub(1)
    }

    /// A further advance would produce a choice
    pub const fn has_more(self) -> bool {
        self.processed < self.total
    }

    /// Move to the next choice, saturating at the last one
    pub fn advance(&mut self) {
        if self.processed < self.total {
            self.processed += 1;
        }
    }

    /// Back to before the first choice
    pub fn reset(&mut self) {
        self.processed = 0;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Randomization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `cg.randomize_choices`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RandomizationPolicy {
    /// Enumerate in natural order
    #[default]
    None,
    /// Shuffle with a run seed taken from `cg.seed` (reproducible)
    FixedSeed,
    /// Shuffle with a fresh seed per run
    VarSeed,
}

impl RandomizationPolicy {
    /// Parse a config value
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NONE" | "FALSE" => Some(Self::None),
            "FIXED_SEED" | "TRUE" => Some(Self::FixedSeed),
            "VAR_SEED" => Some(Self::VarSeed),
            _ => None,
        }
    }
}

/// Run-scoped random source applied to generators at registration.
#[derive(Debug, Clone)]
pub struct ChoiceRandomizer {
    policy: RandomizationPolicy,
    seed: u64,
    rng: StdRng,
}

impl ChoiceRandomizer {
    /// Randomizer for `policy`. `VarSeed` draws its seed from the OS.
    pub fn new(policy: RandomizationPolicy, seed: u64) -> Self {
        let seed = match policy {
            RandomizationPolicy::VarSeed => rand::random(),
            _ => seed,
        };
        Self {
            policy,
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Policy
    pub const fn policy(&self) -> RandomizationPolicy {
        self.policy
    }

    /// Effective seed (logged so a `VarSeed` run can be repeated)
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Randomization is on
    pub fn is_active(&self) -> bool {
        self.policy != RandomizationPolicy::None
    }

    /// Random source
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

impl Default for ChoiceRandomizer {
    fn default() -> Self {
        Self::new(RandomizationPolicy::None, 42)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_saturates() {
        let mut c = Cursor::new(2);
        assert_eq!(c.index(), None);
        c.advance();
        c.advance();
        assert!(!c.has_more());
        c.advance();
        assert_eq!(c.index(), Some(1));
        c.reset();
        assert_eq!(c.processed(), 0);
    }

    #[test]
    fn test_randomization_policy_parse() {
        assert_eq!(RandomizationPolicy::parse("fixed_seed"), Some(RandomizationPolicy::FixedSeed));
        assert_eq!(RandomizationPolicy::parse(" VAR_SEED "), Some(RandomizationPolicy::VarSeed));
        assert_eq!(RandomizationPolicy::parse("sometimes"), None);
    }

    #[test]
    fn test_fixed_seed_is_reproducible() {
        use rand::Rng;
        let mut a = ChoiceRandomizer::new(RandomizationPolicy::FixedSeed, 7);
        let mut b = ChoiceRandomizer::new(RandomizationPolicy::FixedSeed, 7);
        let xs: Vec<u32> = (0..4).map(|_| a.rng().gen()).collect();
        let ys: Vec<u32> = (0..4).map(|_| b.rng().gen()).collect();
        assert_eq!(xs, ys);
        assert!(a.is_active());
    }
}
