//! Toggling live bits for mark-sweep.
//!
//! Each slot has one bit. A GC cycle flips the heap-wide `live` value and
//! marks reachable slots with it, so "marked in this cycle" is
//! `bit == live` and no per-object reset pass is needed between cycles.
//! Bits are not part of a heap snapshot; after a restore the heap calls
//! [`LiveBits::normalize`] once before the next cycle.

/// Per-slot live bits plus the current live value
#[derive(Debug, Clone, Default)]
pub struct LiveBits {
    words: Vec<u64>,
    live: bool,
}

impl LiveBits {
    /// All bits clear, live value `false`
    pub fn new() -> Self {
        Self::default()
    }

    /// Current live value
    #[inline(always)]
    pub const fn live_value(&self) -> bool {
        self.live
    }

    /// Start a new cycle
    #[inline]
    pub fn toggle(&mut self) {
        self.live = !self.live;
    }

    #[inline(always)]
    fn bit(&self, idx: usize) -> bool {
        self.words
            .get(idx >> 6)
            .is_some_and(|w| w & (1u64 << (idx & 63)) != 0)
    }

    /// Slot carries the current live value
    #[inline]
    pub fn is_live(&self, idx: usize) -> bool {
        self.bit(idx) == self.live
    }

    /// Set slot to the current live value
    pub fn mark(&mut self, idx: usize) {
        let word = idx >> 6;
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        let mask = 1u64 << (idx & 63);
        if self.live {
            self.words[word] |= mask;
        } else {
            self.words[word] &= !mask;
        }
    }

    /// Give every slot in `indices` the current live value
    pub fn normalize(&mut self, indices: impl IntoIterator<Item = usize>) {
        for idx in indices {
            self.mark(idx);
        }
    }

    /// Mark and report whether the slot was unmarked before
    pub fn test_and_mark(&mut self, idx: usize) -> bool {
        if self.is_live(idx) {
            false
        } else {
            self.mark(idx);
            true
        }
    }
}
