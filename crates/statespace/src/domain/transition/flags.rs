//! Transition-scoped flags.

use bitflags::bitflags;

bitflags! {
    /// Flags of the running transition
    ///
    /// `IGNORED`/`FORCED` and `INTERESTING`/`BORING` are mutually exclusive
    /// pairs. Everything except `RETAIN_ATTRIBUTES` is cleared when the next
    /// transition starts, unless `RETAIN_ATTRIBUTES` is set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TransitionFlags: u8 {
        /// Revert and re-choose: the resulting state is not explored
        const IGNORED           = 1 << 0;
        /// Treat the resulting state as new even if it matches
        const FORCED            = 1 << 1;
        /// Search heuristics should prefer this state
        const INTERESTING       = 1 << 2;
        /// Search heuristics should defer this state
        const BORING            = 1 << 3;
        /// Keep the flags above into the next transition
        const RETAIN_ATTRIBUTES = 1 << 4;
        /// A blocking operation was hit inside an atomic section
        const BLOCKED_IN_ATOMIC = 1 << 5;
    }
}

impl TransitionFlags {
    /// Flags cleared at the start of a transition
    pub const TRANSIENT: Self = Self::IGNORED
        .union(Self::FORCED)
        .union(Self::INTERESTING)
        .union(Self::BORING)
        .union(Self::BLOCKED_IN_ATOMIC);

    /// Set `flag`, clearing its exclusive partner when setting
    pub fn set_exclusive(&mut self, flag: Self, partner: Self, on: bool) {
        self.set(flag, on);
        if on {
            self.remove(partner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_pairs() {
        let mut flags = TransitionFlags::FORCED;
        flags.set_exclusive(TransitionFlags::IGNORED, TransitionFlags::FORCED, true);
        assert_eq!(flags, TransitionFlags::IGNORED);
        flags.set_exclusive(TransitionFlags::IGNORED, TransitionFlags::FORCED, false);
        assert!(flags.is_empty());
    }

    #[test]
    fn test_transient_excludes_retain() {
        assert!(!TransitionFlags::TRANSIENT.contains(TransitionFlags::RETAIN_ATTRIBUTES));
        assert!(TransitionFlags::TRANSIENT.contains(TransitionFlags::BLOCKED_IN_ATOMIC));
    }
}
