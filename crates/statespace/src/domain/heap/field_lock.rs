//! Field Lock Protection Heuristic
//!
//! Tracks, per shared field, the set of locks that were held on every access
//! so far. Once the candidate set survived `threshold` consecutive checks
//! the field counts as *lock protected* and the sharedness policy stops
//! injecting race choice points for it. The first access with an empty
//! intersection drops the assumption for good.
//!
//! ```text
//!   first access     Empty (no locks held, never protected)
//!                    Single{lock}        one lock held
//!                    Set{l1, l2, ...}    several locks held
//!
//!   check:  candidates ∩ held
//!             = ∅         ─▶ Empty   (warn if it was protected)
//!             = {l}       ─▶ Single{l}
//!             otherwise   ─▶ Set{...}
//!           check_level += 1
//! ```

use super::types::{ObjRef, Value};
use crate::domain::threads::ThreadId;
use smallvec::SmallVec;
use std::fmt;
use tracing::{info, warn};

/// Candidate locks for one field
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockCandidates {
    /// Accessed without any lock, never protected
    Empty,
    /// One candidate lock
    Single(ObjRef),
    /// Several candidate locks, sorted
    Set(SmallVec<[ObjRef; 4]>),
}

/// Lock protection state of one field
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldLockInfo {
    candidates: LockCandidates,
    check_level: u32,
    threshold: u32,
    last_checker: Option<ThreadId>,
}

/// Result of [`FieldLockInfo::check_protection`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionCheck {
    /// Updated info
    pub info: FieldLockInfo,
    /// The assumption was protected and just failed
    pub assumption_failed: bool,
    /// Lock that just became protecting and should be pinned down
    pub pin_down: Option<ObjRef>,
}

impl FieldLockInfo {
    /// Never-protected info
    pub const fn empty(threshold: u32) -> Self {
        Self {
            candidates: LockCandidates::Empty,
            check_level: 0,
            threshold,
            last_checker: None,
        }
    }

    /// Candidate locks
    pub const fn candidates(&self) -> &LockCandidates {
        &self.candidates
    }

    /// Number of checks so far
    pub const fn check_level(&self) -> u32 {
        self.check_level
    }

    /// Field is assumed lock protected
    pub const fn is_protected(&self) -> bool {
        !matches!(self.candidates, LockCandidates::Empty) && self.check_level >= self.threshold
    }

    /// Candidate locks as a slice
    pub fn locks(&self) -> &[ObjRef] {
        match &self.candidates {
            LockCandidates::Empty => &[],
            LockCandidates::Single(l) => std::slice::from_ref(l),
            LockCandidates::Set(s) => s,
        }
    }

    /// Check an access by `tid` holding `held`.
    ///
    /// `field` is only used for the diagnostic on assumption failure.
    pub fn check_protection(
        &self,
        tid: ThreadId,
        held: &[ObjRef],
        field: &dyn fmt::Display,
        pindown: bool,
    ) -> ProtectionCheck {
        if matches!(self.candidates, LockCandidates::Empty) {
            return ProtectionCheck {
                info: self.clone(),
                assumption_failed: false,
                pin_down: None,
            };
        }

        let was_protected = self.is_protected();
        let check_level = self.check_level + 1;
        let mut remaining: SmallVec<[ObjRef; 4]> =
            self.locks().iter().copied().filter(|l| held.contains(l)).collect();

        if remaining.is_empty() {
            if was_protected {
                warn!(
                    "unprotected field access of: {} in thread: {} (last lock candidates: {:?}, current locks: {:?})",
                    field,
                    tid,
                    self.locks(),
                    held
                );
            }
            return ProtectionCheck {
                info: Self::empty(self.threshold),
                assumption_failed: was_protected,
                pin_down: None,
            };
        }

        remaining.sort_unstable();
        let candidates = if remaining.len() == 1 {
            LockCandidates::Single(remaining[0])
        } else {
            LockCandidates::Set(remaining)
        };
        let info = Self {
            candidates,
            check_level,
            threshold: self.threshold,
            last_checker: Some(tid),
        };
        let pin_down = match info.candidates {
            LockCandidates::Single(l) if pindown && !was_protected && info.is_protected() => Some(l),
            _ => None,
        };

        ProtectionCheck {
            info,
            assumption_failed: false,
            pin_down,
        }
    }

    /// Drop candidate locks that are no longer alive
    #[must_use]
    pub fn cleanup(&self, is_alive: impl Fn(ObjRef) -> bool) -> Self {
        let live: SmallVec<[ObjRef; 4]> = self.locks().iter().copied().filter(|l| is_alive(*l)).collect();
        if live.len() == self.locks().len() {
            return self.clone();
        }
        let candidates = match live.len() {
            0 => return Self::empty(self.threshold),
            1 => LockCandidates::Single(live[0]),
            _ => LockCandidates::Set(live),
        };
        Self {
            candidates,
            ..self.clone()
        }
    }
}

impl fmt::Display for FieldLockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.candidates {
            LockCandidates::Empty => write!(f, "EmptyFli"),
            LockCandidates::Single(l) => {
                write!(f, "SingleLockFli {{checkLevel={},lock={l}}}", self.check_level)
            }
            LockCandidates::Set(s) => {
                write!(f, "MultiLockFli {{checkLevel={},lset=[", self.check_level)?;
                for (i, l) in s.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{l}")?;
                }
                write!(f, "]}}")
            }
        }
    }
}

/// What the factory may inspect to find a strong protection candidate
#[derive(Debug, Clone, Copy)]
pub struct FieldOwner<'a> {
    /// Owning object, `None` for a static field
    pub object: Option<ObjRef>,
    /// Class object of the owning class
    pub class_object: Option<ObjRef>,
    /// Current field values of the owner
    pub fields: &'a [Value],
}

/// Creates the initial [`FieldLockInfo`] on the first shared access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLockInfoFactory {
    /// Checks before a candidate set counts as protecting
    pub threshold: u32,
    /// Pin down lock objects of protected fields
    pub pindown: bool,
    /// Trust locks closely related to the owner right away
    pub aggressive: bool,
}

impl Default for FieldLockInfoFactory {
    fn default() -> Self {
        Self {
            threshold: 5,
            pindown: false,
            aggressive: false,
        }
    }
}

impl FieldLockInfoFactory {
    /// Initial info for an access holding `held`.
    ///
    /// `lock_references` answers whether a lock object has a reference
    /// field pointing at the given object (sync wrapper detection).
    pub fn create(
        &self,
        tid: ThreadId,
        held: &[ObjRef],
        owner: FieldOwner<'_>,
        lock_references: impl Fn(ObjRef, ObjRef) -> bool,
    ) -> FieldLockInfo {
        if held.is_empty() {
            return FieldLockInfo::empty(self.threshold);
        }

        if self.aggressive {
            if let Some(lock) = self.strong_candidate(held, owner, lock_references) {
                return FieldLockInfo {
                    candidates: LockCandidates::Single(lock),
                    check_level: self.threshold,
                    threshold: self.threshold,
                    last_checker: Some(tid),
                };
            }
        }

        let candidates = if held.len() == 1 {
            LockCandidates::Single(held[0])
        } else {
            let mut set: SmallVec<[ObjRef; 4]> = held.iter().copied().collect();
            set.sort_unstable();
            set.dedup();
            LockCandidates::Set(set)
        };
        FieldLockInfo {
            candidates,
            check_level: 0,
            threshold: self.threshold,
            last_checker: Some(tid),
        }
    }

    fn strong_candidate(
        &self,
        held: &[ObjRef],
        owner: FieldOwner<'_>,
        lock_references: impl Fn(ObjRef, ObjRef) -> bool,
    ) -> Option<ObjRef> {
        let Some(obj) = owner.object else {
            let class_object = owner.class_object?;
            let found = held.contains(&class_object);
            if found {
                info!("sync-detection: static field assumed to be synced on class object {class_object}");
            }
            return found.then_some(class_object);
        };

        for &lock in held {
            if lock == obj {
                info!("sync-detection: {obj} assumed to be synced on itself");
                return Some(lock);
            }
            if owner.fields.iter().any(|v| v.as_obj() == Some(lock)) {
                info!("sync-detection: {obj} assumed to be synced on sibling {lock}");
                return Some(lock);
            }
            if lock_references(lock, obj) {
                info!("sync-detection: {obj} assumed to be synced on object wrapper {lock}");
                return Some(lock);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T1: ThreadId = ThreadId::new(1);

    fn factory(threshold: u32) -> FieldLockInfoFactory {
        FieldLockInfoFactory {
            threshold,
            ..FieldLockInfoFactory::default()
        }
    }

    fn owner(fields: &[Value]) -> FieldOwner<'_> {
        FieldOwner {
            object: Some(ObjRef::new(1)),
            class_object: None,
            fields,
        }
    }

    #[test]
    fn test_no_locks_is_never_protected() {
        let fli = factory(1).create(T1, &[], owner(&[]), |_, _| false);
        let next = fli.check_protection(T1, &[ObjRef::new(5)], &"C.f", false);
        assert!(!next.info.is_protected());
        assert_eq!(next.info.to_string(), "EmptyFli");
    }

    #[test]
    fn test_single_lock_hardens_after_threshold() {
        let lock = ObjRef::new(5);
        let mut fli = factory(2).create(T1, &[lock], owner(&[]), |_, _| false);
        assert!(!fli.is_protected());
        fli = fli.check_protection(T1, &[lock], &"C.f", false).info;
        assert!(!fli.is_protected());
        fli = fli.check_protection(T1, &[lock], &"C.f", false).info;
        assert!(fli.is_protected());

        let failed = fli.check_protection(T1, &[], &"C.f", false);
        assert!(failed.assumption_failed);
        assert!(!failed.info.is_protected());
    }

    #[test]
    fn test_lock_set_shrinks_to_intersection() {
        let (a, b, c) = (ObjRef::new(2), ObjRef::new(3), ObjRef::new(4));
        let fli = factory(5).create(T1, &[c, a, b], owner(&[]), |_, _| false);
        assert_eq!(fli.locks(), &[a, b, c]);

        let next = fli.check_protection(T1, &[b, c], &"C.f", false).info;
        assert_eq!(next.locks(), &[b, c]);
        let next = next.check_protection(T1, &[c], &"C.f", false).info;
        assert_eq!(next.candidates(), &LockCandidates::Single(c));
        assert_eq!(next.check_level(), 2);
    }

    #[test]
    fn test_pin_down_reported_once_when_protected() {
        let lock = ObjRef::new(5);
        let fli = factory(1).create(T1, &[lock], owner(&[]), |_, _| false);
        let check = fli.check_protection(T1, &[lock], &"C.f", true);
        assert_eq!(check.pin_down, Some(lock));
        let again = check.info.check_protection(T1, &[lock], &"C.f", true);
        assert_eq!(again.pin_down, None);
    }

    #[test]
    fn test_aggressive_detects_self_sibling_and_wrapper() {
        let f = FieldLockInfoFactory {
            aggressive: true,
            ..factory(3)
        };
        let obj = ObjRef::new(1);
        let sibling = ObjRef::new(7);
        let wrapper = ObjRef::new(8);

        let by_self = f.create(T1, &[ObjRef::new(9), obj], owner(&[]), |_, _| false);
        assert!(by_self.is_protected());
        assert_eq!(by_self.locks(), &[obj]);

        let fields = [Value::Ref(sibling)];
        let by_sibling = f.create(T1, &[sibling], owner(&fields), |_, _| false);
        assert_eq!(by_sibling.locks(), &[sibling]);
        assert!(by_sibling.is_protected());

        let by_wrapper = f.create(T1, &[wrapper], owner(&[]), |l, o| l == wrapper && o == obj);
        assert!(by_wrapper.is_protected());

        let statics = FieldOwner {
            object: None,
            class_object: Some(ObjRef::new(11)),
            fields: &[],
        };
        assert!(f.create(T1, &[ObjRef::new(11)], statics, |_, _| false).is_protected());
    }

    #[test]
    fn test_cleanup_drops_dead_locks() {
        let (a, b) = (ObjRef::new(2), ObjRef::new(3));
        let fli = factory(5).create(T1, &[a, b], owner(&[]), |_, _| false);
        let cleaned = fli.cleanup(|l| l == b);
        assert_eq!(cleaned.candidates(), &LockCandidates::Single(b));
        let gone = cleaned.cleanup(|_| false);
        assert_eq!(gone.candidates(), &LockCandidates::Empty);
    }
}
