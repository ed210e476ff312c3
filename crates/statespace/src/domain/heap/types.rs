//! Heap References and Values

use std::fmt;

/// Canonical object reference.
///
/// A dense slot index assigned by the allocation identity, never a host
/// address. Slot 0 is never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ObjRef(pub u32);

impl ObjRef {
    /// Create a new reference
    #[inline(always)]
    pub const fn new(slot: u32) -> Self {
        Self(slot)
    }

    /// Slot index
    #[inline(always)]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Field, array element or stack slot value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Value {
    /// Null reference or uninitialized slot
    #[default]
    Null,
    /// Any primitive, widened
    Int(i64),
    /// Object reference
    Ref(ObjRef),
}

impl Value {
    /// Referenced object, if any
    #[inline]
    pub const fn as_obj(&self) -> Option<ObjRef> {
        match self {
            Self::Ref(r) => Some(*r),
            _ => None,
        }
    }

    /// Primitive payload, if any
    #[inline]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Ref(r) => write!(f, "{r}"),
        }
    }
}

impl From<ObjRef> for Value {
    fn from(r: ObjRef) -> Self {
        Self::Ref(r)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}
