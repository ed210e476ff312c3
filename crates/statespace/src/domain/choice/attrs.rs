//! Attribute Bag
//!
//! Free-form, possibly multi-valued payload attached to a choice generator
//! (and usable by listeners) without subclassing. Values are looked up by
//! their concrete type.
//!
//! ```text
//!   add(x)            append
//!   replace(old,new)  swap the first equal value
//!   remove(x)         drop the first equal value
//!   get::<T>()        first value of type T
//!   iter::<T>()       every value of type T, insertion order
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;

type Attr = Arc<dyn Any + Send + Sync>;

/// Typed multi-value attribute storage. Cloning shares the values.
#[derive(Clone, Default)]
pub struct AttrBag {
    values: Vec<Attr>,
}

impl AttrBag {
    /// Empty bag
    pub const fn new() -> Self {
        Self { values: Vec::new() }
    }

    /// Append a value
    pub fn add<T: Any + Send + Sync>(&mut self, value: T) {
        self.values.push(Arc::new(value));
    }

    /// Drop every value and store `value` as the only one
    pub fn set<T: Any + Send + Sync>(&mut self, value: T) {
        self.values.clear();
        self.add(value);
    }

    /// First value of type `T`
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.values.iter().find_map(|v| v.downcast_ref::<T>())
    }

    /// Any value of type `T` present
    pub fn has<T: Any>(&self) -> bool {
        self.get::<T>().is_some()
    }

    /// Every value of type `T`, insertion order
    pub fn iter<T: Any>(&self) -> impl Iterator<Item = &T> + '_ {
        self.values.iter().filter_map(|v| v.downcast_ref::<T>())
    }

    /// Remove the first value equal to `value`. Returns `true` if found.
    pub fn remove<T: Any + PartialEq>(&mut self, value: &T) -> bool {
        let pos = self
            .values
            .iter()
            .position(|v| v.downcast_ref::<T>() == Some(value));
        pos.map(|i| self.values.remove(i)).is_some()
    }

    /// Remove every value of type `T`. Returns the number removed.
    pub fn remove_all<T: Any>(&mut self) -> usize {
        let before = self.values.len();
        self.values.retain(|v| !v.is::<T>());
        before - self.values.len()
    }

    /// Replace the first value equal to `old` with `new`, keeping its
    /// position. Returns `false` (and stores nothing) if `old` is absent.
    pub fn replace<T: Any + PartialEq + Send + Sync>(&mut self, old: &T, new: T) -> bool {
        let Some(i) = self
            .values
            .iter()
            .position(|v| v.downcast_ref::<T>() == Some(old))
        else {
            return false;
        };
        self.values[i] = Arc::new(new);
        true
    }

    /// Number of values of any type
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// No values
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.values.clear();
    }
}

impl fmt::Debug for AttrBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttrBag({} values)", self.values.len())
    }
}
