//! Heap Element
//!
//! Header, field storage, monitor and sharedness bookkeeping of one heap
//! object or static class area. Elements are immutable once a snapshot
//! shares them; see [`super::slots::PersistentSlots`].

use super::field_lock::FieldLockInfo;
use super::types::{ObjRef, Value};
use crate::domain::classes::{AppId, ClassId};
use crate::domain::threads::{Monitor, ThreadSet};
use bitflags::bitflags;
use smallvec::SmallVec;
use std::sync::Arc;

bitflags! {
    /// Element attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ElementAttrs: u16 {
        /// Reachable from more than one live thread
        const SHARED          = 1 << 0;
        /// Sharedness must not change anymore
        const FREEZE_SHARED   = 1 << 1;
        /// Stored into a shared object while not shared itself
        const EXPOSED         = 1 << 2;
        /// Never mutated after construction
        const IMMUTABLE       = 1 << 3;
        /// Class declares a finalizer
        const HAS_FINALIZER   = 1 << 4;
        /// Finalizer already ran
        const FINALIZED       = 1 << 5;
        /// Constructor completed
        const CONSTRUCTED     = 1 << 6;
        /// Interned string
        const INTERNED        = 1 << 7;
        /// Static initializer completed
        const INITIALIZED     = 1 << 8;
    }
}

/// Element payload kind
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ElementKind {
    /// Plain object
    Object,
    /// Array, fields are the elements
    Array,
    /// String with its character data
    Str(Arc<str>),
    /// Static field area of a class
    Static {
        /// `lang.Class` object of the class, if created
        class_object: Option<ObjRef>,
    },
}

/// One heap or static element
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementInfo {
    /// Class
    pub class: ClassId,
    /// Payload kind
    pub kind: ElementKind,
    /// Field or array element values
    pub fields: Vec<Value>,
    /// Lock state
    pub monitor: Monitor,
    /// Attributes
    pub attrs: ElementAttrs,
    /// Pin-down count, keeps the element alive while > 0
    pub pin_down_count: u32,
    /// Threads that accessed this element
    pub referencing_threads: ThreadSet,
    /// Lock protection per field index
    pub lock_infos: SmallVec<[(usize, FieldLockInfo); 2]>,
    /// Owning application context
    pub app: AppId,
    /// Field holding a weak referent (not traced by GC)
    pub weak_field: Option<usize>,
}

impl ElementInfo {
    /// New element with `n_fields` null fields
    pub fn new(class: ClassId, kind: ElementKind, n_fields: usize, app: AppId) -> Self {
        Self {
            class,
            kind,
            fields: vec![Value::Null; n_fields],
            monitor: Monitor::new(),
            attrs: ElementAttrs::empty(),
            pin_down_count: 0,
            referencing_threads: ThreadSet::new(),
            lock_infos: SmallVec::new(),
            app,
            weak_field: None,
        }
    }

    /// Field value
    #[inline]
    pub fn field(&self, index: usize) -> Option<Value> {
        self.fields.get(index).copied()
    }

    /// Store a field value, `false` if out of range
    #[inline]
    pub fn set_field(&mut self, index: usize, value: Value) -> bool {
        match self.fields.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// String payload
    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            ElementKind::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Array element
    pub const fn is_array(&self) -> bool {
        matches!(self.kind, ElementKind::Array)
    }

    /// Static class area
    pub const fn is_static(&self) -> bool {
        matches!(self.kind, ElementKind::Static { .. })
    }

    /// Reachable from several live threads
    #[inline]
    pub const fn is_shared(&self) -> bool {
        self.attrs.contains(ElementAttrs::SHARED)
    }

    /// Immutable object
    #[inline]
    pub const fn is_immutable(&self) -> bool {
        self.attrs.contains(ElementAttrs::IMMUTABLE)
    }

    /// Pinned down
    #[inline]
    pub const fn is_pinned(&self) -> bool {
        self.pin_down_count > 0
    }

    /// Needs a finalizer run before it can be released
    #[inline]
    pub const fn needs_finalization(&self) -> bool {
        self.attrs.contains(ElementAttrs::HAS_FINALIZER) && !self.attrs.contains(ElementAttrs::FINALIZED)
    }

    /// Outgoing references traced by GC (weak referent excluded)
    pub fn traced_refs(&self) -> impl Iterator<Item = ObjRef> + '_ {
        let class_object = match self.kind {
            ElementKind::Static { class_object } => class_object,
            _ => None,
        };
        self.fields
            .iter()
            .enumerate()
            .filter(move |(i, _)| Some(*i) != self.weak_field)
            .filter_map(|(_, v)| v.as_obj())
            .chain(class_object)
    }

    /// Lock protection info for a field
    pub fn lock_info(&self, field: usize) -> Option<&FieldLockInfo> {
        self.lock_infos
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, fli)| fli)
    }

    /// Replace the lock protection info for a field
    pub fn set_lock_info(&mut self, field: usize, info: FieldLockInfo) {
        match self.lock_infos.iter_mut().find(|(f, _)| *f == field) {
            Some(entry) => entry.1 = info,
            None => self.lock_infos.push((field, info)),
        }
    }

    /// Field access is covered by a protecting lock
    pub fn is_lock_protected(&self, field: usize) -> bool {
        self.lock_info(field).is_some_and(FieldLockInfo::is_protected)
    }

    /// Drop dead candidate locks from all lock infos
    pub fn cleanup_lock_infos(&mut self, is_alive: impl Fn(ObjRef) -> bool) {
        for (_, fli) in &mut self.lock_infos {
            *fli = fli.cleanup(&is_alive);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weak_field_is_not_traced() {
        let mut ei = ElementInfo::new(ClassId::new(0), ElementKind::Object, 3, AppId::new(0));
        ei.weak_field = Some(1);
        ei.set_field(0, Value::Ref(ObjRef::new(4)));
        ei.set_field(1, Value::Ref(ObjRef::new(5)));
        ei.set_field(2, Value::Int(1));
        assert_eq!(ei.traced_refs().collect::<Vec<_>>(), vec![ObjRef::new(4)]);
    }

    #[test]
    fn test_static_area_traces_class_object() {
        let ei = ElementInfo::new(
            ClassId::new(0),
            ElementKind::Static {
                class_object: Some(ObjRef::new(2)),
            },
            1,
            AppId::new(0),
        );
        assert_eq!(ei.traced_refs().collect::<Vec<_>>(), vec![ObjRef::new(2)]);
    }

    #[test]
    fn test_finalization_attrs() {
        let mut ei = ElementInfo::new(ClassId::new(0), ElementKind::Object, 0, AppId::new(0));
        assert!(!ei.needs_finalization());
        ei.attrs |= ElementAttrs::HAS_FINALIZER;
        assert!(ei.needs_finalization());
        ei.attrs |= ElementAttrs::FINALIZED;
        assert!(!ei.needs_finalization());
    }

    #[test]
    fn test_set_field_out_of_range() {
        let mut ei = ElementInfo::new(ClassId::new(0), ElementKind::Array, 2, AppId::new(0));
        assert!(ei.set_field(1, Value::Int(7)));
        assert!(!ei.set_field(2, Value::Int(7)));
        assert_eq!(ei.field(1), Some(Value::Int(7)));
    }
}
