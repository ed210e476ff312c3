//! Statics and Class Loader Registry
//!
//! Per-loader static field storage. Every loader owns a copy-on-write table
//! of static elements keyed by class id; the loader list itself is a small
//! vector, so a memento is a vector of table handles.
//!
//! ```text
//!   ClassLoaderList
//!     ├── Loader(0)  system   parent: none
//!     │     └── statics: Class(3) -> ElementInfo{Static}, ...
//!     └── Loader(1)  app      parent: Loader(0)
//!           └── statics: ...
//! ```
//!
//! Static elements carry their own monitor and sharedness data exactly like
//! heap objects. A static lookup delegates to the parent loader when the
//! class is not defined locally.

use crate::domain::classes::{AppId, ClassId, ClassInfo, LoaderId};
use crate::domain::heap::slots::PersistentSlots;
use crate::domain::heap::{ElementAttrs, ElementInfo, ElementKind, GcRoots, ObjRef};
use crate::domain::snapshot::Restorable;
use tracing::debug;

/// One class loader and the statics of the classes it defined
#[derive(Debug, Clone)]
pub struct ClassLoaderInfo {
    /// Loader id
    pub id: LoaderId,
    /// Delegation parent
    pub parent: Option<LoaderId>,
    /// Application context the loader belongs to
    pub app: AppId,
    statics: PersistentSlots<ElementInfo>,
}

impl ClassLoaderInfo {
    /// Static area of `class` defined by this loader
    pub fn static_element(&self, class: ClassId) -> Option<&ElementInfo> {
        self.statics.get(class.as_usize())
    }

    /// Classes defined by this loader, id order
    pub fn classes(&self) -> impl Iterator<Item = (ClassId, &ElementInfo)> + '_ {
        self.statics
            .iter()
            .map(|(i, ei)| (ClassId::new(i as u32), ei))
    }

    /// Number of classes defined by this loader
    pub const fn class_count(&self) -> usize {
        self.statics.len()
    }
}

/// All loaders of the current path.
#[derive(Debug, Clone, Default)]
pub struct ClassLoaderList {
    loaders: Vec<ClassLoaderInfo>,
}

/// Captured loader list
#[derive(Debug, Clone)]
pub struct ClassLoaderListMemento {
    loaders: Vec<ClassLoaderInfo>,
}

impl ClassLoaderList {
    /// Empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a loader and return its id
    pub fn add_loader(&mut self, parent: Option<LoaderId>, app: AppId) -> LoaderId {
        let id = LoaderId::new(self.loaders.len() as u32);
        self.loaders.push(ClassLoaderInfo {
            id,
            parent,
            app,
            statics: PersistentSlots::new(),
        });
        debug!("added class loader {id} (parent {parent:?}, {app})");
        id
    }

    /// Loader by id
    pub fn loader(&self, id: LoaderId) -> Option<&ClassLoaderInfo> {
        self.loaders.get(id.as_usize())
    }

    /// All loaders
    pub fn iter(&self) -> impl Iterator<Item = &ClassLoaderInfo> + '_ {
        self.loaders.iter()
    }

    /// Number of loaders
    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    /// No loaders
    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }

    /// Create the static area of `class` in `loader` if it does not exist.
    /// Returns `false` if the loader is unknown.
    pub fn register_class(&mut self, loader: LoaderId, class: &ClassInfo, class_object: Option<ObjRef>) -> bool {
        let Some(li) = self.loaders.get_mut(loader.as_usize()) else {
            return false;
        };
        if !li.statics.contains(class.id.as_usize()) {
            let ei = ElementInfo::new(
                class.id,
                ElementKind::Static { class_object },
                class.static_fields.len(),
                li.app,
            );
            li.statics.insert(class.id.as_usize(), ei);
        }
        true
    }

    /// Loader that defines `class`, starting at `loader` and following the
    /// parent chain
    pub fn defining_loader(&self, loader: LoaderId, class: ClassId) -> Option<LoaderId> {
        let mut cur = Some(loader);
        while let Some(id) = cur {
            let li = self.loader(id)?;
            if li.statics.contains(class.as_usize()) {
                return Some(id);
            }
            cur = li.parent;
        }
        None
    }

    /// Static area of `class` as seen from `loader`
    pub fn static_element(&self, loader: LoaderId, class: ClassId) -> Option<&ElementInfo> {
        let owner = self.defining_loader(loader, class)?;
        self.loader(owner)?.static_element(class)
    }

    /// Modifiable static area of `class` as seen from `loader`
    pub fn static_element_mut(&mut self, loader: LoaderId, class: ClassId) -> Option<&mut ElementInfo> {
        let owner = self.defining_loader(loader, class)?;
        self.loaders
            .get_mut(owner.as_usize())?
            .statics
            .get_mut(class.as_usize())
    }

    /// Static initializer of `class` completed
    pub fn is_initialized(&self, loader: LoaderId, class: ClassId) -> bool {
        self.static_element(loader, class)
            .is_some_and(|ei| ei.attrs.contains(ElementAttrs::INITIALIZED))
    }

    /// Mark the static initializer of `class` as completed
    pub fn set_initialized(&mut self, loader: LoaderId, class: ClassId) -> bool {
        match self.static_element_mut(loader, class) {
            Some(ei) => {
                ei.attrs |= ElementAttrs::INITIALIZED;
                true
            }
            None => false,
        }
    }

    /// Drop dead candidate locks from static lock infos after a GC
    pub fn cleanup(&mut self, is_alive: impl Fn(ObjRef) -> bool) {
        for li in &mut self.loaders {
            let stale: Vec<usize> = li
                .statics
                .iter()
                .filter(|(_, ei)| {
                    ei.lock_infos
                        .iter()
                        .any(|(_, fli)| fli.locks().iter().any(|l| !is_alive(*l)))
                })
                .map(|(i, _)| i)
                .collect();
            for idx in stale {
                if let Some(ei) = li.statics.get_mut(idx) {
                    ei.cleanup_lock_infos(&is_alive);
                }
            }
        }
    }
}

impl GcRoots for ClassLoaderList {
    fn for_each_root(&self, f: &mut dyn FnMut(ObjRef)) {
        for li in &self.loaders {
            for (_, ei) in li.statics.iter() {
                for r in ei.traced_refs() {
                    f(r);
                }
            }
        }
    }
}

impl Restorable for ClassLoaderList {
    type Memento = ClassLoaderListMemento;

    fn memento(&self) -> ClassLoaderListMemento {
        ClassLoaderListMemento {
            loaders: self.loaders.clone(),
        }
    }

    fn restore(&mut self, memento: &ClassLoaderListMemento) {
        self.loaders.clone_from(&memento.loaders);
    }
}
