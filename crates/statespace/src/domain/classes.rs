//! Class & Method Registry
//!
//! Class-file parsing is not part of the core. The execution collaborator
//! registers the shapes it needs (field layout, finalizer presence, method
//! flags) and the core works with the resulting integer ids.
//!
//! The registry is search-global: ids stay stable across backtracking, and
//! one registry is shared by every state of a run. It is created per run and
//! cleared with [`ClassRegistry::reset`], never held in a static.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;

/// Name of the class used for string objects
pub const STRING_CLASS: &str = "lang.String";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Identifiers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

macro_rules! registry_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
        pub struct $name(pub u32);

        impl $name {
            /// Create a new id
            #[inline(always)]
            pub const fn new(id: u32) -> Self {
                Self(id)
            }

            /// Raw index
            #[inline(always)]
            pub const fn as_usize(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "({})"), self.0)
            }
        }
    };
}

registry_id!(
    /// Dense class identifier, stable for the whole run
    ClassId,
    "Class"
);
registry_id!(
    /// Dense method identifier, stable for the whole run
    MethodId,
    "Method"
);
registry_id!(
    /// Class loader identifier
    LoaderId,
    "Loader"
);
registry_id!(
    /// Application context (a process inside the modeled program)
    AppId,
    "App"
);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Class / field / method shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Declared field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    /// Simple name
    pub name: Arc<str>,
    /// Slot index inside the owning element
    pub index: usize,
    /// `final` modifier
    pub is_final: bool,
    /// Static field
    pub is_static: bool,
    /// Holds a reference
    pub is_reference: bool,
}

/// Registered class
#[derive(Debug, Clone)]
pub struct ClassInfo {
    /// Class id
    pub id: ClassId,
    /// Fully qualified name
    pub name: Arc<str>,
    /// Superclass, if any
    pub super_class: Option<ClassId>,
    /// Instance field layout
    pub instance_fields: Vec<FieldInfo>,
    /// Static field layout
    pub static_fields: Vec<FieldInfo>,
    /// Instances need finalization before release
    pub has_finalizer: bool,
    /// Instances never change after construction
    pub is_immutable: bool,
    /// Field that holds a weak referent (not traced by GC)
    pub weak_referent: Option<usize>,
}

impl ClassInfo {
    /// Instance field by name
    pub fn instance_field(&self, name: &str) -> Option<&FieldInfo> {
        self.instance_fields.iter().find(|f| &*f.name == name)
    }

    /// Static field by name
    pub fn static_field(&self, name: &str) -> Option<&FieldInfo> {
        self.static_fields.iter().find(|f| &*f.name == name)
    }

    /// `Class.field` for pattern matching and dumps
    pub fn qualified_field(&self, field: &FieldInfo) -> String {
        format!("{}.{}", self.name, field.name)
    }
}

/// Registered method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    /// Method id
    pub id: MethodId,
    /// Declaring class
    pub class: ClassId,
    /// Simple name
    pub name: Arc<str>,
    /// Constructor
    pub is_init: bool,
    /// Static initializer
    pub is_clinit: bool,
    /// `synchronized` modifier
    pub is_synchronized: bool,
}

/// Builder for a class registration.
///
/// # Example
///
/// ```rust
/// use statespace::domain::classes::{ClassDef, ClassRegistry};
///
/// let registry = ClassRegistry::new();
/// let account = registry.define(
///     ClassDef::new("Account").field("balance").ref_field("owner").finalizer(),
/// );
/// assert_eq!(registry.class(account).unwrap().instance_fields.len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ClassDef {
    name: String,
    super_class: Option<ClassId>,
    fields: Vec<(String, bool, bool, bool)>,
    has_finalizer: bool,
    is_immutable: bool,
    weak_referent: Option<String>,
}

impl ClassDef {
    /// Start a class definition
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Superclass
    #[must_use]
    pub const fn extends(mut self, super_class: ClassId) -> Self {
        self.super_class = Some(super_class);
        self
    }

    /// Primitive instance field
    #[must_use]
    pub fn field(mut self, name: &str) -> Self {
        self.fields.push((name.to_owned(), false, false, false));
        self
    }

    /// Reference instance field
    #[must_use]
    pub fn ref_field(mut self, name: &str) -> Self {
        self.fields.push((name.to_owned(), false, false, true));
        self
    }

    /// Final primitive instance field
    #[must_use]
    pub fn final_field(mut self, name: &str) -> Self {
        self.fields.push((name.to_owned(), true, false, false));
        self
    }

    /// Primitive static field
    #[must_use]
    pub fn static_field(mut self, name: &str) -> Self {
        self.fields.push((name.to_owned(), false, true, false));
        self
    }

    /// Reference static field
    #[must_use]
    pub fn static_ref_field(mut self, name: &str) -> Self {
        self.fields.push((name.to_owned(), false, true, true));
        self
    }

    /// Final static field
    #[must_use]
    pub fn static_final_field(mut self, name: &str) -> Self {
        self.fields.push((name.to_owned(), true, true, false));
        self
    }

    /// Instances carry a finalizer
    #[must_use]
    pub const fn finalizer(mut self) -> Self {
        self.has_finalizer = true;
        self
    }

    /// Instances are immutable
    #[must_use]
    pub const fn immutable(mut self) -> Self {
        self.is_immutable = true;
        self
    }

    /// Reference field `name` holds a weak referent
    #[must_use]
    pub fn weak_referent(mut self, name: &str) -> Self {
        self.fields.push((name.to_owned(), false, false, true));
        self.weak_referent = Some(name.to_owned());
        self
    }

    fn build(self, id: ClassId) -> ClassInfo {
        let mut instance_fields = Vec::new();
        let mut static_fields = Vec::new();
        for (name, is_final, is_static, is_reference) in self.fields {
            let target = if is_static {
                &mut static_fields
            } else {
                &mut instance_fields
            };
            target.push(FieldInfo {
                name: Arc::from(name.as_str()),
                index: target.len(),
                is_final,
                is_static,
                is_reference,
            });
        }
        let weak_referent = self
            .weak_referent
            .and_then(|n| instance_fields.iter().find(|f| *f.name == *n).map(|f| f.index));

        ClassInfo {
            id,
            name: Arc::from(self.name.as_str()),
            super_class: self.super_class,
            instance_fields,
            static_fields,
            has_finalizer: self.has_finalizer,
            is_immutable: self.is_immutable,
            weak_referent,
        }
    }
}

/// Flags for a method registration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodFlags {
    /// Constructor
    pub is_init: bool,
    /// Static initializer
    pub is_clinit: bool,
    /// `synchronized`
    pub is_synchronized: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default)]
struct Inner {
    classes: Vec<Arc<ClassInfo>>,
    by_name: FxHashMap<Arc<str>, ClassId>,
    methods: Vec<Arc<MethodInfo>>,
}

/// Run-scoped class and method table.
#[derive(Debug, Default)]
pub struct ClassRegistry {
    inner: RwLock<Inner>,
}

impl ClassRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class. Re-registering a name returns the existing id.
    pub fn define(&self, def: ClassDef) -> ClassId {
        let mut inner = self.inner.write();
        if let Some(&id) = inner.by_name.get(def.name.as_str()) {
            return id;
        }
        let id = ClassId::new(inner.classes.len() as u32);
        let info = Arc::new(def.build(id));
        inner.by_name.insert(Arc::clone(&info.name), id);
        inner.classes.push(info);
        id
    }

    /// Class by id
    pub fn class(&self, id: ClassId) -> Option<Arc<ClassInfo>> {
        self.inner.read().classes.get(id.as_usize()).cloned()
    }

    /// Class by fully qualified name
    pub fn class_by_name(&self, name: &str) -> Option<Arc<ClassInfo>> {
        let inner = self.inner.read();
        inner
            .by_name
            .get(name)
            .and_then(|id| inner.classes.get(id.as_usize()).cloned())
    }

    /// The immutable string class, registered on first use
    pub fn string_class(&self) -> ClassId {
        if let Some(ci) = self.class_by_name(STRING_CLASS) {
            return ci.id;
        }
        self.define(ClassDef::new(STRING_CLASS).immutable())
    }

    /// Superclass chain starting with `id` itself
    pub fn lineage(&self, id: ClassId) -> Vec<Arc<ClassInfo>> {
        let mut out = Vec::new();
        let mut cur = self.class(id);
        while let Some(ci) = cur {
            cur = ci.super_class.and_then(|s| self.class(s));
            out.push(ci);
        }
        out
    }

    /// Register a method on `class`
    pub fn define_method(&self, class: ClassId, name: &str, flags: MethodFlags) -> MethodId {
        let mut inner = self.inner.write();
        let id = MethodId::new(inner.methods.len() as u32);
        inner.methods.push(Arc::new(MethodInfo {
            id,
            class,
            name: Arc::from(name),
            is_init: flags.is_init,
            is_clinit: flags.is_clinit,
            is_synchronized: flags.is_synchronized,
        }));
        id
    }

    /// Method by id
    pub fn method(&self, id: MethodId) -> Option<Arc<MethodInfo>> {
        self.inner.read().methods.get(id.as_usize()).cloned()
    }

    /// `Class.method` for pattern matching
    pub fn qualified_method(&self, id: MethodId) -> Option<String> {
        let mi = self.method(id)?;
        let ci = self.class(mi.class)?;
        Some(format!("{}.{}", ci.name, mi.name))
    }

    /// Number of registered classes
    pub fn class_count(&self) -> usize {
        self.inner.read().classes.len()
    }

    /// Snapshot of all classes, id order
    pub fn classes(&self) -> Vec<Arc<ClassInfo>> {
        self.inner.read().classes.clone()
    }

    /// Drop every registration (end of run)
    pub fn reset(&self) {
        *self.inner.write() = Inner::default();
    }
}

/// Glob match supporting `*` wildcards, used by the configuration patterns
/// for types, fields and methods.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_define_assigns_dense_ids_and_layout() {
        let reg = ClassRegistry::new();
        let a = reg.define(ClassDef::new("A").field("x").static_field("count").ref_field("next"));
        let b = reg.define(ClassDef::new("B"));
        assert_eq!(a, ClassId::new(0));
        assert_eq!(b, ClassId::new(1));

        let ci = reg.class(a).unwrap();
        assert_eq!(ci.instance_fields.len(), 2);
        assert_eq!(ci.instance_field("next").unwrap().index, 1);
        assert!(ci.instance_field("next").unwrap().is_reference);
        assert_eq!(ci.static_field("count").unwrap().index, 0);
    }

    #[test]
    fn test_redefinition_returns_existing_id() {
        let reg = ClassRegistry::new();
        let a = reg.define(ClassDef::new("A"));
        assert_eq!(reg.define(ClassDef::new("A").field("ignored")), a);
        assert_eq!(reg.class_count(), 1);
    }

    #[test]
    fn test_weak_referent_field_is_resolved() {
        let reg = ClassRegistry::new();
        let w = reg.define(ClassDef::new("WeakRef").field("tag").weak_referent("referent"));
        assert_eq!(reg.class(w).unwrap().weak_referent, Some(1));
    }

    #[test]
    fn test_lineage_walks_superclasses() {
        let reg = ClassRegistry::new();
        let base = reg.define(ClassDef::new("Base"));
        let derived = reg.define(ClassDef::new("Derived").extends(base));
        let names: Vec<_> = reg.lineage(derived).iter().map(|c| c.name.to_string()).collect();
        assert_eq!(names, vec!["Derived", "Base"]);
    }

    #[test]
    fn test_reset_clears_everything() {
        let reg = ClassRegistry::new();
        let a = reg.define(ClassDef::new("A"));
        reg.define_method(a, "run", MethodFlags::default());
        reg.reset();
        assert_eq!(reg.class_count(), 0);
        assert!(reg.method(MethodId::new(0)).is_none());
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("app.util.*", "app.util.HashMap"));
        assert!(glob_match("*.count", "Counter.count"));
        assert!(glob_match("*", ""));
        assert!(glob_match("A*B*C", "AxxBxxC"));
        assert!(!glob_match("A*B", "AxxC"));
        assert!(!glob_match("Counter", "Counters"));
    }
}
