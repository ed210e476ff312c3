//! Diagnostic State Dump
//!
//! Renders a [`KernelState`] as plain text, one declaration per line, in a
//! stable order so that two dumps can be diffed:
//!
//! ```text
//! class #1 app.Counter super=none fields=[count,limit] statics=[MAX]
//! static L0 app.Counter attrs=[INITIALIZED] [MAX=5] owner=none
//! object @3 app.Counter attrs=[SHARED] pins=0 refs={T0,T1} [count=1,limit=10] owner=T0 count=1
//! string @4 lang.String "hello" owner=none
//! thread T0 "main" RUNNING app=0 lock=none locked=[@3] suspend=0
//! frame T0 #0 app.Main.run pc=3 slots=[@3,null]
//! ```

use crate::domain::heap::{ElementAttrs, ElementInfo, ElementKind};
use crate::domain::kernel::KernelState;
use crate::domain::threads::ThreadInfo;
use std::fmt::{self, Write};

/// Dump everything into a fresh string
pub fn dump_state(kernel: &KernelState) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail
    let _ = write_state(&mut out, kernel);
    out
}

/// Dump classes, statics, heap objects and threads, in that order
pub fn write_state(w: &mut impl Write, kernel: &KernelState) -> fmt::Result {
    write_classes(w, kernel)?;
    write_statics(w, kernel)?;
    write_heap(w, kernel)?;
    write_threads(w, kernel)
}

/// `class` lines, one per registered class
pub fn write_classes(w: &mut impl Write, kernel: &KernelState) -> fmt::Result {
    let registry = kernel.classes();
    for ci in registry.classes() {
        let super_name = ci
            .super_class
            .and_then(|s| registry.class(s))
            .map_or_else(|| "none".to_string(), |s| s.name.to_string());
        write!(w, "class #{} {} super={super_name} fields=[", ci.id.0, ci.name)?;
        join(w, ci.instance_fields.iter().map(|f| &*f.name))?;
        w.write_str("] statics=[")?;
        join(w, ci.static_fields.iter().map(|f| &*f.name))?;
        w.write_str("]\n")?;
    }
    Ok(())
}

/// `static` lines, one per loaded class and loader
pub fn write_statics(w: &mut impl Write, kernel: &KernelState) -> fmt::Result {
    let registry = kernel.classes();
    for loader in kernel.statics.iter() {
        for (class, ei) in loader.classes() {
            let Some(ci) = registry.class(class) else { continue };
            write!(w, "static L{} {} attrs=", loader.id.0, ci.name)?;
            write_attrs(w, ei.attrs)?;
            w.write_str(" [")?;
            let named = ci.static_fields.iter().map(|f| (f.name.to_string(), f.index));
            write_fields(w, ei, named)?;
            writeln!(w, "] {}", ei.monitor)?;
        }
    }
    Ok(())
}

/// `object` / `array` / `string` lines in reference order
pub fn write_heap(w: &mut impl Write, kernel: &KernelState) -> fmt::Result {
    let registry = kernel.classes();
    let mut objects: Vec<_> = kernel.heap.iter().collect();
    objects.sort_by_key(|(obj, _)| obj.0);

    for (obj, ei) in objects {
        let class_name = registry
            .class(ei.class)
            .map_or_else(|| format!("#{}", ei.class.0), |ci| ci.name.to_string());
        match &ei.kind {
            ElementKind::Str(text) => {
                write!(w, "string {obj} {class_name} {text:?}")?;
            }
            ElementKind::Array => {
                write!(w, "array {obj} {class_name} len={} [", ei.fields.len())?;
                join(w, ei.fields.iter())?;
                w.write_str("]")?;
            }
            ElementKind::Object | ElementKind::Static { .. } => {
                write!(w, "object {obj} {class_name} attrs=")?;
                write_attrs(w, ei.attrs)?;
                write!(w, " pins={} refs={} [", ei.pin_down_count, ei.referencing_threads)?;
                let named: Vec<(String, usize)> = registry
                    .class(ei.class)
                    .map(|ci| ci.instance_fields.iter().map(|f| (f.name.to_string(), f.index)).collect())
                    .unwrap_or_default();
                write_fields(w, ei, named.into_iter())?;
                w.write_str("]")?;
            }
        }
        writeln!(w, " {}", ei.monitor)?;
    }
    Ok(())
}

/// `thread` lines, each followed by its `frame` lines (bottom first)
pub fn write_threads(w: &mut impl Write, kernel: &KernelState) -> fmt::Result {
    for ti in kernel.threads.iter() {
        write_thread(w, kernel, ti)?;
    }
    Ok(())
}

fn write_thread(w: &mut impl Write, kernel: &KernelState, ti: &ThreadInfo) -> fmt::Result {
    write!(w, "thread {} {:?} {} app={}", ti.id, &*ti.name, ti.status, ti.app.0)?;
    match ti.lock_ref {
        Some(obj) => write!(w, " lock={obj}")?,
        None => w.write_str(" lock=none")?,
    }
    w.write_str(" locked=[")?;
    join(w, ti.locked_objects.iter())?;
    write!(w, "] suspend={}", ti.suspend_count)?;
    if ti.daemon {
        w.write_str(" daemon")?;
    }
    if let Some(exc) = &ti.uncaught_exception {
        write!(w, " uncaught={exc:?}")?;
    }
    w.write_char('\n')?;

    let registry = kernel.classes();
    for (depth, frame) in ti.frames.iter().enumerate() {
        let method = registry
            .qualified_method(frame.method)
            .unwrap_or_else(|| format!("{}", frame.method));
        write!(w, "frame {} #{depth} {method} pc={} slots=[", ti.id, frame.pc)?;
        join(w, frame.slots.iter())?;
        w.write_str("]\n")?;
    }
    Ok(())
}

fn write_attrs(w: &mut impl Write, attrs: ElementAttrs) -> fmt::Result {
    w.write_char('[')?;
    join(w, attrs.iter_names().map(|(name, _)| name))?;
    w.write_char(']')
}

fn write_fields(
    w: &mut impl Write,
    ei: &ElementInfo,
    named: impl Iterator<Item = (String, usize)>,
) -> fmt::Result {
    let mut first = true;
    for (name, index) in named {
        let Some(value) = ei.field(index) else { continue };
        if !first {
            w.write_char(',')?;
        }
        first = false;
        write!(w, "{name}={value}")?;
    }
    Ok(())
}

fn join<T: fmt::Display>(w: &mut impl Write, items: impl Iterator<Item = T>) -> fmt::Result {
    for (i, item) in items.enumerate() {
        if i > 0 {
            w.write_char(',')?;
        }
        write!(w, "{item}")?;
    }
    Ok(())
}
