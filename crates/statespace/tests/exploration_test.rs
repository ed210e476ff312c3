//! Integration Test: Scenario Exploration, Traces and Snapshots
//!
//! Runs the built-in scripted scenarios end to end through the search
//! driver, stores the error trace, and replays it on a fresh VM.

use statespace::adapters::{scenario, DfsSearch, Finding, ScriptedProgram};
use statespace::domain::{ClassRegistry, ThreadStatus, Vm, VmConfig};
use statespace::infrastructure::{dump_state, Config, CoreConfig, TraceFile};
use std::sync::Arc;

fn fresh_vm(name: &str) -> Vm<ScriptedProgram> {
    let program = scenario(name).expect("known scenario");
    let mut vm = Vm::new(&VmConfig::default(), Arc::new(ClassRegistry::new()), ScriptedProgram::new(program)).unwrap();
    vm.initialize().unwrap();
    vm
}

fn search(name: &str, config: &CoreConfig) -> DfsSearch<ScriptedProgram> {
    let program = scenario(name).expect("known scenario");
    DfsSearch::with_engine(config, Arc::new(ClassRegistry::new()), ScriptedProgram::new(program)).unwrap()
}

fn config_for(name: &str) -> CoreConfig {
    CoreConfig {
        target: name.to_string(),
        ..CoreConfig::default()
    }
}

#[test]
fn test_abba_trace_replays_into_deadlock() {
    let mut s = search("abba", &config_for("abba"));
    let report = s.run().unwrap()[0].clone();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("abba.trace");
    report.trace.store(&path, true).unwrap();

    let trace = TraceFile::read(&path, Some("abba")).unwrap();
    assert_eq!(trace.points, report.trace.points);

    let mut vm = fresh_vm("abba");
    let outcomes = vm.replay(trace.points).unwrap();
    assert!(!outcomes.is_empty() && outcomes.len() <= report.depth);
    assert!(vm.is_deadlocked());
    assert!(vm
        .kernel()
        .threads
        .iter()
        .filter(|t| t.is_alive())
        .all(|t| t.status == ThreadStatus::Blocked));
}

#[test]
fn test_racy_counter_trace_reproduces_assertion() {
    let mut s = search("racy-counter", &config_for("racy-counter"));
    let report = s.run().unwrap()[0].clone();
    let Finding::UncaughtException { thread, .. } = report.finding else {
        panic!("expected an uncaught exception, got {}", report.finding);
    };

    let text = report.trace.render(false);
    let trace = TraceFile::parse(&text, Some("racy-counter")).unwrap();
    let mut vm = fresh_vm("racy-counter");
    vm.replay(trace.points).unwrap();
    let ti = vm.kernel().thread(thread).unwrap();
    assert!(ti.uncaught_exception.as_deref().unwrap().contains("lost update"));
}

#[test]
fn test_trace_of_other_application_is_rejected() {
    let mut s = search("abba", &config_for("abba"));
    let report = s.run().unwrap()[0].clone();
    let text = report.trace.render(false);
    assert!(TraceFile::parse(&text, Some("wait-notify")).is_err());
}

#[test]
fn test_multiple_errors_keeps_searching() {
    let mut config = config_for("racy-counter");
    config.search.multiple_errors = true;
    let mut s = search("racy-counter", &config);
    let reports = s.run().unwrap().len();
    assert!(reports >= 1);
    // the whole space was explored, so the driver ended back at the root
    assert_eq!(s.vm().depth(), 0);
}

#[test]
fn test_snapshot_restore_reproduces_dump() {
    let mut vm = fresh_vm("racy-counter");
    for _ in 0..3 {
        vm.forward().unwrap().unwrap();
    }
    let snap = vm.snapshot();
    let fingerprint = vm.fingerprint();
    let dump = dump_state(vm.kernel());

    while let Some(outcome) = vm.forward().unwrap() {
        if outcome.is_end {
            break;
        }
    }
    assert_ne!(dump_state(vm.kernel()), dump);

    vm.restore(&snap);
    assert_eq!(vm.fingerprint(), fingerprint);
    assert_eq!(dump_state(vm.kernel()), dump);
}

#[test]
fn test_properties_drive_the_search() {
    let mut props = Config::new();
    props
        .load_str(
            "target = abba\n\
             search.depth_limit = 1\n\
             cg.break_single_choice = false\n",
        )
        .unwrap();
    let config = CoreConfig::from_config(&props).unwrap();
    assert_eq!(config.target, "abba");

    let mut s = search("abba", &config);
    assert!(s.run().unwrap().is_empty());
    assert_eq!(s.stats().max_depth, 1);
}

#[test]
fn test_gc_keeps_published_node_alive() {
    let mut vm = fresh_vm("publish");
    while let Some(outcome) = vm.forward().unwrap() {
        if outcome.is_end {
            break;
        }
    }
    let holder = vm.engine().global(vm.core(), 0).unwrap();
    let node = vm.kernel().heap.field(holder, 0).unwrap().as_obj().unwrap();

    let first = vm.core_mut().kernel.gc();
    let second = vm.core_mut().kernel.gc();
    assert!(vm.kernel().heap.is_alive(node));
    assert!(!first.released.contains(&node));
    assert!(second.released.is_empty());
    assert_eq!(first.marked, second.marked);
}
