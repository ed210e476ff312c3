//! Exploration Benchmark Suite
//!
//! # Scenarios
//!
//! 1. **Full search**: exhaustive DFS over the built-in scripted programs
//!    - `locked-counter`: no findings, whole space explored
//!    - `racy-counter` with `multiple_errors`: every lost update reported
//!    - `abba`: stops at the first deadlock
//!
//! 2. **Snapshot / restore**: cost of capturing and reinstating a node in
//!    the middle of a path

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use statespace::adapters::{scenario, DfsSearch, ScriptedProgram};
use statespace::domain::{ClassRegistry, Vm, VmConfig};
use statespace::infrastructure::CoreConfig;
use std::sync::Arc;

fn run_search(name: &str, multiple_errors: bool) -> usize {
    let mut config = CoreConfig {
        target: name.to_string(),
        ..CoreConfig::default()
    };
    config.search.multiple_errors = multiple_errors;
    let program = scenario(name).expect("known scenario");
    let mut search = DfsSearch::with_engine(&config, Arc::new(ClassRegistry::new()), ScriptedProgram::new(program))
        .expect("vm initializes");
    search.run().expect("search succeeds");
    search.stats().transitions
}

fn bench_full_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_search");
    for (name, multiple) in [("locked-counter", false), ("racy-counter", true), ("abba", false)] {
        group.bench_with_input(BenchmarkId::from_parameter(name), &multiple, |b, &multiple| {
            b.iter(|| black_box(run_search(name, multiple)));
        });
    }
    group.finish();
}

fn bench_snapshot_restore(c: &mut Criterion) {
    let program = scenario("racy-counter").expect("known scenario");
    let mut vm = Vm::new(&VmConfig::default(), Arc::new(ClassRegistry::new()), ScriptedProgram::new(program))
        .expect("valid config");
    vm.initialize().expect("vm initializes");
    for _ in 0..4 {
        vm.forward().expect("forward succeeds");
    }
    let snap = vm.snapshot();

    c.bench_function("snapshot", |b| b.iter(|| black_box(vm.snapshot())));
    c.bench_function("restore_and_forward", |b| {
        b.iter(|| {
            vm.restore(&snap);
            black_box(vm.forward().expect("forward succeeds"))
        });
    });
}

criterion_group!(benches, bench_full_search, bench_snapshot_restore);
criterion_main!(benches);
