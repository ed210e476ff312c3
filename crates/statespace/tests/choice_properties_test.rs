//! Integration Test: Choice Enumeration and Backtracking Properties
//!
//! A data-choice engine registers a cascade of integer generators in one
//! instruction and records what it sees on re-execution. Property tests
//! check enumeration order and that backtracking restores fingerprints.

use parking_lot::Mutex;
use proptest::prelude::*;
use statespace::adapters::{scenario, ScriptedProgram};
use statespace::domain::choice::IntIntervalGenerator;
use statespace::domain::{
    AppId, ChoiceGenerator, ClassDef, ClassRegistry, EngineError, ExecutionEngine, MethodFlags, Step,
    ThreadId, Vm, VmConfig, VmCore,
};
use statespace::domain::threads::StackFrame;
use std::sync::Arc;

/// One thread that asks for one integer per generator, then terminates
#[derive(Debug)]
struct CascadeEngine {
    sizes: Vec<i64>,
    seen: Arc<Mutex<Vec<Vec<i64>>>>,
}

impl ExecutionEngine for CascadeEngine {
    fn initialize(&mut self, core: &mut VmCore) -> Result<(), EngineError> {
        let classes = Arc::clone(core.kernel.classes());
        let class = classes.define(ClassDef::new("app.Picker"));
        let run = classes.define_method(class, "run", MethodFlags::default());
        let tid = core.kernel.threads.create("main", AppId::new(0));
        core.kernel.start_thread(tid)?;
        core.kernel.thread_mut(tid)?.frames.push(StackFrame::new(run));
        Ok(())
    }

    fn step(&mut self, core: &mut VmCore, tid: ThreadId) -> Result<Step, EngineError> {
        match core.pc(tid)? {
            0 => {
                core.advance_pc(tid)?;
                Ok(Step::Continue)
            }
            1 if !core.is_first_step() => {
                for (i, n) in self.sizes.iter().enumerate() {
                    let cg = IntIntervalGenerator::new(format!("pick{i}"), 0, n - 1);
                    core.with_scheduler(|_, cx| cx.register(Box::new(cg)));
                }
                Ok(Step::Reexecute)
            }
            1 => {
                let mut picks = Vec::new();
                for h in core.system.choice_generators() {
                    if let Some(cg) = core.system.cg(h).filter(|cg| cg.is::<IntIntervalGenerator>()) {
                        picks.extend(cg.next_choice().and_then(|v| v.as_int()));
                    }
                }
                self.seen.lock().push(picks);
                core.advance_pc(tid)?;
                Ok(Step::Continue)
            }
            _ => {
                core.kernel.terminate(tid)?;
                Ok(Step::Exit)
            }
        }
    }
}

fn cascade_vm(sizes: &[i64]) -> (Vm<CascadeEngine>, Arc<Mutex<Vec<Vec<i64>>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let engine = CascadeEngine {
        sizes: sizes.to_vec(),
        seen: Arc::clone(&seen),
    };
    let mut vm = Vm::new(&VmConfig::default(), Arc::new(ClassRegistry::new()), engine).unwrap();
    vm.initialize().unwrap();
    (vm, seen)
}

/// Plain DFS, returns the number of transitions
fn explore<E: ExecutionEngine>(vm: &mut Vm<E>) -> usize {
    let mut transitions = 0;
    loop {
        match vm.forward().unwrap() {
            Some(o) => {
                transitions += 1;
                if o.is_end || !o.is_new {
                    vm.backtrack();
                }
            }
            None => {
                if !vm.backtrack() {
                    return transitions;
                }
            }
        }
    }
}

fn product(sizes: &[i64]) -> Vec<Vec<i64>> {
    sizes.iter().fold(vec![Vec::new()], |acc, &n| {
        acc.iter()
            .flat_map(|prefix| {
                (0..n).map(move |v| {
                    let mut next = prefix.clone();
                    next.push(v);
                    next
                })
            })
            .collect()
    })
}

#[test]
fn test_cascade_of_two_one_one_enumerates_two_combinations() {
    let (mut vm, seen) = cascade_vm(&[2, 1, 1]);
    explore(&mut vm);
    assert_eq!(*seen.lock(), vec![vec![0, 0, 0], vec![1, 0, 0]]);
}

#[test]
fn test_cascade_newest_generator_varies_fastest() {
    let (mut vm, seen) = cascade_vm(&[2, 3]);
    explore(&mut vm);
    assert_eq!(*seen.lock(), product(&[2, 3]));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_cascade_enumerates_cartesian_product(sizes in prop::collection::vec(1i64..4, 1..4)) {
        let (mut vm, seen) = cascade_vm(&sizes);
        explore(&mut vm);
        prop_assert_eq!(seen.lock().clone(), product(&sizes));
    }

    #[test]
    fn prop_backtrack_restores_fingerprint(
        name in prop::sample::select(vec!["abba", "racy-counter", "wait-notify", "publish"]),
        moves in prop::collection::vec(any::<bool>(), 1..40),
    ) {
        let program = scenario(name).unwrap();
        let mut vm = Vm::new(&VmConfig::default(), Arc::new(ClassRegistry::new()), ScriptedProgram::new(program)).unwrap();
        vm.initialize().unwrap();

        let mut fingerprints = vec![vm.fingerprint()];
        for go_forward in moves {
            if go_forward {
                if vm.forward().unwrap().is_some() {
                    fingerprints.push(vm.fingerprint());
                    continue;
                }
            }
            if !vm.backtrack() {
                break;
            }
            fingerprints.pop();
            prop_assert_eq!(Some(&vm.fingerprint()), fingerprints.last());
        }
        prop_assert_eq!(fingerprints.len(), vm.depth() + 1);
    }

    #[test]
    fn prop_repeated_gc_is_stable(steps in 0usize..12) {
        let program = scenario("publish").unwrap();
        let mut vm = Vm::new(&VmConfig::default(), Arc::new(ClassRegistry::new()), ScriptedProgram::new(program)).unwrap();
        vm.initialize().unwrap();
        for _ in 0..steps {
            if vm.forward().unwrap().is_none() && !vm.backtrack() {
                break;
            }
        }
        let live_before: Vec<_> = vm.kernel().heap.iter().map(|(r, _)| r).collect();
        vm.core_mut().kernel.gc();
        let live_after: Vec<_> = vm.kernel().heap.iter().map(|(r, _)| r).collect();
        vm.core_mut().kernel.gc();
        let live_again: Vec<_> = vm.kernel().heap.iter().map(|(r, _)| r).collect();
        prop_assert!(live_after.iter().all(|r| live_before.contains(r)));
        prop_assert_eq!(live_after, live_again);
    }
}
