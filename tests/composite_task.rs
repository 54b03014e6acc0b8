// tests/composite_task.rs

mod common;
use crate::common::{new_loop, settle};

use std::cell::Cell;
use std::error::Error;
use std::rc::Rc;

use emerge_engine::task::composite::StepResult;
use emerge_engine::task::returncode::CANCELLED;
use emerge_engine::task::{CompositeTask, Step, Task, TaskExt};
use emerge_engine_test_utils::fake_task::{EventLog, ImmediateTask, ManualTask};

type TestResult = Result<(), Box<dyn Error>>;

fn result(name: &str, returncode: i32) -> StepResult {
    StepResult {
        name: name.to_string(),
        returncode,
    }
}

#[test]
fn steps_run_in_order_and_composite_succeeds() -> TestResult {
    let lp = new_loop();
    let log = EventLog::new();
    let composite = Rc::new(CompositeTask::new(&lp, "build"));

    for name in ["fetch", "unpack", "compile"] {
        let step = ImmediateTask::new(&lp, name, 0);
        let log = log.clone();
        step.add_start_listener(move || log.push(name));
        composite.push(step);
    }

    composite.start();
    assert_eq!(composite.wait()?, 0);
    assert_eq!(log.events(), vec!["fetch", "unpack", "compile"]);
    assert_eq!(composite.started_steps(), 3);
    assert_eq!(
        composite.step_results(),
        vec![result("fetch", 0), result("unpack", 0), result("compile", 0)]
    );
    Ok(())
}

#[test]
fn failing_step_short_circuits_the_rest() -> TestResult {
    let lp = new_loop();
    let never = ManualTask::new(&lp, "install");
    let composite = Rc::new(CompositeTask::with_steps(
        &lp,
        "build",
        [
            Step::Ready(ImmediateTask::new(&lp, "configure", 0)),
            Step::Ready(ImmediateTask::new(&lp, "compile", 3)),
            Step::Ready(never.clone()),
        ],
    ));

    composite.start();
    assert_eq!(composite.wait()?, 3);
    assert_eq!(never.run_count(), 0);
    assert_eq!(composite.pending_steps(), 1);
    assert_eq!(
        composite.step_results(),
        vec![result("configure", 0), result("compile", 3)]
    );
    Ok(())
}

#[test]
fn empty_composite_succeeds_immediately() -> TestResult {
    let lp = new_loop();
    let composite = Rc::new(CompositeTask::new(&lp, "nothing"));
    composite.start();
    assert_eq!(composite.core().returncode(), Some(0));
    assert_eq!(composite.wait()?, 0);
    Ok(())
}

#[test]
fn cancel_before_start_runs_no_step() -> TestResult {
    let lp = new_loop();
    let step = ManualTask::new(&lp, "step");
    let composite = Rc::new(CompositeTask::new(&lp, "build"));
    composite.push(step.clone());

    composite.cancel();
    composite.start();

    assert_eq!(composite.wait()?, CANCELLED);
    assert_eq!(step.run_count(), 0);
    assert_eq!(composite.started_steps(), 0);
    Ok(())
}

#[test]
fn cancel_is_forwarded_to_the_running_step() -> TestResult {
    let lp = new_loop();
    let first = ManualTask::new(&lp, "first");
    let second = ManualTask::new(&lp, "second");
    let composite = Rc::new(CompositeTask::new(&lp, "build"));
    composite.push(first.clone());
    composite.push(second.clone());

    composite.start();
    let current = composite.current_task().ok_or("no current step")?;
    assert_eq!(current.core().id(), first.core().id());

    composite.cancel();
    assert_eq!(first.cancel_count(), 1);
    assert_eq!(composite.wait()?, CANCELLED);
    assert_eq!(first.core().returncode(), Some(CANCELLED));
    assert_eq!(second.run_count(), 0);
    Ok(())
}

#[test]
fn deferred_step_is_built_only_after_its_predecessor_succeeds() -> TestResult {
    let lp = new_loop();
    let first = ManualTask::new(&lp, "first");
    let built = Rc::new(Cell::new(false));
    let composite = Rc::new(CompositeTask::new(&lp, "build"));
    composite.push(first.clone());
    {
        let built = Rc::clone(&built);
        composite.push_deferred(move |event_loop| {
            built.set(true);
            ImmediateTask::new(event_loop, "second", 0)
        });
    }

    composite.start();
    settle(&lp, 10);
    assert!(!built.get());

    first.finish(0);
    assert_eq!(composite.wait()?, 0);
    assert!(built.get());
    Ok(())
}

#[test]
fn deferred_step_is_never_built_after_a_failure() -> TestResult {
    let lp = new_loop();
    let built = Rc::new(Cell::new(false));
    let composite = Rc::new(CompositeTask::new(&lp, "build"));
    composite.push(ImmediateTask::new(&lp, "first", 1));
    {
        let built = Rc::clone(&built);
        composite.push_deferred(move |event_loop| {
            built.set(true);
            ImmediateTask::new(event_loop, "second", 0)
        });
    }

    composite.start();
    assert_eq!(composite.wait()?, 1);
    assert!(!built.get());
    Ok(())
}

#[test]
fn composites_nest() -> TestResult {
    let lp = new_loop();
    let inner = Rc::new(CompositeTask::new(&lp, "inner"));
    inner.push(ImmediateTask::new(&lp, "a", 0));
    inner.push(ImmediateTask::new(&lp, "b", 0));

    let outer = Rc::new(CompositeTask::new(&lp, "outer"));
    outer.push(inner.clone());
    outer.push(ImmediateTask::new(&lp, "c", 6));

    outer.start();
    assert_eq!(outer.wait()?, 6);
    assert_eq!(inner.core().returncode(), Some(0));
    Ok(())
}
