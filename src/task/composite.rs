// src/task/composite.rs

//! Sequential composition of tasks.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use tracing::{debug, info, warn};

use crate::event_loop::EventLoop;
use crate::task::core::{TaskCore, TaskId};
use crate::task::{Task, TaskExt};

/// One unit of a [`CompositeTask`].
pub enum Step {
    Ready(Rc<dyn Task>),
    /// Built only when the previous step has succeeded.
    Deferred(Box<dyn FnOnce(&EventLoop) -> Rc<dyn Task>>),
}

impl Step {
    fn build(self, event_loop: &EventLoop) -> Rc<dyn Task> {
        match self {
            Step::Ready(task) => task,
            Step::Deferred(factory) => factory(event_loop),
        }
    }
}

/// Name and returncode of a finished step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepResult {
    pub name: String,
    pub returncode: i32,
}

struct CurrentStep {
    id: TaskId,
    name: String,
    task: Weak<dyn Task>,
}

/// Runs child tasks one after another, stopping at the first non-zero
/// returncode.
///
/// Only the step currently running is referenced, and only weakly, so a
/// finished step can be dropped as soon as its exit listeners have run.
pub struct CompositeTask {
    core: TaskCore,
    steps: RefCell<VecDeque<Step>>,
    current: RefCell<Option<CurrentStep>>,
    results: RefCell<Vec<StepResult>>,
    started_steps: Cell<usize>,
}

impl CompositeTask {
    pub fn new(event_loop: &EventLoop, name: impl Into<String>) -> Self {
        CompositeTask {
            core: TaskCore::new(event_loop, name),
            steps: RefCell::new(VecDeque::new()),
            current: RefCell::new(None),
            results: RefCell::new(Vec::new()),
            started_steps: Cell::new(0),
        }
    }

    pub fn with_steps(
        event_loop: &EventLoop,
        name: impl Into<String>,
        steps: impl IntoIterator<Item = Step>,
    ) -> Self {
        let composite = Self::new(event_loop, name);
        composite.steps.borrow_mut().extend(steps);
        composite
    }

    pub fn push(&self, task: Rc<dyn Task>) {
        self.steps.borrow_mut().push_back(Step::Ready(task));
    }

    pub fn push_deferred(&self, factory: impl FnOnce(&EventLoop) -> Rc<dyn Task> + 'static) {
        self.steps
            .borrow_mut()
            .push_back(Step::Deferred(Box::new(factory)));
    }

    /// The step running right now, if it is still alive.
    pub fn current_task(&self) -> Option<Rc<dyn Task>> {
        self.current
            .borrow()
            .as_ref()
            .and_then(|step| step.task.upgrade())
    }

    pub fn pending_steps(&self) -> usize {
        self.steps.borrow().len()
    }

    pub fn started_steps(&self) -> usize {
        self.started_steps.get()
    }

    pub fn step_results(&self) -> Vec<StepResult> {
        self.results.borrow().clone()
    }

    fn start_next(self: &Rc<Self>) {
        if self.core.was_cancelled() {
            return;
        }

        let next = self.steps.borrow_mut().pop_front();
        let Some(step) = next else {
            info!(task = %self.core.name(), steps = self.started_steps.get(), "all steps succeeded");
            self.core.complete(0);
            return;
        };

        let task = step.build(self.core.event_loop());
        let id = task.core().id();
        *self.current.borrow_mut() = Some(CurrentStep {
            id,
            name: task.core().name().to_string(),
            task: Rc::downgrade(&task),
        });
        self.started_steps.set(self.started_steps.get() + 1);

        let this = Rc::clone(self);
        task.add_exit_listener(move |returncode| this.step_exited(id, returncode));

        debug!(
            task = %self.core.name(),
            step = %task.core().name(),
            "starting step"
        );
        task.start();
    }

    fn step_exited(self: &Rc<Self>, id: TaskId, returncode: i32) {
        let step_name = {
            let mut current = self.current.borrow_mut();
            match current.take() {
                Some(step) if step.id == id => step.name,
                other => {
                    *current = other;
                    warn!(task = %self.core.name(), step = %id, "ignoring exit of a step that is no longer current");
                    return;
                }
            }
        };

        self.results.borrow_mut().push(StepResult {
            name: step_name.clone(),
            returncode,
        });

        if returncode != 0 {
            warn!(
                task = %self.core.name(),
                step = %step_name,
                returncode,
                "step failed; skipping remaining steps"
            );
            self.core.complete(returncode);
            return;
        }

        self.start_next();
    }
}

impl Task for CompositeTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn run(self: Rc<Self>) {
        self.start_next();
    }

    fn on_cancel(self: Rc<Self>) {
        if let Some(current) = self.current_task() {
            current.cancel();
        }
    }
}
