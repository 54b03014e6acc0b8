use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;

use emerge_engine::event_loop::EventLoop;
use emerge_engine::sched::LoadSource;
use emerge_engine::task::{Task, TaskCore};

/// A task whose completion is driven by the test.
///
/// - counts `run` and `on_cancel` invocations
/// - finishes only when [`ManualTask::finish`] is called, or on cancel
///   unless [`ManualTask::ignore_cancel`] was used
pub struct ManualTask {
    core: TaskCore,
    runs: Cell<usize>,
    cancels: Cell<usize>,
    finish_on_cancel: Cell<bool>,
}

impl ManualTask {
    pub fn new(event_loop: &EventLoop, name: &str) -> Rc<Self> {
        Rc::new(ManualTask {
            core: TaskCore::new(event_loop, name),
            runs: Cell::new(0),
            cancels: Cell::new(0),
            finish_on_cancel: Cell::new(true),
        })
    }

    /// Cancellation only sets the flag; the task keeps "running" until
    /// `finish` is called.
    pub fn ignore_cancel(self: Rc<Self>) -> Rc<Self> {
        self.finish_on_cancel.set(false);
        self
    }

    pub fn finish(&self, returncode: i32) -> bool {
        self.core.complete(returncode)
    }

    pub fn run_count(&self) -> usize {
        self.runs.get()
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.get()
    }
}

impl Task for ManualTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn run(self: Rc<Self>) {
        self.runs.set(self.runs.get() + 1);
    }

    fn on_cancel(self: Rc<Self>) {
        self.cancels.set(self.cancels.get() + 1);
        if self.finish_on_cancel.get() && self.core.is_started() {
            self.core.was_cancelled();
        }
    }
}

/// A task that finishes with a fixed returncode as soon as it starts.
pub struct ImmediateTask {
    core: TaskCore,
    returncode: i32,
}

impl ImmediateTask {
    pub fn new(event_loop: &EventLoop, name: &str, returncode: i32) -> Rc<Self> {
        Rc::new(ImmediateTask {
            core: TaskCore::new(event_loop, name),
            returncode,
        })
    }
}

impl Task for ImmediateTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn run(self: Rc<Self>) {
        self.core.complete(self.returncode);
    }
}

/// Load average the test can change at will. Clones share the value.
#[derive(Clone, Default)]
pub struct FakeLoad {
    value: Rc<Cell<Option<f64>>>,
    reads: Rc<Cell<usize>>,
}

impl FakeLoad {
    pub fn new(load: f64) -> Self {
        let fake = FakeLoad::default();
        fake.set(load);
        fake
    }

    pub fn set(&self, load: f64) {
        self.value.set(Some(load));
    }

    /// Make every read fail, as if the load average were unavailable.
    pub fn fail(&self) {
        self.value.set(None);
    }

    pub fn reads(&self) -> usize {
        self.reads.get()
    }
}

impl LoadSource for FakeLoad {
    fn load_average(&self) -> io::Result<f64> {
        self.reads.set(self.reads.get() + 1);
        self.value
            .get()
            .ok_or_else(|| io::Error::other("load average unavailable"))
    }
}

/// Ordered record of events observed by listeners in a test.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Rc<RefCell<Vec<String>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: impl Into<String>) {
        self.events.borrow_mut().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.events.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.borrow().is_empty()
    }
}
