// src/task/core.rs

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace};

use crate::event_loop::EventLoop;
use crate::task::listeners::{ExitListenerStack, ListenerId};
use crate::task::returncode::CANCELLED;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique task identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Coarse lifecycle position. Cancellation is orthogonal, see
/// [`TaskCore::is_cancelled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Running,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Idle,
    /// Queued while the loop was at this discard generation.
    Scheduled(u64),
    Delivering,
}

/// State shared by every task: identity, returncode, cancellation flag and
/// listener registries.
///
/// Cloning is cheap and yields a handle to the same state.
#[derive(Clone)]
pub struct TaskCore {
    inner: Rc<CoreInner>,
}

struct CoreInner {
    id: TaskId,
    name: String,
    event_loop: EventLoop,
    background: Cell<bool>,
    started: Cell<bool>,
    cancelled: Cell<bool>,
    returncode: Cell<Option<i32>>,
    start_listeners: RefCell<Vec<Box<dyn FnOnce()>>>,
    start_fired: Cell<bool>,
    exit_listeners: RefCell<ExitListenerStack>,
    delivery: Cell<Delivery>,
}

impl TaskCore {
    pub fn new(event_loop: &EventLoop, name: impl Into<String>) -> Self {
        TaskCore {
            inner: Rc::new(CoreInner {
                id: TaskId::next(),
                name: name.into(),
                event_loop: event_loop.clone(),
                background: Cell::new(false),
                started: Cell::new(false),
                cancelled: Cell::new(false),
                returncode: Cell::new(None),
                start_listeners: RefCell::new(Vec::new()),
                start_fired: Cell::new(false),
                exit_listeners: RefCell::new(ExitListenerStack::new()),
                delivery: Cell::new(Delivery::Idle),
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    pub fn is_background(&self) -> bool {
        self.inner.background.get()
    }

    pub fn set_background(&self, background: bool) {
        self.inner.background.set(background);
    }

    pub fn returncode(&self) -> Option<i32> {
        self.inner.returncode.get()
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.get()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.get()
    }

    pub fn state(&self) -> TaskState {
        if self.inner.returncode.get().is_some() {
            TaskState::Done
        } else if self.inner.started.get() {
            TaskState::Running
        } else {
            TaskState::Idle
        }
    }

    /// Record the task's returncode and schedule exit-listener delivery.
    ///
    /// The first call wins; later calls are ignored and return false. A
    /// cancelled task always records [`CANCELLED`].
    pub fn complete(&self, returncode: i32) -> bool {
        if let Some(existing) = self.inner.returncode.get() {
            debug!(
                task = %self.name(),
                existing,
                ignored = returncode,
                "returncode already set"
            );
            return false;
        }

        let returncode = if self.is_cancelled() { CANCELLED } else { returncode };
        self.inner.returncode.set(Some(returncode));
        debug!(task = %self.name(), id = %self.id(), returncode, "task finished");
        self.wait_hook();
        true
    }

    /// If the task was cancelled, make sure it carries the cancelled
    /// returncode. Returns whether it was cancelled.
    pub fn was_cancelled(&self) -> bool {
        if self.is_cancelled() && self.inner.returncode.get().is_none() {
            self.complete(CANCELLED);
        }
        self.is_cancelled()
    }

    pub fn add_start_listener(&self, listener: impl FnOnce() + 'static) {
        if self.inner.start_fired.get() {
            trace!(task = %self.name(), "start listener added after start; invoking now");
            listener();
            return;
        }
        self.inner.start_listeners.borrow_mut().push(Box::new(listener));
    }

    pub fn add_exit_listener(&self, listener: impl FnOnce(i32) + 'static) -> ListenerId {
        let id = self
            .inner
            .exit_listeners
            .borrow_mut()
            .push(Box::new(listener));
        self.wait_hook();
        id
    }

    pub fn remove_exit_listener(&self, id: ListenerId) -> bool {
        self.inner.exit_listeners.borrow_mut().remove(id)
    }

    /// Listeners registered and not yet invoked.
    pub fn exit_listener_count(&self) -> usize {
        self.inner.exit_listeners.borrow().len()
    }

    pub(crate) fn mark_started(&self) -> bool {
        !self.inner.started.replace(true)
    }

    pub(crate) fn mark_cancelled(&self) -> bool {
        !self.inner.cancelled.replace(true)
    }

    pub(crate) fn fire_start_listeners(&self) {
        if self.inner.start_fired.replace(true) {
            return;
        }
        let listeners = std::mem::take(&mut *self.inner.start_listeners.borrow_mut());
        for listener in listeners {
            listener();
        }
    }

    /// Schedule delivery of pending exit listeners if the task is done.
    /// Delivery always happens on a later loop iteration.
    pub(crate) fn wait_hook(&self) {
        if self.inner.returncode.get().is_none() {
            return;
        }
        self.fire_start_listeners();

        let generation = self.inner.event_loop.discard_generation();
        match self.inner.delivery.get() {
            Delivery::Idle => {}
            Delivery::Scheduled(queued) if queued != generation => {
                debug!(task = %self.name(), "pending exit delivery was discarded; requeueing");
            }
            Delivery::Scheduled(_) | Delivery::Delivering => return,
        }
        if !self.inner.exit_listeners.borrow().has_live() {
            self.inner.delivery.set(Delivery::Idle);
            return;
        }

        self.inner.delivery.set(Delivery::Scheduled(generation));
        let core = self.clone();
        self.inner.event_loop.call_soon(move || core.deliver_exit());
    }

    fn deliver_exit(&self) {
        let Some(returncode) = self.inner.returncode.get() else {
            self.inner.delivery.set(Delivery::Idle);
            return;
        };

        self.inner.delivery.set(Delivery::Delivering);
        self.inner.exit_listeners.borrow_mut().begin_delivery();

        loop {
            let next = self.inner.exit_listeners.borrow_mut().pop_in_flight();
            let Some((id, listener)) = next else {
                break;
            };
            trace!(task = %self.name(), ?id, returncode, "invoking exit listener");
            listener.on_exit(returncode);
        }

        self.inner.delivery.set(Delivery::Idle);
        // Listeners registered during delivery get a round of their own.
        self.wait_hook();
    }
}

impl fmt::Debug for TaskCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCore")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("cancelled", &self.inner.cancelled.get())
            .field("returncode", &self.inner.returncode.get())
            .finish()
    }
}
