// src/event_loop/mod.rs

//! Single-threaded reactor that drives tasks, process output and child
//! reaping.
//!
//! The loop is a thin layer over a tokio current-thread runtime and a
//! `LocalSet`. Everything the engine schedules goes through one FIFO
//! ready-queue of plain callbacks: readiness watchers, timers, SIGCHLD
//! and cross-thread wakeups only ever *enqueue* work, they never run
//! engine code directly. That keeps every exit-listener invocation on a
//! fresh, shallow stack.

mod children;
mod readiness;
mod remote;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::pin;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::Notify;
use tokio::task::{AbortHandle, LocalSet};
use tracing::trace;

use crate::errors::{EngineError, Result};

pub use children::ChildExit;
pub use readiness::ReaderHandle;
pub use remote::RemoteWaker;

type Callback = Box<dyn FnOnce() + 'static>;

/// Handle to the reactor. Cheap to clone; all clones share one loop.
///
/// The loop is `!Send`: it must be used from the thread that created it.
/// Use [`EventLoop::remote_waker`] to poke it from other threads.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

/// Non-owning reference to an [`EventLoop`], used by callbacks the loop
/// itself stores so they do not keep it alive.
#[derive(Clone)]
pub struct WeakEventLoop {
    inner: Weak<LoopInner>,
}

impl WeakEventLoop {
    pub fn upgrade(&self) -> Option<EventLoop> {
        self.inner.upgrade().map(|inner| EventLoop { inner })
    }
}

// Field order matters for drop: local tasks (which own readiness
// registrations) must go before the runtime that services them.
struct LoopInner {
    local: LocalSet,
    ready: RefCell<VecDeque<Callback>>,
    discards: Cell<u64>,
    wakeup: Notify,
    running: Cell<bool>,
    remote: remote::RemoteRegistry,
    children: children::ChildTable,
    runtime: Runtime,
}

/// Cancels a callback registered with [`EventLoop::call_later`].
#[derive(Debug)]
pub struct TimerHandle {
    abort: AbortHandle,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.abort.abort();
    }
}

struct RunningGuard<'a> {
    flag: &'a Cell<bool>,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let inner = Rc::new(LoopInner {
            local: LocalSet::new(),
            ready: RefCell::new(VecDeque::new()),
            discards: Cell::new(0),
            wakeup: Notify::new(),
            running: Cell::new(false),
            remote: remote::RemoteRegistry::new(),
            children: children::ChildTable::default(),
            runtime,
        });

        let event_loop = EventLoop { inner };
        event_loop.install_child_watcher()?;
        Ok(event_loop)
    }

    pub fn downgrade(&self) -> WeakEventLoop {
        WeakEventLoop {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// True while [`run_until_complete`](Self::run_until_complete) is
    /// executing on this loop.
    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    /// Whether two handles refer to the same loop.
    pub fn same_loop(&self, other: &EventLoop) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Queue `callback` to run on a later iteration of the loop.
    ///
    /// Callbacks run in FIFO order, and never inside the caller's frame.
    pub fn call_soon(&self, callback: impl FnOnce() + 'static) {
        self.inner.ready.borrow_mut().push_back(Box::new(callback));
        self.inner.wakeup.notify_one();
    }

    /// Queue `callback` to run once `delay` has elapsed.
    pub fn call_later(&self, delay: Duration, callback: impl FnOnce() + 'static) -> TimerHandle {
        let weak = self.downgrade();
        let handle = self.inner.local.spawn_local(async move {
            tokio::time::sleep(delay).await;
            if let Some(event_loop) = weak.upgrade() {
                event_loop.call_soon(callback);
            }
        });
        TimerHandle {
            abort: handle.abort_handle(),
        }
    }

    /// Host an arbitrary future on the loop. It makes progress only while
    /// the loop is running.
    pub fn spawn_local<F>(&self, future: F) -> AbortHandle
    where
        F: Future<Output = ()> + 'static,
    {
        self.inner.local.spawn_local(future).abort_handle()
    }

    /// Drive the loop until `future` resolves.
    ///
    /// Fails with [`EngineError::InvalidState`] if the loop is already
    /// running; nested runs would let callbacks observe half-updated state.
    pub fn run_until_complete<F: Future>(&self, future: F) -> Result<F::Output> {
        if self.inner.running.get() {
            return Err(EngineError::InvalidState(
                "event loop is already running".to_string(),
            ));
        }
        self.inner.running.set(true);
        let _running = RunningGuard {
            flag: &self.inner.running,
        };

        let inner = &self.inner;
        let output = inner
            .runtime
            .block_on(inner.local.run_until(self.drive(future)));
        Ok(output)
    }

    async fn drive<F: Future>(&self, future: F) -> F::Output {
        let mut future = pin!(future);
        let mut remote_rx = self.inner.remote.receiver.borrow_mut();

        loop {
            self.run_ready();

            if !self.inner.ready.borrow().is_empty() {
                // More work was queued by the batch we just ran. Let local
                // tasks and the target future have a turn before the next
                // batch so readiness is never starved.
                tokio::select! {
                    biased;
                    out = &mut future => return out,
                    () = tokio::task::yield_now() => {}
                }
                continue;
            }

            tokio::select! {
                biased;
                out = &mut future => return out,
                Some(token) = remote_rx.recv() => self.dispatch_remote(token),
                () = self.inner.wakeup.notified() => {}
            }
        }
    }

    /// Drop every queued callback without running it.
    ///
    /// Bumps [`discard_generation`](Self::discard_generation), so code that
    /// queued a callback can tell it will never run.
    pub fn discard_pending(&self) -> usize {
        let pending = std::mem::take(&mut *self.inner.ready.borrow_mut());
        self.inner.discards.set(self.inner.discards.get() + 1);
        pending.len()
    }

    /// How many times [`discard_pending`](Self::discard_pending) has run.
    pub fn discard_generation(&self) -> u64 {
        self.inner.discards.get()
    }

    /// Run the callbacks that were queued when this iteration began.
    /// Anything they enqueue waits for the next iteration.
    fn run_ready(&self) {
        let batch = self.inner.ready.borrow().len();
        if batch > 0 {
            trace!(batch, "running ready callbacks");
        }
        for _ in 0..batch {
            let next = self.inner.ready.borrow_mut().pop_front();
            match next {
                Some(callback) => callback(),
                None => break,
            }
        }
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("running", &self.inner.running.get())
            .field("ready", &self.inner.ready.borrow().len())
            .finish()
    }
}
