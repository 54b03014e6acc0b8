// src/task/mod.rs

//! Task lifecycle: start, poll, cancel, wait and exit notification.
//!
//! A concrete task embeds a [`TaskCore`] and implements [`Task`] to supply
//! its behaviour hooks. Callers drive it through [`TaskExt`], which is
//! implemented for every `Rc<T: Task>` (including `Rc<dyn Task>`).

pub mod composite;
pub mod core;
pub mod future;
pub mod listeners;
pub mod returncode;

use std::rc::Rc;

use tracing::{debug, error, warn};

use crate::errors::{EngineError, Result};

pub use self::composite::{CompositeTask, Step};
pub use self::core::{TaskCore, TaskId, TaskState};
pub use self::future::TaskFuture;
pub use self::listeners::{ExitListenerStack, ListenerId, OnExit};

/// Behaviour hooks of a concrete task.
pub trait Task: 'static {
    fn core(&self) -> &TaskCore;

    /// Begin the actual work. Called at most once, right after the start
    /// listeners. Implementations finish by calling
    /// [`TaskCore::complete`], now or later.
    fn run(self: Rc<Self>);

    /// Cancellation hook. The cancelled flag is already set when this runs.
    fn on_cancel(self: Rc<Self>) {}

    /// Give the task a chance to notice completion without blocking.
    fn on_poll(&self) {}
}

/// Caller-facing lifecycle operations.
pub trait TaskExt {
    fn start(&self);
    fn poll(&self) -> Option<i32>;
    fn cancel(&self);
    fn is_alive(&self) -> bool;

    /// Block on the event loop until the task finishes.
    ///
    /// Must not be called from inside the running loop: that would require
    /// re-entering the loop and fails with [`EngineError::InvalidState`].
    fn wait(&self) -> Result<i32>;
    fn async_wait(&self) -> TaskFuture;

    fn add_exit_listener(&self, listener: impl FnOnce(i32) + 'static) -> ListenerId;
    fn remove_exit_listener(&self, id: ListenerId) -> bool;
    fn add_start_listener(&self, listener: impl FnOnce() + 'static);
}

impl<T: Task + ?Sized> TaskExt for Rc<T> {
    fn start(&self) {
        let core = self.core();
        if core.returncode().is_some() {
            // Cancelled before it ever ran.
            debug!(task = %core.name(), "start on finished task ignored");
            core.fire_start_listeners();
            return;
        }
        if !core.mark_started() {
            warn!(task = %core.name(), "task already started");
            return;
        }
        debug!(task = %core.name(), id = %core.id(), "starting task");
        core.fire_start_listeners();
        Rc::clone(self).run();
    }

    fn poll(&self) -> Option<i32> {
        let core = self.core();
        if let Some(returncode) = core.returncode() {
            return Some(returncode);
        }
        self.on_poll();
        core.wait_hook();
        core.returncode()
    }

    fn cancel(&self) {
        let core = self.core();
        if !core.mark_cancelled() {
            return;
        }
        debug!(task = %core.name(), id = %core.id(), "cancelling task");
        Rc::clone(self).on_cancel();
        if !core.is_started() {
            core.was_cancelled();
        }
    }

    fn is_alive(&self) -> bool {
        self.core().returncode().is_none()
    }

    fn wait(&self) -> Result<i32> {
        let core = self.core();
        if let Some(returncode) = core.returncode() {
            return Ok(returncode);
        }
        if core.event_loop().is_running() {
            error!(
                task = %core.name(),
                "wait() called from inside the running event loop; use async_wait()"
            );
            return Err(EngineError::InvalidState(format!(
                "cannot block on task '{}' while its event loop is running",
                core.name()
            )));
        }
        let event_loop = core.event_loop().clone();
        event_loop.run_until_complete(self.async_wait())?
    }

    fn async_wait(&self) -> TaskFuture {
        TaskFuture::new(self.core())
    }

    fn add_exit_listener(&self, listener: impl FnOnce(i32) + 'static) -> ListenerId {
        self.core().add_exit_listener(listener)
    }

    fn remove_exit_listener(&self, id: ListenerId) -> bool {
        self.core().remove_exit_listener(id)
    }

    fn add_start_listener(&self, listener: impl FnOnce() + 'static) {
        self.core().add_start_listener(listener)
    }
}
