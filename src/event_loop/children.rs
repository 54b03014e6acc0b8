// src/event_loop/children.rs

use std::cell::RefCell;
use std::collections::BTreeMap;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, warn};

use super::EventLoop;
use crate::errors::Result;

/// How a watched child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Exited(i32),
    Signaled(i32),
    /// The pid could no longer be waited on (already reaped elsewhere).
    Lost,
}

type ExitCallback = Box<dyn FnOnce(ChildExit) + 'static>;

/// Pids this loop is responsible for reaping, ordered by pid.
#[derive(Default)]
pub(crate) struct ChildTable {
    watchers: RefCell<BTreeMap<i32, ExitCallback>>,
}

impl EventLoop {
    pub(super) fn install_child_watcher(&self) -> Result<()> {
        let mut sigchld = {
            let _rt = self.runtime().enter();
            signal(SignalKind::child())?
        };
        let weak = self.downgrade();
        self.spawn_local(async move {
            while sigchld.recv().await.is_some() {
                let Some(event_loop) = weak.upgrade() else {
                    break;
                };
                event_loop.schedule_child_check();
            }
        });
        Ok(())
    }

    /// Reap `pid` once it exits and queue `on_exit` with its status.
    ///
    /// Only pids registered here are ever waited on, so children owned by
    /// other code in the process are left alone.
    pub fn watch_child(&self, pid: Pid, on_exit: impl FnOnce(ChildExit) + 'static) {
        let previous = self
            .inner
            .children
            .watchers
            .borrow_mut()
            .insert(pid.as_raw(), Box::new(on_exit));
        if previous.is_some() {
            warn!(pid = pid.as_raw(), "replacing existing child watcher");
        }
        // The child may already be gone; SIGCHLD would not fire again.
        self.schedule_child_check();
    }

    /// Stop watching `pid`. The process is not signalled or reaped.
    pub fn unwatch_child(&self, pid: Pid) -> bool {
        self.inner
            .children
            .watchers
            .borrow_mut()
            .remove(&pid.as_raw())
            .is_some()
    }

    pub fn watched_children(&self) -> Vec<Pid> {
        self.inner
            .children
            .watchers
            .borrow()
            .keys()
            .map(|pid| Pid::from_raw(*pid))
            .collect()
    }

    fn schedule_child_check(&self) {
        let weak = self.downgrade();
        self.call_soon(move || {
            if let Some(event_loop) = weak.upgrade() {
                event_loop.check_children();
            }
        });
    }

    fn check_children(&self) {
        let pids: Vec<i32> = self.inner.children.watchers.borrow().keys().copied().collect();

        for pid in pids {
            let exit = match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => ChildExit::Exited(code),
                Ok(WaitStatus::Signaled(_, sig, _)) => ChildExit::Signaled(sig as i32),
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(err) => {
                    warn!(pid, error = %err, "lost track of child process");
                    ChildExit::Lost
                }
            };

            let callback = self.inner.children.watchers.borrow_mut().remove(&pid);
            if let Some(callback) = callback {
                debug!(pid, ?exit, "child process reaped");
                callback(exit);
            }
        }
    }

    /// Kill and synchronously reap every child still being watched, in
    /// ascending pid order. Their exit callbacks are dropped, not invoked.
    ///
    /// Returns the number of children reaped.
    pub fn shutdown_children(&self) -> usize {
        let watchers = std::mem::take(&mut *self.inner.children.watchers.borrow_mut());
        let mut reaped = 0;

        for (pid, _callback) in watchers {
            let pid = Pid::from_raw(pid);
            match kill(pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(err) => warn!(pid = pid.as_raw(), error = %err, "failed to kill child"),
            }
            loop {
                match waitpid(pid, None) {
                    Err(Errno::EINTR) => continue,
                    Ok(_) => {
                        reaped += 1;
                        break;
                    }
                    Err(err) => {
                        debug!(pid = pid.as_raw(), error = %err, "child already reaped");
                        break;
                    }
                }
            }
        }

        if reaped > 0 {
            debug!(reaped, "reaped leftover children");
        }
        reaped
    }
}
