// src/sched/terminate.rs

//! Asynchronous, idempotent termination requests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use tracing::{debug, warn};

use crate::event_loop::RemoteWaker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationState {
    Running,
    /// Requested; running tasks have not been cancelled yet.
    Terminating,
    TerminatedTasksSent,
}

const CHECK_IDLE: u8 = 0;
const CHECK_SCHEDULED: u8 = 1;
const CHECK_CLOSED: u8 = 2;

struct TerminateShared {
    terminated: AtomicBool,
    check: AtomicU8,
    waker: RemoteWaker,
}

/// Requests scheduler termination. `Send + Sync`; call it from any thread
/// or from a signal-listening task.
#[derive(Clone)]
pub struct TerminateHandle {
    shared: Arc<TerminateShared>,
}

impl TerminateHandle {
    pub(crate) fn new(waker: RemoteWaker) -> Self {
        TerminateHandle {
            shared: Arc::new(TerminateShared {
                terminated: AtomicBool::new(false),
                check: AtomicU8::new(CHECK_IDLE),
                waker,
            }),
        }
    }

    /// Ask the scheduler to stop. Only the first call has any effect; the
    /// actual cancellation happens later on the scheduler's loop.
    pub fn terminate(&self) {
        let claimed = self
            .shared
            .check
            .compare_exchange(CHECK_IDLE, CHECK_SCHEDULED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !claimed {
            debug!("termination already requested");
            return;
        }
        self.shared.terminated.store(true, Ordering::SeqCst);
        if !self.shared.waker.wake() {
            warn!("scheduler loop is gone; termination request dropped");
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::SeqCst)
    }

    /// Refuse further requests.
    pub(crate) fn close(&self) {
        self.shared.check.store(CHECK_CLOSED, Ordering::Release);
    }
}

impl std::fmt::Debug for TerminateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminateHandle")
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
