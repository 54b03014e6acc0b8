// src/event_loop/remote.rs

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::trace;

use super::EventLoop;

/// Thread-safe handle that queues a callback on the loop that created it.
///
/// Waking is lock-free from the caller's point of view; the callback itself
/// always runs on the loop thread.
#[derive(Debug, Clone)]
pub struct RemoteWaker {
    token: u64,
    tx: UnboundedSender<u64>,
}

impl RemoteWaker {
    /// Returns false if the loop has been dropped.
    pub fn wake(&self) -> bool {
        self.tx.send(self.token).is_ok()
    }
}

pub(crate) struct RemoteRegistry {
    tx: UnboundedSender<u64>,
    pub(super) receiver: RefCell<UnboundedReceiver<u64>>,
    callbacks: RefCell<HashMap<u64, Rc<dyn Fn()>>>,
    next_token: Cell<u64>,
}

impl RemoteRegistry {
    pub(super) fn new() -> Self {
        let (tx, rx) = unbounded_channel();
        RemoteRegistry {
            tx,
            receiver: RefCell::new(rx),
            callbacks: RefCell::new(HashMap::new()),
            next_token: Cell::new(0),
        }
    }
}

impl EventLoop {
    pub fn remote_waker(&self, callback: impl Fn() + 'static) -> RemoteWaker {
        let registry = &self.inner.remote;
        let token = registry.next_token.get();
        registry.next_token.set(token + 1);
        registry.callbacks.borrow_mut().insert(token, Rc::new(callback));
        RemoteWaker {
            token,
            tx: registry.tx.clone(),
        }
    }

    /// Forget the callback behind `waker`. Later wakes become no-ops.
    pub fn remove_remote_waker(&self, waker: &RemoteWaker) -> bool {
        self.inner
            .remote
            .callbacks
            .borrow_mut()
            .remove(&waker.token)
            .is_some()
    }

    pub(super) fn dispatch_remote(&self, token: u64) {
        let callback = self.inner.remote.callbacks.borrow().get(&token).cloned();
        match callback {
            Some(callback) => self.call_soon(move || callback()),
            None => trace!(token, "wake for removed remote callback"),
        }
    }
}
