// src/task/listeners.rs

//! Exit-listener bookkeeping for a single task.
//!
//! Listeners live in one of two places:
//! - `live`: registered and not yet part of any delivery.
//! - `in_flight`: detached for the delivery currently underway.
//!
//! Delivery pops from `in_flight` one at a time, newest first, so a
//! listener removed mid-delivery is never invoked and a listener added
//! mid-delivery waits in `live` for the next round.

/// Identifies a registered exit listener for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Something to run once with a task's returncode.
pub trait OnExit: 'static {
    fn on_exit(self: Box<Self>, returncode: i32);
}

impl<F> OnExit for F
where
    F: FnOnce(i32) + 'static,
{
    fn on_exit(self: Box<Self>, returncode: i32) {
        (*self)(returncode)
    }
}

type Entry = (ListenerId, Box<dyn OnExit>);

#[derive(Default)]
pub struct ExitListenerStack {
    next_id: u64,
    live: Vec<Entry>,
    in_flight: Vec<Entry>,
}

impl ExitListenerStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, listener: Box<dyn OnExit>) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.live.push((id, listener));
        id
    }

    /// Remove a listener wherever it currently is. Returns false if it has
    /// already been invoked or was never registered.
    pub fn remove(&mut self, id: ListenerId) -> bool {
        if let Some(pos) = self.live.iter().position(|(lid, _)| *lid == id) {
            self.live.remove(pos);
            return true;
        }
        if let Some(pos) = self.in_flight.iter().position(|(lid, _)| *lid == id) {
            self.in_flight.remove(pos);
            return true;
        }
        false
    }

    /// Move every live listener into the in-flight set.
    pub fn begin_delivery(&mut self) {
        self.in_flight.append(&mut self.live);
    }

    /// Next listener to invoke, most recently registered first.
    pub fn pop_in_flight(&mut self) -> Option<Entry> {
        self.in_flight.pop()
    }

    pub fn has_live(&self) -> bool {
        !self.live.is_empty()
    }

    pub fn len(&self) -> usize {
        self.live.len() + self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ExitListenerStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitListenerStack")
            .field("live", &self.live.len())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}
