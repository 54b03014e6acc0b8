// src/task/future.rs

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::errors::{EngineError, Result};
use crate::task::core::TaskCore;
use crate::task::listeners::ListenerId;

/// Resolves with a task's returncode.
///
/// Dropping the future before it resolves unregisters its exit listener,
/// so abandoned waits leave nothing behind on the task.
pub struct TaskFuture {
    rx: oneshot::Receiver<i32>,
    core: TaskCore,
    listener: Option<ListenerId>,
}

impl TaskFuture {
    pub(crate) fn new(core: &TaskCore) -> Self {
        let (tx, rx) = oneshot::channel();
        let listener = core.add_exit_listener(move |returncode| {
            let _ = tx.send(returncode);
        });
        TaskFuture {
            rx,
            core: core.clone(),
            listener: Some(listener),
        }
    }
}

impl Future for TaskFuture {
    type Output = Result<i32>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(returncode)) => {
                this.listener = None;
                Poll::Ready(Ok(returncode))
            }
            Poll::Ready(Err(_)) => {
                this.listener = None;
                Poll::Ready(Err(EngineError::TaskAbandoned(
                    this.core.name().to_string(),
                )))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TaskFuture {
    fn drop(&mut self) {
        if let Some(id) = self.listener.take() {
            self.core.remove_exit_listener(id);
        }
    }
}
