// src/event_loop/readiness.rs

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{trace, warn};

use super::EventLoop;

/// A file descriptor registered for read readiness.
///
/// The handle owns the descriptor. Dropping it stops the readiness watch;
/// the descriptor is deregistered from the reactor before it is closed.
pub struct ReaderHandle {
    fd: Rc<AsyncFd<File>>,
    watcher: AbortHandle,
}

impl ReaderHandle {
    pub fn file(&self) -> &File {
        self.fd.get_ref()
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

impl std::fmt::Debug for ReaderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderHandle")
            .field("fd", &self.raw_fd())
            .finish()
    }
}

impl EventLoop {
    /// Watch `file` for readability and queue `on_readable` each time the
    /// reactor reports it readable.
    ///
    /// `file` should be in non-blocking mode; the callback is expected to
    /// read until `WouldBlock` or end-of-file before returning. After the
    /// peer hangs up the callback is queued one final time.
    pub fn add_reader(
        &self,
        file: File,
        on_readable: impl Fn() + 'static,
    ) -> io::Result<ReaderHandle> {
        let fd = {
            let _rt = self.runtime().enter();
            Rc::new(AsyncFd::with_interest(file, Interest::READABLE)?)
        };

        let on_readable: Rc<dyn Fn()> = Rc::new(on_readable);
        let drained = Rc::new(Notify::new());
        let watched = Rc::clone(&fd);
        let weak = self.downgrade();

        // One callback in flight at a time: the next readiness wait starts
        // only after the callback has drained the descriptor. A read-closed
        // descriptor stays ready forever, so that callback is the last one.
        let watcher = self.spawn_local(async move {
            loop {
                let ready = watched.readable().await;
                let Some(event_loop) = weak.upgrade() else {
                    break;
                };
                let callback = Rc::clone(&on_readable);
                let done = Rc::clone(&drained);
                match ready {
                    Ok(mut guard) => {
                        let closed = guard.ready().is_read_closed();
                        guard.clear_ready();
                        event_loop.call_soon(move || {
                            callback();
                            done.notify_one();
                        });
                        if closed {
                            trace!(fd = watched.as_raw_fd(), "reader closed; stopping watch");
                            break;
                        }
                    }
                    Err(err) => {
                        // Let the reader observe the failure through read().
                        warn!(fd = watched.as_raw_fd(), error = %err, "readiness watch failed");
                        event_loop.call_soon(move || callback());
                        break;
                    }
                }
                drop(event_loop);
                drained.notified().await;
            }
        });

        Ok(ReaderHandle { fd, watcher })
    }
}
