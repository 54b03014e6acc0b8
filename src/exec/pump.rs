// src/exec/pump.rs

//! Relays a child's output from the parent end of its channel to the
//! configured sinks, as a task that finishes at end-of-file.

use std::cell::{Cell, RefCell};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;

use nix::errno::Errno;
use tracing::{debug, error, trace};

use crate::event_loop::{EventLoop, ReaderHandle};
use crate::exec::channel::set_nonblocking;
use crate::exec::sinks::PumpSinks;
use crate::task::returncode::{RELAY_FAILED, SUCCESS};
use crate::task::{Task, TaskCore};

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    WaitingForReadable,
    Draining,
    Done,
}

pub struct OutputPump {
    core: TaskCore,
    input: RefCell<Option<OwnedFd>>,
    reader: RefCell<Option<ReaderHandle>>,
    sinks: RefCell<PumpSinks>,
    state: Cell<PumpState>,
    buffer: RefCell<Vec<u8>>,
    bytes_relayed: Cell<u64>,
    relay_error: RefCell<Option<String>>,
}

impl OutputPump {
    pub fn new(
        event_loop: &EventLoop,
        name: impl Into<String>,
        input: OwnedFd,
        sinks: PumpSinks,
    ) -> Self {
        OutputPump {
            core: TaskCore::new(event_loop, name),
            input: RefCell::new(Some(input)),
            reader: RefCell::new(None),
            sinks: RefCell::new(sinks),
            state: Cell::new(PumpState::WaitingForReadable),
            buffer: RefCell::new(vec![0; READ_CHUNK]),
            bytes_relayed: Cell::new(0),
            relay_error: RefCell::new(None),
        }
    }

    pub fn state(&self) -> PumpState {
        self.state.get()
    }

    pub fn bytes_relayed(&self) -> u64 {
        self.bytes_relayed.get()
    }

    /// Description of the error that stopped the relay, if any.
    pub fn relay_error(&self) -> Option<String> {
        self.relay_error.borrow().clone()
    }

    fn on_readable(&self) {
        if self.state.get() == PumpState::Done {
            return;
        }
        self.state.set(PumpState::Draining);

        loop {
            let mut buffer = self.buffer.borrow_mut();
            let read = {
                let reader = self.reader.borrow();
                let Some(reader) = reader.as_ref() else {
                    return;
                };
                let mut file = reader.file();
                file.read(&mut buffer[..])
            };

            match read {
                Ok(0) => {
                    drop(buffer);
                    self.finish(SUCCESS);
                    return;
                }
                Ok(n) => {
                    self.bytes_relayed.set(self.bytes_relayed.get() + n as u64);
                    trace!(task = %self.core.name(), bytes = n, "relaying output");
                    let written = self.sinks.borrow_mut().write(&buffer[..n]);
                    if let Err(err) = written {
                        drop(buffer);
                        self.fail(err);
                        return;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.state.set(PumpState::WaitingForReadable);
                    return;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                // A pty master reports EIO once the slave side is closed.
                Err(err) if err.raw_os_error() == Some(Errno::EIO as i32) => {
                    drop(buffer);
                    self.finish(SUCCESS);
                    return;
                }
                Err(err) => {
                    drop(buffer);
                    self.fail(err);
                    return;
                }
            }
        }
    }

    fn fail(&self, err: io::Error) {
        error!(task = %self.core.name(), error = %err, "output relay failed");
        *self.relay_error.borrow_mut() = Some(err.to_string());
        self.finish(RELAY_FAILED);
    }

    fn finish(&self, returncode: i32) {
        self.state.set(PumpState::Done);
        if self.core.returncode().is_some() {
            return;
        }
        self.reader.borrow_mut().take();
        self.input.borrow_mut().take();

        let mut returncode = returncode;
        if let Err(err) = self.sinks.borrow_mut().finish() {
            error!(task = %self.core.name(), error = %err, "failed to finish output sinks");
            if returncode == SUCCESS {
                *self.relay_error.borrow_mut() = Some(err.to_string());
                returncode = RELAY_FAILED;
            }
        }

        debug!(
            task = %self.core.name(),
            bytes = self.bytes_relayed.get(),
            returncode,
            "output relay finished"
        );
        self.core.complete(returncode);
    }
}

impl Task for OutputPump {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn run(self: Rc<Self>) {
        let Some(fd) = self.input.borrow_mut().take() else {
            self.fail(io::Error::other("output pump has no input"));
            return;
        };
        if let Err(err) = set_nonblocking(fd.as_raw_fd()) {
            self.fail(err);
            return;
        }

        let weak = Rc::downgrade(&self);
        let registered = self.core.event_loop().add_reader(File::from(fd), move || {
            if let Some(pump) = weak.upgrade() {
                pump.on_readable();
            }
        });
        match registered {
            Ok(handle) => {
                *self.reader.borrow_mut() = Some(handle);
                self.state.set(PumpState::WaitingForReadable);
            }
            Err(err) => self.fail(err),
        }
    }

    fn on_cancel(self: Rc<Self>) {
        if self.state.get() != PumpState::Done {
            self.finish(SUCCESS);
        }
    }
}
