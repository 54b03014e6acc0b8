// src/exec/channel.rs

//! Output channels between a child process and its pump: a pseudo-terminal
//! when the output ends up on an interactive terminal, a pipe otherwise.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
use nix::pty::openpty;
use nix::sys::termios::{OutputFlags, SetArg, tcgetattr, tcsetattr};
use nix::unistd::pipe2;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Pipe,
    Pty,
}

/// Both ends of an output channel. `child` is handed to the process as its
/// stdout/stderr; `parent` is read by the pump.
#[derive(Debug)]
pub struct OutputChannel {
    pub kind: ChannelKind,
    pub parent: OwnedFd,
    pub child: OwnedFd,
}

/// Source of pseudo-terminals. Swappable so pty failures can be exercised.
pub trait PtyOpener {
    /// Returns `(master, slave)`, both close-on-exec.
    fn open_pty(&self) -> io::Result<(OwnedFd, OwnedFd)>;
}

static SYSTEM_PTY_DISABLED: AtomicBool = AtomicBool::new(false);

/// Ptys from the operating system.
///
/// After the first failure every later request fails immediately, so a
/// system without usable ptys pays for the failed attempt once per process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPty;

impl PtyOpener for SystemPty {
    fn open_pty(&self) -> io::Result<(OwnedFd, OwnedFd)> {
        if SYSTEM_PTY_DISABLED.load(Ordering::Relaxed) {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "pty allocation disabled after an earlier failure",
            ));
        }
        open_system_pty().inspect_err(|_| {
            SYSTEM_PTY_DISABLED.store(true, Ordering::Relaxed);
        })
    }
}

fn open_system_pty() -> io::Result<(OwnedFd, OwnedFd)> {
    let pty = openpty(None, None)?;
    set_cloexec(pty.master.as_raw_fd())?;
    set_cloexec(pty.slave.as_raw_fd())?;

    // No output post-processing, so "\n" is not turned into "\r\n".
    let mut termios = tcgetattr(&pty.slave)?;
    termios.output_flags.remove(OutputFlags::OPOST);
    tcsetattr(&pty.slave, SetArg::TCSANOW, &termios)?;

    Ok((pty.master, pty.slave))
}

/// Open a pty if `want_pty`, falling back to a pipe when that fails.
pub fn open_output_channel(want_pty: bool, opener: &dyn PtyOpener) -> io::Result<OutputChannel> {
    if want_pty {
        match opener.open_pty() {
            Ok((master, slave)) => {
                debug!("allocated pty for process output");
                return Ok(OutputChannel {
                    kind: ChannelKind::Pty,
                    parent: master,
                    child: slave,
                });
            }
            Err(err) => {
                warn!(error = %err, "pty allocation failed; falling back to a pipe");
            }
        }
    }

    let (read, write) = pipe2(OFlag::O_CLOEXEC)?;
    Ok(OutputChannel {
        kind: ChannelKind::Pipe,
        parent: read,
        child: write,
    })
}

pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}
