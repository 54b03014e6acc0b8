// src/exec/spawn.rs

//! fork/exec with an explicit descriptor layout.
//!
//! Everything the child needs (argv, envp, the fd remapping plan) is
//! prepared before `fork()`. Between fork and exec the child only makes
//! async-signal-safe calls, so spawning is safe from a multi-threaded
//! process.

use std::collections::BTreeMap;
use std::env;
use std::ffi::{CString, OsStr, OsString};
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::libc;
use nix::unistd::{AccessFlags, ForkResult, Pid, access, fork, pipe2};
use tracing::{debug, trace};

use crate::errors::{EngineError, Result};
use crate::event_loop::EventLoop;
use crate::task::returncode::{COMMAND_NOT_FOUND, PERMISSION_DENIED, SPAWN_FAILED};

/// What to run and how the child's descriptors are laid out.
#[derive(Debug)]
pub struct SpawnRequest<'a> {
    pub args: &'a [OsString],
    /// `None` inherits the parent's environment.
    pub env: Option<&'a BTreeMap<String, String>>,
    pub cwd: Option<&'a Path>,
    /// Child fd -> parent fd. Parent fds only need to stay open until
    /// [`spawn_process`] returns.
    pub fd_pipes: &'a BTreeMap<RawFd, RawFd>,
}

/// Returncode reported for a process that could not be spawned.
pub fn spawn_failure_returncode(err: &EngineError) -> i32 {
    match err {
        EngineError::CommandNotFound(_) => COMMAND_NOT_FOUND,
        EngineError::PermissionDenied(_) => PERMISSION_DENIED,
        _ => SPAWN_FAILED,
    }
}

/// Two-phase remapping: every source is first duplicated above all
/// targets, then moved into place. This stays correct when sources and
/// targets overlap, including swaps.
struct FdLayout {
    pairs: Vec<(RawFd, RawFd)>,
    temps: Vec<RawFd>,
    floor: RawFd,
}

impl FdLayout {
    fn new(fd_pipes: &BTreeMap<RawFd, RawFd>) -> Self {
        let pairs: Vec<(RawFd, RawFd)> = fd_pipes.iter().map(|(t, s)| (*t, *s)).collect();
        let floor = pairs
            .iter()
            .flat_map(|(t, s)| [*t, *s])
            .max()
            .map_or(3, |max| max.max(2) + 1);
        FdLayout {
            temps: vec![-1; pairs.len()],
            pairs,
            floor,
        }
    }

    /// Child side. Returns the errno of the first failing call.
    fn apply(&mut self) -> std::result::Result<(), i32> {
        for (i, (_, source)) in self.pairs.iter().enumerate() {
            // SAFETY: plain fcntl on a descriptor number; no allocation.
            let temp = unsafe { libc::fcntl(*source, libc::F_DUPFD_CLOEXEC, self.floor) };
            if temp < 0 {
                return Err(Errno::last() as i32);
            }
            self.temps[i] = temp;
        }
        for (i, (target, _)) in self.pairs.iter().enumerate() {
            // SAFETY: dup2 between descriptor numbers; clears CLOEXEC on target.
            if unsafe { libc::dup2(self.temps[i], *target) } < 0 {
                return Err(Errno::last() as i32);
            }
        }
        Ok(())
    }
}

/// Resolve `program` the way `execvp` would, but before forking so a
/// missing binary never creates a process.
fn resolve_program(program: &OsStr, path_var: Option<&OsStr>) -> Result<PathBuf> {
    let display = program.to_string_lossy().into_owned();

    if program.as_bytes().contains(&b'/') {
        let candidate = PathBuf::from(program);
        if !candidate.exists() {
            return Err(EngineError::CommandNotFound(display));
        }
        if access(candidate.as_path(), AccessFlags::X_OK).is_err() || candidate.is_dir() {
            return Err(EngineError::PermissionDenied(display));
        }
        return Ok(candidate);
    }

    let mut saw_non_executable = false;
    for dir in env::split_paths(path_var.unwrap_or(OsStr::new("/usr/bin:/bin"))) {
        let candidate = dir.join(program);
        if !candidate.is_file() {
            continue;
        }
        if access(candidate.as_path(), AccessFlags::X_OK).is_ok() {
            return Ok(candidate);
        }
        saw_non_executable = true;
    }

    if saw_non_executable {
        Err(EngineError::PermissionDenied(display))
    } else {
        Err(EngineError::CommandNotFound(display))
    }
}

fn to_cstring(bytes: &[u8]) -> Result<CString> {
    CString::new(bytes).map_err(|_| {
        EngineError::ConfigError(format!(
            "argument or environment entry contains a NUL byte: {}",
            String::from_utf8_lossy(bytes)
        ))
    })
}

fn build_envp(env: Option<&BTreeMap<String, String>>) -> Result<Vec<CString>> {
    match env {
        Some(vars) => vars
            .iter()
            .map(|(k, v)| to_cstring(format!("{k}={v}").as_bytes()))
            .collect(),
        None => env::vars_os()
            .map(|(k, v)| {
                let mut entry = k.as_bytes().to_vec();
                entry.push(b'=');
                entry.extend_from_slice(v.as_bytes());
                to_cstring(&entry)
            })
            .collect(),
    }
}

/// Fork and exec `request`. Returns the child's pid once exec has
/// succeeded; exec failures in the child are reported back through a
/// close-on-exec pipe.
///
/// Reading that pipe blocks only until the child has either exec'd or
/// written its errno, and no caller code runs in between. A child whose
/// exec failed is handed to `event_loop` for reaping.
pub fn spawn_process(event_loop: &EventLoop, request: &SpawnRequest<'_>) -> Result<Pid> {
    let program = request
        .args
        .first()
        .ok_or_else(|| EngineError::ConfigError("empty argument list".to_string()))?;

    let path_var = match request.env {
        Some(vars) => vars.get("PATH").map(OsString::from),
        None => env::var_os("PATH"),
    };
    let binary = resolve_program(program, path_var.as_deref())?;

    let binary_c = to_cstring(binary.as_os_str().as_bytes())?;
    let argv: Vec<CString> = request
        .args
        .iter()
        .map(|a| to_cstring(a.as_bytes()))
        .collect::<Result<_>>()?;
    let envp = build_envp(request.env)?;
    let cwd = request
        .cwd
        .map(|dir| to_cstring(dir.as_os_str().as_bytes()))
        .transpose()?;

    let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|a| a.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());
    let mut envp_ptrs: Vec<*const libc::c_char> = envp.iter().map(|e| e.as_ptr()).collect();
    envp_ptrs.push(std::ptr::null());

    let mut layout = FdLayout::new(request.fd_pipes);

    // The error pipe's write end must survive the remapping, so keep it
    // above every target.
    let (err_read, err_write_low) = pipe2(OFlag::O_CLOEXEC)?;
    let raised = fcntl(err_write_low.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(layout.floor))?;
    drop(err_write_low);
    // SAFETY: `raised` is a fresh descriptor we exclusively own.
    let err_write = unsafe { OwnedFd::from_raw_fd(raised) };
    let err_write_raw = err_write.as_raw_fd();

    trace!(binary = %binary.display(), fds = ?request.fd_pipes, "forking");

    // SAFETY: the child branch only performs async-signal-safe calls on
    // memory prepared above and never returns.
    match unsafe { fork() }? {
        ForkResult::Child => {
            let errno = exec_child(
                &mut layout,
                cwd.as_ref(),
                &binary_c,
                &argv_ptrs,
                &envp_ptrs,
            );
            let bytes = errno.to_ne_bytes();
            // SAFETY: writing a stack buffer to an open descriptor, then
            // leaving without running any destructors.
            unsafe {
                libc::write(err_write_raw, bytes.as_ptr().cast(), bytes.len());
                libc::_exit(127);
            }
        }
        ForkResult::Parent { child } => {
            drop(err_write);
            match read_exec_error(err_read)? {
                None => {
                    debug!(pid = child.as_raw(), binary = %binary.display(), "exec succeeded");
                    Ok(child)
                }
                Some(errno) => {
                    event_loop.watch_child(child, move |exit| {
                        trace!(pid = child.as_raw(), ?exit, "reaped child after failed exec");
                    });
                    let display = program.to_string_lossy().into_owned();
                    Err(match Errno::from_raw(errno) {
                        Errno::ENOENT => EngineError::CommandNotFound(display),
                        Errno::EACCES | Errno::EPERM => EngineError::PermissionDenied(display),
                        other => EngineError::IoError(std::io::Error::from(other)),
                    })
                }
            }
        }
    }
}

/// Child side: set up descriptors and exec. Only returns on failure.
fn exec_child(
    layout: &mut FdLayout,
    cwd: Option<&CString>,
    binary: &CString,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
) -> i32 {
    // SAFETY: every call below is async-signal-safe and operates on
    // pointers that stay valid until exec.
    unsafe {
        // The parent ignores SIGPIPE; children expect the default.
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        let mut empty: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut empty);
        libc::sigprocmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut());

        if let Err(errno) = layout.apply() {
            return errno;
        }
        if let Some(dir) = cwd {
            if libc::chdir(dir.as_ptr()) < 0 {
                return Errno::last() as i32;
            }
        }
        libc::execve(binary.as_ptr(), argv.as_ptr(), envp.as_ptr());
        Errno::last() as i32
    }
}

fn read_exec_error(err_read: OwnedFd) -> Result<Option<i32>> {
    let mut pipe = File::from(err_read);
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        match pipe.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    if filled == buf.len() {
        Ok(Some(i32::from_ne_bytes(buf)))
    } else {
        Ok(None)
    }
}
