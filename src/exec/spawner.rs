// src/exec/spawner.rs

//! A task that runs one external process and relays its output.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::fs::OpenOptions;
use std::io::IsTerminal;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use crate::errors::Result;
use crate::event_loop::{ChildExit, EventLoop, TimerHandle};
use crate::exec::channel::{ChannelKind, PtyOpener, SystemPty, open_output_channel};
use crate::exec::pump::OutputPump;
use crate::exec::sinks::{CapturedOutput, LogSink, PumpSinks, StdoutSink};
use crate::exec::spawn::{SpawnRequest, spawn_failure_returncode, spawn_process};
use crate::task::returncode::{self, RELAY_FAILED};
use crate::task::{Task, TaskCore, TaskExt};
use crate::types::{LogWriteMode, PtyMode};

/// How to launch a process.
#[derive(Clone)]
pub struct SpawnOptions {
    args: Vec<OsString>,
    env: Option<BTreeMap<String, String>>,
    cwd: Option<PathBuf>,
    fd_pipes: BTreeMap<RawFd, RawFd>,
    log_file: Option<PathBuf>,
    log_mode: LogWriteMode,
    background: bool,
    pty_mode: PtyMode,
    capture: Option<CapturedOutput>,
    kill_timeout: Option<Duration>,
    pty_opener: Rc<dyn PtyOpener>,
}

impl SpawnOptions {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        SpawnOptions {
            args: args.into_iter().map(Into::into).collect(),
            env: None,
            cwd: None,
            fd_pipes: BTreeMap::new(),
            log_file: None,
            log_mode: LogWriteMode::default(),
            background: false,
            pty_mode: PtyMode::default(),
            capture: None,
            kill_timeout: None,
            pty_opener: Rc::new(SystemPty),
        }
    }

    /// Run `command` through `/bin/sh -c`.
    pub fn shell(command: &str) -> Self {
        Self::new(["/bin/sh", "-c", command])
    }

    /// Replace the child's environment entirely.
    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    /// Inherit the parent's environment with `vars` layered on top.
    pub fn env_overlay<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let env = self
            .env
            .get_or_insert_with(|| std::env::vars().collect());
        env.extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Map `parent_fd` to `child_fd` in the child. Unmapped 0, 1 and 2 are
    /// inherited from the parent.
    pub fn fd_pipe(mut self, child_fd: RawFd, parent_fd: RawFd) -> Self {
        self.fd_pipes.insert(child_fd, parent_fd);
        self
    }

    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn log_mode(mut self, mode: LogWriteMode) -> Self {
        self.log_mode = mode;
        self
    }

    pub fn background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    pub fn pty_mode(mut self, mode: PtyMode) -> Self {
        self.pty_mode = mode;
        self
    }

    pub fn capture(mut self, capture: CapturedOutput) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Escalate to SIGKILL if the process outlives a cancel by `timeout`.
    pub fn kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = Some(timeout);
        self
    }

    pub fn pty_opener(mut self, opener: Rc<dyn PtyOpener>) -> Self {
        self.pty_opener = opener;
        self
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    pub fn is_background(&self) -> bool {
        self.background
    }

    /// Whether output goes through the pump rather than straight to the
    /// inherited stdout.
    pub fn captures_output(&self) -> bool {
        self.log_file.is_some() || self.background || self.capture.is_some()
    }

    pub fn command_line(&self) -> String {
        self.args
            .iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Debug for SpawnOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnOptions")
            .field("args", &self.args)
            .field("env", &self.env.as_ref().map(|e| e.len()))
            .field("cwd", &self.cwd)
            .field("fd_pipes", &self.fd_pipes)
            .field("log_file", &self.log_file)
            .field("log_mode", &self.log_mode)
            .field("background", &self.background)
            .field("pty_mode", &self.pty_mode)
            .field("capture", &self.capture.is_some())
            .field("kill_timeout", &self.kill_timeout)
            .finish()
    }
}

pub struct ProcessSpawner {
    core: TaskCore,
    options: SpawnOptions,
    pid: Cell<Option<Pid>>,
    channel_kind: Cell<Option<ChannelKind>>,
    pump: RefCell<Option<Rc<OutputPump>>>,
    pump_done: Cell<bool>,
    exit: Cell<Option<ChildExit>>,
    relay_failed: Cell<bool>,
    kill_timer: RefCell<Option<TimerHandle>>,
}

impl ProcessSpawner {
    pub fn new(event_loop: &EventLoop, name: impl Into<String>, options: SpawnOptions) -> Self {
        let core = TaskCore::new(event_loop, name);
        core.set_background(options.background);
        ProcessSpawner {
            core,
            options,
            pid: Cell::new(None),
            channel_kind: Cell::new(None),
            pump: RefCell::new(None),
            pump_done: Cell::new(false),
            exit: Cell::new(None),
            relay_failed: Cell::new(false),
            kill_timer: RefCell::new(None),
        }
    }

    pub fn options(&self) -> &SpawnOptions {
        &self.options
    }

    /// Pid of the child while it is running and not yet reaped.
    pub fn pid(&self) -> Option<Pid> {
        self.pid.get()
    }

    pub fn channel_kind(&self) -> Option<ChannelKind> {
        self.channel_kind.get()
    }

    fn launch(self: &Rc<Self>) -> Result<()> {
        let opts = &self.options;
        let mut fd_pipes = opts.fd_pipes.clone();

        let null_input: Option<OwnedFd> = if opts.background && !fd_pipes.contains_key(&0) {
            Some(OpenOptions::new().read(true).open("/dev/null")?.into())
        } else {
            None
        };
        if let Some(null) = &null_input {
            fd_pipes.insert(0, null.as_raw_fd());
        }
        for fd in 0..=2 {
            fd_pipes.entry(fd).or_insert(fd);
        }
        let stdout_target = fd_pipes.get(&1).copied().unwrap_or(1);

        let capturing = opts.captures_output();
        let want_pty = match opts.pty_mode {
            PtyMode::Never => false,
            PtyMode::Always => true,
            PtyMode::Auto => capturing && !opts.background && fd_is_terminal(stdout_target),
        };

        let log = opts
            .log_file
            .as_deref()
            .map(|path| LogSink::open(path, opts.log_mode))
            .transpose()?;
        let stdout = if opts.log_file.is_some() && !opts.background {
            Some(StdoutSink::new(dup_fd(stdout_target)?))
        } else {
            None
        };

        let channel = open_output_channel(want_pty, opts.pty_opener.as_ref())?;
        self.channel_kind.set(Some(channel.kind));

        let child_end = channel.child.as_raw_fd();
        if capturing {
            fd_pipes.insert(1, child_end);
            fd_pipes.insert(2, child_end);
        } else {
            // Output goes straight to the inherited fds; this end only
            // exists so end-of-file marks process exit.
            fd_pipes.insert(child_end, child_end);
        }

        let pid = spawn_process(self.core.event_loop(), &SpawnRequest {
            args: &opts.args,
            env: opts.env.as_ref(),
            cwd: opts.cwd.as_deref(),
            fd_pipes: &fd_pipes,
        })?;

        drop(channel.child);
        drop(null_input);
        self.pid.set(Some(pid));

        // Watched from the start so loop shutdown can find it; the result
        // is held back until the output has been drained.
        let this = Rc::clone(self);
        self.core
            .event_loop()
            .watch_child(pid, move |exit| this.child_reaped(exit));

        info!(
            task = %self.core.name(),
            pid = pid.as_raw(),
            channel = ?channel.kind,
            background = opts.background,
            cmd = %opts.command_line(),
            "spawned process"
        );

        let sinks = PumpSinks {
            log,
            stdout,
            capture: opts.capture.clone(),
        };
        let pump = Rc::new(OutputPump::new(
            self.core.event_loop(),
            format!("{}:output", self.core.name()),
            channel.parent,
            sinks,
        ));

        let this = Rc::clone(self);
        pump.add_exit_listener(move |returncode| this.pump_exited(returncode));
        *self.pump.borrow_mut() = Some(Rc::clone(&pump));
        pump.start();
        Ok(())
    }

    fn pump_exited(&self, returncode: i32) {
        self.pump.borrow_mut().take();
        self.pump_done.set(true);

        if returncode != 0 && !self.core.is_cancelled() {
            error!(task = %self.core.name(), returncode, "lost the output relay");
            self.relay_failed.set(true);
        } else if returncode != 0 {
            // Nobody is reading any more; make sure the child goes away.
            if let Some(pid) = self.pid.get() {
                self.send_signal(pid, Signal::SIGKILL);
            }
        }

        match self.exit.get() {
            Some(exit) => self.finish(exit),
            None => debug!(
                task = %self.core.name(),
                pid = self.pid.get().map(Pid::as_raw),
                "output closed; waiting for the process to exit"
            ),
        }
    }

    fn child_reaped(&self, exit: ChildExit) {
        // The pid may be reused from here on; never signal it again.
        self.pid.set(None);
        if let Some(timer) = self.kill_timer.borrow_mut().take() {
            timer.cancel();
        }
        self.exit.set(Some(exit));

        if self.pump_done.get() {
            self.finish(exit);
        } else {
            debug!(task = %self.core.name(), ?exit, "process exited; draining output");
        }
    }

    fn finish(&self, exit: ChildExit) {
        let mut returncode = returncode::from_child_exit(exit);
        if self.relay_failed.get() && returncode == 0 {
            returncode = RELAY_FAILED;
        }

        let outcome = returncode::Outcome::from_returncode(returncode);
        if outcome.is_success() {
            info!(task = %self.core.name(), "process succeeded");
        } else {
            warn!(task = %self.core.name(), returncode, %outcome, "process failed");
        }
        self.core.complete(returncode);
    }

    fn send_signal(&self, pid: Pid, signal: Signal) {
        match kill(pid, signal) {
            Ok(()) => debug!(task = %self.core.name(), pid = pid.as_raw(), ?signal, "signalled process"),
            Err(Errno::ESRCH) => {}
            Err(err) => warn!(
                task = %self.core.name(),
                pid = pid.as_raw(),
                ?signal,
                error = %err,
                "failed to signal process"
            ),
        }
    }

    fn kill_timeout_expired(&self, pid: Pid) {
        self.kill_timer.borrow_mut().take();
        if self.pid.get() == Some(pid) {
            warn!(task = %self.core.name(), pid = pid.as_raw(), "process ignored SIGTERM; killing");
            self.send_signal(pid, Signal::SIGKILL);
        }
    }
}

impl Task for ProcessSpawner {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn run(self: Rc<Self>) {
        if let Err(err) = self.launch() {
            let returncode = spawn_failure_returncode(&err);
            error!(
                task = %self.core.name(),
                cmd = %self.options.command_line(),
                error = %err,
                returncode,
                "failed to spawn process"
            );
            self.core.complete(returncode);
        }
    }

    fn on_cancel(self: Rc<Self>) {
        if self.core.returncode().is_some() {
            return;
        }
        let Some(pid) = self.pid.get() else {
            return;
        };
        self.send_signal(pid, Signal::SIGTERM);

        if let Some(timeout) = self.options.kill_timeout {
            let this = Rc::clone(&self);
            let timer = self
                .core
                .event_loop()
                .call_later(timeout, move || this.kill_timeout_expired(pid));
            *self.kill_timer.borrow_mut() = Some(timer);
        }
    }
}

fn fd_is_terminal(fd: RawFd) -> bool {
    // SAFETY: only borrowed for the duration of the isatty check; the fd
    // is one of the caller-provided descriptors that outlive `start`.
    unsafe { BorrowedFd::borrow_raw(fd) }.is_terminal()
}

fn dup_fd(fd: RawFd) -> Result<OwnedFd> {
    // SAFETY: as above; the duplicate is owned independently.
    let dup = unsafe { BorrowedFd::borrow_raw(fd) }.try_clone_to_owned()?;
    Ok(dup)
}
