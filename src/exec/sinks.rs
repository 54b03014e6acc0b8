// src/exec/sinks.rs

//! Destinations for relayed process output.

use std::cell::RefCell;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use flate2::Compression;
use flate2::write::GzEncoder;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, warn};

use crate::types::LogWriteMode;

/// How many times a single stdout write may hit `EAGAIN` before the relay
/// gives up.
const STDOUT_WOULD_BLOCK_LIMIT: usize = 50;

/// Wait between `EAGAIN` retries, in milliseconds.
const STDOUT_RETRY_WAIT_MS: u16 = 10;

/// Shared in-memory buffer that collects a process's output.
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    buf: Rc<RefCell<Vec<u8>>>,
}

impl CapturedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buf.borrow().clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.buf.borrow()).into_owned()
    }

    pub fn len(&self) -> usize {
        self.buf.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.borrow().is_empty()
    }

    pub(crate) fn extend(&self, data: &[u8]) {
        self.buf.borrow_mut().extend_from_slice(data);
    }
}

enum LogWriter {
    Plain(File),
    Gzip(GzEncoder<File>),
}

impl LogWriter {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            LogWriter::Plain(file) => file.write_all(data),
            LogWriter::Gzip(encoder) => encoder.write_all(data),
        }
    }

    fn finish(self) -> io::Result<()> {
        match self {
            LogWriter::Plain(mut file) => file.flush(),
            LogWriter::Gzip(encoder) => encoder.finish()?.flush(),
        }
    }
}

/// Append-mode log file. Paths ending in `.gz` are gzip-compressed; each
/// run appends a new gzip member.
pub struct LogSink {
    path: PathBuf,
    writer: Option<LogWriter>,
    mode: LogWriteMode,
    pending: Vec<u8>,
}

impl LogSink {
    pub fn open(path: &Path, mode: LogWriteMode) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let writer = if path.extension().is_some_and(|ext| ext == "gz") {
            LogWriter::Gzip(GzEncoder::new(file, Compression::default()))
        } else {
            LogWriter::Plain(file)
        };
        debug!(path = %path.display(), ?mode, "opened log file");
        Ok(LogSink {
            path: path.to_path_buf(),
            writer: Some(writer),
            mode,
            pending: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(io::Error::other("log sink already finished"));
        };
        match self.mode {
            LogWriteMode::Block => writer.write_all(data),
            LogWriteMode::Line => {
                self.pending.extend_from_slice(data);
                if let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') {
                    let rest = self.pending.split_off(last_newline + 1);
                    writer.write_all(&self.pending)?;
                    self.pending = rest;
                }
                Ok(())
            }
        }
    }

    /// Flush any partial line and close the file. Idempotent.
    pub fn finish(&mut self) -> io::Result<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        if !self.pending.is_empty() {
            writer.write_all(&self.pending)?;
            self.pending.clear();
        }
        writer.finish()
    }
}

/// Tee to the parent's stdout, tolerating a terminal that is
/// (unexpectedly) in non-blocking mode.
pub struct StdoutSink {
    file: File,
}

impl StdoutSink {
    pub fn new(fd: OwnedFd) -> Self {
        StdoutSink {
            file: File::from(fd),
        }
    }

    pub fn write_all(&mut self, mut data: &[u8]) -> io::Result<()> {
        let mut would_block = 0;
        while !data.is_empty() {
            match self.file.write(data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => data = &data[n..],
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    would_block += 1;
                    if would_block > STDOUT_WOULD_BLOCK_LIMIT {
                        warn!(attempts = would_block, "stdout stayed unwritable");
                        return Err(err);
                    }
                    self.wait_writable();
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn wait_writable(&self) {
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLOUT)];
        // Timeouts and EINTR both just lead to another write attempt.
        let _ = poll(&mut fds, PollTimeout::from(STDOUT_RETRY_WAIT_MS));
    }
}

/// Everything a pump writes to.
#[derive(Default)]
pub struct PumpSinks {
    pub log: Option<LogSink>,
    pub stdout: Option<StdoutSink>,
    pub capture: Option<CapturedOutput>,
}

impl PumpSinks {
    pub fn is_empty(&self) -> bool {
        self.log.is_none() && self.stdout.is_none() && self.capture.is_none()
    }

    pub(crate) fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if let Some(capture) = &self.capture {
            capture.extend(data);
        }
        if let Some(log) = self.log.as_mut() {
            log.write(data)?;
        }
        if let Some(stdout) = self.stdout.as_mut() {
            stdout.write_all(data)?;
        }
        Ok(())
    }

    pub(crate) fn finish(&mut self) -> io::Result<()> {
        if let Some(log) = self.log.as_mut() {
            log.finish()?;
        }
        if let Some(stdout) = self.stdout.as_mut() {
            stdout.file.flush()?;
        }
        Ok(())
    }
}
