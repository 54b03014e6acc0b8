// src/task/returncode.rs

//! Integer returncode conventions shared by every task.
//!
//! - `0..=255` is a normal process exit status.
//! - A process killed by signal `N` reports `N << 8`, so the low byte stays
//!   zero and the two ranges never collide.
//! - Negative values are engine-generated: cancellation and failures to
//!   create the process at all.

use std::fmt;

use crate::event_loop::ChildExit;

pub const SUCCESS: i32 = 0;

/// Assigned to tasks that were cancelled. Mirrors `-SIGINT`.
pub const CANCELLED: i32 = -2;

/// The process could not be created for a reason other than the two below.
pub const SPAWN_FAILED: i32 = -1;

pub const PERMISSION_DENIED: i32 = -126;

pub const COMMAND_NOT_FOUND: i32 = -127;

/// Output could not be relayed although the child itself succeeded.
pub const RELAY_FAILED: i32 = 1;

/// Encode death-by-signal.
pub fn from_signal(signal: i32) -> i32 {
    (signal & 0xff) << 8
}

pub fn from_child_exit(exit: ChildExit) -> i32 {
    match exit {
        ChildExit::Exited(code) => code,
        ChildExit::Signaled(signal) => from_signal(signal),
        ChildExit::Lost => 1,
    }
}

/// Human-oriented classification of a returncode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Exited(i32),
    Signaled(i32),
    Cancelled,
    CommandNotFound,
    PermissionDenied,
    SpawnFailed,
    Other(i32),
}

impl Outcome {
    pub fn from_returncode(returncode: i32) -> Self {
        match returncode {
            SUCCESS => Outcome::Success,
            CANCELLED => Outcome::Cancelled,
            COMMAND_NOT_FOUND => Outcome::CommandNotFound,
            PERMISSION_DENIED => Outcome::PermissionDenied,
            SPAWN_FAILED => Outcome::SpawnFailed,
            1..=255 => Outcome::Exited(returncode),
            rc if rc > 255 && rc & 0xff == 0 => Outcome::Signaled(rc >> 8),
            rc => Outcome::Other(rc),
        }
    }

    pub fn is_success(self) -> bool {
        self == Outcome::Success
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("succeeded"),
            Outcome::Exited(code) => write!(f, "exited with status {code}"),
            Outcome::Signaled(signal) => write!(f, "killed by signal {signal}"),
            Outcome::Cancelled => f.write_str("cancelled"),
            Outcome::CommandNotFound => f.write_str("command not found"),
            Outcome::PermissionDenied => f.write_str("permission denied"),
            Outcome::SpawnFailed => f.write_str("failed to spawn"),
            Outcome::Other(rc) => write!(f, "returncode {rc}"),
        }
    }
}
