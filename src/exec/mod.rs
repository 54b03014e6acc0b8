// src/exec/mod.rs

//! Process execution layer.
//!
//! - [`spawner`] holds [`ProcessSpawner`], the task that runs one external
//!   command, and its [`SpawnOptions`].
//! - [`spawn`] does the actual fork/exec with an explicit fd layout.
//! - [`channel`] allocates the pty-or-pipe between child and parent.
//! - [`pump`] relays output from that channel as an [`OutputPump`] task.
//! - [`sinks`] contains the destinations output is relayed to.

pub mod channel;
pub mod pump;
pub mod sinks;
pub mod spawn;
pub mod spawner;

pub use channel::{ChannelKind, OutputChannel, PtyOpener, SystemPty};
pub use pump::{OutputPump, PumpState};
pub use sinks::{CapturedOutput, LogSink, PumpSinks, StdoutSink};
pub use spawner::{ProcessSpawner, SpawnOptions};
