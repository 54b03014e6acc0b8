#![allow(dead_code)]

use emerge_engine::event_loop::EventLoop;

pub use emerge_engine_test_utils::{init_tracing, run_with_timeout, settle};

/// Fresh event loop with test tracing installed.
pub fn new_loop() -> EventLoop {
    init_tracing();
    EventLoop::new().expect("failed to create event loop")
}
