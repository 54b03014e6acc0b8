pub mod builders;
pub mod fake_task;

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use emerge_engine::event_loop::EventLoop;
use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// Output is captured per test and only shown for failures (or with
/// `-- --nocapture`). The filter comes from `EMERGE_ENGINE_LOG`, then
/// `RUST_LOG`, and defaults to engine events at `info`, e.g.
/// `EMERGE_ENGINE_LOG=emerge_engine::exec=trace cargo test --test process_spawner`
/// to follow every read the output pump makes.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env("EMERGE_ENGINE_LOG")
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new("warn,emerge_engine=info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// Drive `event_loop` until `f` resolves, failing the test after 10 seconds.
pub fn run_with_timeout<F, T>(event_loop: &EventLoop, f: F) -> T
where
    F: Future<Output = T>,
{
    event_loop
        .run_until_complete(async {
            tokio::time::timeout(Duration::from_secs(10), f)
                .await
                .expect("Test timed out after 10 seconds")
        })
        .expect("event loop was already running")
}

/// Let the loop run queued callbacks (and anything they queue) for `ms`
/// milliseconds.
pub fn settle(event_loop: &EventLoop, ms: u64) {
    // The sleep registers with the loop's timer, so it must be created
    // inside the runtime.
    event_loop
        .run_until_complete(async move { tokio::time::sleep(Duration::from_millis(ms)).await })
        .expect("event loop was already running");
}
