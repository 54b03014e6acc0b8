// src/logging.rs

//! Logging setup for the `emerge-engine` binary.
//!
//! Engine events carry structured fields rather than prose: `task` (the
//! job or step name, e.g. `pkg[1/2]`), `pid`, `returncode`, `outcome`, and
//! for the relay `bytes` and `fd`. Scheduler events add `running`,
//! `queued` and `admission`.
//!
//! Filter resolution:
//! 1. `--log-level` sets one level for everything.
//! 2. Otherwise `EMERGE_ENGINE_LOG` is read as an `EnvFilter` directive
//!    list, so `info,emerge_engine::exec=trace` follows every relay read
//!    while keeping the rest at `info`. A bare level such as `debug` works
//!    too.
//! 3. Default: `info`.
//!
//! Logs go to STDERR; stdout carries nothing but relayed job output.

use anyhow::Result;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogLevel;

/// Variable holding the filter directives.
pub const LOG_ENV: &str = "EMERGE_ENGINE_LOG";

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let filter = match cli_level {
        Some(lvl) => EnvFilter::default().add_directive(level_from_log_level(lvl).into()),
        None => filter_from_env(std::env::var(LOG_ENV).ok().as_deref()),
    };

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to install log subscriber: {err}"))?;

    Ok(())
}

/// Directives from the environment, falling back to `info` when unset or
/// unparsable.
fn filter_from_env(value: Option<&str>) -> EnvFilter {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return EnvFilter::new("info");
    };
    if let Some(level) = parse_level_str(value) {
        return EnvFilter::default().add_directive(level.into());
    }
    EnvFilter::try_new(value).unwrap_or_else(|err| {
        eprintln!("ignoring invalid {LOG_ENV}={value:?}: {err}");
        EnvFilter::new("info")
    })
}

fn level_from_log_level(lvl: LogLevel) -> tracing::Level {
    match lvl {
        LogLevel::Error => tracing::Level::ERROR,
        LogLevel::Warn => tracing::Level::WARN,
        LogLevel::Info => tracing::Level::INFO,
        LogLevel::Debug => tracing::Level::DEBUG,
        LogLevel::Trace => tracing::Level::TRACE,
    }
}

pub fn parse_level_str(s: &str) -> Option<tracing::Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(tracing::Level::ERROR),
        "warn" | "warning" => Some(tracing::Level::WARN),
        "info" => Some(tracing::Level::INFO),
        "debug" => Some(tracing::Level::DEBUG),
        "trace" => Some(tracing::Level::TRACE),
        _ => None,
    }
}
