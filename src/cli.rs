// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

use crate::types::MaxJobs;

/// Command-line arguments for `emerge-engine`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "emerge-engine",
    version,
    about = "Run build jobs as supervised processes with job and load limits.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the build plan (TOML).
    ///
    /// Default: `BuildPlan.toml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value = "BuildPlan.toml")]
    pub plan: String,

    /// Maximum concurrent jobs (a number or "unbounded"). Overrides
    /// `[scheduler].jobs`.
    #[arg(long, short = 'j', value_name = "N")]
    pub jobs: Option<MaxJobs>,

    /// Do not start new jobs while the load average is at or above this.
    /// Overrides `[scheduler].load_average`.
    #[arg(long, short = 'l', value_name = "LOAD")]
    pub load_average: Option<f64>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `EMERGE_ENGINE_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print the plan, but don't execute anything.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
