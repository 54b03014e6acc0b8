// tests/config_loading.rs

mod common;
use crate::common::init_tracing;

use std::error::Error;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use emerge_engine::cli::CliArgs;
use emerge_engine::config::{load_and_validate, load_from_path, load_from_str};
use emerge_engine::effective_scheduler_config;
use emerge_engine::errors::EngineError;
use emerge_engine::logging::parse_level_str;
use emerge_engine::plan;
use emerge_engine::types::{LogWriteMode, MaxJobs, PtyMode};
use emerge_engine_test_utils::builders::{JobBuilder, PlanBuilder};
use tempfile::NamedTempFile;

type TestResult = Result<(), Box<dyn Error>>;

fn plan_file(contents: &str) -> Result<NamedTempFile, Box<dyn Error>> {
    let mut file = NamedTempFile::new()?;
    write!(file, "{contents}")?;
    Ok(file)
}

fn validation_error(contents: &str) -> String {
    let file = plan_file(contents).expect("temp plan");
    match load_and_validate(file.path()) {
        Err(EngineError::ConfigError(msg)) => msg,
        other => panic!("expected ConfigError, got {other:?}"),
    }
}

#[test]
fn full_plan_is_loaded() -> TestResult {
    init_tracing();
    let file = plan_file(
        r#"
[scheduler]
jobs = 4
load_average = 6.0
load_recheck_ms = 250

[default]
log_dir = "/var/log/build"
compress_logs = true
log_mode = "line"
pty = "never"
kill_timeout_ms = 1500

[job.zlib]
env = { CFLAGS = "-O2" }
cwd = "/tmp"
background = true

[[job.zlib.step]]
args = ["tar", "xf", "zlib.tar.gz"]

[[job.zlib.step]]
cmd = "./configure && make"
"#,
    )?;

    let plan = load_and_validate(file.path())?;
    assert_eq!(plan.scheduler.jobs, MaxJobs::Limited(4));
    assert_eq!(plan.scheduler.load_average, Some(6.0));
    assert_eq!(plan.scheduler.load_recheck_ms, 250);
    assert_eq!(plan.default.log_mode, LogWriteMode::Line);
    assert_eq!(plan.default.pty, PtyMode::Never);
    assert_eq!(plan.default.kill_timeout_ms, Some(1500));

    let job = &plan.job["zlib"];
    assert_eq!(job.env.get("CFLAGS").map(String::as_str), Some("-O2"));
    assert_eq!(job.background, Some(true));
    assert_eq!(job.steps.len(), 2);
    assert_eq!(job.steps[0].argv(), vec!["tar", "xf", "zlib.tar.gz"]);
    assert_eq!(job.steps[1].argv(), vec!["/bin/sh", "-c", "./configure && make"]);

    assert_eq!(
        plan::log_path(&plan.default, "zlib"),
        Some(PathBuf::from("/var/log/build/zlib.log.gz"))
    );
    let options = plan::step_options(&plan.default, "zlib", job, &job.steps[0]);
    assert!(options.is_background());
    assert_eq!(options.command_line(), "tar xf zlib.tar.gz");
    Ok(())
}

#[test]
fn defaults_apply_when_sections_are_missing() -> TestResult {
    let raw = load_from_str(
        r#"
[[job.only.step]]
args = ["true"]
"#,
    )?;
    assert_eq!(raw.scheduler.jobs, MaxJobs::Limited(1));
    assert_eq!(raw.scheduler.load_average, None);
    assert_eq!(raw.scheduler.load_recheck_ms, 5000);
    assert!(raw.default.log_dir.is_none());
    assert_eq!(raw.default.pty, PtyMode::Auto);
    assert_eq!(raw.default.log_mode, LogWriteMode::Block);
    Ok(())
}

#[test]
fn jobs_accepts_numbers_words_and_flags() -> TestResult {
    let unbounded = load_from_str("[scheduler]\njobs = \"unbounded\"\n")?;
    assert_eq!(unbounded.scheduler.jobs, MaxJobs::Unbounded);

    let flag = load_from_str("[scheduler]\njobs = true\n")?;
    assert_eq!(flag.scheduler.jobs, MaxJobs::Unbounded);

    let count = load_from_str("[scheduler]\njobs = 3\n")?;
    assert_eq!(count.scheduler.jobs, MaxJobs::Limited(3));
    Ok(())
}

#[test]
fn zero_jobs_is_a_parse_error() {
    let result = load_from_str("[scheduler]\njobs = 0\n");
    assert!(matches!(result, Err(EngineError::TomlError(_))));
}

#[test]
fn max_jobs_from_str() {
    assert_eq!(MaxJobs::from_str("8"), Ok(MaxJobs::Limited(8)));
    assert_eq!(MaxJobs::from_str(" Unbounded "), Ok(MaxJobs::Unbounded));
    assert!(MaxJobs::from_str("0").is_err());
    assert!(MaxJobs::from_str("lots").is_err());
    assert_eq!(MaxJobs::Limited(2).to_string(), "2");
    assert!(!MaxJobs::Limited(1).allows_parallelism());
    assert!(MaxJobs::Unbounded.allows_parallelism());
}

#[test]
fn plan_without_jobs_is_rejected() {
    let msg = validation_error("[scheduler]\njobs = 2\n");
    assert!(msg.contains("at least one"), "{msg}");
}

#[test]
fn job_without_steps_is_rejected() {
    let msg = validation_error("[job.empty]\nbackground = true\n");
    assert!(msg.contains("'empty'"), "{msg}");
}

#[test]
fn step_with_both_args_and_cmd_is_rejected() {
    let msg = validation_error(
        r#"
[[job.both.step]]
args = ["true"]
cmd = "true"
"#,
    );
    assert!(msg.contains("both"), "{msg}");
}

#[test]
fn step_with_empty_args_is_rejected() {
    let msg = validation_error("[[job.hollow.step]]\nargs = []\n");
    assert!(msg.contains("empty `args`"), "{msg}");
}

#[test]
fn negative_load_average_is_rejected() {
    let msg = validation_error(
        r#"
[scheduler]
load_average = -1.0

[[job.a.step]]
args = ["true"]
"#,
    );
    assert!(msg.contains("load_average"), "{msg}");
}

#[test]
fn job_names_with_slashes_are_rejected() {
    let raw = PlanBuilder::new()
        .with_job("a/b", JobBuilder::new().args(&["true"]).build())
        .build_raw();
    let result = emerge_engine::config::PlanFile::try_from(raw);
    assert!(matches!(result, Err(EngineError::ConfigError(_))));
}

#[test]
fn missing_plan_file_is_an_io_error() {
    let result = load_from_path("/definitely/not/here/BuildPlan.toml");
    assert!(matches!(result, Err(EngineError::IoError(_))));
}

#[test]
fn command_line_overrides_plan_limits() -> TestResult {
    let plan = PlanBuilder::new()
        .with_jobs(MaxJobs::Limited(2))
        .with_load_average(4.0)
        .with_job("a", JobBuilder::new().args(&["true"]).build())
        .build();

    let args = CliArgs::try_parse_from(["emerge-engine", "--plan", "x.toml", "-j", "unbounded", "-l", "2.5"])?;
    let config = effective_scheduler_config(&plan, &args);
    assert_eq!(config.max_jobs, MaxJobs::Unbounded);
    assert_eq!(config.max_load, Some(2.5));

    let args = CliArgs::try_parse_from(["emerge-engine"])?;
    assert_eq!(args.plan, "BuildPlan.toml");
    let config = effective_scheduler_config(&plan, &args);
    assert_eq!(config.max_jobs, MaxJobs::Limited(2));
    assert_eq!(config.max_load, Some(4.0));
    Ok(())
}

#[test]
fn log_levels_parse_case_insensitively() {
    assert_eq!(parse_level_str("DEBUG"), Some(tracing::Level::DEBUG));
    assert_eq!(parse_level_str("warning"), Some(tracing::Level::WARN));
    assert_eq!(parse_level_str("loud"), None);
}
