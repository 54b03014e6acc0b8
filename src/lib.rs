// src/lib.rs

pub mod cli;
pub mod config;
pub mod errors;
pub mod event_loop;
pub mod exec;
pub mod logging;
pub mod plan;
pub mod sched;
pub mod task;
pub mod types;

use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;

use anyhow::Result;
use tracing::{debug, info};

use crate::cli::CliArgs;
use crate::config::loader::load_and_validate;
use crate::config::model::PlanFile;
use crate::sched::{RunSummary, Scheduler, SchedulerConfig};
use crate::task::Task;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - plan loading + CLI overrides
/// - scheduler and its event loop
/// - one composite job task per plan job
/// - Ctrl-C handling
pub fn run(args: CliArgs) -> Result<ExitCode> {
    let plan_path = PathBuf::from(&args.plan);
    let plan = load_and_validate(&plan_path)?;
    let config = effective_scheduler_config(&plan, &args);

    if args.dry_run {
        print_dry_run(&plan, &config);
        return Ok(ExitCode::SUCCESS);
    }

    let scheduler = Scheduler::new(config)?;
    scheduler.terminate_on_interrupt();

    for job in plan::build_jobs(scheduler.event_loop(), &plan) {
        let job: Rc<dyn Task> = job;
        scheduler.submit(job);
    }
    info!(jobs = plan.job.len(), plan = %plan_path.display(), "submitted plan");

    let summary = scheduler.run()?;
    scheduler.shutdown();

    report(&summary);
    Ok(if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Plan `[scheduler]` values with command-line overrides applied.
pub fn effective_scheduler_config(plan: &PlanFile, args: &CliArgs) -> SchedulerConfig {
    let mut config = plan::scheduler_config(plan);
    if let Some(jobs) = args.jobs {
        config.max_jobs = jobs;
    }
    if let Some(load) = args.load_average {
        config.max_load = Some(load);
    }
    config
}

fn report(summary: &RunSummary) {
    for failure in summary.failures() {
        eprintln!(
            "job '{}' {} (returncode {})",
            failure.name,
            failure.outcome(),
            failure.returncode
        );
    }
    if summary.terminated {
        if !summary.in_flight_at_termination.is_empty() {
            eprintln!(
                "terminated while running: {}",
                summary.in_flight_at_termination.join(", ")
            );
        }
        if !summary.not_started.is_empty() {
            eprintln!("never started: {}", summary.not_started.join(", "));
        }
    }
}

/// Simple dry-run output: print jobs, steps and scheduler limits.
fn print_dry_run(plan: &PlanFile, config: &SchedulerConfig) {
    println!("emerge-engine dry-run");
    println!("  scheduler.jobs = {}", config.max_jobs);
    match config.max_load {
        Some(load) => println!("  scheduler.load_average = {load}"),
        None => println!("  scheduler.load_average = (none)"),
    }
    println!();

    println!("jobs ({}):", plan.job.len());
    for (name, job) in plan.job.iter() {
        println!("  - {name}");
        if let Some(path) = plan::log_path(&plan.default, name) {
            println!("      log: {}", path.display());
        }
        if job.background.unwrap_or(plan.default.background) {
            println!("      background: true");
        }
        if !job.env.is_empty() {
            println!("      env: {:?}", job.env);
        }
        for (i, step) in job.steps.iter().enumerate() {
            println!("      {}. {}", i + 1, step.describe());
        }
    }

    debug!("dry-run complete (no execution)");
}
