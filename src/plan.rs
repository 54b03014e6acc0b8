// src/plan.rs

//! Turns a validated [`PlanFile`] into scheduler configuration and tasks.

use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use tracing::debug;

use crate::config::{DefaultSection, JobConfig, PlanFile, StepConfig};
use crate::event_loop::EventLoop;
use crate::exec::{ProcessSpawner, SpawnOptions};
use crate::sched::SchedulerConfig;
use crate::task::{CompositeTask, Task};

pub fn scheduler_config(plan: &PlanFile) -> SchedulerConfig {
    SchedulerConfig::default()
        .with_max_jobs(plan.scheduler.jobs)
        .with_max_load(plan.scheduler.load_average)
        .with_load_recheck(Duration::from_millis(plan.scheduler.load_recheck_ms))
}

/// Log file for `job`, if logging is configured.
pub fn log_path(defaults: &DefaultSection, job: &str) -> Option<PathBuf> {
    let dir = defaults.log_dir.as_ref()?;
    let file = if defaults.compress_logs {
        format!("{job}.log.gz")
    } else {
        format!("{job}.log")
    };
    Some(dir.join(file))
}

pub fn step_options(defaults: &DefaultSection, job_name: &str, job: &JobConfig, step: &StepConfig) -> SpawnOptions {
    let mut options = SpawnOptions::new(step.argv())
        .background(job.background.unwrap_or(defaults.background))
        .pty_mode(defaults.pty)
        .log_mode(defaults.log_mode);

    if !job.env.is_empty() {
        options = options.env_overlay(job.env.clone());
    }
    if let Some(dir) = &job.cwd {
        options = options.cwd(dir.clone());
    }
    if let Some(path) = log_path(defaults, job_name) {
        options = options.log_file(path);
    }
    if let Some(ms) = defaults.kill_timeout_ms {
        options = options.kill_timeout(Duration::from_millis(ms));
    }
    options
}

/// One composite task per job; its steps are spawned lazily, each only
/// after the previous one succeeded.
pub fn build_job(event_loop: &EventLoop, plan: &PlanFile, name: &str, job: &JobConfig) -> Rc<CompositeTask> {
    let composite = CompositeTask::new(event_loop, name);
    let step_count = job.steps.len();

    for (i, step) in job.steps.iter().enumerate() {
        let options = step_options(&plan.default, name, job, step);
        let step_name = format!("{name}[{}/{step_count}]", i + 1);
        composite.push_deferred(move |event_loop| -> Rc<dyn Task> {
            Rc::new(ProcessSpawner::new(event_loop, step_name, options))
        });
    }

    debug!(job = %name, steps = step_count, "built job");
    Rc::new(composite)
}

pub fn build_jobs(event_loop: &EventLoop, plan: &PlanFile) -> Vec<Rc<CompositeTask>> {
    plan.job
        .iter()
        .map(|(name, job)| build_job(event_loop, plan, name, job))
        .collect()
}
