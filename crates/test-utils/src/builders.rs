#![allow(dead_code)]

use std::path::Path;

use emerge_engine::config::{JobConfig, PlanFile, RawPlanFile, StepConfig};
use emerge_engine::types::MaxJobs;

/// Builder for `PlanFile` to simplify test setup.
pub struct PlanBuilder {
    plan: RawPlanFile,
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self {
            plan: RawPlanFile::default(),
        }
    }

    pub fn with_job(mut self, name: &str, job: JobConfig) -> Self {
        self.plan.job.insert(name.to_string(), job);
        self
    }

    pub fn with_jobs(mut self, jobs: MaxJobs) -> Self {
        self.plan.scheduler.jobs = jobs;
        self
    }

    pub fn with_load_average(mut self, load: f64) -> Self {
        self.plan.scheduler.load_average = Some(load);
        self
    }

    pub fn with_log_dir(mut self, dir: &Path) -> Self {
        self.plan.default.log_dir = Some(dir.to_path_buf());
        self
    }

    pub fn with_compressed_logs(mut self, compress: bool) -> Self {
        self.plan.default.compress_logs = compress;
        self
    }

    pub fn with_background(mut self, background: bool) -> Self {
        self.plan.default.background = background;
        self
    }

    pub fn build_raw(self) -> RawPlanFile {
        self.plan
    }

    pub fn build(self) -> PlanFile {
        PlanFile::try_from(self.plan).expect("Failed to build valid plan from builder")
    }
}

impl Default for PlanBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `JobConfig`.
pub struct JobBuilder {
    job: JobConfig,
}

impl JobBuilder {
    pub fn new() -> Self {
        Self {
            job: JobConfig::default(),
        }
    }

    pub fn args(mut self, args: &[&str]) -> Self {
        self.job.steps.push(StepConfig {
            args: Some(args.iter().map(|s| s.to_string()).collect()),
            cmd: None,
        });
        self
    }

    pub fn cmd(mut self, cmd: &str) -> Self {
        self.job.steps.push(StepConfig {
            args: None,
            cmd: Some(cmd.to_string()),
        });
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.job.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn background(mut self, background: bool) -> Self {
        self.job.background = Some(background);
        self
    }

    pub fn build(self) -> JobConfig {
        self.job
    }
}

impl Default for JobBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience: a plan with one single-step shell job per `(name, cmd)`.
pub fn shell_plan(jobs: &[(&str, &str)]) -> PlanFile {
    jobs.iter()
        .fold(PlanBuilder::new(), |plan, (name, cmd)| {
            plan.with_job(name, JobBuilder::new().cmd(cmd).build())
        })
        .build()
}
