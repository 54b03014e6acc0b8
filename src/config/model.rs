// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::types::{LogWriteMode, MaxJobs, PtyMode};

/// Build plan as read from a TOML file, before validation.
///
/// ```toml
/// [scheduler]
/// jobs = 4
/// load_average = 6.0
///
/// [default]
/// log_dir = "logs"
///
/// [job.zlib]
/// env = { CFLAGS = "-O2" }
/// [[job.zlib.step]]
/// args = ["tar", "xf", "zlib.tar.gz"]
/// [[job.zlib.step]]
/// cmd = "cd zlib && ./configure && make"
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPlanFile {
    #[serde(default)]
    pub scheduler: SchedulerSection,

    #[serde(default)]
    pub default: DefaultSection,

    /// Jobs keyed by name. Jobs are submitted in name order.
    #[serde(default)]
    pub job: BTreeMap<String, JobConfig>,
}

/// A plan that passed validation. Only constructible through
/// `PlanFile::try_from(RawPlanFile)`.
#[derive(Debug, Clone)]
pub struct PlanFile {
    pub scheduler: SchedulerSection,
    pub default: DefaultSection,
    pub job: BTreeMap<String, JobConfig>,
}

impl PlanFile {
    pub(crate) fn new_unchecked(
        scheduler: SchedulerSection,
        default: DefaultSection,
        job: BTreeMap<String, JobConfig>,
    ) -> Self {
        PlanFile {
            scheduler,
            default,
            job,
        }
    }
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    /// Integer, `"unbounded"` or `true`. Defaults to 1.
    #[serde(default)]
    pub jobs: MaxJobs,

    /// Do not start additional jobs while the 1-minute load average is at
    /// or above this value.
    #[serde(default)]
    pub load_average: Option<f64>,

    #[serde(default = "default_load_recheck_ms")]
    pub load_recheck_ms: u64,
}

fn default_load_recheck_ms() -> u64 {
    5000
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            jobs: MaxJobs::default(),
            load_average: None,
            load_recheck_ms: default_load_recheck_ms(),
        }
    }
}

/// `[default]` section: settings shared by every job.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefaultSection {
    /// Each job logs to `<log_dir>/<job>.log` (or `.log.gz`).
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    #[serde(default)]
    pub compress_logs: bool,

    #[serde(default)]
    pub log_mode: LogWriteMode,

    /// Background jobs get `/dev/null` as stdin and never write to the
    /// terminal.
    #[serde(default)]
    pub background: bool,

    #[serde(default)]
    pub pty: PtyMode,

    /// SIGKILL a cancelled process that is still alive after this long.
    #[serde(default)]
    pub kill_timeout_ms: Option<u64>,
}

/// `[job.<name>]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobConfig {
    /// Added to the inherited environment of every step.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Overrides `default.background` for this job.
    #[serde(default)]
    pub background: Option<bool>,

    /// `[[job.<name>.step]]` entries, run in order.
    #[serde(default, rename = "step")]
    pub steps: Vec<StepConfig>,
}

/// One `[[job.<name>.step]]`: exactly one of `args` or `cmd`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StepConfig {
    #[serde(default)]
    pub args: Option<Vec<String>>,

    /// Run through `/bin/sh -c`.
    #[serde(default)]
    pub cmd: Option<String>,
}

impl StepConfig {
    /// Argument vector for this step.
    pub fn argv(&self) -> Vec<String> {
        match (&self.args, &self.cmd) {
            (Some(args), _) => args.clone(),
            (None, Some(cmd)) => vec!["/bin/sh".to_string(), "-c".to_string(), cmd.clone()],
            (None, None) => Vec::new(),
        }
    }

    pub fn describe(&self) -> String {
        match (&self.args, &self.cmd) {
            (Some(args), _) => args.join(" "),
            (None, Some(cmd)) => cmd.clone(),
            (None, None) => String::new(),
        }
    }
}
