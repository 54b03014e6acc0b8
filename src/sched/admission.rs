// src/sched/admission.rs

//! Whether the scheduler may start another job right now.
//!
//! Kept free of scheduler state so the rules can be tested directly.

use crate::sched::load::LoadSource;
use crate::types::MaxJobs;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Admit,
    Terminated,
    JobLimit { running: usize, limit: usize },
    LoadLimit { load: f64, max_load: f64 },
    /// The load average could not be read; treated as overloaded.
    LoadUnavailable,
}

impl Admission {
    pub fn is_admit(self) -> bool {
        matches!(self, Admission::Admit)
    }

    /// Rejections that may clear without any job finishing.
    pub fn wants_load_recheck(self) -> bool {
        matches!(
            self,
            Admission::LoadLimit { .. } | Admission::LoadUnavailable
        )
    }
}

/// Admission rules, in order:
/// 1. nothing starts once tasks have been terminated;
/// 2. the job limit caps concurrency;
/// 3. the load limit only applies when parallelism is allowed and at least
///    one job is already running, so a lone job can always make progress.
pub fn can_add_job(
    terminated: bool,
    running: usize,
    max_jobs: MaxJobs,
    max_load: Option<f64>,
    load: &dyn LoadSource,
) -> Admission {
    if terminated {
        return Admission::Terminated;
    }

    if let Some(limit) = max_jobs.limit() {
        if running >= limit {
            return Admission::JobLimit { running, limit };
        }
    }

    if let Some(max_load) = max_load {
        if max_jobs.allows_parallelism() && running >= 1 {
            return match load.load_average() {
                Ok(load) if load >= max_load => Admission::LoadLimit { load, max_load },
                Ok(_) => Admission::Admit,
                Err(_) => Admission::LoadUnavailable,
            };
        }
    }

    Admission::Admit
}
