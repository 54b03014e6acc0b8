// src/config/validate.rs

use crate::config::model::{PlanFile, RawPlanFile};
use crate::errors::{EngineError, Result};

impl TryFrom<RawPlanFile> for PlanFile {
    type Error = EngineError;

    fn try_from(raw: RawPlanFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_plan(&raw)?;
        Ok(PlanFile::new_unchecked(raw.scheduler, raw.default, raw.job))
    }
}

pub fn validate_raw_plan(plan: &RawPlanFile) -> Result<()> {
    ensure_has_jobs(plan)?;
    validate_scheduler(plan)?;
    validate_jobs(plan)?;
    Ok(())
}

fn ensure_has_jobs(plan: &RawPlanFile) -> Result<()> {
    if plan.job.is_empty() {
        return Err(EngineError::ConfigError(
            "plan must contain at least one [job.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_scheduler(plan: &RawPlanFile) -> Result<()> {
    // `jobs` is validated during deserialization.

    if let Some(load) = plan.scheduler.load_average {
        if !load.is_finite() || load < 0.0 {
            return Err(EngineError::ConfigError(format!(
                "[scheduler].load_average must be a non-negative number (got {load})"
            )));
        }
    }

    if plan.scheduler.load_recheck_ms == 0 {
        return Err(EngineError::ConfigError(
            "[scheduler].load_recheck_ms must be >= 1 (got 0)".to_string(),
        ));
    }

    Ok(())
}

fn validate_jobs(plan: &RawPlanFile) -> Result<()> {
    for (name, job) in plan.job.iter() {
        if name.trim().is_empty() || name.contains('/') {
            return Err(EngineError::ConfigError(format!(
                "invalid job name '{name}' (must be non-empty and contain no '/')"
            )));
        }

        if job.steps.is_empty() {
            return Err(EngineError::ConfigError(format!(
                "job '{name}' has no [[job.{name}.step]] entries"
            )));
        }

        for (i, step) in job.steps.iter().enumerate() {
            match (&step.args, &step.cmd) {
                (Some(_), Some(_)) => {
                    return Err(EngineError::ConfigError(format!(
                        "job '{name}' step {} sets both `args` and `cmd`",
                        i + 1
                    )));
                }
                (None, None) => {
                    return Err(EngineError::ConfigError(format!(
                        "job '{name}' step {} needs either `args` or `cmd`",
                        i + 1
                    )));
                }
                (Some(args), None) if args.is_empty() => {
                    return Err(EngineError::ConfigError(format!(
                        "job '{name}' step {} has an empty `args` list",
                        i + 1
                    )));
                }
                (None, Some(cmd)) if cmd.trim().is_empty() => {
                    return Err(EngineError::ConfigError(format!(
                        "job '{name}' step {} has an empty `cmd`",
                        i + 1
                    )));
                }
                _ => {}
            }
        }
    }
    Ok(())
}
