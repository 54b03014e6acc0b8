// src/config/mod.rs

//! Build plan loading and validation.
//!
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a plan file from disk (`loader.rs`).
//! - Validate it into a [`PlanFile`] (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_plan_path, load_and_validate, load_from_path, load_from_str};
pub use model::{DefaultSection, JobConfig, PlanFile, RawPlanFile, SchedulerSection, StepConfig};
pub use validate::validate_raw_plan;
