// tests/plan_run.rs

mod common;
use crate::common::new_loop;

use std::error::Error;
use std::fs::{self, File};
use std::io::Read;
use std::rc::Rc;

use emerge_engine::plan;
use emerge_engine::sched::Scheduler;
use emerge_engine::task::Task;
use emerge_engine::types::MaxJobs;
use emerge_engine_test_utils::builders::{JobBuilder, PlanBuilder};
use flate2::read::MultiGzDecoder;
use tempfile::tempdir;

type TestResult = Result<(), Box<dyn Error>>;

#[test]
fn plan_runs_jobs_and_stops_failed_jobs_early() -> TestResult {
    let logs = tempdir()?;
    let plan = PlanBuilder::new()
        .with_jobs(MaxJobs::Limited(2))
        .with_log_dir(logs.path())
        .with_background(true)
        .with_job(
            "good",
            JobBuilder::new()
                .args(&["echo", "one"])
                .cmd("echo \"$GREETING\"")
                .env("GREETING", "two")
                .build(),
        )
        .with_job(
            "bad",
            JobBuilder::new().cmd("echo failing; exit 4").cmd("echo never").build(),
        )
        .build();

    let lp = new_loop();
    let scheduler = Scheduler::with_event_loop(&lp, plan::scheduler_config(&plan));
    let jobs = plan::build_jobs(&lp, &plan);
    for job in &jobs {
        scheduler.submit(Rc::clone(job) as Rc<dyn Task>);
    }
    let summary = scheduler.run()?;

    let mut results: Vec<_> = summary
        .results
        .iter()
        .map(|r| (r.name.clone(), r.returncode))
        .collect();
    results.sort();
    assert_eq!(results, vec![("bad".to_string(), 4), ("good".to_string(), 0)]);

    assert_eq!(fs::read_to_string(logs.path().join("good.log"))?, "one\ntwo\n");
    assert_eq!(fs::read_to_string(logs.path().join("bad.log"))?, "failing\n");

    let bad = jobs
        .iter()
        .find(|job| job.core().name() == "bad")
        .ok_or("bad job missing")?;
    assert_eq!(bad.started_steps(), 1);
    assert_eq!(bad.pending_steps(), 1);
    Ok(())
}

#[test]
fn compressed_logs_hold_every_step() -> TestResult {
    let logs = tempdir()?;
    let plan = PlanBuilder::new()
        .with_log_dir(logs.path())
        .with_compressed_logs(true)
        .with_background(true)
        .with_job(
            "zipped",
            JobBuilder::new().args(&["echo", "a"]).args(&["echo", "b"]).build(),
        )
        .build();

    let lp = new_loop();
    let scheduler = Scheduler::with_event_loop(&lp, plan::scheduler_config(&plan));
    for job in plan::build_jobs(&lp, &plan) {
        scheduler.submit(job);
    }
    let summary = scheduler.run()?;
    assert!(summary.is_success());

    let mut text = String::new();
    MultiGzDecoder::new(File::open(logs.path().join("zipped.log.gz"))?).read_to_string(&mut text)?;
    assert_eq!(text, "a\nb\n");
    Ok(())
}

#[test]
fn step_names_carry_their_position() {
    let plan = PlanBuilder::new()
        .with_job("pkg", JobBuilder::new().args(&["true"]).args(&["true"]).build())
        .build();

    let lp = new_loop();
    let job = plan::build_job(&lp, &plan, "pkg", &plan.job["pkg"]);
    assert_eq!(job.pending_steps(), 2);

    let scheduler = Scheduler::with_event_loop(&lp, plan::scheduler_config(&plan));
    scheduler.submit(job.clone());
    scheduler.run().expect("run");

    let names: Vec<_> = job.step_results().into_iter().map(|r| r.name).collect();
    assert_eq!(names, vec!["pkg[1/2]", "pkg[2/2]"]);
}
