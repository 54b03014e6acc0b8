// src/sched/mod.rs

//! Job scheduler: admission control over a queue of tasks, driven by the
//! event loop, with asynchronous termination.

pub mod admission;
pub mod load;
pub mod terminate;

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::{Rc, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::errors::{EngineError, Result};
use crate::event_loop::{EventLoop, RemoteWaker, TimerHandle};
use crate::task::returncode::Outcome;
use crate::task::{Task, TaskExt, TaskId};
use crate::types::MaxJobs;

pub use admission::{Admission, can_add_job};
pub use load::{LoadSource, SystemLoad};
pub use terminate::{TerminateHandle, TerminationState};

/// Default delay before re-checking a load average that blocked admission.
pub const DEFAULT_LOAD_RECHECK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_jobs: MaxJobs,
    pub max_load: Option<f64>,
    pub load_recheck: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_jobs: MaxJobs::default(),
            max_load: None,
            load_recheck: DEFAULT_LOAD_RECHECK,
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_jobs(mut self, max_jobs: MaxJobs) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    pub fn with_max_load(mut self, max_load: Option<f64>) -> Self {
        self.max_load = max_load;
        self
    }

    pub fn with_load_recheck(mut self, delay: Duration) -> Self {
        self.load_recheck = delay;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub id: TaskId,
    pub name: String,
    pub returncode: i32,
}

impl JobResult {
    pub fn outcome(&self) -> Outcome {
        Outcome::from_returncode(self.returncode)
    }
}

/// What happened during [`Scheduler::run`].
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Finished jobs in completion order.
    pub results: Vec<JobResult>,
    /// Jobs that were running when termination cancelled them.
    pub in_flight_at_termination: Vec<String>,
    /// Queued jobs dropped by termination.
    pub not_started: Vec<String>,
    pub terminated: bool,
}

impl RunSummary {
    pub fn failures(&self) -> impl Iterator<Item = &JobResult> {
        self.results.iter().filter(|r| r.returncode != 0)
    }

    pub fn is_success(&self) -> bool {
        !self.terminated && self.not_started.is_empty() && self.failures().next().is_none()
    }
}

/// Owns the event loop and the job queue.
///
/// Cloning yields another handle to the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
}

struct SchedulerInner {
    event_loop: EventLoop,
    config: SchedulerConfig,
    load: RefCell<Box<dyn LoadSource>>,
    queue: RefCell<VecDeque<Rc<dyn Task>>>,
    running: RefCell<BTreeMap<TaskId, Rc<dyn Task>>>,
    running_job_count: Cell<usize>,
    scheduling: Cell<bool>,
    terminated_tasks: Cell<bool>,
    terminate: TerminateHandle,
    waker: RemoteWaker,
    load_timer: RefCell<Option<TimerHandle>>,
    summary: RefCell<RunSummary>,
    main_exit: RefCell<Option<oneshot::Sender<()>>>,
    owns_loop: bool,
    closed: Cell<bool>,
}

impl Scheduler {
    /// Create a scheduler with its own event loop.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        let event_loop = EventLoop::new()?;
        Ok(Self::build(&event_loop, config, true))
    }

    /// Create a scheduler on a loop shared with other code. Shutting it
    /// down only affects this scheduler's own jobs.
    pub fn with_event_loop(event_loop: &EventLoop, config: SchedulerConfig) -> Self {
        Self::build(event_loop, config, false)
    }

    fn build(event_loop: &EventLoop, config: SchedulerConfig, owns_loop: bool) -> Self {
        let inner = Rc::new_cyclic(|weak: &Weak<SchedulerInner>| {
            let weak = weak.clone();
            let waker = event_loop.remote_waker(move || {
                if let Some(inner) = weak.upgrade() {
                    Scheduler { inner }.termination_check(false);
                }
            });
            SchedulerInner {
                event_loop: event_loop.clone(),
                config,
                load: RefCell::new(Box::new(SystemLoad)),
                queue: RefCell::new(VecDeque::new()),
                running: RefCell::new(BTreeMap::new()),
                running_job_count: Cell::new(0),
                scheduling: Cell::new(false),
                terminated_tasks: Cell::new(false),
                terminate: TerminateHandle::new(waker.clone()),
                waker,
                load_timer: RefCell::new(None),
                summary: RefCell::new(RunSummary::default()),
                main_exit: RefCell::new(None),
                owns_loop,
                closed: Cell::new(false),
            }
        });
        Scheduler { inner }
    }

    pub fn set_load_source(&self, load: impl LoadSource + 'static) {
        *self.inner.load.borrow_mut() = Box::new(load);
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn terminate_handle(&self) -> TerminateHandle {
        self.inner.terminate.clone()
    }

    /// Shorthand for `terminate_handle().terminate()`.
    pub fn terminate(&self) {
        self.inner.terminate.terminate();
    }

    pub fn termination_state(&self) -> TerminationState {
        if self.inner.terminated_tasks.get() {
            TerminationState::TerminatedTasksSent
        } else if self.inner.terminate.is_terminated() {
            TerminationState::Terminating
        } else {
            TerminationState::Running
        }
    }

    pub fn running_job_count(&self) -> usize {
        self.inner.running_job_count.get()
    }

    pub fn queued_job_count(&self) -> usize {
        self.inner.queue.borrow().len()
    }

    /// Queue a task. Once tasks have been terminated, submissions are
    /// cancelled immediately and reported as not started.
    pub fn submit(&self, task: Rc<dyn Task>) {
        if self.inner.terminated_tasks.get() {
            warn!(job = %task.core().name(), "scheduler terminated; not queueing job");
            self.inner
                .summary
                .borrow_mut()
                .not_started
                .push(task.core().name().to_string());
            task.cancel();
            return;
        }
        debug!(job = %task.core().name(), "queued job");
        self.inner.queue.borrow_mut().push_back(task);
        self.schedule();
    }

    /// Turn an interrupt (Ctrl-C) into a termination request.
    pub fn terminate_on_interrupt(&self) {
        let handle = self.terminate_handle();
        self.inner.event_loop.spawn_local(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    warn!("interrupted; terminating jobs");
                    handle.terminate();
                }
                Err(err) => warn!(error = %err, "failed to listen for Ctrl+C"),
            }
        });
    }

    /// Run until every queued job has finished, or until termination has
    /// cancelled the running ones and they have exited.
    pub fn run(&self) -> Result<RunSummary> {
        let (tx, rx) = oneshot::channel();
        *self.inner.main_exit.borrow_mut() = Some(tx);

        info!(
            jobs = self.queued_job_count(),
            max_jobs = %self.inner.config.max_jobs,
            max_load = ?self.inner.config.max_load,
            "scheduler starting"
        );
        self.schedule();

        let event_loop = self.inner.event_loop.clone();
        event_loop.run_until_complete(rx)?.map_err(|_| {
            EngineError::InvalidState("scheduler exited without completing".to_string())
        })?;

        if let Some(timer) = self.inner.load_timer.borrow_mut().take() {
            timer.cancel();
        }

        let mut summary = std::mem::take(&mut *self.inner.summary.borrow_mut());
        summary.terminated = self.inner.terminate.is_terminated();
        info!(
            finished = summary.results.len(),
            failed = summary.failures().count(),
            terminated = summary.terminated,
            "scheduler finished"
        );
        Ok(summary)
    }

    /// Refuse further termination requests and drop queued jobs. Also runs
    /// on drop.
    ///
    /// With its own loop, every child still watched by the loop is killed
    /// and reaped and every pending callback is dropped. On a shared loop
    /// the running jobs are cancelled instead and the loop is left alone.
    pub fn shutdown(&self) {
        self.inner.cleanup();
    }

    fn schedule(&self) {
        if self.inner.scheduling.replace(true) {
            trace!("schedule re-entered; outer pass will pick up new work");
            return;
        }
        self.schedule_tasks();
        self.inner.scheduling.set(false);
        self.check_main_exit();
    }

    fn can_add_job(&self) -> Admission {
        let load = self.inner.load.borrow();
        can_add_job(
            self.inner.terminated_tasks.get(),
            self.inner.running_job_count.get(),
            self.inner.config.max_jobs,
            self.inner.config.max_load,
            load.as_ref(),
        )
    }

    fn schedule_tasks(&self) {
        loop {
            if self.inner.queue.borrow().is_empty() {
                break;
            }
            let admission = self.can_add_job();
            if !admission.is_admit() {
                debug!(
                    ?admission,
                    queued = self.queued_job_count(),
                    running = self.running_job_count(),
                    "admission deferred"
                );
                if admission.wants_load_recheck() {
                    self.arm_load_recheck();
                }
                break;
            }
            let next = self.inner.queue.borrow_mut().pop_front();
            if let Some(task) = next {
                self.start_job(task);
            }
        }
    }

    fn start_job(&self, task: Rc<dyn Task>) {
        let id = task.core().id();
        let name = task.core().name().to_string();

        self.inner
            .running_job_count
            .set(self.inner.running_job_count.get() + 1);
        self.inner.running.borrow_mut().insert(id, Rc::clone(&task));

        // Registered last, so it runs before any listener the submitter added.
        let weak = Rc::downgrade(&self.inner);
        let job_name = name.clone();
        task.add_exit_listener(move |returncode| {
            if let Some(inner) = weak.upgrade() {
                Scheduler { inner }.job_exited(id, job_name, returncode);
            }
        });

        info!(job = %name, running = self.running_job_count(), "starting job");
        task.start();
    }

    fn job_exited(&self, id: TaskId, name: String, returncode: i32) {
        if self.inner.closed.get() {
            debug!(job = %name, returncode, "job exited after shutdown");
            return;
        }
        if self.inner.running.borrow_mut().remove(&id).is_none() {
            warn!(job = %name, "exit from a job that is not running");
            return;
        }
        let count = self.inner.running_job_count.get();
        debug_assert!(count > 0, "running job count underflow");
        self.inner.running_job_count.set(count.saturating_sub(1));

        let outcome = Outcome::from_returncode(returncode);
        if outcome.is_success() {
            info!(job = %name, "job finished");
        } else {
            warn!(job = %name, returncode, %outcome, "job failed");
        }
        self.inner.summary.borrow_mut().results.push(JobResult {
            id,
            name,
            returncode,
        });

        self.schedule();
    }

    fn arm_load_recheck(&self) {
        if self.inner.load_timer.borrow().is_some() {
            return;
        }
        let weak = Rc::downgrade(&self.inner);
        let timer = self
            .inner
            .event_loop
            .call_later(self.inner.config.load_recheck, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.load_timer.borrow_mut().take();
                    debug!("re-checking load average");
                    Scheduler { inner }.schedule();
                }
            });
        *self.inner.load_timer.borrow_mut() = Some(timer);
    }

    fn termination_check(&self, retry: bool) {
        if !self.inner.terminate.is_terminated() || self.inner.terminated_tasks.get() {
            return;
        }
        if self.inner.scheduling.get() {
            trace!(retry, "scheduling pass active; deferring termination");
            let weak = Rc::downgrade(&self.inner);
            self.inner.event_loop.call_soon(move || {
                if let Some(inner) = weak.upgrade() {
                    Scheduler { inner }.termination_check(true);
                }
            });
            return;
        }

        self.inner.terminated_tasks.set(true);
        self.terminate_tasks();
        self.check_main_exit();
    }

    fn terminate_tasks(&self) {
        let running: Vec<Rc<dyn Task>> = self.inner.running.borrow().values().cloned().collect();
        let queued: Vec<Rc<dyn Task>> = self.inner.queue.borrow_mut().drain(..).collect();

        warn!(
            running = running.len(),
            queued = queued.len(),
            "terminating jobs"
        );

        for task in running {
            if task.is_alive() {
                self.inner
                    .summary
                    .borrow_mut()
                    .in_flight_at_termination
                    .push(task.core().name().to_string());
                task.cancel();
            }
        }
        for task in queued {
            self.inner
                .summary
                .borrow_mut()
                .not_started
                .push(task.core().name().to_string());
            task.cancel();
        }
    }

    fn is_idle(&self) -> bool {
        let idle = self.inner.running_job_count.get() == 0;
        let drained = self.inner.queue.borrow().is_empty() || self.inner.terminated_tasks.get();
        idle && drained
    }

    /// Exit is confirmed one loop turn later: exit listeners that run after
    /// ours in the same round may still submit work.
    fn check_main_exit(&self) {
        if !self.is_idle() || self.inner.main_exit.borrow().is_none() {
            return;
        }
        let weak = Rc::downgrade(&self.inner);
        self.inner.event_loop.call_soon(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let scheduler = Scheduler { inner };
            if !scheduler.is_idle() {
                return;
            }
            if let Some(tx) = scheduler.inner.main_exit.borrow_mut().take() {
                debug!("no jobs left; scheduler exiting");
                let _ = tx.send(());
            }
        });
    }
}

impl SchedulerInner {
    fn cleanup(&self) {
        if self.closed.replace(true) {
            return;
        }
        self.terminate.close();
        self.event_loop.remove_remote_waker(&self.waker);
        if let Some(timer) = self.load_timer.borrow_mut().take() {
            timer.cancel();
        }
        self.queue.borrow_mut().clear();
        let running = std::mem::take(&mut *self.running.borrow_mut());

        if self.owns_loop {
            let reaped = self.event_loop.shutdown_children();
            let discarded = self.event_loop.discard_pending();
            debug!(reaped, discarded, "scheduler shut down");
        } else {
            for task in running.values() {
                task.cancel();
            }
            debug!(cancelled = running.len(), "scheduler shut down on a shared loop");
        }
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        if !self.event_loop.is_running() {
            self.cleanup();
        }
    }
}
