use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot, Notify, Semaphore},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};
use vigil_core::SchedulerConfig;

use crate::{
    error::{Result, SchedulerError},
    registry::{JobEntry, Registry},
    sched_job::{SchedJob, TypeGate},
    schedule::Schedule,
    stats::{Stats, StatsSnapshot},
    types::{JobId, JobInfo, TaskFn},
};

/// How long the control loop sleeps when no job has a future due time.
const IDLE_WAKE: Duration = Duration::from_secs(3600);

/// Messages accepted by the control loop, the only owner of the registry.
pub(crate) enum Command {
    Add(JobEntry),
    Remove(JobId),
    RunFinished(JobId),
    Snapshot(oneshot::Sender<Vec<JobInfo>>),
}

enum Lifecycle {
    /// Not started yet; commands queue up until the control loop takes them.
    Idle(mpsc::UnboundedReceiver<Command>),
    Running,
    Stopped,
}

/// State shared between the public handle, the control loop and runs.
struct Shared {
    location: Tz,
    global: Option<Arc<Semaphore>>,
    type_limits: HashMap<String, Arc<Semaphore>>,
    stats: Arc<Stats>,
    slot_freed: Arc<Notify>,
    shutdown: CancellationToken,
    commands: mpsc::UnboundedSender<Command>,
}

/// Recurring-job scheduler with a global task budget and optional
/// per-job-type run budgets.
pub struct Scheduler {
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
    tracker: TaskTracker,
}

impl Scheduler {
    /// Create a stopped scheduler.
    ///
    /// `limit` caps concurrently executing task bodies across all jobs
    /// (`0` = unbounded). `job_type_limits` caps concurrently admitted runs
    /// per job type; a limit of `0` leaves that type ungated.
    pub fn new(limit: usize, location: Tz, job_type_limits: HashMap<String, usize>) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let type_limits = job_type_limits
            .into_iter()
            .filter(|(_, limit)| *limit > 0)
            .map(|(job_type, limit)| (job_type, Arc::new(Semaphore::new(limit))))
            .collect();

        Self {
            shared: Arc::new(Shared {
                location,
                global: (limit > 0).then(|| Arc::new(Semaphore::new(limit))),
                type_limits,
                stats: Arc::new(Stats::default()),
                slot_freed: Arc::new(Notify::new()),
                shutdown: CancellationToken::new(),
                commands,
            }),
            lifecycle: Mutex::new(Lifecycle::Idle(receiver)),
            tracker: TaskTracker::new(),
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Result<Self> {
        let location: Tz = config
            .location
            .parse()
            .map_err(|_| SchedulerError::InvalidTimezone(config.location.clone()))?;
        Ok(Self::new(
            config.limit,
            location,
            config.job_type_limits.clone(),
        ))
    }

    /// Spawn the control loop on the current Tokio runtime.
    pub fn start(&self) -> Result<()> {
        let runtime = Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;

        let mut state = lock(&self.lifecycle);
        let receiver = match std::mem::replace(&mut *state, Lifecycle::Running) {
            Lifecycle::Idle(receiver) => receiver,
            Lifecycle::Running => return Err(SchedulerError::AlreadyRunning),
            Lifecycle::Stopped => {
                *state = Lifecycle::Stopped;
                return Err(SchedulerError::Stopped);
            }
        };

        let control = ControlLoop {
            registry: Registry::new(self.shared.location),
            shared: Arc::clone(&self.shared),
            commands: receiver,
            runs: self.tracker.clone(),
        };
        self.tracker.spawn_on(control.run(), &runtime);
        info!(
            limit = self.shared.global.as_ref().map(|s| s.available_permits()),
            location = %self.shared.location,
            "scheduler started"
        );
        Ok(())
    }

    /// Stop scheduling and wait until every run and task has finished.
    ///
    /// Tasks still waiting for a concurrency slot are skipped; task bodies
    /// already executing are not interrupted but see their token cancelled.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = lock(&self.lifecycle);
            match *state {
                Lifecycle::Running => *state = Lifecycle::Stopped,
                _ => return Err(SchedulerError::NotRunning),
            }
        }

        info!("scheduler stopping");
        self.shared.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("scheduler stopped");
        Ok(())
    }

    /// Register a job. Its first due time is `schedule.next(now)`.
    ///
    /// May be called before or after [`Scheduler::start`]. The returned
    /// handle deregisters the job.
    pub fn add(
        &self,
        schedule: Schedule,
        name: &str,
        job_type: &str,
        task: TaskFn,
    ) -> Result<RemoveHandle> {
        if matches!(*lock(&self.lifecycle), Lifecycle::Stopped) {
            return Err(SchedulerError::Stopped);
        }

        let id = JobId::new();
        let cancel = self.shared.shutdown.child_token();
        let next_due = schedule.next(Utc::now(), &self.shared.location);
        let entry = JobEntry::new(
            id.clone(),
            name.to_string(),
            job_type.to_string(),
            schedule,
            task,
            cancel.clone(),
            next_due,
        );
        self.shared
            .commands
            .send(Command::Add(entry))
            .map_err(|_| SchedulerError::Stopped)?;

        Ok(RemoveHandle {
            id,
            cancel,
            commands: self.shared.commands.clone(),
            removed: AtomicBool::new(false),
        })
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Snapshot of all registered jobs, ordered by next due time.
    pub async fn jobs(&self) -> Result<Vec<JobInfo>> {
        if !matches!(*lock(&self.lifecycle), Lifecycle::Running) {
            return Err(SchedulerError::NotRunning);
        }
        let (tx, rx) = oneshot::channel();
        self.shared
            .commands
            .send(Command::Snapshot(tx))
            .map_err(|_| SchedulerError::NotRunning)?;
        rx.await.map_err(|_| SchedulerError::NotRunning)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Stop the control loop and any queued tasks if the owner forgot to.
        self.shared.shutdown.cancel();
    }
}

// ---------------------------------------------------------------------------
// RemoveHandle
// ---------------------------------------------------------------------------

/// Deregisters a job. Only the first [`RemoveHandle::cancel`] has an effect.
pub struct RemoveHandle {
    id: JobId,
    cancel: CancellationToken,
    commands: mpsc::UnboundedSender<Command>,
    removed: AtomicBool,
}

impl RemoveHandle {
    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Remove the job and cancel its in-flight run, if any.
    pub fn cancel(&self) -> Result<()> {
        if self.removed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        self.commands
            .send(Command::Remove(self.id.clone()))
            .map_err(|_| SchedulerError::Stopped)
    }
}

// ---------------------------------------------------------------------------
// Control loop
// ---------------------------------------------------------------------------

struct ControlLoop {
    shared: Arc<Shared>,
    registry: Registry,
    commands: mpsc::UnboundedReceiver<Command>,
    runs: TaskTracker,
}

impl ControlLoop {
    async fn run(mut self) {
        debug!("scheduler control loop running");
        loop {
            let now = Utc::now();
            self.dispatch(now);

            let sleep_for = self
                .registry
                .next_wake(now)
                .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(IDLE_WAKE);

            tokio::select! {
                biased;
                _ = self.shared.shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = self.shared.slot_freed.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }

        let jobs = self.registry.drain();
        for job in &jobs {
            job.cancel.cancel();
        }
        self.shared.stats.set_jobs_waiting(0);
        debug!(jobs = jobs.len(), "scheduler control loop exited");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Add(entry) => {
                info!(
                    job_id = %entry.id,
                    job = %entry.name,
                    job_type = %entry.job_type,
                    schedule = %entry.schedule,
                    next_due = ?entry.next_due,
                    "job added"
                );
                self.registry.insert(entry);
                debug!(jobs = self.registry.len(), "registry updated");
            }
            Command::Remove(id) => {
                if let Some(entry) = self.registry.remove(&id) {
                    entry.cancel.cancel();
                    info!(job_id = %id, job = %entry.name, "job removed");
                }
            }
            Command::RunFinished(id) => {
                if let Some(entry) = self.registry.get_mut(&id) {
                    entry.active_runs = entry.active_runs.saturating_sub(1);
                }
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.registry.snapshot());
            }
        }
    }

    /// Start every due job that can be admitted now. Jobs blocked by a full
    /// gate stay due and are retried on the next event.
    fn dispatch(&mut self, now: DateTime<Utc>) {
        let mut waiting = 0;

        for id in self.registry.due(now) {
            let Some(job) = self.registry.get(&id) else {
                continue;
            };

            if job.active_runs > 0 {
                let name = job.name.clone();
                self.shared.stats.deadline_missed();
                let next_due = self.registry.advance(&id, now);
                warn!(job_id = %id, job = %name, next_due = ?next_due, "job still active at its due time; skipping this run");
                continue;
            }

            if self
                .shared
                .global
                .as_ref()
                .is_some_and(|global| global.available_permits() == 0)
            {
                waiting += 1;
                debug!(job_id = %id, job = %job.name, "deferred: global limit reached");
                continue;
            }

            let gate = match self.shared.type_limits.get(&job.job_type) {
                None => TypeGate::Open,
                Some(sem) => match Arc::clone(sem).try_acquire_owned() {
                    Ok(permit) => TypeGate::Held(permit),
                    Err(_) => {
                        waiting += 1;
                        debug!(job_id = %id, job = %job.name, job_type = %job.job_type, "deferred: job-type limit reached");
                        continue;
                    }
                },
            };

            self.start_run(&id, gate, now);
        }

        self.shared.stats.set_jobs_waiting(waiting);
    }

    fn start_run(&mut self, id: &JobId, gate: TypeGate, now: DateTime<Utc>) {
        let next_due = self.registry.advance(id, now);
        let Some(job) = self.registry.get_mut(id) else {
            return;
        };
        if next_due.is_none() {
            warn!(job_id = %id, job = %job.name, schedule = %job.schedule, "job has no further due time");
        }
        job.active_runs += 1;

        let run = SchedJob::new(
            job.id.clone(),
            job.name.clone(),
            job.job_type.clone(),
            job.cancel.clone(),
            self.shared.global.clone(),
            gate,
            Arc::clone(&self.shared.stats),
            Arc::clone(&self.shared.slot_freed),
        );
        let entrypoint = job.entrypoint.clone();
        debug!(job_id = %id, job = %job.name, next_due = ?next_due, "job started");

        let stats = Arc::clone(&self.shared.stats);
        let commands = self.shared.commands.clone();
        let id = id.clone();
        stats.run_started();
        self.runs.spawn(async move {
            run.run(entrypoint).await;
            stats.run_finished();
            let _ = commands.send(Command::RunFinished(id));
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
