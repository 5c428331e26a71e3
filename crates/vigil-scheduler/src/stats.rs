//! Scheduler counters.
//!
//! `Stats` keeps lock-free atomics that back [`StatsSnapshot`] and mirrors
//! every change to the `metrics` facade. Nothing here feeds back into
//! admission decisions.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};
use serde::Serialize;

const JOBS_ACTIVE: &str = "vigil_scheduler_jobs_active";
const JOBS_WAITING: &str = "vigil_scheduler_jobs_waiting";
const TASKS_ACTIVE: &str = "vigil_scheduler_tasks_active";
const TASKS_WAITING: &str = "vigil_scheduler_tasks_waiting";
const JOBS_STARTED_TOTAL: &str = "vigil_scheduler_jobs_started_total";
const JOBS_MISSED_DEADLINE_TOTAL: &str = "vigil_scheduler_jobs_missed_deadline_total";
const TASKS_PANICKED_TOTAL: &str = "vigil_scheduler_tasks_panicked_total";

/// Point-in-time copy of the scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Runs currently in flight.
    pub jobs_active: u64,
    /// Due jobs deferred because a concurrency gate was full.
    pub jobs_waiting: u64,
    /// Task bodies currently executing.
    pub tasks_active: u64,
    /// Tasks blocked on the global gate.
    pub tasks_waiting: u64,
    pub jobs_started: u64,
    /// Due times skipped because the previous run was still active.
    pub jobs_missed_deadline: u64,
    pub tasks_panicked: u64,
}

#[derive(Debug, Default)]
pub struct Stats {
    jobs_active: AtomicU64,
    jobs_waiting: AtomicU64,
    tasks_active: AtomicU64,
    tasks_waiting: AtomicU64,
    jobs_started: AtomicU64,
    jobs_missed_deadline: AtomicU64,
    tasks_panicked: AtomicU64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            jobs_active: self.jobs_active.load(Ordering::Relaxed),
            jobs_waiting: self.jobs_waiting.load(Ordering::Relaxed),
            tasks_active: self.tasks_active.load(Ordering::Relaxed),
            tasks_waiting: self.tasks_waiting.load(Ordering::Relaxed),
            jobs_started: self.jobs_started.load(Ordering::Relaxed),
            jobs_missed_deadline: self.jobs_missed_deadline.load(Ordering::Relaxed),
            tasks_panicked: self.tasks_panicked.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn run_started(&self) {
        self.jobs_active.fetch_add(1, Ordering::Relaxed);
        self.jobs_started.fetch_add(1, Ordering::Relaxed);
        gauge!(JOBS_ACTIVE).increment(1.0);
        counter!(JOBS_STARTED_TOTAL).increment(1);
    }

    pub(crate) fn run_finished(&self) {
        self.jobs_active.fetch_sub(1, Ordering::Relaxed);
        gauge!(JOBS_ACTIVE).decrement(1.0);
    }

    pub(crate) fn set_jobs_waiting(&self, n: u64) {
        self.jobs_waiting.store(n, Ordering::Relaxed);
        gauge!(JOBS_WAITING).set(n as f64);
    }

    pub(crate) fn deadline_missed(&self) {
        self.jobs_missed_deadline.fetch_add(1, Ordering::Relaxed);
        counter!(JOBS_MISSED_DEADLINE_TOTAL).increment(1);
    }

    pub(crate) fn task_waiting(&self) {
        self.tasks_waiting.fetch_add(1, Ordering::Relaxed);
        gauge!(TASKS_WAITING).increment(1.0);
    }

    pub(crate) fn task_done_waiting(&self) {
        self.tasks_waiting.fetch_sub(1, Ordering::Relaxed);
        gauge!(TASKS_WAITING).decrement(1.0);
    }

    pub(crate) fn task_active(&self) {
        self.tasks_active.fetch_add(1, Ordering::Relaxed);
        gauge!(TASKS_ACTIVE).increment(1.0);
    }

    pub(crate) fn task_done_active(&self) {
        self.tasks_active.fetch_sub(1, Ordering::Relaxed);
        gauge!(TASKS_ACTIVE).decrement(1.0);
    }

    pub(crate) fn task_panicked(&self) {
        self.tasks_panicked.fetch_add(1, Ordering::Relaxed);
        counter!(TASKS_PANICKED_TOTAL).increment(1);
    }
}
