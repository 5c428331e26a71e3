//! `vigil-scheduler`: Tokio-based recurring-job scheduler with bounded
//! task concurrency.
//!
//! # Overview
//!
//! Jobs are registered with a [`Schedule`], a name, a job type and an entry
//! [`TaskFn`]. A single control loop owned by [`Scheduler`] keeps jobs ordered
//! by due time, sleeps until the earliest one, and starts a *run* for each
//! due job. A task body returns zero or more continuation tasks; the run
//! ends once every task it spawned has returned.
//!
//! # Concurrency gates
//!
//! | Gate      | Scope                                   | Held for                  |
//! |-----------|-----------------------------------------|---------------------------|
//! | Global    | every task body across all jobs         | one task body execution   |
//! | Job type  | runs of jobs sharing a `job_type`       | a run, until one leaf remains |
//!
//! A job whose previous run is still active when it becomes due again skips
//! that due time and counts a missed deadline.
//!
//! # Schedule syntax
//!
//! | Form                | Example              |
//! |---------------------|----------------------|
//! | `@every <duration>` | `@every 1m30s`       |
//! | 5-field cron        | `*/5 * * * *`        |
//! | 6-field cron        | `0 */5 * * * *`      |

pub mod engine;
pub mod error;
pub(crate) mod queue;
pub(crate) mod registry;
pub(crate) mod sched_job;
pub mod schedule;
pub mod stats;
pub mod types;

pub use engine::{RemoveHandle, Scheduler};
pub use error::{Result, SchedulerError};
pub use schedule::{parse_go_duration, CronSchedule, Schedule};
pub use stats::StatsSnapshot;
pub use types::{JobId, JobInfo, TaskContext, TaskFn};
