use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The schedule string is empty, malformed, or resolves to a non-advancing interval.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The configured location is not a known IANA time zone.
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    /// `start` was called on a scheduler whose control loop is already running.
    #[error("Scheduler already running")]
    AlreadyRunning,

    /// The operation needs a running scheduler.
    #[error("Scheduler not running")]
    NotRunning,

    /// The scheduler has been shut down and accepts no further work.
    #[error("Scheduler stopped")]
    Stopped,

    /// `start` was called outside a Tokio runtime.
    #[error("No Tokio runtime available")]
    NoRuntime,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
