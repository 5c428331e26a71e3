//! Shared data types for vigil-scheduler.

use std::{fmt, future::Future, sync::Arc};

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::schedule::Schedule;

// ---------------------------------------------------------------------------
// JobId
// ---------------------------------------------------------------------------

/// Opaque identifier for a registered job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a fresh random job ID (UUIDv4).
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// TaskContext
// ---------------------------------------------------------------------------

/// Handed to every task body. Continuations share their parent's token.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub cancel: CancellationToken,
    pub job_id: JobId,
    pub job_name: String,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the run is cancelled (job removed or scheduler stopping).
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

// ---------------------------------------------------------------------------
// TaskFn
// ---------------------------------------------------------------------------

type TaskBody = dyn Fn(TaskContext) -> BoxFuture<'static, Vec<TaskFn>> + Send + Sync;

/// One unit of work. Its output is the list of continuations to run next,
/// each as an independent concurrent task of the same run.
#[derive(Clone)]
pub struct TaskFn(Arc<TaskBody>);

impl TaskFn {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<TaskFn>> + Send + 'static,
    {
        Self(Arc::new(move |ctx| f(ctx).boxed()))
    }

    pub(crate) fn call(&self, ctx: TaskContext) -> BoxFuture<'static, Vec<TaskFn>> {
        (self.0)(ctx)
    }
}

impl fmt::Debug for TaskFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TaskFn")
    }
}

// ---------------------------------------------------------------------------
// JobInfo
// ---------------------------------------------------------------------------

/// Snapshot of a registered job, as returned by `Scheduler::jobs`.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub job_type: String,
    pub schedule: Schedule,
    /// `None` when the schedule will never fire again.
    pub next_due: Option<DateTime<Utc>>,
    pub active_runs: u32,
}
