//! The job registry owned by the control loop.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio_util::sync::CancellationToken;

use crate::{
    queue::{DueKey, DueQueue},
    schedule::Schedule,
    types::{JobId, JobInfo, TaskFn},
};

/// A registered job.
#[derive(Debug)]
pub(crate) struct JobEntry {
    pub id: JobId,
    pub name: String,
    pub job_type: String,
    pub schedule: Schedule,
    pub entrypoint: TaskFn,
    /// Child of the scheduler's shutdown token; cancelled on removal.
    pub cancel: CancellationToken,
    pub next_due: Option<DateTime<Utc>>,
    pub active_runs: u32,
    key: Option<DueKey>,
}

impl JobEntry {
    pub fn new(
        id: JobId,
        name: String,
        job_type: String,
        schedule: Schedule,
        entrypoint: TaskFn,
        cancel: CancellationToken,
        next_due: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            name,
            job_type,
            schedule,
            entrypoint,
            cancel,
            next_due,
            active_runs: 0,
            key: None,
        }
    }

    fn info(&self) -> JobInfo {
        JobInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            job_type: self.job_type.clone(),
            schedule: self.schedule.clone(),
            next_due: self.next_due,
            active_runs: self.active_runs,
        }
    }
}

pub(crate) struct Registry {
    jobs: HashMap<JobId, JobEntry>,
    queue: DueQueue,
    location: Tz,
}

impl Registry {
    pub fn new(location: Tz) -> Self {
        Self {
            jobs: HashMap::new(),
            queue: DueQueue::default(),
            location,
        }
    }

    pub fn insert(&mut self, mut entry: JobEntry) {
        if let Some(old) = self.remove(&entry.id) {
            old.cancel.cancel();
        }
        entry.key = Some(self.queue.push(entry.next_due, entry.id.clone()));
        self.jobs.insert(entry.id.clone(), entry);
    }

    pub fn remove(&mut self, id: &JobId) -> Option<JobEntry> {
        let entry = self.jobs.remove(id)?;
        if let Some(key) = &entry.key {
            self.queue.remove(key);
        }
        Some(entry)
    }

    pub fn get(&self, id: &JobId) -> Option<&JobEntry> {
        self.jobs.get(id)
    }

    pub fn get_mut(&mut self, id: &JobId) -> Option<&mut JobEntry> {
        self.jobs.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Jobs due at or before `now`, earliest first.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<JobId> {
        self.queue.due(now)
    }

    /// Earliest due time in the future. Jobs already due but deferred do not
    /// count; they are retried when capacity frees up.
    pub fn next_wake(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.queue.next_after(now)
    }

    /// Move the job's due time forward past `now`, stepping from its previous
    /// due time so intervals do not drift. Returns the new due time.
    pub fn advance(&mut self, id: &JobId, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let location = self.location;
        let entry = self.jobs.get_mut(id)?;
        let prev = entry.next_due?;
        let next = next_after_now(&entry.schedule, prev, now, &location);

        if let Some(key) = entry.key.take() {
            self.queue.remove(&key);
        }
        entry.next_due = next;
        entry.key = Some(self.queue.push(next, entry.id.clone()));
        next
    }

    /// All jobs ordered by next due time.
    pub fn snapshot(&self) -> Vec<JobInfo> {
        self.queue
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .map(JobEntry::info)
            .collect()
    }

    /// Drain every entry, e.g. on shutdown.
    pub fn drain(&mut self) -> Vec<JobEntry> {
        self.queue = DueQueue::default();
        self.jobs.drain().map(|(_, entry)| entry).collect()
    }
}

/// First trigger of `schedule` strictly after `now`, walking forward from `prev`.
fn next_after_now(
    schedule: &Schedule,
    prev: DateTime<Utc>,
    now: DateTime<Utc>,
    location: &Tz,
) -> Option<DateTime<Utc>> {
    if let Schedule::Interval(every) = schedule {
        // A zero interval never moves forward.
        if every.is_zero() {
            return None;
        }
        // Jump straight over the missed slots instead of stepping one by one.
        if let Ok(behind) = (now - prev).to_std() {
            let step = every.as_nanos();
            let on_grid = (behind.as_nanos() / step + 1)
                .checked_mul(step)
                .and_then(|offset| i64::try_from(offset).ok())
                .and_then(|offset| prev.checked_add_signed(chrono::Duration::nanoseconds(offset)));
            // Lag too large to express as an offset: restart the grid at `now`.
            return on_grid.or_else(|| schedule.next(now, location));
        }
    }

    let mut next = schedule.next(prev, location)?;
    while next <= now {
        next = schedule.next(next, location)?;
    }
    Some(next)
}
