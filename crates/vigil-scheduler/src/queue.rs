//! Due-time ordering of registered jobs.
//!
//! Entries are kept in an ordered map keyed by `(due, seq)`. `seq` grows with
//! every insertion so equal due times come out in insertion order, and a key
//! without a due time sorts after every real instant.

use std::{cmp::Ordering, collections::BTreeMap};

use chrono::{DateTime, Utc};

use crate::types::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DueKey {
    pub due: Option<DateTime<Utc>>,
    seq: u64,
}

impl Ord for DueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_due = match (self.due, other.due) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_due.then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for DueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub(crate) struct DueQueue {
    entries: BTreeMap<DueKey, JobId>,
    next_seq: u64,
}

impl DueQueue {
    /// Insert `id` at `due` and return the key needed to remove it later.
    pub fn push(&mut self, due: Option<DateTime<Utc>>, id: JobId) -> DueKey {
        let key = DueKey {
            due,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.entries.insert(key, id);
        key
    }

    pub fn remove(&mut self, key: &DueKey) -> Option<JobId> {
        self.entries.remove(key)
    }

    /// Job IDs whose due time is at or before `now`, earliest first.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<JobId> {
        self.entries
            .iter()
            .take_while(|(key, _)| key.due.is_some_and(|due| due <= now))
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// Earliest due time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.entries
            .keys()
            .filter_map(|key| key.due)
            .find(|due| *due > now)
    }

    /// All IDs in due order.
    pub fn iter(&self) -> impl Iterator<Item = &JobId> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> Option<DateTime<Utc>> {
        Some(Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap())
    }

    fn ids(queue: &DueQueue) -> Vec<&str> {
        queue.iter().map(JobId::as_str).collect()
    }

    #[test]
    fn orders_by_due_time() {
        let mut q = DueQueue::default();
        q.push(at(30), "c".into());
        q.push(at(10), "a".into());
        q.push(at(20), "b".into());
        assert_eq!(ids(&q), ["a", "b", "c"]);
    }

    #[test]
    fn ties_keep_insertion_order() {
        let mut q = DueQueue::default();
        q.push(at(5), "first".into());
        q.push(at(5), "second".into());
        q.push(at(5), "third".into());
        assert_eq!(ids(&q), ["first", "second", "third"]);
    }

    #[test]
    fn missing_due_time_sorts_last() {
        let mut q = DueQueue::default();
        q.push(None, "never".into());
        q.push(at(1_000), "later".into());
        q.push(at(1), "soon".into());
        assert_eq!(ids(&q), ["soon", "later", "never"]);
        assert_eq!(q.due(at(10_000).unwrap()), vec![JobId::from("soon"), JobId::from("later")]);
    }

    #[test]
    fn due_and_next_after() {
        let mut q = DueQueue::default();
        q.push(at(0), "a".into());
        q.push(at(10), "b".into());
        q.push(at(20), "c".into());

        let now = at(10).unwrap();
        assert_eq!(q.due(now), vec![JobId::from("a"), JobId::from("b")]);
        assert_eq!(q.next_after(now), at(20));
        assert_eq!(q.next_after(at(20).unwrap()), None);
    }

    #[test]
    fn remove_by_key() {
        let mut q = DueQueue::default();
        let a = q.push(at(1), "a".into());
        q.push(at(2), "b".into());
        assert_eq!(q.remove(&a), Some(JobId::from("a")));
        assert_eq!(q.remove(&a), None);
        assert_eq!(q.len(), 1);
        assert_eq!(ids(&q), ["b"]);
    }
}
