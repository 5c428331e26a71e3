//! `SchedJob`: one triggered run of a job's task tree.
//!
//! The entry task runs first; every continuation it returns is spawned as its
//! own concurrent task, and so on until the tree is exhausted. Each task body
//! must hold a permit of the global gate while it executes. The optional
//! job-type permit is held from admission until the tree has collapsed to a
//! single outstanding task, then released so the next run of the same type
//! can be admitted while that last leaf finishes.

use std::{
    any::Any,
    backtrace::Backtrace,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, warn};

use crate::{
    stats::Stats,
    types::{JobId, TaskContext, TaskFn},
};

/// How the job-type gate is satisfied for a run.
pub(crate) enum TypeGate {
    /// The job type has no concurrency limit.
    Open,
    /// The permit was acquired by the caller before the run was built.
    Held(OwnedSemaphorePermit),
}

pub(crate) struct SchedJob {
    ctx: TaskContext,
    job_type: String,
    global: Option<Arc<Semaphore>>,
    type_gate: Mutex<Option<TypeGate>>,
    type_permit: Mutex<Option<OwnedSemaphorePermit>>,
    active_tasks: AtomicUsize,
    tasks: TaskTracker,
    stats: Arc<Stats>,
    slot_freed: Arc<Notify>,
}

impl SchedJob {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: JobId,
        job_name: String,
        job_type: String,
        cancel: CancellationToken,
        global: Option<Arc<Semaphore>>,
        type_gate: TypeGate,
        stats: Arc<Stats>,
        slot_freed: Arc<Notify>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx: TaskContext {
                cancel,
                job_id,
                job_name,
            },
            job_type,
            global,
            type_gate: Mutex::new(Some(type_gate)),
            type_permit: Mutex::new(None),
            active_tasks: AtomicUsize::new(0),
            tasks: TaskTracker::new(),
            stats,
            slot_freed,
        })
    }

    /// Execute `entrypoint` and every transitive continuation, returning once
    /// all of them have run or been skipped.
    pub async fn run(self: Arc<Self>, entrypoint: TaskFn) {
        let gate = lock(&self.type_gate).take();
        let permit = match gate {
            Some(TypeGate::Held(permit)) => Some(permit),
            Some(TypeGate::Open) | None => None,
        };
        *lock(&self.type_permit) = permit;

        debug!(job_id = %self.ctx.job_id, job = %self.ctx.job_name, "run started");
        self.active_tasks.store(1, Ordering::SeqCst);
        self.tasks.spawn(Arc::clone(&self).run_task(entrypoint));
        self.tasks.close();
        self.tasks.wait().await;

        // Trees that never narrowed to a single task release on completion.
        self.release_type_permit();
        debug!(job_id = %self.ctx.job_id, job = %self.ctx.job_name, "run finished");
    }

    /// Run one task node: wait for a global slot, execute, fan out.
    fn run_task(self: Arc<Self>, task: TaskFn) -> BoxFuture<'static, ()> {
        async move {
            let continuations = match self.admit().await {
                Some(permit) => {
                    let out = self.execute(&task).await;
                    drop(permit);
                    if self.global.is_some() {
                        self.slot_freed.notify_one();
                    }
                    out
                }
                None => Vec::new(),
            };

            let spawned = continuations.len();
            self.active_tasks.fetch_add(spawned, Ordering::SeqCst);
            for next in continuations {
                self.tasks.spawn(Arc::clone(&self).run_task(next));
            }
            let remaining = self.active_tasks.fetch_sub(1, Ordering::SeqCst) - 1;
            if spawned > 0 {
                debug!(job_id = %self.ctx.job_id, task_count = spawned, remaining, "spawned continuations");
            }
            if remaining == 1 {
                self.release_type_permit();
            }
        }
        .boxed()
    }

    /// Acquire a global slot. `None` means the task must be skipped because
    /// the run was cancelled while (or before) waiting.
    async fn admit(&self) -> Option<Option<OwnedSemaphorePermit>> {
        let Some(global) = &self.global else {
            return (!self.ctx.is_cancelled()).then_some(None);
        };

        self.stats.task_waiting();
        let permit = tokio::select! {
            _ = self.ctx.cancel.cancelled() => None,
            permit = Arc::clone(global).acquire_owned() => permit.ok(),
        };
        self.stats.task_done_waiting();

        match permit {
            Some(permit) if !self.ctx.is_cancelled() => Some(Some(permit)),
            Some(permit) => {
                drop(permit);
                self.slot_freed.notify_one();
                None
            }
            None => None,
        }
    }

    /// Invoke the task body, isolating panics.
    async fn execute(&self, task: &TaskFn) -> Vec<TaskFn> {
        self.stats.task_active();
        let ctx = self.ctx.clone();
        let result = match std::panic::catch_unwind(AssertUnwindSafe(|| task.call(ctx))) {
            Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
            Err(payload) => Err(payload),
        };
        self.stats.task_done_active();

        match result {
            Ok(continuations) => continuations,
            Err(payload) => {
                self.stats.task_panicked();
                warn!(
                    job_id = %self.ctx.job_id,
                    job = %self.ctx.job_name,
                    panic = %panic_message(&*payload),
                    backtrace = %Backtrace::force_capture(),
                    "task panicked; treating it as finished without continuations"
                );
                Vec::new()
            }
        }
    }

    fn release_type_permit(&self) {
        if lock(&self.type_permit).take().is_some() {
            debug!(job_id = %self.ctx.job_id, job_type = %self.job_type, "job-type slot released");
            self.slot_freed.notify_one();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Harness {
        stats: Arc<Stats>,
        slot_freed: Arc<Notify>,
        cancel: CancellationToken,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                stats: Arc::new(Stats::default()),
                slot_freed: Arc::new(Notify::new()),
                cancel: CancellationToken::new(),
            }
        }

        fn job(&self, global: Option<Arc<Semaphore>>, gate: TypeGate) -> Arc<SchedJob> {
            SchedJob::new(
                JobId::from("job"),
                "job".to_string(),
                "test".to_string(),
                self.cancel.clone(),
                global,
                gate,
                Arc::clone(&self.stats),
                Arc::clone(&self.slot_freed),
            )
        }
    }

    /// Counts executions and the peak number of bodies running at once.
    #[derive(Default)]
    struct Tally {
        executed: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Tally {
        async fn body(&self, hold: Duration) {
            self.executed.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(hold).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn leaf(tally: Arc<Tally>) -> TaskFn {
        TaskFn::new(move |_ctx| {
            let tally = Arc::clone(&tally);
            async move {
                tally.body(Duration::from_millis(20)).await;
                Vec::new()
            }
        })
    }

    fn fork(tally: Arc<Tally>, width: usize) -> TaskFn {
        TaskFn::new(move |_ctx| {
            let tally = Arc::clone(&tally);
            async move {
                tally.body(Duration::from_millis(20)).await;
                (0..width).map(|_| leaf(Arc::clone(&tally))).collect()
            }
        })
    }

    #[tokio::test]
    async fn forking_task_respects_global_limit() {
        let h = Harness::new();
        let tally = Arc::new(Tally::default());
        let global = Arc::new(Semaphore::new(1));

        let job = h.job(Some(Arc::clone(&global)), TypeGate::Open);
        job.run(fork(Arc::clone(&tally), 3)).await;

        assert_eq!(tally.executed.load(Ordering::SeqCst), 4);
        assert_eq!(tally.peak.load(Ordering::SeqCst), 1);
        assert_eq!(global.available_permits(), 1);
        let snap = h.stats.snapshot();
        assert_eq!(snap.tasks_active, 0);
        assert_eq!(snap.tasks_waiting, 0);
    }

    #[tokio::test]
    async fn continuations_run_in_parallel_without_limit() {
        let h = Harness::new();
        let tally = Arc::new(Tally::default());

        h.job(None, TypeGate::Open).run(fork(Arc::clone(&tally), 3)).await;

        assert_eq!(tally.executed.load(Ordering::SeqCst), 4);
        assert_eq!(tally.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn deep_tree_completes_before_run_returns() {
        fn chain(depth: usize, count: Arc<AtomicUsize>) -> TaskFn {
            TaskFn::new(move |_ctx| {
                let count = Arc::clone(&count);
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    if depth == 0 {
                        Vec::new()
                    } else {
                        vec![chain(depth - 1, Arc::clone(&count)), chain(depth - 1, count)]
                    }
                }
            })
        }

        let h = Harness::new();
        let count = Arc::new(AtomicUsize::new(0));
        h.job(Some(Arc::new(Semaphore::new(2))), TypeGate::Open)
            .run(chain(4, Arc::clone(&count)))
            .await;
        // Full binary tree of depth 4.
        assert_eq!(count.load(Ordering::SeqCst), 31);
    }

    #[tokio::test]
    async fn continuations_share_parent_context() {
        let h = Harness::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_leaf = Arc::clone(&seen);
        let child = TaskFn::new(move |ctx: TaskContext| {
            let seen = Arc::clone(&seen_leaf);
            async move {
                lock(&seen).push(ctx.job_id.clone());
                Vec::new()
            }
        });
        let root = TaskFn::new(move |_ctx| {
            let child = child.clone();
            async move { vec![child.clone(), child] }
        });

        h.job(None, TypeGate::Open).run(root).await;
        assert_eq!(*lock(&seen), vec![JobId::from("job"), JobId::from("job")]);
    }

    #[tokio::test]
    async fn cancelled_waiters_never_execute() {
        let h = Harness::new();
        let global = Arc::new(Semaphore::new(1));
        // Hold the only slot so every entry task queues on the global gate.
        let blocker = Arc::clone(&global).acquire_owned().await.unwrap();

        let executed = Arc::new(AtomicUsize::new(0));
        let mut runs = Vec::new();
        for _ in 0..5 {
            let executed = Arc::clone(&executed);
            let entry = TaskFn::new(move |_ctx| {
                let executed = Arc::clone(&executed);
                async move {
                    executed.fetch_add(1, Ordering::SeqCst);
                    Vec::new()
                }
            });
            let job = h.job(Some(Arc::clone(&global)), TypeGate::Open);
            runs.push(tokio::spawn(job.run(entry)));
        }

        for _ in 0..100 {
            if h.stats.snapshot().tasks_waiting == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.stats.snapshot().tasks_waiting, 5);

        h.cancel.cancel();
        drop(blocker);
        for run in runs {
            tokio::time::timeout(Duration::from_secs(1), run)
                .await
                .expect("run did not return after cancellation")
                .unwrap();
        }
        assert_eq!(executed.load(Ordering::SeqCst), 0);
        assert_eq!(h.stats.snapshot().tasks_waiting, 0);
    }

    fn explode() -> Vec<TaskFn> {
        panic!("task exploded")
    }

    #[tokio::test]
    async fn panic_is_contained_and_slot_returned() {
        let h = Harness::new();
        let global = Arc::new(Semaphore::new(1));
        let after = Arc::new(AtomicUsize::new(0));

        let after_leaf = Arc::clone(&after);
        let root = TaskFn::new(move |_ctx| {
            let after = Arc::clone(&after_leaf);
            async move {
                let ok = TaskFn::new(move |_ctx| {
                    let after = Arc::clone(&after);
                    async move {
                        after.fetch_add(1, Ordering::SeqCst);
                        Vec::new()
                    }
                });
                let boom = TaskFn::new(|_ctx| async { explode() });
                vec![boom, ok]
            }
        });

        h.job(Some(Arc::clone(&global)), TypeGate::Open).run(root).await;

        assert_eq!(after.load(Ordering::SeqCst), 1);
        assert_eq!(global.available_permits(), 1);
        assert_eq!(h.stats.snapshot().tasks_panicked, 1);
        assert_eq!(h.stats.snapshot().tasks_active, 0);
    }

    #[tokio::test]
    async fn type_slot_released_when_last_leaf_remains() {
        let h = Harness::new();
        let type_sem = Arc::new(Semaphore::new(1));
        let permit = Arc::clone(&type_sem).try_acquire_owned().unwrap();

        let (leaf_started_tx, leaf_started_rx) = tokio::sync::oneshot::channel::<()>();
        let leaf_started_tx = Arc::new(Mutex::new(Some(leaf_started_tx)));
        let release_leaf = Arc::new(Notify::new());

        let leaf_release = Arc::clone(&release_leaf);
        let root = TaskFn::new(move |_ctx| {
            let started = Arc::clone(&leaf_started_tx);
            let release = Arc::clone(&leaf_release);
            async move {
                let leaf = TaskFn::new(move |_ctx| {
                    let started = Arc::clone(&started);
                    let release = Arc::clone(&release);
                    async move {
                        if let Some(tx) = lock(&started).take() {
                            let _ = tx.send(());
                        }
                        release.notified().await;
                        Vec::new()
                    }
                });
                vec![leaf]
            }
        });

        let run = tokio::spawn(h.job(None, TypeGate::Held(permit)).run(root));
        leaf_started_rx.await.unwrap();

        // The leaf is still executing, yet the job-type slot is free again.
        for _ in 0..100 {
            if type_sem.available_permits() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(type_sem.available_permits(), 1);
        assert!(!run.is_finished());

        release_leaf.notify_one();
        run.await.unwrap();
        assert_eq!(type_sem.available_permits(), 1);
    }

    #[tokio::test]
    async fn type_slot_held_until_completion_without_fanout() {
        let h = Harness::new();
        let type_sem = Arc::new(Semaphore::new(1));
        let observed = Arc::new(AtomicUsize::new(usize::MAX));

        let sem = Arc::clone(&type_sem);
        let seen = Arc::clone(&observed);
        let root = TaskFn::new(move |_ctx| {
            let sem = Arc::clone(&sem);
            let seen = Arc::clone(&seen);
            async move {
                seen.store(sem.available_permits(), Ordering::SeqCst);
                Vec::new()
            }
        });

        let permit = Arc::clone(&type_sem).try_acquire_owned().unwrap();
        h.job(None, TypeGate::Held(permit)).run(root).await;
        assert_eq!(observed.load(Ordering::SeqCst), 0);
        assert_eq!(type_sem.available_permits(), 1);
    }

    #[tokio::test]
    async fn cancelled_run_executes_nothing_and_returns_type_slot() {
        let h = Harness::new();
        let type_sem = Arc::new(Semaphore::new(1));
        let permit = Arc::clone(&type_sem).try_acquire_owned().unwrap();
        let executed = Arc::new(AtomicUsize::new(0));

        let count = Arc::clone(&executed);
        let root = TaskFn::new(move |_ctx| {
            let count = Arc::clone(&count);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Vec::new()
            }
        });

        h.cancel.cancel();
        h.job(None, TypeGate::Held(permit)).run(root).await;
        assert_eq!(executed.load(Ordering::SeqCst), 0);
        assert_eq!(type_sem.available_permits(), 1);
    }

    #[tokio::test]
    async fn continuations_observe_parent_cancellation() {
        let h = Harness::new();
        let observed = Arc::new(AtomicUsize::new(0));
        let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel::<()>();

        let seen = Arc::clone(&observed);
        let root = TaskFn::new(move |_ctx| {
            let seen = Arc::clone(&seen);
            let started_tx = started_tx.clone();
            async move {
                (0..3)
                    .map(|_| {
                        let seen = Arc::clone(&seen);
                        let started_tx = started_tx.clone();
                        TaskFn::new(move |ctx: TaskContext| {
                            let seen = Arc::clone(&seen);
                            let started_tx = started_tx.clone();
                            async move {
                                let _ = started_tx.send(());
                                tokio::select! {
                                    _ = ctx.cancelled() => {
                                        seen.fetch_add(1, Ordering::SeqCst);
                                    }
                                    _ = tokio::time::sleep(Duration::from_secs(10)) => {}
                                }
                                Vec::new()
                            }
                        })
                    })
                    .collect()
            }
        });

        let run = tokio::spawn(h.job(None, TypeGate::Open).run(root));
        for _ in 0..3 {
            started_rx.recv().await.unwrap();
        }
        h.cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .expect("run did not return after cancellation")
            .unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 3);
    }
}
