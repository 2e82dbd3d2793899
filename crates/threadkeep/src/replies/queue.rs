use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::cancel::CancelSignal;
use crate::error::{ErrorKind, ErrorReport, IngestError};
use crate::events::ChangeEventBus;
use crate::record::ReplyTask;
use crate::scheduler::Pacer;
use crate::source::RemoteCommentSource;
use crate::store::DedupUpsertStore;
use crate::transform::Transform;

use super::config::ReplyQueueConfig;
use super::limiter::AdaptiveLimiter;
use super::task::run_task;

/// Identifier assigned to every queued task.
pub type TaskId = u64;

/// Terminal state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Completed,
    Failed,
    Cancelled,
}

/// What happened to one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub task_id: TaskId,
    pub partition_id: String,
    pub parent_item_id: String,
    pub status: TaskStatus,
    pub replies_fetched: u64,
    pub pages: usize,
    /// Transient-failure retries used. Rate limits are not counted here.
    pub retries: u32,
    pub rate_limit_hits: u32,
    pub error: Option<ErrorReport>,
}

impl TaskReport {
    pub(crate) fn new(task_id: TaskId, task: &ReplyTask) -> Self {
        Self {
            task_id,
            partition_id: task.partition_id.clone(),
            parent_item_id: task.parent_item_id.clone(),
            status: TaskStatus::Completed,
            replies_fetched: 0,
            pages: 0,
            retries: 0,
            rate_limit_hits: 0,
            error: None,
        }
    }

    pub(crate) fn fail(mut self, err: IngestError) -> Self {
        self.status = TaskStatus::Failed;
        self.error = Some(err.report());
        self
    }

    pub(crate) fn cancelled(mut self) -> Self {
        self.status = TaskStatus::Cancelled;
        self
    }
}

/// Live queue progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyProgress {
    pub completed: usize,
    pub total: usize,
    pub replies_fetched: u64,
    pub failed: usize,
    pub cancelled: usize,
    pub active: usize,
    pub queued: usize,
    pub concurrency_limit: usize,
    pub cooling_down: bool,
}

impl ReplyProgress {
    /// Tasks that reached a terminal state.
    pub fn settled(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }
}

/// Aggregate totals for one `queue_reply_fetches` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub batch_id: u64,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub replies_fetched: u64,
    pub failures: Vec<TaskReport>,
}

/// Passed to the rate limit callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitNotice {
    pub task_id: TaskId,
    pub partition_id: String,
    pub parent_item_id: String,
    pub cooldown: Duration,
    /// Rate limit hits of this task so far.
    pub hits: u32,
    /// Concurrency limit in effect during the cooldown.
    pub concurrency_limit: usize,
}

pub type AllCompleteCallback = Box<dyn FnOnce(&BatchSummary) + Send>;
pub type RateLimitCallback = Arc<dyn Fn(&RateLimitNotice) + Send + Sync>;
pub type TaskSettledCallback = Arc<dyn Fn(&TaskReport) + Send + Sync>;

/// Per-batch callbacks.
#[derive(Default)]
pub struct ReplyCallbacks {
    on_all_complete: Option<AllCompleteCallback>,
    on_rate_limited: Option<RateLimitCallback>,
    on_task_settled: Option<TaskSettledCallback>,
}

impl ReplyCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once, when every task of the batch has settled.
    #[must_use]
    pub fn on_all_complete(mut self, f: impl FnOnce(&BatchSummary) + Send + 'static) -> Self {
        self.on_all_complete = Some(Box::new(f));
        self
    }

    /// Called whenever a task of the batch is rate limited.
    #[must_use]
    pub fn on_rate_limited(mut self, f: impl Fn(&RateLimitNotice) + Send + Sync + 'static) -> Self {
        self.on_rate_limited = Some(Arc::new(f));
        self
    }

    /// Called as each task of the batch settles.
    #[must_use]
    pub fn on_task_settled(mut self, f: impl Fn(&TaskReport) + Send + Sync + 'static) -> Self {
        self.on_task_settled = Some(Arc::new(f));
        self
    }
}

pub(super) struct BatchState {
    remaining: AtomicUsize,
    summary: Mutex<BatchSummary>,
    on_all_complete: Mutex<Option<AllCompleteCallback>>,
    pub(super) on_rate_limited: Option<RateLimitCallback>,
    on_task_settled: Option<TaskSettledCallback>,
}

pub(super) struct Job {
    id: TaskId,
    task: ReplyTask,
    batch: Arc<BatchState>,
}

/// State shared by the dispatcher and every running task.
pub(super) struct QueueShared {
    pub(super) source: Arc<dyn RemoteCommentSource>,
    pub(super) transform: Arc<dyn Transform>,
    pub(super) store: Arc<dyn DedupUpsertStore>,
    pub(super) bus: ChangeEventBus,
    pub(super) config: ReplyQueueConfig,
    pub(super) limiter: Arc<AdaptiveLimiter>,
    pub(super) pacer: Option<Pacer>,
    pub(super) cancel: CancelSignal,
    progress: Mutex<ReplyProgress>,
    pending: watch::Sender<usize>,
}

impl QueueShared {
    pub(super) fn add_replies(&self, n: u64) {
        self.progress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replies_fetched += n;
    }

    fn set_running(&self, active: usize, queued: usize) {
        let mut progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        progress.active = active;
        progress.queued = queued;
    }

    fn settle(&self, job: Job, report: TaskReport) {
        {
            let mut progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
            match report.status {
                TaskStatus::Completed => progress.completed += 1,
                TaskStatus::Failed => progress.failed += 1,
                TaskStatus::Cancelled => progress.cancelled += 1,
            }
        }

        match report.status {
            TaskStatus::Completed => tracing::debug!(
                task_id = job.id,
                parent = %job.task.parent_item_id,
                replies = report.replies_fetched,
                pages = report.pages,
                "Reply task completed"
            ),
            TaskStatus::Cancelled => {
                tracing::debug!(task_id = job.id, "Reply task cancelled")
            }
            TaskStatus::Failed => {
                if let Some(error) = &report.error {
                    tracing::error!(
                        task_id = job.id,
                        parent = %job.task.parent_item_id,
                        kind = %error.kind,
                        error = %error.message,
                        "Reply task failed"
                    );
                    self.bus.emit_error(
                        &job.task.partition_id,
                        error.clone(),
                        Some(serde_json::json!({
                            "parentId": job.task.parent_item_id,
                            "taskId": job.id,
                        })),
                    );
                }
            }
        }

        let batch = &job.batch;
        if let Some(cb) = &batch.on_task_settled {
            cb(&report);
        }

        let finished = {
            let mut summary = batch.summary.lock().unwrap_or_else(|e| e.into_inner());
            summary.replies_fetched += report.replies_fetched;
            match report.status {
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed => {
                    summary.failed += 1;
                    summary.failures.push(report);
                }
                TaskStatus::Cancelled => summary.cancelled += 1,
            }
            (batch.remaining.fetch_sub(1, Ordering::AcqRel) == 1).then(|| summary.clone())
        };

        if let Some(summary) = finished {
            tracing::info!(
                batch_id = summary.batch_id,
                completed = summary.completed,
                failed = summary.failed,
                cancelled = summary.cancelled,
                replies = summary.replies_fetched,
                "Reply batch settled"
            );
            let callback = batch
                .on_all_complete
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(cb) = callback {
                cb(&summary);
            }
        }

        self.pending.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Bounded-concurrency pool fetching reply threads.
///
/// Tasks are dispatched in the order they were queued. Each task walks its
/// reply thread page by page and writes every page through the store as it
/// arrives. Transient failures retry with exponential backoff. A rate limit
/// halves the queue's concurrency for one cooldown; the task that hit it
/// waits out the cooldown and retries without spending a retry attempt.
/// A failing task never blocks or cancels its siblings.
pub struct ReplyWorkQueue {
    shared: Arc<QueueShared>,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    next_task_id: AtomicU64,
    next_batch_id: AtomicU64,
}

impl std::fmt::Debug for ReplyWorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyWorkQueue")
            .field("config", &self.shared.config)
            .field("progress", &self.progress())
            .finish_non_exhaustive()
    }
}

impl ReplyWorkQueue {
    pub fn new(
        source: Arc<dyn RemoteCommentSource>,
        transform: Arc<dyn Transform>,
        store: Arc<dyn DedupUpsertStore>,
        bus: ChangeEventBus,
        cancel: CancelSignal,
        config: ReplyQueueConfig,
    ) -> Self {
        let (pending, _) = watch::channel(0usize);
        let shared = QueueShared {
            source,
            transform,
            store,
            bus,
            limiter: Arc::new(AdaptiveLimiter::new(config.concurrency)),
            pacer: config.pacing.map(Pacer::new),
            config,
            cancel,
            progress: Mutex::new(ReplyProgress::default()),
            pending,
        };
        Self {
            shared: Arc::new(shared),
            sender: Mutex::new(None),
            next_task_id: AtomicU64::new(1),
            next_batch_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &ReplyQueueConfig {
        &self.shared.config
    }

    /// The dispatcher's inbox, starting the dispatcher on first use.
    fn sender(&self) -> mpsc::UnboundedSender<Job> {
        let mut sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        match sender.as_ref() {
            Some(tx) if !tx.is_closed() => tx.clone(),
            _ => {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(dispatch_loop(Arc::clone(&self.shared), rx));
                *sender = Some(tx.clone());
                tx
            }
        }
    }

    /// Queue reply fetches. Returns one id per task, in input order.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn queue_reply_fetches(
        &self,
        tasks: Vec<ReplyTask>,
        callbacks: ReplyCallbacks,
    ) -> Vec<TaskId> {
        let batch_id = self.next_batch_id.fetch_add(1, Ordering::Relaxed);
        let total = tasks.len();

        if tasks.is_empty() {
            if let Some(cb) = callbacks.on_all_complete {
                cb(&BatchSummary {
                    batch_id,
                    ..BatchSummary::default()
                });
            }
            return Vec::new();
        }

        let batch = Arc::new(BatchState {
            remaining: AtomicUsize::new(total),
            summary: Mutex::new(BatchSummary {
                batch_id,
                total,
                ..BatchSummary::default()
            }),
            on_all_complete: Mutex::new(callbacks.on_all_complete),
            on_rate_limited: callbacks.on_rate_limited,
            on_task_settled: callbacks.on_task_settled,
        });

        {
            let mut progress = self
                .shared
                .progress
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            progress.total += total;
            progress.queued += total;
        }
        self.shared.pending.send_modify(|n| *n += total);

        let sender = self.sender();
        let ids = tasks
            .into_iter()
            .map(|task| {
                let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
                let job = Job {
                    id,
                    task,
                    batch: Arc::clone(&batch),
                };
                if let Err(mpsc::error::SendError(job)) = sender.send(job) {
                    let report = TaskReport::new(job.id, &job.task).cancelled();
                    self.shared.settle(job, report);
                }
                id
            })
            .collect();

        tracing::info!(batch_id, tasks = total, "Queued reply fetches");
        ids
    }

    /// Copy of the live progress.
    pub fn progress(&self) -> ReplyProgress {
        let mut progress = self
            .shared
            .progress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let limit = self.shared.limiter.current();
        progress.concurrency_limit = limit.limit;
        progress.cooling_down = limit.cooling_down;
        progress
    }

    /// Resolves once every queued task has settled.
    pub async fn wait_idle(&self) {
        let mut pending = self.shared.pending.subscribe();
        // The sender lives in `self.shared`, so the channel cannot close here.
        let _ = pending.wait_for(|n| *n == 0).await;
    }

    /// Stop queued and in-flight work. Shares the session's cancel signal.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }
}

/// Admit queued jobs up to the current limit and settle finished ones.
async fn dispatch_loop(shared: Arc<QueueShared>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    let mut queued: VecDeque<Job> = VecDeque::new();
    let mut workers: JoinSet<(Job, TaskReport)> = JoinSet::new();
    let mut limits = shared.limiter.subscribe();
    let mut open = true;

    loop {
        if shared.cancel.is_cancelled() {
            while let Some(job) = queued.pop_front() {
                let report = TaskReport::new(job.id, &job.task).cancelled();
                shared.settle(job, report);
            }
        }

        let limit = shared.limiter.limit();
        while workers.len() < limit
            && let Some(job) = queued.pop_front()
        {
            workers.spawn(run_worker(Arc::clone(&shared), job));
        }
        shared.set_running(workers.len(), queued.len());

        if !open && queued.is_empty() && workers.is_empty() {
            break;
        }

        tokio::select! {
            Some(joined) = workers.join_next(), if !workers.is_empty() => match joined {
                Ok((job, report)) => shared.settle(job, report),
                Err(e) => tracing::error!(error = %e, "Reply worker did not finish"),
            },
            job = jobs.recv(), if open => match job {
                Some(job) => queued.push_back(job),
                None => open = false,
            },
            _ = limits.changed() => {}
            _ = shared.cancel.cancelled(), if !queued.is_empty() => {}
        }
    }

    tracing::debug!("Reply dispatcher stopped");
}

/// Run one task in its own Tokio task so a panic settles it as failed.
async fn run_worker(shared: Arc<QueueShared>, job: Job) -> (Job, TaskReport) {
    let handle = tokio::spawn(run_task(
        Arc::clone(&shared),
        job.id,
        job.task.clone(),
        Arc::clone(&job.batch),
    ));
    let report = match handle.await {
        Ok(report) => report,
        Err(e) => {
            let mut report = TaskReport::new(job.id, &job.task);
            report.status = TaskStatus::Failed;
            report.error = Some(ErrorReport::new(
                ErrorKind::PermanentFetch,
                format!("reply task aborted: {e}"),
            ));
            report
        }
    };
    (job, report)
}
