//! Ingestion session: one object owning every engine component.
//!
//! An [`IngestSession`] wires the crawler, accumulator, scheduler and reply
//! queue to a shared store, event bus and cancel signal. Everything that
//! would otherwise be process-global state lives here, so several sessions
//! can run side by side.
//!
//! # Example
//!
//! ```ignore
//! use threadkeep::{IngestSession, MemoryStore};
//!
//! let session = IngestSession::builder()
//!     .store(Arc::new(MemoryStore::new()))
//!     .source(source)
//!     .build()?;
//!
//! session.subscribe_all(|event| {
//!     println!("{} {}", event.event_type, event.partition_id);
//!     Ok(())
//! });
//! let report = session.ingest("v1", bootstrap_token).await?;
//! ```

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::accumulator::WriteBatchAccumulator;
use crate::cancel::CancelSignal;
use crate::crawler::{ContinuationCrawler, CrawlConfig, CrawlOutcome, CrawlProgress, CrawlStatus};
use crate::error::{ErrorKind, IngestError};
use crate::events::{ChangeEvent, ChangeEventBus, ChangeEventType, EventStats, HandlerError, Unsubscribe};
use crate::record::ReplyTask;
use crate::replies::{BatchSummary, ReplyCallbacks, ReplyProgress, ReplyQueueConfig, ReplyWorkQueue, TaskId};
use crate::retry::{RetryPolicy, RetryingSource};
use crate::scheduler::PriorityReplyScheduler;
use crate::source::RemoteCommentSource;
use crate::store::DedupUpsertStore;
use crate::token::TokenExtractor;
use crate::transform::{JsonTransform, Transform};

/// Error type for session construction.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Missing required field in builder.
    #[error("Missing required field: {field}")]
    MissingField { field: &'static str },
}

/// Builder for [`IngestSession`].
///
/// `store` and `source` are required. Everything else has a default.
#[derive(Default)]
pub struct IngestSessionBuilder {
    store: Option<Arc<dyn DedupUpsertStore>>,
    source: Option<Arc<dyn RemoteCommentSource>>,
    transform: Option<Arc<dyn Transform>>,
    bus: Option<ChangeEventBus>,
    cancel: Option<CancelSignal>,
    crawl: CrawlConfig,
    crawl_retry: RetryPolicy,
    replies: ReplyQueueConfig,
    token_extractor: Option<TokenExtractor>,
}

impl IngestSessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the durable store.
    pub fn store(mut self, store: Arc<dyn DedupUpsertStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the remote comment source.
    pub fn source(mut self, source: Arc<dyn RemoteCommentSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the page transform. Defaults to [`JsonTransform`].
    pub fn transform(mut self, transform: Arc<dyn Transform>) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Use an existing event bus instead of a fresh one.
    pub fn bus(mut self, bus: ChangeEventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Use an existing cancel signal, e.g. one wired to Ctrl+C.
    pub fn cancel_signal(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn crawl_config(mut self, config: CrawlConfig) -> Self {
        self.crawl = config;
        self
    }

    /// Backoff for transient failures during the main crawl.
    pub fn crawl_retry(mut self, policy: RetryPolicy) -> Self {
        self.crawl_retry = policy;
        self
    }

    pub fn reply_config(mut self, config: ReplyQueueConfig) -> Self {
        self.replies = config;
        self
    }

    /// Token extraction for both the crawl and reply threads.
    pub fn token_extractor(mut self, extractor: TokenExtractor) -> Self {
        self.token_extractor = Some(extractor);
        self
    }

    /// Build the session.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::MissingField` if `store` or `source` is not set.
    pub fn build(self) -> Result<IngestSession, SessionError> {
        let store = self
            .store
            .ok_or(SessionError::MissingField { field: "store" })?;
        let source = self
            .source
            .ok_or(SessionError::MissingField { field: "source" })?;
        let transform = self.transform.unwrap_or_else(|| Arc::new(JsonTransform));
        let bus = self.bus.unwrap_or_default();
        let cancel = self.cancel.unwrap_or_default();

        let mut replies = self.replies;
        let mut crawler_extractor = TokenExtractor::default();
        if let Some(extractor) = self.token_extractor {
            replies = replies.with_token_extractor(extractor.clone());
            crawler_extractor = extractor;
        }

        let accumulator = Arc::new(WriteBatchAccumulator::new(store.clone(), bus.clone()));
        let crawl_source: Arc<dyn RemoteCommentSource> =
            Arc::new(RetryingSource::new(source.clone(), self.crawl_retry));
        let crawler = ContinuationCrawler::new(
            crawl_source,
            transform.clone(),
            accumulator.clone(),
            cancel.clone(),
        )
        .with_config(self.crawl)
        .with_token_extractor(crawler_extractor);

        let queue = ReplyWorkQueue::new(
            source,
            transform,
            store.clone(),
            bus.clone(),
            cancel.clone(),
            replies,
        );

        Ok(IngestSession {
            scheduler: PriorityReplyScheduler::new(store.clone()),
            store,
            bus,
            accumulator,
            crawler: Arc::new(crawler),
            queue,
            cancel,
        })
    }
}

/// Outcome of [`IngestSession::ingest`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub crawl: CrawlOutcome,
    /// `None` when the crawl was cancelled before replies were scheduled.
    pub replies: Option<BatchSummary>,
    /// Rows stored for the partition after ingestion.
    pub stored: u64,
}

/// One ingestion session.
pub struct IngestSession {
    store: Arc<dyn DedupUpsertStore>,
    bus: ChangeEventBus,
    accumulator: Arc<WriteBatchAccumulator>,
    crawler: Arc<ContinuationCrawler>,
    scheduler: PriorityReplyScheduler,
    queue: ReplyWorkQueue,
    cancel: CancelSignal,
}

impl std::fmt::Debug for IngestSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestSession")
            .field("crawl", &self.crawler.progress())
            .field("replies", &self.queue.progress())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl IngestSession {
    pub fn builder() -> IngestSessionBuilder {
        IngestSessionBuilder::new()
    }

    pub fn bus(&self) -> &ChangeEventBus {
        &self.bus
    }

    pub fn store(&self) -> &Arc<dyn DedupUpsertStore> {
        &self.store
    }

    pub fn accumulator(&self) -> &WriteBatchAccumulator {
        &self.accumulator
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    // ─── Events ─────────────────────────────────────────────────────────────

    pub fn subscribe<F>(&self, event_type: ChangeEventType, handler: F) -> Unsubscribe
    where
        F: Fn(&ChangeEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.bus.on(event_type, handler)
    }

    pub fn subscribe_all<F>(&self, handler: F) -> Unsubscribe
    where
        F: Fn(&ChangeEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.bus.on_all(handler)
    }

    pub fn once<F>(&self, event_type: ChangeEventType, handler: F) -> Unsubscribe
    where
        F: Fn(&ChangeEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.bus.once(event_type, handler)
    }

    pub fn stats(&self) -> EventStats {
        self.bus.stats()
    }

    pub fn reset_stats(&self) {
        self.bus.reset_stats();
    }

    // ─── Crawl ──────────────────────────────────────────────────────────────

    /// Crawl a partition's main thread to the end.
    ///
    /// Fetch failures are also published as `error-occurred` events.
    pub async fn crawl(&self, partition_id: &str, initial_token: &str) -> Result<CrawlOutcome, IngestError> {
        run_crawl(&self.crawler, &self.bus, partition_id, initial_token).await
    }

    /// Run [`IngestSession::crawl`] on a background task.
    pub fn start_crawl(
        &self,
        partition_id: impl Into<String>,
        initial_token: impl Into<String>,
    ) -> JoinHandle<Result<CrawlOutcome, IngestError>> {
        let crawler = Arc::clone(&self.crawler);
        let bus = self.bus.clone();
        let partition_id = partition_id.into();
        let initial_token = initial_token.into();
        tokio::spawn(async move { run_crawl(&crawler, &bus, &partition_id, &initial_token).await })
    }

    pub fn crawl_progress(&self) -> CrawlProgress {
        self.crawler.progress()
    }

    // ─── Replies ────────────────────────────────────────────────────────────

    /// Reply tasks for a partition, largest threads first.
    pub async fn schedule_replies(&self, partition_id: &str) -> Result<Vec<ReplyTask>, IngestError> {
        Ok(self.scheduler.schedule(partition_id).await?)
    }

    pub fn queue_replies(&self, tasks: Vec<ReplyTask>, callbacks: ReplyCallbacks) -> Vec<TaskId> {
        self.queue.queue_reply_fetches(tasks, callbacks)
    }

    pub fn reply_progress(&self) -> ReplyProgress {
        self.queue.progress()
    }

    /// Wait until every queued reply task has settled.
    pub async fn wait_for_replies(&self) {
        self.queue.wait_idle().await;
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────────

    /// Crawl the main thread, then fetch every reply thread it revealed.
    pub async fn ingest(&self, partition_id: &str, initial_token: &str) -> Result<IngestReport, IngestError> {
        let crawl = self.crawl(partition_id, initial_token).await?;

        let replies = if crawl.status == CrawlStatus::Cancelled || self.cancel.is_cancelled() {
            None
        } else {
            let tasks = self.schedule_replies(partition_id).await?;
            let (tx, rx) = oneshot::channel();
            self.queue_replies(
                tasks,
                ReplyCallbacks::new().on_all_complete(move |summary| {
                    let _ = tx.send(summary.clone());
                }),
            );
            rx.await.ok()
        };

        let stored = self.store.count_by_partition(partition_id).await?;
        tracing::info!(
            partition_id,
            status = ?crawl.status,
            pages = crawl.pages,
            stored,
            "Ingestion finished"
        );

        Ok(IngestReport {
            crawl,
            replies,
            stored,
        })
    }

    /// Cancel the crawl and all reply work of this session.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Flush and drop every partition buffer. Returns the records flushed.
    pub async fn teardown(&self) -> Result<u64, IngestError> {
        let flushed = self.accumulator.clear_all(true).await?;
        tracing::debug!(flushed, "Session torn down");
        Ok(flushed)
    }
}

async fn run_crawl(
    crawler: &ContinuationCrawler,
    bus: &ChangeEventBus,
    partition_id: &str,
    initial_token: &str,
) -> Result<CrawlOutcome, IngestError> {
    let result = crawler.crawl(partition_id, initial_token).await;
    // Flush failures were already published by the accumulator.
    if let Err(e) = &result
        && e.kind() != ErrorKind::Storage
    {
        bus.emit_error(
            partition_id,
            e.report(),
            Some(serde_json::json!({ "phase": "crawl" })),
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::replies::TaskStatus;
    use crate::source::{FetchError, FetchOptions, RawPage};
    use crate::store::MemoryStore;

    #[derive(Default)]
    struct MapSource {
        pages: HashMap<String, Result<RawPage, FetchError>>,
        fetches: AtomicUsize,
    }

    impl MapSource {
        fn page(mut self, token: &str, items: Vec<serde_json::Value>, next: Option<&str>) -> Self {
            self.pages
                .insert(token.to_string(), Ok(RawPage::new(items, next.map(str::to_string))));
            self
        }
    }

    #[async_trait]
    impl RemoteCommentSource for MapSource {
        async fn fetch_page(&self, token: &str, _options: &FetchOptions) -> Result<RawPage, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.pages
                .get(token)
                .cloned()
                .unwrap_or_else(|| Err(FetchError::permanent(format!("unknown token {token}"))))
        }
    }

    fn session(source: MapSource) -> (IngestSession, Arc<MemoryStore>, Arc<MapSource>) {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(source);
        let session = IngestSession::builder()
            .store(store.clone())
            .source(source.clone())
            .build()
            .unwrap();
        (session, store, source)
    }

    #[test]
    fn builder_requires_store_and_source() {
        let err = IngestSession::builder().build().unwrap_err();
        assert!(matches!(err, SessionError::MissingField { field: "store" }));

        let err = IngestSession::builder()
            .store(Arc::new(MemoryStore::new()))
            .build()
            .unwrap_err();
        assert!(matches!(err, SessionError::MissingField { field: "source" }));
    }

    #[tokio::test(start_paused = true)]
    async fn ingest_crawls_then_fetches_replies_by_priority() {
        let source = MapSource::default()
            .page(
                "A",
                vec![
                    json!({ "id": "c1", "replyCount": 2, "replyToken": "R1" }),
                    json!({ "id": "c2", "replyCount": 5, "replyToken": "R2" }),
                    json!({ "id": "c3" }),
                ],
                None,
            )
            .page("R1", vec![json!({ "id": "r1a" }), json!({ "id": "r1b" })], None)
            .page("R2", vec![json!({ "id": "r2a" })], None);
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(source);
        let session = IngestSession::builder()
            .store(store.clone())
            .source(source.clone())
            .reply_config(ReplyQueueConfig::default().with_concurrency(1))
            .build()
            .unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let sink = order.clone();
        session.subscribe(ChangeEventType::RepliesAdded, move |event| {
            let parent = event
                .metadata
                .as_ref()
                .and_then(|m| m.get("parentId"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            sink.lock().unwrap().push(parent);
            Ok(())
        });

        let report = session.ingest("v1", "A").await.unwrap();

        assert_eq!(report.crawl.status, CrawlStatus::Completed);
        let replies = report.replies.unwrap();
        assert_eq!(replies.completed, 2);
        assert_eq!(replies.replies_fetched, 3);
        assert_eq!(report.stored, 6);
        assert_eq!(store.len(), 6);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 3);
        assert_eq!(*order.lock().unwrap(), vec!["c2".to_string(), "c1".to_string()]);
        assert_eq!(session.stats().count_of(ChangeEventType::BulkAdded), 1);
    }

    #[tokio::test]
    async fn crawl_failure_is_published_as_error_event() {
        let source = MapSource::default().page("A", vec![json!({ "id": "c1" })], Some("B"));
        let (session, store, _) = session(source);

        let err = session.crawl("v1", "A").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::PermanentFetch);
        assert_eq!(session.stats().count_of(ChangeEventType::ErrorOccurred), 1);
        assert!(store.get("v1", "c1").is_some());
    }

    #[tokio::test]
    async fn cancelled_session_skips_replies() {
        let source = MapSource::default().page(
            "A",
            vec![json!({ "id": "c1", "replyCount": 3, "replyToken": "R1" })],
            None,
        );
        let (session, _, source) = session(source);
        session.cancel();

        let report = session.ingest("v1", "A").await.unwrap();

        assert_eq!(report.crawl.status, CrawlStatus::Cancelled);
        assert!(report.replies.is_none());
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn start_crawl_runs_in_background() {
        let source = MapSource::default()
            .page("A", vec![json!({ "id": "c1" })], Some("B"))
            .page("B", vec![json!({ "id": "c2" })], None);
        let (session, store, _) = session(source);

        let outcome = session.start_crawl("v1", "A").await.unwrap().unwrap();

        assert_eq!(outcome.pages, 2);
        assert_eq!(store.len(), 2);
        let progress = session.crawl_progress();
        assert!(!progress.running);
        assert_eq!(progress.status, Some(CrawlStatus::Completed));
    }

    #[tokio::test]
    async fn queue_replies_reports_through_callbacks() {
        let source = MapSource::default().page("R1", vec![json!({ "id": "r1" })], None);
        let (session, _, _) = session(source);

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = statuses.clone();
        let ids = session.queue_replies(
            vec![ReplyTask::new("v1", "c1", Some("R1".into()))],
            ReplyCallbacks::new().on_task_settled(move |r| sink.lock().unwrap().push(r.status)),
        );
        session.wait_for_replies().await;

        assert_eq!(ids.len(), 1);
        assert_eq!(*statuses.lock().unwrap(), vec![TaskStatus::Completed]);
        assert_eq!(session.reply_progress().replies_fetched, 1);
    }

    #[tokio::test]
    async fn teardown_flushes_buffered_records() {
        let (session, store, _) = session(MapSource::default());
        let record = |id: &str| crate::record::Record::top_level("v1", id);
        let opts = crate::accumulator::AccumulatorOptions::default();

        session.accumulator().accumulate("v1", vec![record("a")], opts).await.unwrap();
        session.accumulator().accumulate("v1", vec![record("b")], opts).await.unwrap();
        assert_eq!(store.len(), 1);

        assert_eq!(session.teardown().await.unwrap(), 1);
        assert_eq!(store.len(), 2);
        assert!(session.accumulator().partitions().is_empty());
    }
}
