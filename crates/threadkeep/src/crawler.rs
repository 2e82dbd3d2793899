//! Main-thread crawl driven by continuation tokens.
//!
//! The crawler walks one partition page by page: fetch with the current
//! token, normalize, hand the records to the accumulator, extract the next
//! token. Page N+1 is never requested before page N's token is known.
//!
//! The walk stops when:
//! - the next token is empty or missing ([`CrawlStatus::Completed`])
//! - a token repeats ([`CrawlStatus::CycleDetected`])
//! - the session is cancelled ([`CrawlStatus::Cancelled`])
//! - the configured page limit is reached ([`CrawlStatus::PageLimit`])
//!
//! Whatever is still buffered is flushed before returning, including after
//! cancellation. A fetch or storage failure stops the crawl and is returned
//! to the caller; pages already flushed stay visible.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;

use crate::accumulator::{AccumulatorOptions, DEFAULT_BATCH_SIZE, WriteBatchAccumulator};
use crate::cancel::CancelSignal;
use crate::error::{ErrorKind, IngestError, Result};
use crate::source::{FetchError, FetchOptions, RawPage, RemoteCommentSource};
use crate::token::{TokenExtractor, TokenStrategy};
use crate::transform::{Transform, TransformContext};

/// Crawl tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrawlConfig {
    /// Records per accumulator flush.
    pub batch_size: usize,
    /// Stop after this many pages.
    pub max_pages: Option<usize>,
    /// The partition is known to be empty before the crawl starts.
    pub is_fresh: bool,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_pages: None,
            is_fresh: false,
        }
    }
}

impl CrawlConfig {
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    #[must_use]
    pub fn with_max_pages(mut self, max_pages: Option<usize>) -> Self {
        self.max_pages = max_pages;
        self
    }

    #[must_use]
    pub fn fresh(mut self, is_fresh: bool) -> Self {
        self.is_fresh = is_fresh;
        self
    }

    fn accumulator_options(&self) -> AccumulatorOptions {
        AccumulatorOptions::default()
            .with_batch_size(self.batch_size)
            .fresh(self.is_fresh)
    }
}

/// How a crawl ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CrawlStatus {
    Completed,
    CycleDetected,
    Cancelled,
    PageLimit,
}

/// Result of a crawl that did not fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlOutcome {
    pub partition_id: String,
    pub status: CrawlStatus,
    pub pages: usize,
    pub items: usize,
}

/// Live crawl progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlProgress {
    pub partition_id: Option<String>,
    pub running: bool,
    pub pages_fetched: usize,
    pub items_fetched: usize,
    pub current_token: Option<String>,
    pub status: Option<CrawlStatus>,
}

/// Walks a partition's main comment feed.
pub struct ContinuationCrawler {
    source: Arc<dyn RemoteCommentSource>,
    transform: Arc<dyn Transform>,
    accumulator: Arc<WriteBatchAccumulator>,
    extractor: TokenExtractor,
    config: CrawlConfig,
    cancel: CancelSignal,
    progress: Arc<Mutex<CrawlProgress>>,
}

impl ContinuationCrawler {
    pub fn new(
        source: Arc<dyn RemoteCommentSource>,
        transform: Arc<dyn Transform>,
        accumulator: Arc<WriteBatchAccumulator>,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            source,
            transform,
            accumulator,
            extractor: TokenExtractor::default(),
            config: CrawlConfig::default(),
            cancel,
            progress: Arc::new(Mutex::new(CrawlProgress::default())),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: CrawlConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_token_extractor(mut self, extractor: TokenExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn config(&self) -> &CrawlConfig {
        &self.config
    }

    /// Copy of the live progress.
    pub fn progress(&self) -> CrawlProgress {
        self.progress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn update_progress(&self, f: impl FnOnce(&mut CrawlProgress)) {
        let mut progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut progress);
    }

    async fn fetch(&self, token: &str) -> std::result::Result<RawPage, FetchError> {
        let options = FetchOptions::main_thread(self.cancel.clone());
        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => Err(FetchError::Cancelled),
            page = self.source.fetch_page(token, &options) => page,
        }
    }

    /// Stop on a failure: flush what is buffered, then return the error.
    ///
    /// A storage failure already restored the buffer and reported itself,
    /// so it is left for the next flush or teardown.
    async fn abort(&self, partition_id: &str, err: IngestError) -> IngestError {
        if err.kind() != ErrorKind::Storage
            && let Err(flush_err) = self.accumulator.flush(partition_id).await
        {
            tracing::warn!(partition_id, error = %flush_err, "Failed to flush after crawl error");
        }
        self.update_progress(|p| p.running = false);
        tracing::error!(partition_id, error = %err, kind = %err.kind(), "Crawl failed");
        err
    }

    /// Crawl a partition starting from `initial_token`.
    ///
    /// An empty initial token completes immediately without fetching.
    #[tracing::instrument(skip_all, fields(partition_id = %partition_id))]
    pub async fn crawl(&self, partition_id: &str, initial_token: &str) -> Result<CrawlOutcome> {
        if partition_id.is_empty() {
            return Err(IngestError::invalid_input("partition id must not be empty"));
        }

        self.update_progress(|p| {
            *p = CrawlProgress {
                partition_id: Some(partition_id.to_string()),
                running: true,
                ..CrawlProgress::default()
            }
        });

        let crawl_start = Instant::now();
        let options = self.config.accumulator_options();
        let context = TransformContext::main_thread(partition_id);
        let mut seen: HashSet<String> = HashSet::new();
        let mut token = Some(initial_token.to_string()).filter(|t| !t.is_empty());
        let mut pages = 0usize;
        let mut items = 0usize;

        let status = loop {
            let Some(current) = token.take() else {
                break CrawlStatus::Completed;
            };
            if self.cancel.is_cancelled() {
                break CrawlStatus::Cancelled;
            }
            if !seen.insert(current.clone()) {
                tracing::warn!(partition_id, pages, "Continuation token repeated, stopping crawl");
                break CrawlStatus::CycleDetected;
            }
            if self.config.max_pages.is_some_and(|max| pages >= max) {
                break CrawlStatus::PageLimit;
            }

            self.update_progress(|p| p.current_token = Some(current.clone()));
            let page = match self.fetch(&current).await {
                Ok(page) => page,
                Err(FetchError::Cancelled) => break CrawlStatus::Cancelled,
                Err(e) => return Err(self.abort(partition_id, e.into()).await),
            };
            pages += 1;

            let records = match self.transform.normalize(&context, &page) {
                Ok(records) => records,
                Err(e) => return Err(self.abort(partition_id, e.into()).await),
            };
            let page_items = records.len();
            items += page_items;

            if let Err(e) = self
                .accumulator
                .accumulate(partition_id, records, options)
                .await
            {
                return Err(self.abort(partition_id, e).await);
            }

            token = self.extractor.extract(&page).map(|found| {
                if found.strategy != TokenStrategy::Explicit {
                    tracing::trace!(strategy = ?found.strategy, "Extracted continuation token");
                }
                found.token
            });

            tracing::debug!(partition_id, page = pages, page_items, has_next = token.is_some(), "Fetched page");
            self.update_progress(|p| {
                p.pages_fetched = pages;
                p.items_fetched = items;
            });
        };

        if let Err(e) = self.accumulator.flush(partition_id).await {
            return Err(self.abort(partition_id, e).await);
        }

        self.update_progress(|p| {
            p.running = false;
            p.current_token = None;
            p.status = Some(status);
        });
        tracing::info!(
            partition_id,
            status = ?status,
            pages,
            items,
            elapsed_ms = crawl_start.elapsed().as_millis(),
            "Crawl finished"
        );

        Ok(CrawlOutcome {
            partition_id: partition_id.to_string(),
            status,
            pages,
            items,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::events::ChangeEventBus;
    use crate::store::{DedupUpsertStore, MemoryStore};
    use crate::transform::JsonTransform;

    /// Serves pages keyed by token; unknown tokens fail permanently.
    #[derive(Default)]
    struct PagedSource {
        pages: HashMap<String, std::result::Result<RawPage, FetchError>>,
        fetches: AtomicUsize,
        cancel_on_fetch: Option<CancelSignal>,
    }

    impl PagedSource {
        fn page(mut self, token: &str, ids: &[&str], next: Option<&str>) -> Self {
            let items = ids.iter().map(|id| json!({ "id": id })).collect();
            self.pages.insert(
                token.to_string(),
                Ok(RawPage::new(items, next.map(str::to_string))),
            );
            self
        }

        fn failing(mut self, token: &str, err: FetchError) -> Self {
            self.pages.insert(token.to_string(), Err(err));
            self
        }
    }

    #[async_trait]
    impl RemoteCommentSource for PagedSource {
        async fn fetch_page(
            &self,
            token: &str,
            _options: &FetchOptions,
        ) -> std::result::Result<RawPage, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(cancel) = &self.cancel_on_fetch {
                cancel.cancel();
            }
            self.pages
                .get(token)
                .cloned()
                .unwrap_or_else(|| Err(FetchError::permanent(format!("unknown token {token}"))))
        }
    }

    fn crawler(source: Arc<PagedSource>, cancel: CancelSignal) -> (ContinuationCrawler, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let accumulator = Arc::new(WriteBatchAccumulator::new(
            store.clone(),
            ChangeEventBus::new(),
        ));
        let crawler = ContinuationCrawler::new(source, Arc::new(JsonTransform), accumulator, cancel)
            .with_config(CrawlConfig::default().with_batch_size(2));
        (crawler, store)
    }

    #[tokio::test]
    async fn crawl_follows_tokens_until_exhausted() {
        let source = Arc::new(
            PagedSource::default()
                .page("A", &["1", "2"], Some("B"))
                .page("B", &["3"], Some("C"))
                .page("C", &["4", "5"], None),
        );
        let (crawler, store) = crawler(source.clone(), CancelSignal::new());

        let outcome = crawler.crawl("v1", "A").await.expect("crawl");

        assert_eq!(outcome.status, CrawlStatus::Completed);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.pages, 3);
        assert_eq!(outcome.items, 5);
        assert_eq!(store.count_by_partition("v1").await.expect("count"), 5);

        let progress = crawler.progress();
        assert!(!progress.running);
        assert_eq!(progress.status, Some(CrawlStatus::Completed));
    }

    #[tokio::test]
    async fn repeated_token_stops_the_crawl() {
        let source = Arc::new(
            PagedSource::default()
                .page("A", &["1"], Some("B"))
                .page("B", &["2"], Some("A")),
        );
        let (crawler, store) = crawler(source.clone(), CancelSignal::new());

        let outcome = crawler.crawl("v1", "A").await.expect("crawl");

        assert_eq!(outcome.status, CrawlStatus::CycleDetected);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn empty_terminal_page_is_not_an_error() {
        let source = Arc::new(PagedSource::default().page("A", &[], None));
        let (crawler, store) = crawler(source, CancelSignal::new());

        let outcome = crawler.crawl("v1", "A").await.expect("crawl");
        assert_eq!(outcome.status, CrawlStatus::Completed);
        assert_eq!(outcome.items, 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn empty_initial_token_fetches_nothing() {
        let source = Arc::new(PagedSource::default());
        let (crawler, _store) = crawler(source.clone(), CancelSignal::new());

        let outcome = crawler.crawl("v1", "").await.expect("crawl");
        assert_eq!(outcome.status, CrawlStatus::Completed);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_is_checked_before_each_fetch() {
        let cancel = CancelSignal::new();
        let source = Arc::new(PagedSource {
            cancel_on_fetch: Some(cancel.clone()),
            ..PagedSource::default()
                .page("A", &["1", "2", "3"], Some("B"))
                .page("B", &["4"], None)
        });
        let (crawler, store) = crawler(source.clone(), cancel);

        let outcome = crawler.crawl("v1", "A").await.expect("crawl");

        assert_eq!(outcome.status, CrawlStatus::Cancelled);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        // The page fetched before cancellation is still flushed.
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn permanent_failure_keeps_flushed_pages() {
        let source = Arc::new(
            PagedSource::default()
                .page("A", &["1", "2"], Some("B"))
                .page("B", &["3"], Some("C"))
                .failing("C", FetchError::from_status(403, "forbidden")),
        );
        let (crawler, store) = crawler(source, CancelSignal::new());

        let err = crawler.crawl("v1", "A").await.expect_err("403 aborts");
        assert_eq!(err.kind(), ErrorKind::PermanentFetch);
        assert_eq!(store.len(), 3);
        assert!(!crawler.progress().running);
    }

    #[tokio::test]
    async fn page_limit_stops_early() {
        let source = Arc::new(
            PagedSource::default()
                .page("A", &["1"], Some("B"))
                .page("B", &["2"], Some("C"))
                .page("C", &["3"], None),
        );
        let (crawler, _store) = crawler(source.clone(), CancelSignal::new());
        let crawler = crawler.with_config(CrawlConfig::default().with_max_pages(Some(2)));

        let outcome = crawler.crawl("v1", "A").await.expect("crawl");
        assert_eq!(outcome.status, CrawlStatus::PageLimit);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn envelope_tokens_are_followed() {
        let mut source = PagedSource::default().page("B", &["2"], None);
        source.pages.insert(
            "A".to_string(),
            Ok(RawPage::from_body(json!({
                "items": [{"id": "1"}],
                "meta": {"continuation": "B"}
            }))),
        );
        let source = Arc::new(source);
        let (crawler, store) = crawler(source.clone(), CancelSignal::new());

        crawler.crawl("v1", "A").await.expect("crawl");
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn storage_failure_is_written_and_reported_once() {
        let source = Arc::new(
            PagedSource::default()
                .page("A", &["1", "2"], Some("B"))
                .page("B", &["3"], None),
        );
        let store = Arc::new(MemoryStore::new());
        store.fail_next_writes(10);
        let bus = ChangeEventBus::new();
        let accumulator = Arc::new(WriteBatchAccumulator::new(store.clone(), bus.clone()));
        let crawler = ContinuationCrawler::new(
            source.clone(),
            Arc::new(JsonTransform),
            accumulator.clone(),
            CancelSignal::new(),
        );

        let err = crawler.crawl("v1", "A").await.expect_err("store rejects writes");

        assert_eq!(err.kind(), ErrorKind::Storage);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(store.upsert_calls().len(), 1);
        assert_eq!(bus.stats().count_of(crate::events::ChangeEventType::ErrorOccurred), 1);
        // The batch stays buffered for a later flush.
        assert!(store.is_empty());
        assert_eq!(accumulator.snapshot("v1").map(|s| s.buffered), Some(2));
    }
}
