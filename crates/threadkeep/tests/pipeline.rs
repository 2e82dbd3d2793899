//! End-to-end ingestion against scripted sources and the in-memory store.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{ScriptedSource, items, thread};
use threadkeep::{
    AccumulatorOptions, ChangeEventBus, ChangeEventType, CrawlConfig, CrawlStatus, FetchError,
    IngestSession, MemoryStore, Record, ReplyCallbacks, ReplyQueueConfig, RetryPolicy, TaskStatus,
    WriteBatchAccumulator,
};

fn build(
    source: ScriptedSource,
    crawl: CrawlConfig,
    replies: ReplyQueueConfig,
) -> (IngestSession, Arc<MemoryStore>, Arc<ScriptedSource>) {
    let store = Arc::new(MemoryStore::new());
    let source = Arc::new(source);
    let session = IngestSession::builder()
        .store(store.clone())
        .source(source.clone())
        .crawl_config(crawl)
        .crawl_retry(RetryPolicy::new(Duration::from_millis(10), 2))
        .reply_config(replies)
        .build()
        .expect("session");
    (session, store, source)
}

fn default_session(source: ScriptedSource) -> (IngestSession, Arc<MemoryStore>, Arc<ScriptedSource>) {
    build(source, CrawlConfig::default(), ReplyQueueConfig::default())
}

#[tokio::test]
async fn crawl_follows_tokens_until_exhausted() {
    let source = ScriptedSource::new()
        .page("A", items(&["a1", "a2"]), Some("B"))
        .page("B", items(&["b1"]), Some("C"))
        .page("C", items(&["c1"]), None);
    let (session, store, source) = default_session(source);

    let outcome = session.crawl("v1", "A").await.unwrap();

    assert_eq!(outcome.status, CrawlStatus::Completed);
    assert_eq!(source.fetched(), vec!["A", "B", "C"]);
    assert_eq!(outcome.items, 4);
    assert_eq!(store.len(), 4);
}

#[tokio::test]
async fn repeated_token_ends_the_crawl() {
    let source = ScriptedSource::new()
        .page("A", items(&["a1"]), Some("B"))
        .page("B", items(&["b1"]), Some("A"));
    let (session, store, source) = default_session(source);

    let outcome = session.crawl("v1", "A").await.unwrap();

    assert_eq!(outcome.status, CrawlStatus::CycleDetected);
    assert_eq!(source.fetch_count(), 2);
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn ingesting_twice_converges_to_one_row_per_key() {
    let source = ScriptedSource::new()
        .page("A", vec![thread("c1", 1, "R1"), thread("c2", 0, "")], Some("B"))
        .page("B", items(&["c3", "c2"]), None)
        .page("R1", items(&["r1"]), None);
    let (session, store, _) = default_session(source);

    let first = session.ingest("v1", "A").await.unwrap();
    let second = session.ingest("v1", "A").await.unwrap();

    assert_eq!(first.stored, 4);
    assert_eq!(second.stored, 4);
    assert_eq!(store.len(), 4);
    // "c2" was seen last on page B, with text.
    assert_eq!(
        store.get("v1", "c2").unwrap().text.as_deref(),
        Some("comment c2")
    );
}

#[tokio::test(start_paused = true)]
async fn first_page_is_visible_before_the_crawl_ends() {
    let source = ScriptedSource::new()
        .with_latency(Duration::from_secs(1))
        .page("A", items(&["a1", "a2"]), Some("B"))
        .page("B", items(&["b1"]), Some("C"))
        .page("C", items(&["c1"]), None);
    let (session, store, _) = default_session(source);

    let handle = session.start_crawl("v1", "A");
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(store.len(), 2);
    assert!(session.crawl_progress().running);

    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome.pages, 3);
    assert_eq!(store.len(), 4);
}

#[tokio::test]
async fn later_pages_flush_at_the_batch_threshold() {
    let source = ScriptedSource::new()
        .page("P1", items(&["a", "b"]), Some("P2"))
        .page("P2", items(&["c", "d"]), Some("P3"))
        .page("P3", items(&["e", "f"]), Some("P4"))
        .page("P4", items(&["g", "h"]), None);
    let (session, _, _) = build(
        source,
        CrawlConfig::default().with_batch_size(3),
        ReplyQueueConfig::default(),
    );

    let batches = Arc::new(Mutex::new(Vec::new()));
    let sink = batches.clone();
    session.subscribe(ChangeEventType::BulkAdded, move |event| {
        sink.lock().unwrap().push(event.count.unwrap_or_default());
        Ok(())
    });

    session.crawl("v1", "P1").await.unwrap();

    assert_eq!(*batches.lock().unwrap(), vec![2, 4, 2]);
}

#[tokio::test]
async fn first_accumulate_flushes_immediately() {
    let store = Arc::new(MemoryStore::new());
    let accumulator = WriteBatchAccumulator::new(store.clone(), ChangeEventBus::new());

    let records = vec![Record::top_level("v1", "a"), Record::top_level("v1", "b")];
    accumulator
        .accumulate("v1", records, AccumulatorOptions::default().with_batch_size(500))
        .await
        .unwrap();

    assert_eq!(accumulator.snapshot("v1").unwrap().total_flushed, 2);
    assert_eq!(store.len(), 2);
}

#[test]
fn emit_added_is_counted() {
    let bus = ChangeEventBus::new();
    bus.emit_added("v1", 5);

    let stats = bus.stats();
    assert_eq!(stats.total_events_emitted, 1);
    assert_eq!(stats.count_of(ChangeEventType::Added), 1);
}

#[tokio::test(start_paused = true)]
async fn reply_fetches_respect_concurrency_and_priority() {
    let threads = (1..=10)
        .map(|i| thread(&format!("c{i}"), i, &format!("R{i}")))
        .collect();
    let mut source = ScriptedSource::new()
        .with_latency(Duration::from_millis(50))
        .page("A", threads, None);
    for i in 1..=10 {
        source = source.page(&format!("R{i}"), items(&[format!("r{i}").as_str()]), None);
    }
    let (session, store, source) = build(
        source,
        CrawlConfig::default(),
        ReplyQueueConfig::default().with_concurrency(2),
    );

    let report = session.ingest("v1", "A").await.unwrap();

    assert_eq!(source.max_in_flight(), 2);
    let replies = report.replies.unwrap();
    assert_eq!(replies.completed, 10);
    assert_eq!(store.len(), 20);
    // Largest threads are dispatched first.
    let mut first = source.fetched()[1..3].to_vec();
    first.sort();
    assert_eq!(first, vec!["R10".to_string(), "R9".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn failing_thread_does_not_block_siblings() {
    let source = ScriptedSource::new()
        .page(
            "A",
            vec![
                thread("c1", 5, "R1"),
                thread("c2", 4, "R2"),
                thread("c3", 3, "R3"),
                thread("c4", 2, "R4"),
                thread("c5", 1, "R5"),
            ],
            None,
        )
        .page("R1", items(&["r1"]), None)
        .page("R2", items(&["r2a", "r2b"]), Some("R2b"))
        .page("R2b", items(&["r2c"]), None)
        .respond("R3", Err(FetchError::from_status(404, "gone")))
        .page("R4", items(&["r4"]), None)
        .page("R5", items(&["r5"]), None);
    let (session, store, _) = default_session(source);

    let report = session.ingest("v1", "A").await.unwrap();

    let replies = report.replies.unwrap();
    assert_eq!(replies.completed, 4);
    assert_eq!(replies.failed, 1);
    assert_eq!(replies.failures[0].parent_item_id, "c3");
    assert_eq!(replies.replies_fetched, 6);
    assert_eq!(store.len(), 11);
    assert_eq!(session.stats().count_of(ChangeEventType::ErrorOccurred), 1);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_thread_waits_out_cooldown() {
    let source = ScriptedSource::new()
        .page("A", vec![thread("c1", 2, "R1"), thread("c2", 1, "R2")], None)
        .respond("R1", Err(FetchError::RateLimited { retry_after: None }))
        .page("R1", items(&["r1"]), None)
        .page("R2", items(&["r2"]), None);
    let config = ReplyQueueConfig::default()
        .with_concurrency(4)
        .with_rate_limit_cooldown(Duration::from_secs(30));
    let (session, store, _) = build(source, CrawlConfig::default(), config);

    let tasks = {
        session.crawl("v1", "A").await.unwrap();
        session.schedule_replies("v1").await.unwrap()
    };

    let notices = Arc::new(Mutex::new(Vec::new()));
    let reports = Arc::new(Mutex::new(Vec::new()));
    let (notice_sink, report_sink) = (notices.clone(), reports.clone());
    session.queue_replies(
        tasks,
        ReplyCallbacks::new()
            .on_rate_limited(move |n| notice_sink.lock().unwrap().push(n.clone()))
            .on_task_settled(move |r| report_sink.lock().unwrap().push(r.clone())),
    );

    tokio::time::sleep(Duration::from_secs(1)).await;
    let during = session.reply_progress();
    assert!(during.cooling_down);
    assert_eq!(during.concurrency_limit, 2);

    session.wait_for_replies().await;

    assert_eq!(notices.lock().unwrap().len(), 1);
    let reports = reports.lock().unwrap();
    assert!(reports.iter().all(|r| r.status == TaskStatus::Completed));
    let c1 = reports.iter().find(|r| r.parent_item_id == "c1").unwrap();
    assert_eq!(c1.retries, 0);
    assert_eq!(c1.rate_limit_hits, 1);
    assert_eq!(store.len(), 4);
    assert_eq!(session.reply_progress().concurrency_limit, 4);
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_crawl_and_reports_cancelled() {
    let source = ScriptedSource::new()
        .with_latency(Duration::from_secs(1))
        .page("A", items(&["a1"]), Some("B"))
        .page("B", items(&["b1"]), Some("C"))
        .page("C", items(&["c1"]), None);
    let (session, store, source) = default_session(source);

    let handle = session.start_crawl("v1", "A");
    tokio::time::sleep(Duration::from_millis(1500)).await;
    session.cancel();

    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome.status, CrawlStatus::Cancelled);
    assert_eq!(source.fetch_count(), 2);
    assert_eq!(store.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_crawl_failure_is_retried() {
    let source = ScriptedSource::new()
        .respond("A", Err(FetchError::from_status(502, "bad gateway")))
        .page("A", items(&["a1"]), None);
    let (session, store, source) = default_session(source);

    let outcome = session.crawl("v1", "A").await.unwrap();

    assert_eq!(outcome.status, CrawlStatus::Completed);
    assert_eq!(source.fetch_count(), 2);
    assert_eq!(store.len(), 1);
}
