use std::sync::Arc;
use std::time::Duration;

use console::style;
use threadkeep::source::http::HttpCommentSource;
use threadkeep::source::http::reqwest_transport::ReqwestTransport;
use threadkeep::{
    CancelSignal, CrawlOutcome, CrawlStatus, DedupUpsertStore, IngestReport, IngestSession, RateLimitedSource,
    RemoteCommentSource, SeaOrmStore, connect_and_migrate,
};

use crate::IngestArgs;
use crate::commands::OutputFormat;
use crate::config::Config;
use crate::progress::ProgressReporter;

/// How often the reply progress display is refreshed.
const PROGRESS_REFRESH: Duration = Duration::from_millis(200);

/// Split `NAME=VALUE` (or `NAME: VALUE`) into a header pair.
fn parse_header(raw: &str) -> Option<(String, String)> {
    let (name, value) = raw.split_once('=').or_else(|| raw.split_once(':'))?;
    let name = name.trim();
    (!name.is_empty()).then(|| (name.to_string(), value.trim().to_string()))
}

fn build_source(
    args: &IngestArgs,
    config: &Config,
) -> Result<Arc<dyn RemoteCommentSource>, Box<dyn std::error::Error>> {
    let endpoint = args
        .endpoint
        .clone()
        .or_else(|| config.source.endpoint.clone())
        .ok_or("No source endpoint configured. Pass --endpoint or set [source] endpoint.")?;

    let transport = ReqwestTransport::with_timeout(Duration::from_secs(config.source.timeout_secs))?;
    let mut source = HttpCommentSource::new(transport, endpoint);
    for raw in &args.headers {
        let (name, value) =
            parse_header(raw).ok_or_else(|| format!("Invalid header '{raw}', expected NAME=VALUE"))?;
        source = source.with_header(name, value);
    }

    let rps = if args.no_rate_limit {
        0
    } else {
        config.source.requests_per_second
    };
    Ok(if rps == 0 {
        Arc::new(source)
    } else {
        Arc::new(RateLimitedSource::new(source, rps))
    })
}

pub(crate) async fn handle_ingest(
    args: IngestArgs,
    config: &Config,
    database_url: &str,
    cancel: CancelSignal,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = connect_and_migrate(database_url).await?;
    let store = Arc::new(SeaOrmStore::new(db));
    let source = build_source(&args, config)?;

    let mut reply_config = config.reply_config();
    if let Some(concurrency) = args.concurrency {
        reply_config = reply_config.with_concurrency(concurrency);
    }
    let mut crawl_config = config.crawl_config().fresh(args.fresh);
    if let Some(max_pages) = args.max_pages {
        crawl_config = crawl_config.with_max_pages(Some(max_pages));
    }

    let session = IngestSession::builder()
        .store(store)
        .source(source)
        .cancel_signal(cancel)
        .crawl_config(crawl_config)
        .crawl_retry(config.crawl_retry())
        .reply_config(reply_config)
        .build()?;

    let reporter = Arc::new(ProgressReporter::new());
    let subscription = reporter.attach(&session);

    let result = if args.no_replies {
        session.crawl(&args.partition, &args.token).await.map(|crawl| (crawl, None))
    } else {
        run_with_progress(&session, &reporter, &args.partition, &args.token)
            .await
            .map(|report| (report.crawl, report.replies))
    };
    subscription.unsubscribe();
    reporter.finish();

    let (crawl, replies) = result?;
    let stored = session.store().count_by_partition(&args.partition).await?;
    let report = IngestReport {
        crawl,
        replies,
        stored,
    };

    print_report(&report, args.output)?;
    Ok(())
}

/// Drive `ingest` while refreshing the reply progress display.
async fn run_with_progress(
    session: &IngestSession,
    reporter: &ProgressReporter,
    partition: &str,
    token: &str,
) -> Result<IngestReport, threadkeep::IngestError> {
    let ingest = session.ingest(partition, token);
    tokio::pin!(ingest);
    let mut ticker = tokio::time::interval(PROGRESS_REFRESH);

    loop {
        tokio::select! {
            report = &mut ingest => {
                reporter.replies(&session.reply_progress());
                return report;
            }
            _ = ticker.tick() => reporter.replies(&session.reply_progress()),
        }
    }
}

fn status_label(crawl: &CrawlOutcome) -> String {
    match crawl.status {
        CrawlStatus::Completed => style("completed").green().to_string(),
        CrawlStatus::CycleDetected => style("stopped at repeated token").yellow().to_string(),
        CrawlStatus::PageLimit => style("stopped at page limit").yellow().to_string(),
        CrawlStatus::Cancelled => style("cancelled").red().to_string(),
    }
}

fn print_report(report: &IngestReport, output: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    if let OutputFormat::Json = output {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let crawl = &report.crawl;
    println!();
    println!(
        "{} {}: {} pages, {} comments ({})",
        style("✓").green(),
        style(&crawl.partition_id).bold(),
        crawl.pages,
        crawl.items,
        status_label(crawl)
    );

    if let Some(replies) = &report.replies {
        println!(
            "  Replies: {} fetched from {} threads ({} completed, {} failed, {} cancelled)",
            replies.replies_fetched,
            replies.total,
            replies.completed,
            replies.failed,
            replies.cancelled
        );
        for failure in &replies.failures {
            if let Some(error) = &failure.error {
                println!(
                    "  {} thread {}: {} ({})",
                    style("✗").red(),
                    failure.parent_item_id,
                    error.message,
                    error.kind
                );
            }
        }
    }

    println!("  Stored: {} comments and replies", report.stored);
    Ok(())
}
