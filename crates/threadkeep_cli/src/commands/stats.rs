use console::style;
use serde::Serialize;
use threadkeep::{DedupUpsertStore, Record, SeaOrmStore, connect_and_migrate};

use crate::commands::OutputFormat;

/// One reply thread for display.
#[derive(Debug, Clone, Serialize, tabled::Tabled)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ThreadDisplay {
    #[tabled(rename = "Comment")]
    pub item_id: String,
    #[tabled(rename = "Author")]
    pub author: String,
    #[tabled(rename = "Reported")]
    pub reported: u64,
    #[tabled(rename = "Stored")]
    pub stored: u64,
    #[tabled(rename = "Coverage")]
    pub coverage: String,
}

impl ThreadDisplay {
    fn new(record: &Record, stored: u64) -> Self {
        let coverage = if record.reply_count > 0 {
            (stored as f64 / record.reply_count as f64) * 100.0
        } else {
            100.0
        };
        Self {
            item_id: record.item_id.clone(),
            author: record.author.clone().unwrap_or_else(|| "-".to_string()),
            reported: record.reply_count,
            stored,
            coverage: format!("{:.1}%", coverage),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PartitionStats {
    partition_id: String,
    stored: u64,
    reply_threads: usize,
    threads: Vec<ThreadDisplay>,
}

pub(crate) async fn handle_stats(
    partition: String,
    top: usize,
    output: OutputFormat,
    database_url: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = connect_and_migrate(database_url).await?;
    let store = SeaOrmStore::new(db);

    let stored = store.count_by_partition(&partition).await?;
    let threads = store.reply_threads(&partition).await?;

    let mut rows = Vec::with_capacity(top.min(threads.len()));
    for record in threads.iter().take(top) {
        let replies = store.count_replies(&partition, &record.item_id).await?;
        rows.push(ThreadDisplay::new(record, replies));
    }

    let stats = PartitionStats {
        partition_id: partition,
        stored,
        reply_threads: threads.len(),
        threads: rows,
    };

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
        OutputFormat::Table => print_table(stats),
    }
    Ok(())
}

fn print_table(stats: PartitionStats) {
    println!(
        "{}: {} stored, {} threads with replies",
        style(&stats.partition_id).bold(),
        stats.stored,
        stats.reply_threads
    );
    if stats.threads.is_empty() {
        return;
    }
    let mut table = tabled::Table::new(stats.threads);
    table.with(tabled::settings::Style::rounded());
    println!("{}", table);
}
