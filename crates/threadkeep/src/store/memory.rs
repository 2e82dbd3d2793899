use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use crate::record::{CommentLevel, Record};

use super::errors::{Result, StoreError};
use super::{DedupUpsertStore, UpsertOptions, UpsertSummary, dedup_last_wins};

/// In-memory [`DedupUpsertStore`] for tests and dry runs.
///
/// Honours the same contract as [`super::SeaOrmStore`], including the
/// insert-only fast path falling back when a key already exists. Writes can
/// be made to fail on demand with [`MemoryStore::fail_next_writes`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<(String, String), Record>>,
    calls: Mutex<Vec<(usize, UpsertOptions)>>,
    failures_pending: AtomicUsize,
    write_delay: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every write, to widen race windows in tests.
    #[must_use]
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    /// Make the next `n` upsert calls fail with a storage error.
    pub fn fail_next_writes(&self, n: usize) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    /// Every upsert call so far as `(batch_len, options)`.
    pub fn upsert_calls(&self) -> Vec<(usize, UpsertOptions)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Look up a stored record by natural key.
    pub fn get(&self, partition_id: &str, item_id: &str) -> Option<Record> {
        self.rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(partition_id.to_string(), item_id.to_string()))
            .cloned()
    }

    /// Total rows across all partitions.
    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_failure(&self) -> bool {
        self.failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DedupUpsertStore for MemoryStore {
    async fn upsert_by_key(
        &self,
        items: Vec<Record>,
        options: UpsertOptions,
    ) -> Result<UpsertSummary> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((items.len(), options));

        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }

        if self.take_failure() {
            return Err(StoreError::Database(sea_orm::DbErr::Custom(
                "injected write failure".to_string(),
            )));
        }

        let items = dedup_last_wins(items)?;
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());

        let fell_back = options.skip_lookup
            && items
                .iter()
                .any(|item| rows.contains_key(&(item.partition_id.clone(), item.item_id.clone())));
        if fell_back {
            tracing::debug!("Insert-only write hit existing keys, falling back to upsert");
        }

        let mut summary = UpsertSummary {
            fell_back,
            ..UpsertSummary::default()
        };
        for item in items {
            let key = (item.partition_id.clone(), item.item_id.clone());
            match rows.get_mut(&key) {
                Some(row) => {
                    *row = item;
                    summary.updated += 1;
                }
                None => {
                    rows.insert(key, item);
                    summary.inserted += 1;
                }
            }
        }

        Ok(summary)
    }

    async fn count_by_partition(&self, partition_id: &str) -> Result<u64> {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        Ok(rows.keys().filter(|(p, _)| p == partition_id).count() as u64)
    }

    async fn reply_threads(&self, partition_id: &str) -> Result<Vec<Record>> {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let mut threads: Vec<Record> = rows
            .values()
            .filter(|r| {
                r.partition_id == partition_id
                    && r.level == CommentLevel::TopLevel
                    && r.reply_count > 0
            })
            .cloned()
            .collect();
        threads.sort_by(|a, b| {
            b.reply_count
                .cmp(&a.reply_count)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        Ok(threads)
    }

    async fn count_replies(&self, partition_id: &str, parent_item_id: &str) -> Result<u64> {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        Ok(rows
            .values()
            .filter(|r| {
                r.partition_id == partition_id && r.parent_id.as_deref() == Some(parent_item_id)
            })
            .count() as u64)
    }
}
