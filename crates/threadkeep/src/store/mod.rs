//! Idempotent keyed writes against the durable comment cache.
//!
//! Every writer in the engine goes through [`DedupUpsertStore`]. Repeated
//! writes of the same `(partition_id, item_id)` converge to exactly one row,
//! and the last write wins.

mod database;
mod errors;
mod memory;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::record::Record;

pub use database::{SeaOrmStore, build_upsert_on_conflict};
pub use errors::{Result, StoreError};
pub use memory::MemoryStore;

/// Maximum rows per statement for lookups and batched writes.
pub const WRITE_CHUNK_SIZE: usize = 500;

/// Options for [`DedupUpsertStore::upsert_by_key`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOptions {
    /// Skip the existing-key lookup and insert only. Used for the first
    /// flush into a partition known to be empty.
    pub skip_lookup: bool,
}

impl UpsertOptions {
    pub fn insert_only() -> Self {
        Self { skip_lookup: true }
    }
}

/// Outcome of one upsert call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    /// Rows created by this call.
    pub inserted: u64,
    /// Existing rows rewritten in place.
    pub updated: u64,
    /// The insert-only path hit an existing key and fell back to upsert.
    pub fell_back: bool,
}

impl UpsertSummary {
    /// Rows written (inserted plus updated).
    pub fn written(&self) -> u64 {
        self.inserted + self.updated
    }
}

/// Contract for idempotent keyed writes.
#[async_trait]
pub trait DedupUpsertStore: Send + Sync {
    /// Insert or update records by their natural key in one transaction.
    async fn upsert_by_key(&self, items: Vec<Record>, options: UpsertOptions)
    -> Result<UpsertSummary>;

    /// Number of stored rows in a partition.
    async fn count_by_partition(&self, partition_id: &str) -> Result<u64>;

    /// Top-level records with replies, highest `reply_count` first.
    async fn reply_threads(&self, partition_id: &str) -> Result<Vec<Record>>;

    /// Number of stored replies under one parent.
    async fn count_replies(&self, partition_id: &str, parent_item_id: &str) -> Result<u64>;
}

#[async_trait]
impl<S: DedupUpsertStore + ?Sized> DedupUpsertStore for std::sync::Arc<S> {
    async fn upsert_by_key(
        &self,
        items: Vec<Record>,
        options: UpsertOptions,
    ) -> Result<UpsertSummary> {
        (**self).upsert_by_key(items, options).await
    }

    async fn count_by_partition(&self, partition_id: &str) -> Result<u64> {
        (**self).count_by_partition(partition_id).await
    }

    async fn reply_threads(&self, partition_id: &str) -> Result<Vec<Record>> {
        (**self).reply_threads(partition_id).await
    }

    async fn count_replies(&self, partition_id: &str, parent_item_id: &str) -> Result<u64> {
        (**self).count_replies(partition_id, parent_item_id).await
    }
}

/// Validate and deduplicate a batch by natural key, keeping the last write.
///
/// The position of each key's first occurrence is kept so batches stay in
/// upstream order.
pub(crate) fn dedup_last_wins(items: Vec<Record>) -> Result<Vec<Record>> {
    let mut positions: HashMap<(String, String), usize> = HashMap::with_capacity(items.len());
    let mut deduped: Vec<Record> = Vec::with_capacity(items.len());

    for item in items {
        if item.partition_id.is_empty() || item.item_id.is_empty() {
            return Err(StoreError::invalid_input(format!(
                "record key must be non-empty (partition_id={:?}, item_id={:?})",
                item.partition_id, item.item_id
            )));
        }
        let key = (item.partition_id.clone(), item.item_id.clone());
        match positions.get(&key) {
            Some(&pos) => deduped[pos] = item,
            None => {
                positions.insert(key, deduped.len());
                deduped.push(item);
            }
        }
    }

    Ok(deduped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keeps_last_write_in_first_position() {
        let items = vec![
            Record::top_level("v1", "a").with_text("old"),
            Record::top_level("v1", "b"),
            Record::top_level("v1", "a").with_text("new"),
            Record::top_level("v2", "a"),
        ];
        let deduped = dedup_last_wins(items).expect("valid batch");

        assert_eq!(deduped.len(), 3);
        assert_eq!(deduped[0].item_id, "a");
        assert_eq!(deduped[0].text.as_deref(), Some("new"));
        assert_eq!(deduped[1].item_id, "b");
        assert_eq!(deduped[2].partition_id, "v2");
    }

    #[test]
    fn dedup_rejects_empty_keys() {
        let err = dedup_last_wins(vec![Record::top_level("v1", "")]).expect_err("empty item id");
        assert!(matches!(err, StoreError::InvalidInput { .. }));
    }

    #[test]
    fn summary_written_adds_both_counts() {
        let summary = UpsertSummary {
            inserted: 3,
            updated: 2,
            fell_back: false,
        };
        assert_eq!(summary.written(), 5);
        assert!(UpsertOptions::insert_only().skip_lookup);
        assert!(!UpsertOptions::default().skip_lookup);
    }
}
