use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    TransactionTrait, sea_query::OnConflict,
};
use uuid::Uuid;

use crate::entity::comment::{ActiveModel, Column, Entity as Comment};
use crate::record::{CommentLevel, Record};

use super::errors::{Result, StoreError};
use super::{DedupUpsertStore, UpsertOptions, UpsertSummary, WRITE_CHUNK_SIZE, dedup_last_wins};

/// Default number of retry attempts for batched writes.
pub const DEFAULT_WRITE_RETRIES: u32 = 3;

/// Default initial backoff delay in milliseconds for write retries.
pub const DEFAULT_WRITE_BACKOFF_MS: u64 = 100;

/// [`DedupUpsertStore`] backed by a sea-orm connection.
#[derive(Debug)]
pub struct SeaOrmStore {
    db: DatabaseConnection,
    max_retries: u32,
    initial_backoff_ms: u64,
}

impl SeaOrmStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            max_retries: DEFAULT_WRITE_RETRIES,
            initial_backoff_ms: DEFAULT_WRITE_BACKOFF_MS,
        }
    }

    /// Configure retries for transient write failures (0 = no retries).
    #[must_use]
    pub fn with_retry(mut self, max_retries: u32, initial_backoff_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.initial_backoff_ms = initial_backoff_ms;
        self
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Give the connection back, e.g. to close it or read a mock's log.
    pub fn into_connection(self) -> DatabaseConnection {
        self.db
    }

    /// Run a write, retrying transient database errors with doubling backoff.
    async fn write_with_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff_ms = self.initial_backoff_ms;
        let mut attempt = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        max_retries = self.max_retries,
                        backoff_ms,
                        error = %e,
                        "Comment write failed, retrying..."
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Pure batched insert. Fails with [`StoreError::DuplicateKey`] when any
    /// key already exists; the transaction rolls back so nothing is written.
    async fn insert_only(&self, models: &[ActiveModel]) -> Result<u64> {
        let txn = self.db.begin().await?;
        for chunk in models.chunks(WRITE_CHUNK_SIZE) {
            Comment::insert_many(chunk.to_vec())
                .exec_without_returning(&txn)
                .await
                .map_err(StoreError::from_db)?;
        }
        txn.commit().await?;
        Ok(models.len() as u64)
    }

    /// Batched `INSERT ... ON CONFLICT DO UPDATE` in one transaction.
    async fn write_upsert(&self, models: &[ActiveModel]) -> Result<()> {
        let txn = self.db.begin().await?;
        for chunk in models.chunks(WRITE_CHUNK_SIZE) {
            Comment::insert_many(chunk.to_vec())
                .on_conflict(build_upsert_on_conflict())
                .exec_without_returning(&txn)
                .await
                .map_err(StoreError::from_db)?;
        }
        txn.commit().await?;
        Ok(())
    }

    /// Map natural keys of `items` to existing internal ids.
    ///
    /// Issues one `IN` query per partition (chunked for very large batches).
    async fn lookup_existing(&self, items: &[Record]) -> Result<HashMap<(String, String), Uuid>> {
        let mut by_partition: HashMap<&str, Vec<String>> = HashMap::new();
        for item in items {
            by_partition
                .entry(item.partition_id.as_str())
                .or_default()
                .push(item.item_id.clone());
        }

        let mut existing = HashMap::new();
        for (partition_id, item_ids) in by_partition {
            for chunk in item_ids.chunks(WRITE_CHUNK_SIZE) {
                let rows = Comment::find()
                    .filter(Column::PartitionId.eq(partition_id))
                    .filter(Column::ItemId.is_in(chunk.to_vec()))
                    .all(&self.db)
                    .await?;
                for row in rows {
                    existing.insert((row.partition_id, row.item_id), row.id);
                }
            }
        }

        Ok(existing)
    }

    async fn upsert_with_lookup(&self, items: &[Record]) -> Result<UpsertSummary> {
        let existing = self.lookup_existing(items).await?;
        let synced_at = Utc::now().fixed_offset();

        let mut summary = UpsertSummary::default();
        let models: Vec<ActiveModel> = items
            .iter()
            .map(|item| {
                let key = (item.partition_id.clone(), item.item_id.clone());
                let id = match existing.get(&key) {
                    Some(id) => {
                        summary.updated += 1;
                        *id
                    }
                    None => {
                        summary.inserted += 1;
                        Uuid::new_v4()
                    }
                };
                item.to_active_model(id, synced_at)
            })
            .collect();

        self.write_with_retry(|| self.write_upsert(&models)).await?;
        Ok(summary)
    }
}

#[async_trait]
impl DedupUpsertStore for SeaOrmStore {
    async fn upsert_by_key(
        &self,
        items: Vec<Record>,
        options: UpsertOptions,
    ) -> Result<UpsertSummary> {
        let items = dedup_last_wins(items)?;
        if items.is_empty() {
            return Ok(UpsertSummary::default());
        }

        if options.skip_lookup {
            let synced_at = Utc::now().fixed_offset();
            let models: Vec<ActiveModel> = items
                .iter()
                .map(|item| item.to_active_model(Uuid::new_v4(), synced_at))
                .collect();

            match self.write_with_retry(|| self.insert_only(&models)).await {
                Ok(inserted) => {
                    tracing::debug!(inserted, "Inserted comments without lookup");
                    return Ok(UpsertSummary {
                        inserted,
                        updated: 0,
                        fell_back: false,
                    });
                }
                Err(e) if e.is_duplicate_key() => {
                    tracing::debug!(error = %e, "Insert-only write hit existing keys, falling back to upsert");
                    let summary = self.upsert_with_lookup(&items).await?;
                    return Ok(UpsertSummary {
                        fell_back: true,
                        ..summary
                    });
                }
                Err(e) => return Err(e),
            }
        }

        self.upsert_with_lookup(&items).await
    }

    async fn count_by_partition(&self, partition_id: &str) -> Result<u64> {
        let count = Comment::find()
            .filter(Column::PartitionId.eq(partition_id))
            .count(&self.db)
            .await?;
        Ok(count)
    }

    async fn reply_threads(&self, partition_id: &str) -> Result<Vec<Record>> {
        let rows = Comment::find()
            .filter(Column::PartitionId.eq(partition_id))
            .filter(Column::Level.eq(CommentLevel::TopLevel.as_i16()))
            .filter(Column::ReplyCount.gt(0))
            .order_by_desc(Column::ReplyCount)
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(Record::from).collect())
    }

    async fn count_replies(&self, partition_id: &str, parent_item_id: &str) -> Result<u64> {
        let count = Comment::find()
            .filter(Column::PartitionId.eq(partition_id))
            .filter(Column::ParentId.eq(parent_item_id))
            .count(&self.db)
            .await?;
        Ok(count)
    }
}

/// Build the ON CONFLICT clause used by the upsert write.
///
/// Conflict detection uses `(partition_id, item_id)` as the natural key and
/// rewrites every column except the internal id.
pub fn build_upsert_on_conflict() -> OnConflict {
    OnConflict::columns([Column::PartitionId, Column::ItemId])
        .update_columns([
            Column::ParentId,
            Column::Level,
            Column::ReplyCount,
            Column::ReplyToken,
            Column::Author,
            Column::Text,
            Column::LikeCount,
            Column::PublishedAt,
            Column::Payload,
            Column::SyncedAt,
        ])
        .to_owned()
}
