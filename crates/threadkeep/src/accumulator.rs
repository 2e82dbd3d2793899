//! Per-partition write batching.
//!
//! The accumulator trades throughput against visibility: the first write to
//! a partition is flushed immediately so readers see something at once,
//! later writes are buffered until a full batch is ready.
//!
//! ```text
//! Crawler → accumulate() → buffer ─(first call | batch full)→ flush() → store → bus
//! ```
//!
//! Flushes of one partition are serialized. A flush swaps the buffer out
//! under a lock, so records accumulated while a write is in flight land in
//! the next batch; a failed write puts its snapshot back in front of them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;

use crate::error::{IngestError, Result};
use crate::events::ChangeEventBus;
use crate::record::Record;
use crate::store::{DedupUpsertStore, UpsertOptions};

/// Default number of records per flush.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Options for [`WriteBatchAccumulator::accumulate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccumulatorOptions {
    /// Flush once this many records are buffered.
    pub batch_size: usize,
    /// The partition is known to be empty, so the first flush may skip
    /// the existing-key lookup.
    pub is_fresh: bool,
}

impl Default for AccumulatorOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            is_fresh: false,
        }
    }
}

impl AccumulatorOptions {
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    #[must_use]
    pub fn fresh(mut self, is_fresh: bool) -> Self {
        self.is_fresh = is_fresh;
        self
    }
}

/// Point-in-time view of one partition's buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccumulatorSnapshot {
    pub buffered: usize,
    pub total_flushed: u64,
    pub is_fresh: bool,
}

#[derive(Debug, Default)]
struct PartitionBuffer {
    buffer: Vec<Record>,
    total_flushed: u64,
    is_fresh: bool,
}

#[derive(Debug, Default)]
struct PartitionState {
    buffer: Mutex<PartitionBuffer>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl PartitionState {
    fn snapshot(&self) -> AccumulatorSnapshot {
        let state = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        AccumulatorSnapshot {
            buffered: state.buffer.len(),
            total_flushed: state.total_flushed,
            is_fresh: state.is_fresh,
        }
    }
}

/// Buffers records per partition and flushes them through the store.
pub struct WriteBatchAccumulator {
    store: Arc<dyn DedupUpsertStore>,
    bus: ChangeEventBus,
    partitions: Mutex<HashMap<String, Arc<PartitionState>>>,
}

impl std::fmt::Debug for WriteBatchAccumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBatchAccumulator")
            .field("partitions", &self.partitions())
            .finish_non_exhaustive()
    }
}

impl WriteBatchAccumulator {
    pub fn new(store: Arc<dyn DedupUpsertStore>, bus: ChangeEventBus) -> Self {
        Self {
            store,
            bus,
            partitions: Mutex::new(HashMap::new()),
        }
    }

    fn state(&self, partition_id: &str) -> Option<Arc<PartitionState>> {
        self.partitions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(partition_id)
            .cloned()
    }

    fn state_or_create(&self, partition_id: &str, is_fresh: bool) -> Arc<PartitionState> {
        let mut partitions = self.partitions.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(partitions.entry(partition_id.to_string()).or_insert_with(|| {
            tracing::debug!(partition_id, is_fresh, "Creating write buffer");
            Arc::new(PartitionState {
                buffer: Mutex::new(PartitionBuffer {
                    is_fresh,
                    ..PartitionBuffer::default()
                }),
                flush_lock: tokio::sync::Mutex::new(()),
            })
        }))
    }

    /// Buffer records for a partition, flushing when due.
    ///
    /// The first call for a partition flushes immediately; later calls
    /// flush once the buffer holds `batch_size` records. Returns the number
    /// of records flushed by this call.
    pub async fn accumulate(
        &self,
        partition_id: &str,
        items: Vec<Record>,
        options: AccumulatorOptions,
    ) -> Result<u64> {
        if partition_id.is_empty() {
            return Err(IngestError::invalid_input("partition id must not be empty"));
        }

        let state = self.state_or_create(partition_id, options.is_fresh);
        let should_flush = {
            let mut buf = state.buffer.lock().unwrap_or_else(|e| e.into_inner());
            buf.buffer.extend(items);
            buf.total_flushed == 0 || buf.buffer.len() >= options.batch_size.max(1)
        };

        if should_flush {
            self.flush(partition_id).await
        } else {
            Ok(0)
        }
    }

    /// Write everything buffered for a partition in one upsert.
    ///
    /// On failure the snapshot is merged back ahead of anything accumulated
    /// since, and the error is returned.
    pub async fn flush(&self, partition_id: &str) -> Result<u64> {
        let Some(state) = self.state(partition_id) else {
            return Ok(0);
        };
        let _flushing = state.flush_lock.lock().await;

        let (snapshot, is_fresh) = {
            let mut buf = state.buffer.lock().unwrap_or_else(|e| e.into_inner());
            (std::mem::take(&mut buf.buffer), buf.is_fresh)
        };
        if snapshot.is_empty() {
            return Ok(0);
        }

        let batch_size = snapshot.len();
        let ids: Vec<String> = snapshot.iter().map(|r| r.item_id.clone()).collect();
        let options = UpsertOptions {
            skip_lookup: is_fresh,
        };

        let flush_start = Instant::now();
        match self.store.upsert_by_key(snapshot.clone(), options).await {
            Ok(summary) => {
                {
                    let mut buf = state.buffer.lock().unwrap_or_else(|e| e.into_inner());
                    buf.total_flushed += batch_size as u64;
                    buf.is_fresh = false;
                }
                tracing::debug!(
                    partition_id,
                    batch_size,
                    inserted = summary.inserted,
                    updated = summary.updated,
                    fell_back = summary.fell_back,
                    elapsed_ms = flush_start.elapsed().as_millis(),
                    "Flushed batch"
                );

                self.bus.emit_bulk_added(partition_id, ids);
                match self.store.count_by_partition(partition_id).await {
                    Ok(total) => {
                        self.bus.emit_count_updated(partition_id, total);
                    }
                    Err(e) => {
                        tracing::warn!(partition_id, error = %e, "Failed to count partition after flush");
                    }
                }

                Ok(batch_size as u64)
            }
            Err(e) => {
                {
                    let mut buf = state.buffer.lock().unwrap_or_else(|e| e.into_inner());
                    let newer = std::mem::replace(&mut buf.buffer, snapshot);
                    buf.buffer.extend(newer);
                }
                tracing::warn!(
                    partition_id,
                    batch_size,
                    elapsed_ms = flush_start.elapsed().as_millis(),
                    error = %e,
                    "Failed to flush batch, records kept for the next flush"
                );

                let err = IngestError::from(e);
                self.bus.emit_error(
                    partition_id,
                    err.report(),
                    Some(serde_json::json!({ "phase": "flush", "batchSize": batch_size })),
                );
                Err(err)
            }
        }
    }

    /// Optionally flush a partition, then discard its state.
    ///
    /// If the flush fails the state is kept and the error returned.
    pub async fn clear_accumulator(&self, partition_id: &str, flush: bool) -> Result<u64> {
        let flushed = if flush {
            self.flush(partition_id).await?
        } else {
            0
        };

        let removed = self
            .partitions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(partition_id);
        if let Some(state) = removed {
            let dropped = state.snapshot().buffered;
            if dropped > 0 {
                tracing::debug!(partition_id, dropped, "Discarded buffered records");
            }
        }

        Ok(flushed)
    }

    /// Clear every partition. Returns the first flush error, after trying
    /// all of them.
    pub async fn clear_all(&self, flush: bool) -> Result<u64> {
        let mut flushed = 0;
        let mut first_error = None;
        for partition_id in self.partitions() {
            match self.clear_accumulator(&partition_id, flush).await {
                Ok(n) => flushed += n,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(flushed),
        }
    }

    pub fn snapshot(&self, partition_id: &str) -> Option<AccumulatorSnapshot> {
        self.state(partition_id).map(|state| state.snapshot())
    }

    /// Partitions with live buffer state, sorted.
    pub fn partitions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .partitions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
