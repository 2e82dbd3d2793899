//! Reply work ordering and dispatch pacing.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::error::Result;
use crate::record::{Record, ReplyTask};
use crate::store::DedupUpsertStore;

/// Default jitter applied around the pacing base delay (±15%).
pub const DEFAULT_PACING_JITTER: f64 = 0.15;

/// Orders reply threads so the largest ones are fetched first.
pub struct PriorityReplyScheduler {
    store: Arc<dyn DedupUpsertStore>,
}

impl PriorityReplyScheduler {
    pub fn new(store: Arc<dyn DedupUpsertStore>) -> Self {
        Self { store }
    }

    /// Turn records into reply tasks, highest `reply_count` first.
    ///
    /// Records without replies or without a stored reply token are dropped.
    /// Ties keep their input order.
    pub fn prioritize(records: &[Record]) -> Vec<ReplyTask> {
        let mut candidates: Vec<&Record> = records
            .iter()
            .filter(|r| r.reply_count > 0)
            .filter(|r| r.reply_token.as_deref().is_some_and(|t| !t.is_empty()))
            .collect();
        candidates.sort_by(|a, b| b.reply_count.cmp(&a.reply_count));

        candidates
            .into_iter()
            .map(|r| ReplyTask::new(&r.partition_id, &r.item_id, r.reply_token.clone()))
            .collect()
    }

    /// Reply tasks for every known thread in a partition.
    pub async fn schedule(&self, partition_id: &str) -> Result<Vec<ReplyTask>> {
        let threads = self.store.reply_threads(partition_id).await?;
        let known = threads.len();
        let tasks = Self::prioritize(&threads);
        tracing::debug!(
            partition_id,
            known,
            scheduled = tasks.len(),
            "Scheduled reply fetches"
        );
        Ok(tasks)
    }
}

/// Jittered delay between dispatches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pacing {
    base: Duration,
    /// Fraction of `base` the delay may vary by in either direction, in `[0, 1]`.
    jitter: f64,
}

impl Pacing {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            jitter: DEFAULT_PACING_JITTER,
        }
    }

    /// Set the jitter fraction. Values outside `[0, 1]` are clamped and NaN
    /// disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_nan() { 0.0 } else { jitter.clamp(0.0, 1.0) };
        self
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// A delay in `base * [1 - jitter, 1 + jitter]`.
    pub fn next_delay(&self) -> Duration {
        if self.base.is_zero() || self.jitter <= 0.0 {
            return self.base;
        }
        let factor = rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        self.base.mul_f64(factor)
    }
}

/// Spaces out dispatches shared by many workers.
#[derive(Debug)]
pub struct Pacer {
    pacing: Pacing,
    next_slot: tokio::sync::Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(pacing: Pacing) -> Self {
        Self {
            pacing,
            next_slot: tokio::sync::Mutex::new(None),
        }
    }

    /// Wait for the next dispatch slot. The first call returns immediately.
    pub async fn wait(&self) {
        let mut next_slot = self.next_slot.lock().await;
        if let Some(at) = *next_slot
            && at > Instant::now()
        {
            tokio::time::sleep_until(at).await;
        }
        *next_slot = Some(Instant::now() + self.pacing.next_delay());
    }
}
