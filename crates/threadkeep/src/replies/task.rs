//! One reply-thread fetch, run to a terminal state.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::IngestError;
use crate::record::ReplyTask;
use crate::source::{FetchError, FetchOptions};
use crate::store::UpsertOptions;
use crate::transform::TransformContext;

use super::queue::{BatchState, QueueShared, RateLimitNotice, TaskId, TaskReport};

/// Where a task stands between fetch attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Idle,
    /// Waiting to retry after the given number of transient failures.
    Retrying(u32),
    /// Waiting out a rate limit cooldown. Retries are carried over untouched.
    CoolingDown { retries: u32 },
}

impl TaskState {
    fn retries(self) -> u32 {
        match self {
            Self::Idle => 0,
            Self::Retrying(n) | Self::CoolingDown { retries: n } => n,
        }
    }

    /// Enter a cooldown, keeping the retry count.
    fn cool_down(self) -> Self {
        Self::CoolingDown {
            retries: self.retries(),
        }
    }

    /// State to resume in once a cooldown is over.
    fn resume(self) -> Self {
        match self {
            Self::CoolingDown { retries: 0 } => Self::Idle,
            Self::CoolingDown { retries } => Self::Retrying(retries),
            other => other,
        }
    }
}

#[tracing::instrument(
    skip_all,
    fields(task_id = id, partition_id = %task.partition_id, parent = %task.parent_item_id)
)]
pub(super) async fn run_task(
    shared: Arc<QueueShared>,
    id: TaskId,
    task: ReplyTask,
    batch: Arc<BatchState>,
) -> TaskReport {
    let report = TaskReport::new(id, &task);

    let Some(start) = task.start_token() else {
        tracing::debug!("No reply continuation, nothing to fetch");
        return report;
    };
    if shared.cancel.is_cancelled() {
        return report.cancelled();
    }

    if let Some(pacer) = &shared.pacer {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return report.cancelled(),
            _ = pacer.wait() => {}
        }
    }

    let token = start.to_string();
    fetch_thread(&shared, &task, &batch, report, token).await
}

async fn fetch_thread(
    shared: &QueueShared,
    task: &ReplyTask,
    batch: &BatchState,
    mut report: TaskReport,
    mut token: String,
) -> TaskReport {
    let context = TransformContext::replies(&task.partition_id, &task.parent_item_id);
    let options = FetchOptions::replies(shared.cancel.clone());
    let timeout = shared.config.request_timeout;
    let mut seen: HashSet<String> = HashSet::from([token.clone()]);
    let mut state = TaskState::Idle;
    let mut delays = shared.config.retry.delays();

    loop {
        let fetched = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => Err(FetchError::Cancelled),
            result = tokio::time::timeout(timeout, shared.source.fetch_page(&token, &options)) => {
                result.unwrap_or_else(|_| {
                    Err(FetchError::transient(format!(
                        "reply fetch timed out after {}ms",
                        timeout.as_millis()
                    )))
                })
            }
        };

        match fetched {
            Ok(page) => {
                if state != TaskState::Idle {
                    tracing::debug!(?state, "Reply fetch recovered");
                    state = TaskState::Idle;
                    delays = shared.config.retry.delays();
                }
                report.pages += 1;

                let records = match shared.transform.normalize(&context, &page) {
                    Ok(records) => records,
                    Err(e) => return report.fail(e.into()),
                };
                if !records.is_empty() {
                    let ids: Vec<String> = records.iter().map(|r| r.item_id.clone()).collect();
                    if let Err(e) = shared
                        .store
                        .upsert_by_key(records, UpsertOptions::default())
                        .await
                    {
                        return report.fail(e.into());
                    }
                    let count = ids.len() as u64;
                    report.replies_fetched += count;
                    shared.add_replies(count);
                    shared
                        .bus
                        .emit_replies_added(&task.partition_id, &task.parent_item_id, ids);
                }

                match shared.config.token_extractor.extract(&page) {
                    None => return report,
                    Some(next) if !seen.insert(next.token.clone()) => {
                        tracing::warn!(token = %next.token, "Reply continuation repeated, stopping");
                        return report;
                    }
                    Some(next) => token = next.token,
                }
            }

            Err(FetchError::Cancelled) => return report.cancelled(),

            Err(FetchError::RateLimited { retry_after }) => {
                report.rate_limit_hits += 1;
                if let Some(max) = shared.config.max_rate_limit_hits
                    && report.rate_limit_hits > max
                {
                    tracing::error!(hits = report.rate_limit_hits, "Rate limit persisted, giving up");
                    return report.fail(IngestError::RateLimited { retry_after });
                }

                state = state.cool_down();
                let cooldown = retry_after.unwrap_or(shared.config.rate_limit_cooldown);
                shared.limiter.enter_cooldown(cooldown);

                if let Some(cb) = &batch.on_rate_limited {
                    cb(&RateLimitNotice {
                        task_id: report.task_id,
                        partition_id: task.partition_id.clone(),
                        parent_item_id: task.parent_item_id.clone(),
                        cooldown,
                        hits: report.rate_limit_hits,
                        concurrency_limit: shared.limiter.limit(),
                    });
                }

                tracing::debug!(?state, cooldown_ms = cooldown.as_millis() as u64, "Waiting out rate limit");
                tokio::select! {
                    biased;
                    _ = shared.cancel.cancelled() => return report.cancelled(),
                    _ = shared.limiter.cooled_down() => {}
                }
                state = state.resume();
            }

            Err(e) if e.is_transient() => {
                let Some(delay) = delays.next() else {
                    tracing::error!(retries = state.retries(), error = %e, "Reply fetch retries exhausted");
                    return report.fail(e.into());
                };
                let attempt = state.retries() + 1;
                state = TaskState::Retrying(attempt);
                report.retries += 1;
                tracing::warn!(
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %e,
                    "Reply fetch failed, retrying"
                );
                tokio::select! {
                    biased;
                    _ = shared.cancel.cancelled() => return report.cancelled(),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            Err(e) => return report.fail(e.into()),
        }
    }
}
