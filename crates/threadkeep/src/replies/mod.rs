//! Bounded-concurrency reply fetching.

mod config;
mod limiter;
mod queue;
mod task;

pub use config::{
    DEFAULT_CONCURRENCY, DEFAULT_MAX_RATE_LIMIT_HITS, DEFAULT_RATE_LIMIT_COOLDOWN,
    DEFAULT_REQUEST_TIMEOUT, ReplyQueueConfig,
};
pub use limiter::{AdaptiveLimiter, LimitState};
pub use queue::{
    AllCompleteCallback, BatchSummary, RateLimitCallback, RateLimitNotice, ReplyCallbacks,
    ReplyProgress, ReplyWorkQueue, TaskId, TaskReport, TaskSettledCallback, TaskStatus,
};
