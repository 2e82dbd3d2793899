use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::scheduler::Pacing;
use crate::token::TokenExtractor;

/// Default number of reply threads fetched at once.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default pause after a rate limit signal.
pub const DEFAULT_RATE_LIMIT_COOLDOWN: Duration = Duration::from_millis(60_000);

/// Default timeout for a single page request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Default number of rate limit hits one task may absorb before failing.
pub const DEFAULT_MAX_RATE_LIMIT_HITS: u32 = 5;

/// Reply queue tuning.
#[derive(Debug, Clone)]
pub struct ReplyQueueConfig {
    /// Maximum number of tasks executing at once.
    pub concurrency: usize,
    /// Backoff for transient failures. Rate limits never consume it.
    pub retry: RetryPolicy,
    /// Cooldown after a rate limit when the server gives no `Retry-After`.
    pub rate_limit_cooldown: Duration,
    pub request_timeout: Duration,
    /// Rate limit hits one task may absorb before it fails. `None` waits
    /// out every cooldown.
    pub max_rate_limit_hits: Option<u32>,
    /// Optional jittered delay between task dispatches.
    pub pacing: Option<Pacing>,
    pub token_extractor: TokenExtractor,
}

impl Default for ReplyQueueConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            rate_limit_cooldown: DEFAULT_RATE_LIMIT_COOLDOWN,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_rate_limit_hits: Some(DEFAULT_MAX_RATE_LIMIT_HITS),
            pacing: None,
            token_extractor: TokenExtractor::default(),
        }
    }
}

impl ReplyQueueConfig {
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.retry.initial_backoff = initial_backoff;
        self
    }

    #[must_use]
    pub fn with_rate_limit_cooldown(mut self, cooldown: Duration) -> Self {
        self.rate_limit_cooldown = cooldown;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_rate_limit_hits(mut self, max_hits: Option<u32>) -> Self {
        self.max_rate_limit_hits = max_hits;
        self
    }

    #[must_use]
    pub fn with_pacing(mut self, pacing: Option<Pacing>) -> Self {
        self.pacing = pacing;
        self
    }

    #[must_use]
    pub fn with_token_extractor(mut self, extractor: TokenExtractor) -> Self {
        self.token_extractor = extractor;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ReplyQueueConfig::default();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.initial_backoff, Duration::from_secs(2));
        assert_eq!(config.rate_limit_cooldown, Duration::from_secs(60));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.pacing.is_none());
    }

    #[test]
    fn concurrency_is_at_least_one() {
        assert_eq!(ReplyQueueConfig::default().with_concurrency(0).concurrency, 1);
    }
}
