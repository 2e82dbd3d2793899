//! Retry policy shared by the crawl source and the reply queue.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder, Retryable};

use crate::source::{FetchError, FetchOptions, RawPage, RemoteCommentSource, short_error_message};

/// Default initial backoff before the first retry.
pub const INITIAL_BACKOFF_MS: u64 = 2_000;

/// Default upper bound for a single backoff delay.
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// Default number of retries after the first attempt.
pub const MAX_RETRIES: usize = 3;

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry; doubles per attempt.
    pub initial_backoff: Duration,
    /// Maximum delay between retries.
    pub max_backoff: Duration,
    /// Maximum number of retry attempts.
    pub max_retries: usize,
    /// Whether to add jitter to delays.
    pub with_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
            max_retries: MAX_RETRIES,
            with_jitter: false,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(initial_backoff: Duration, max_retries: usize) -> Self {
        Self {
            initial_backoff,
            max_retries,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Set whether to use jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.with_jitter = jitter;
        self
    }

    /// Build an exponential backoff strategy from this policy.
    #[must_use]
    pub fn into_backoff(self) -> ExponentialBuilder {
        let mut builder = ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_factor(2.0)
            .with_max_times(self.max_retries);

        if self.with_jitter {
            builder = builder.with_jitter();
        }

        builder
    }

    /// The sequence of retry delays, one per allowed retry.
    pub fn delays(&self) -> ExponentialBackoff {
        self.clone().into_backoff().build()
    }
}

/// Retries transient fetch failures of the wrapped source with backoff.
///
/// Rate limits, permanent failures and cancellation pass straight through.
#[derive(Debug, Clone)]
pub struct RetryingSource<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: RemoteCommentSource> RetryingSource<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: RemoteCommentSource> RemoteCommentSource for RetryingSource<S> {
    async fn fetch_page(
        &self,
        token: &str,
        options: &FetchOptions,
    ) -> std::result::Result<RawPage, FetchError> {
        // Track attempt number for logging
        let attempt = AtomicU32::new(0);

        let fetch = || async {
            attempt.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch_page(token, options).await
        };

        fetch
            .retry(self.policy.clone().into_backoff())
            .when(|e: &FetchError| e.is_transient() && !options.cancel.is_cancelled())
            .notify(|err: &FetchError, dur: Duration| {
                tracing::warn!(
                    attempt = attempt.load(Ordering::SeqCst),
                    backoff_ms = dur.as_millis() as u64,
                    error = %short_error_message(err),
                    "Page fetch failed, retrying"
                );
            })
            .await
    }
}
