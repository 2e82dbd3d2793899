use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use super::errors::Result;
use super::{FetchOptions, RawPage, RemoteCommentSource};

/// Type alias for the governor rate limiter.
type GovernorRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Default client-side request rates (requests per second).
pub mod rate_limits {
    /// Conservative default for comment feeds.
    pub const DEFAULT_RPS: u32 = 5;
    /// Ceiling used when throttling is effectively disabled.
    pub const UNTHROTTLED_RPS: u32 = 1_000;
}

/// A standalone API rate limiter using the governor crate.
///
/// # Example
///
/// ```ignore
/// use threadkeep::source::ApiRateLimiter;
///
/// let limiter = ApiRateLimiter::new(5);
/// limiter.wait().await;
/// source.fetch_page(token, &options).await?;
/// ```
#[derive(Clone)]
pub struct ApiRateLimiter {
    inner: Arc<GovernorRateLimiter>,
}

impl ApiRateLimiter {
    /// Create a new rate limiter with the specified requests per second.
    ///
    /// A rate of 0 is treated as 1.
    pub fn new(requests_per_second: u32) -> Self {
        let rps = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            inner: Arc::new(RateLimiter::direct(Quota::per_second(rps))),
        }
    }

    /// Wait until a request is allowed by the rate limiter.
    pub async fn wait(&self) {
        self.inner.until_ready().await;
    }
}

impl std::fmt::Debug for ApiRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiRateLimiter").finish_non_exhaustive()
    }
}

/// A rate-limited wrapper around any [`RemoteCommentSource`].
///
/// Proactive throttling keeps the client under the server's limits; it does
/// not replace the reply queue's reaction to explicit 429 responses.
pub struct RateLimitedSource<S> {
    inner: S,
    limiter: ApiRateLimiter,
}

impl<S> RateLimitedSource<S> {
    pub fn new(inner: S, requests_per_second: u32) -> Self {
        Self {
            inner,
            limiter: ApiRateLimiter::new(requests_per_second),
        }
    }

    /// Share an existing limiter between several sources.
    pub fn with_limiter(inner: S, limiter: ApiRateLimiter) -> Self {
        Self { inner, limiter }
    }

    /// Get a reference to the inner source.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: Clone> Clone for RateLimitedSource<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
        }
    }
}

#[async_trait]
impl<S: RemoteCommentSource> RemoteCommentSource for RateLimitedSource<S> {
    async fn fetch_page(&self, token: &str, options: &FetchOptions) -> Result<RawPage> {
        self.limiter.wait().await;
        self.inner.fetch_page(token, options).await
    }
}
