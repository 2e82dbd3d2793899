//! Remote comment source boundary.
//!
//! A [`RemoteCommentSource`] turns a continuation token into one raw page.
//! Transport, authentication and request signing live behind this trait;
//! the engine only sees [`RawPage`] values and classified [`FetchError`]s.

mod errors;
mod rate_limit;

pub mod http;

use async_trait::async_trait;
use serde_json::Value;

use crate::cancel::CancelSignal;

pub use errors::{FetchError, Result, short_error_message};
pub use rate_limit::{ApiRateLimiter, RateLimitedSource, rate_limits};

/// One page as returned by the remote source.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawPage {
    /// Raw items on this page, in upstream order.
    pub items: Vec<Value>,
    /// Next-page token when the source already knows it.
    pub next_token: Option<String>,
    /// The rest of the response body (everything except the items).
    pub envelope: Value,
}

impl RawPage {
    /// A page with an explicit next token and no envelope.
    pub fn new(items: Vec<Value>, next_token: Option<String>) -> Self {
        Self {
            items,
            next_token,
            envelope: Value::Null,
        }
    }

    /// Split a JSON response body into items and envelope.
    ///
    /// Items are taken from the first of `items`, `comments` or `replies`
    /// holding an array. The next token is left for token extraction.
    pub fn from_body(mut body: Value) -> Self {
        let key = ["items", "comments", "replies"]
            .into_iter()
            .find(|key| body.get(*key).is_some_and(Value::is_array));
        let items = match key.and_then(|key| body.as_object_mut()?.remove(key)) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        };

        Self {
            items,
            next_token: None,
            envelope: body,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Options passed with every page request.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Whether the token points into a reply thread.
    pub is_reply: bool,
    /// Session cancellation; sources should abort in-flight requests on it.
    pub cancel: CancelSignal,
}

impl FetchOptions {
    pub fn main_thread(cancel: CancelSignal) -> Self {
        Self {
            is_reply: false,
            cancel,
        }
    }

    pub fn replies(cancel: CancelSignal) -> Self {
        Self {
            is_reply: true,
            cancel,
        }
    }
}

/// Fetches raw pages by continuation token.
///
/// Implementations classify failures into [`FetchError`] variants; retrying
/// transient failures during the main crawl is the implementation's concern.
#[async_trait]
pub trait RemoteCommentSource: Send + Sync {
    async fn fetch_page(&self, token: &str, options: &FetchOptions) -> Result<RawPage>;
}

#[async_trait]
impl<S: RemoteCommentSource + ?Sized> RemoteCommentSource for std::sync::Arc<S> {
    async fn fetch_page(&self, token: &str, options: &FetchOptions) -> Result<RawPage> {
        (**self).fetch_page(token, options).await
    }
}
