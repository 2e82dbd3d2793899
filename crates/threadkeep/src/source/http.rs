//! JSON-over-HTTP comment source.
//!
//! The source POSTs `{"continuation": <token>, "isReply": <bool>}` to a
//! configured endpoint and expects a JSON page back. All I/O goes through the
//! [`HttpTransport`] trait so the classification logic can be tested without
//! sockets.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::errors::{FetchError, Result};
use super::{FetchOptions, RawPage, RemoteCommentSource};

/// HTTP headers represented as key/value pairs.
///
/// Header names are treated case-insensitively by helper functions.
pub type HttpHeaders = Vec<(String, String)>;

/// A JSON POST to the comment endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: HttpHeaders,
    pub body: Vec<u8>,
}

/// A minimal HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HttpHeaders,
    pub body: Vec<u8>,
}

impl HttpResponse {
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        header_get(&self.headers, name)
    }

    /// Whether the status is 2xx.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("http transport error: {0}")]
    Transport(String),

    #[error("no mock response registered for {url}")]
    NoMockResponse { url: String },
}

/// Transport boundary for all HTTP I/O.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, HttpError>;
}

/// Get the first header value matching `name` (case-insensitive).
#[must_use]
pub fn header_get<'a>(headers: &'a HttpHeaders, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Parse a `Retry-After` header given in seconds.
///
/// HTTP-date values are ignored; the queue's configured cooldown applies.
#[must_use]
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Longest response body excerpt kept in error messages.
const ERROR_BODY_EXCERPT: usize = 200;

/// A [`RemoteCommentSource`] speaking JSON over HTTP.
pub struct HttpCommentSource<T> {
    transport: T,
    endpoint: String,
    headers: HttpHeaders,
}

impl<T: HttpTransport> HttpCommentSource<T> {
    pub fn new(transport: T, endpoint: impl Into<String>) -> Self {
        Self {
            transport,
            endpoint: endpoint.into(),
            headers: Vec::new(),
        }
    }

    /// Add a header sent with every request.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn build_request(&self, token: &str, options: &FetchOptions) -> Result<HttpRequest> {
        let body = serde_json::to_vec(&serde_json::json!({
            "continuation": token,
            "isReply": options.is_reply,
        }))
        .map_err(|e| FetchError::permanent(e.to_string()))?;

        let mut headers = self.headers.clone();
        headers.push(("Content-Type".to_string(), "application/json".to_string()));
        headers.push(("Accept".to_string(), "application/json".to_string()));

        Ok(HttpRequest {
            url: self.endpoint.clone(),
            headers,
            body,
        })
    }
}

/// Turn a raw HTTP response into a page or a classified error.
pub(crate) fn page_from_response(resp: HttpResponse) -> Result<RawPage> {
    if !resp.is_success() {
        let excerpt: String = String::from_utf8_lossy(&resp.body)
            .chars()
            .take(ERROR_BODY_EXCERPT)
            .collect();
        let retry_after = parse_retry_after(resp.header("retry-after"));
        return Err(FetchError::from_status(resp.status, excerpt).with_retry_after(retry_after));
    }

    let body: serde_json::Value =
        serde_json::from_slice(&resp.body).map_err(|e| FetchError::malformed(e.to_string()))?;
    if !body.is_object() {
        return Err(FetchError::malformed("response body is not a JSON object"));
    }
    Ok(RawPage::from_body(body))
}

#[async_trait]
impl<T: HttpTransport> RemoteCommentSource for HttpCommentSource<T> {
    async fn fetch_page(&self, token: &str, options: &FetchOptions) -> Result<RawPage> {
        if options.cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let request = self.build_request(token, options)?;
        tracing::debug!(endpoint = %self.endpoint, is_reply = options.is_reply, "Fetching page");

        let resp = tokio::select! {
            biased;

            _ = options.cancel.cancelled() => return Err(FetchError::Cancelled),
            resp = self.transport.send(request) => {
                resp.map_err(|e| FetchError::transient(e.to_string()))?
            }
        };

        page_from_response(resp)
    }
}

#[cfg(feature = "http")]
pub mod reqwest_transport {
    use super::*;

    use std::time::Duration as StdDuration;

    /// A real HTTP transport backed by reqwest.
    #[derive(Clone)]
    pub struct ReqwestTransport {
        client: reqwest::Client,
    }

    impl ReqwestTransport {
        pub fn new(client: reqwest::Client) -> Self {
            Self { client }
        }

        pub fn with_timeout(timeout: StdDuration) -> std::result::Result<Self, HttpError> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| HttpError::Transport(e.to_string()))?;
            Ok(Self { client })
        }
    }

    #[async_trait]
    impl HttpTransport for ReqwestTransport {
        async fn send(
            &self,
            request: HttpRequest,
        ) -> std::result::Result<HttpResponse, HttpError> {
            let mut builder = self.client.post(&request.url);
            for (k, v) in request.headers {
                builder = builder.header(&k, &v);
            }

            if !request.body.is_empty() {
                builder = builder.body(request.body);
            }

            let resp = builder
                .send()
                .await
                .map_err(|e| HttpError::Transport(e.to_string()))?;

            let status = resp.status().as_u16();
            let headers: HttpHeaders = resp
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        value.to_str().unwrap_or_default().to_string(),
                    )
                })
                .collect();

            let body = resp
                .bytes()
                .await
                .map_err(|e| HttpError::Transport(e.to_string()))?
                .to_vec();

            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        }
    }
}

// ---------- Test-only mock transport ----------

#[cfg(test)]
use std::collections::{HashMap, VecDeque};
#[cfg(test)]
use std::sync::{Arc, Mutex};

/// In-memory mock transport.
///
/// This is designed for unit tests: no sockets, no loopback HTTP servers.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[cfg(test)]
#[derive(Default)]
struct MockTransportInner {
    routes: HashMap<String, VecDeque<HttpResponse>>,
    requests: Vec<HttpRequest>,
}

#[cfg(test)]
impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a response for a URL, returned in FIFO order.
    pub fn push_response(&self, url: impl Into<String>, response: HttpResponse) {
        let mut inner = self
            .inner
            .lock()
            .expect("mock transport lock should not be poisoned");
        inner
            .routes
            .entry(url.into())
            .or_default()
            .push_back(response);
    }

    #[must_use]
    pub fn requests(&self) -> Vec<HttpRequest> {
        let inner = self
            .inner
            .lock()
            .expect("mock transport lock should not be poisoned");
        inner.requests.clone()
    }
}

#[cfg(test)]
#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, HttpError> {
        let mut inner = self
            .inner
            .lock()
            .expect("mock transport lock should not be poisoned");

        let url = request.url.clone();
        inner.requests.push(request);

        match inner.routes.get_mut(&url).and_then(|q| q.pop_front()) {
            Some(resp) => Ok(resp),
            None => Err(HttpError::NoMockResponse { url }),
        }
    }
}
