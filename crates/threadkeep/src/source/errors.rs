use std::time::Duration;

use thiserror::Error;

/// Classified failure of a single page fetch.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Network failure, timeout or 5xx. Retryable.
    #[error("Network error: {message}")]
    Transient {
        status: Option<u16>,
        message: String,
    },

    /// The server asked us to slow down (HTTP 429).
    #[error("Rate limit exceeded")]
    RateLimited { retry_after: Option<Duration> },

    /// Non-retryable failure such as a non-429 4xx.
    #[error("Request rejected ({status:?}): {message}")]
    Permanent {
        status: Option<u16>,
        message: String,
    },

    /// The page could not be interpreted.
    #[error("Malformed page: {message}")]
    Malformed { message: String },

    /// The fetch was abandoned because the session was cancelled.
    #[error("Fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Create a transient network error.
    #[inline]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            status: None,
            message: message.into(),
        }
    }

    /// Create a permanent error without a status code.
    #[inline]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            status: None,
            message: message.into(),
        }
    }

    /// Create a malformed page error.
    #[inline]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    /// Classify a non-success HTTP status.
    ///
    /// 429 is a rate limit, 408 and 5xx are transient, any other status is
    /// permanent.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => Self::RateLimited { retry_after: None },
            408 | 500..=599 => Self::Transient {
                status: Some(status),
                message,
            },
            _ => Self::Permanent {
                status: Some(status),
                message,
            },
        }
    }

    /// Attach a server-provided `Retry-After` to a rate limit error.
    #[must_use]
    pub fn with_retry_after(self, retry_after: Option<Duration>) -> Self {
        match self {
            Self::RateLimited { .. } => Self::RateLimited { retry_after },
            other => other,
        }
    }

    /// Check if this error is a rate limit signal.
    #[inline]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Check if retrying with backoff may succeed.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Extract a short error message suitable for logs and progress events.
///
/// Takes the first line of the error's display output.
#[inline]
pub fn short_error_message(e: &impl std::error::Error) -> String {
    let full = e.to_string();
    full.lines().next().unwrap_or(&full).to_string()
}

/// Result type for fetch operations.
pub type Result<T> = std::result::Result<T, FetchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_classification() {
        assert!(FetchError::from_status(429, "slow down").is_rate_limited());
        assert!(FetchError::from_status(503, "unavailable").is_transient());
        assert!(FetchError::from_status(408, "timeout").is_transient());
        assert!(matches!(
            FetchError::from_status(403, "forbidden"),
            FetchError::Permanent {
                status: Some(403),
                ..
            }
        ));
        assert!(matches!(
            FetchError::from_status(302, "redirect"),
            FetchError::Permanent { .. }
        ));
    }

    #[test]
    fn test_with_retry_after_only_touches_rate_limits() {
        let err = FetchError::from_status(429, "").with_retry_after(Some(Duration::from_secs(5)));
        assert!(matches!(
            err,
            FetchError::RateLimited {
                retry_after: Some(d)
            } if d == Duration::from_secs(5)
        ));

        let err = FetchError::transient("x").with_retry_after(Some(Duration::from_secs(5)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_short_error_message_takes_first_line() {
        let err = FetchError::transient("connection reset\nbacktrace follows");
        assert_eq!(short_error_message(&err), "Network error: connection reset");
    }
}
