//! Engine-level error taxonomy.
//!
//! Every error that leaves the engine carries a machine-readable
//! [`ErrorKind`] and can be turned into an [`ErrorReport`] for a UI layer to
//! render. The engine never formats user-facing text itself.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::source::FetchError;
use crate::store::StoreError;

/// Machine-readable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network failure or 5xx; retryable.
    TransientNetwork,
    /// Server-imposed throttling; pause and retry.
    RateLimited,
    /// Non-retryable fetch failure (e.g. non-429 4xx, malformed page).
    PermanentFetch,
    /// The session was cancelled. Never counted as a failure.
    Cancelled,
    /// The durable store rejected a read or write.
    Storage,
    /// Caller supplied unusable input.
    InvalidInput,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransientNetwork => "transient_network",
            Self::RateLimited => "rate_limited",
            Self::PermanentFetch => "permanent_fetch",
            Self::Cancelled => "cancelled",
            Self::Storage => "storage",
            Self::InvalidInput => "invalid_input",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured `{kind, message}` attached to every surfaced error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorReport {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Errors surfaced by the crawler, accumulator and reply queue.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Transient network error: {message}")]
    TransientNetwork { message: String },

    #[error("Rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Permanent fetch error: {message}")]
    PermanentFetch {
        status: Option<u16>,
        message: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },
}

impl IngestError {
    /// Create an invalid input error.
    #[inline]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientNetwork { .. } => ErrorKind::TransientNetwork,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::PermanentFetch { .. } => ErrorKind::PermanentFetch,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Storage(_) => ErrorKind::Storage,
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Structured report for this error.
    #[must_use]
    pub fn report(&self) -> ErrorReport {
        ErrorReport::new(self.kind(), self.to_string())
    }
}

impl From<FetchError> for IngestError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Transient { message, .. } => Self::TransientNetwork { message },
            FetchError::RateLimited { retry_after } => Self::RateLimited { retry_after },
            FetchError::Permanent { status, message } => Self::PermanentFetch { status, message },
            FetchError::Malformed { message } => Self::PermanentFetch {
                status: None,
                message,
            },
            FetchError::Cancelled => Self::Cancelled,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_errors_map_to_kinds() {
        let cases = [
            (FetchError::transient("reset"), ErrorKind::TransientNetwork),
            (
                FetchError::RateLimited { retry_after: None },
                ErrorKind::RateLimited,
            ),
            (FetchError::from_status(404, "gone"), ErrorKind::PermanentFetch),
            (FetchError::malformed("no items"), ErrorKind::PermanentFetch),
            (FetchError::Cancelled, ErrorKind::Cancelled),
        ];
        for (fetch_err, kind) in cases {
            assert_eq!(IngestError::from(fetch_err).kind(), kind);
        }
    }

    #[test]
    fn test_report_carries_kind_and_message() {
        let err = IngestError::invalid_input("partition id is empty");
        let report = err.report();
        assert_eq!(report.kind, ErrorKind::InvalidInput);
        assert!(report.message.contains("partition id is empty"));
    }

    #[test]
    fn test_report_serializes_kind_as_snake_case() {
        let report = ErrorReport::new(ErrorKind::TransientNetwork, "boom");
        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["kind"], "transient_network");
        assert_eq!(json["message"], "boom");
    }

    #[test]
    fn test_storage_error_converts() {
        let err: IngestError = StoreError::invalid_input("missing key").into();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(!err.is_cancelled());
        assert!(IngestError::Cancelled.is_cancelled());
    }
}
