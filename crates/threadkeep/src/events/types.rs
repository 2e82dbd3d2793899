use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorReport;

/// Closed taxonomy of cache mutation events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeEventType {
    Added,
    Updated,
    Deleted,
    BulkAdded,
    RepliesAdded,
    CountUpdated,
    ErrorOccurred,
}

impl ChangeEventType {
    pub const ALL: [ChangeEventType; 7] = [
        Self::Added,
        Self::Updated,
        Self::Deleted,
        Self::BulkAdded,
        Self::RepliesAdded,
        Self::CountUpdated,
        Self::ErrorOccurred,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::BulkAdded => "bulk-added",
            Self::RepliesAdded => "replies-added",
            Self::CountUpdated => "count-updated",
            Self::ErrorOccurred => "error-occurred",
        }
    }
}

impl std::fmt::Display for ChangeEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied part of an event. The bus adds the type and timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPayload {
    pub partition_id: String,
    pub count: Option<u64>,
    pub ids: Option<Vec<String>>,
    pub metadata: Option<serde_json::Value>,
    pub error: Option<ErrorReport>,
}

impl EventPayload {
    pub fn new(partition_id: impl Into<String>) -> Self {
        Self {
            partition_id: partition_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    #[must_use]
    pub fn with_ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: ErrorReport) -> Self {
        self.error = Some(error);
        self
    }
}

/// An immutable notification of a cache mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub event_type: ChangeEventType,
    pub partition_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

impl ChangeEvent {
    /// Stamp a payload with its type and the current time.
    pub fn new(event_type: ChangeEventType, payload: EventPayload) -> Self {
        Self {
            event_type,
            partition_id: payload.partition_id,
            count: payload.count,
            ids: payload.ids,
            timestamp: Utc::now(),
            metadata: payload.metadata,
            error: payload.error,
        }
    }
}
