//! Normalized comment records and reply work items.
//!
//! [`Record`] is the engine's view of a comment, independent of how it is
//! stored. Conversion to and from the `comment` entity lives here so every
//! writer maps fields the same way.

use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::Set;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::comment::{ActiveModel as CommentActiveModel, Model as CommentModel};

/// Nesting level of a comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentLevel {
    /// A comment on the partition itself.
    TopLevel,
    /// A reply to a top-level comment.
    Reply,
}

impl CommentLevel {
    /// Stored representation (0 top-level, 1 reply).
    #[must_use]
    pub fn as_i16(self) -> i16 {
        match self {
            Self::TopLevel => 0,
            Self::Reply => 1,
        }
    }

    /// Parse the stored representation. Anything above zero is a reply.
    #[must_use]
    pub fn from_i16(value: i16) -> Self {
        if value > 0 { Self::Reply } else { Self::TopLevel }
    }
}

/// A normalized comment or reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable upstream key, unique within the partition.
    pub item_id: String,
    /// Partition the record belongs to.
    pub partition_id: String,
    /// Upstream key of the parent, `None` for top-level comments.
    pub parent_id: Option<String>,
    pub level: CommentLevel,
    /// Reply count reported upstream.
    pub reply_count: u64,
    /// Continuation token for the first page of this comment's replies.
    pub reply_token: Option<String>,
    pub author: Option<String>,
    pub text: Option<String>,
    pub like_count: Option<i64>,
    pub published_at: Option<DateTime<Utc>>,
    /// Opaque upstream payload.
    pub payload: serde_json::Value,
}

impl Record {
    /// Create a top-level record with empty content fields.
    pub fn top_level(partition_id: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            partition_id: partition_id.into(),
            parent_id: None,
            level: CommentLevel::TopLevel,
            reply_count: 0,
            reply_token: None,
            author: None,
            text: None,
            like_count: None,
            published_at: None,
            payload: serde_json::Value::Object(Default::default()),
        }
    }

    /// Create a reply record with empty content fields.
    pub fn reply(
        partition_id: impl Into<String>,
        parent_id: impl Into<String>,
        item_id: impl Into<String>,
    ) -> Self {
        Self {
            parent_id: Some(parent_id.into()),
            level: CommentLevel::Reply,
            ..Self::top_level(partition_id, item_id)
        }
    }

    /// Set the reply count and the token for the reply thread.
    #[must_use]
    pub fn with_replies(mut self, reply_count: u64, reply_token: Option<String>) -> Self {
        self.reply_count = reply_count;
        self.reply_token = reply_token;
        self
    }

    /// Set the comment text.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// The natural key `(partition_id, item_id)`.
    pub fn key(&self) -> (&str, &str) {
        (&self.partition_id, &self.item_id)
    }

    /// Convert to an active model carrying the given internal id.
    pub fn to_active_model(&self, id: Uuid, synced_at: DateTime<FixedOffset>) -> CommentActiveModel {
        CommentActiveModel {
            id: Set(id),
            partition_id: Set(self.partition_id.clone()),
            item_id: Set(self.item_id.clone()),
            parent_id: Set(self.parent_id.clone()),
            level: Set(self.level.as_i16()),
            reply_count: Set(i64::try_from(self.reply_count).unwrap_or(i64::MAX)),
            reply_token: Set(self.reply_token.clone()),
            author: Set(self.author.clone()),
            text: Set(self.text.clone()),
            like_count: Set(self.like_count),
            published_at: Set(self.published_at.map(|t| t.fixed_offset())),
            payload: Set(self.payload.clone()),
            synced_at: Set(synced_at),
        }
    }
}

impl From<CommentModel> for Record {
    fn from(model: CommentModel) -> Self {
        Self {
            item_id: model.item_id,
            partition_id: model.partition_id,
            parent_id: model.parent_id,
            level: CommentLevel::from_i16(model.level),
            reply_count: u64::try_from(model.reply_count).unwrap_or(0),
            reply_token: model.reply_token,
            author: model.author,
            text: model.text,
            like_count: model.like_count,
            published_at: model.published_at.map(|t| t.with_timezone(&Utc)),
            payload: model.payload,
        }
    }
}

/// One pending reply-thread fetch.
///
/// A task without a continuation token completes immediately without
/// fetching anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTask {
    pub partition_id: String,
    pub parent_item_id: String,
    pub continuation_token: Option<String>,
}

impl ReplyTask {
    pub fn new(
        partition_id: impl Into<String>,
        parent_item_id: impl Into<String>,
        continuation_token: Option<String>,
    ) -> Self {
        Self {
            partition_id: partition_id.into(),
            parent_item_id: parent_item_id.into(),
            continuation_token,
        }
    }

    /// The token to start from, ignoring empty strings.
    pub fn start_token(&self) -> Option<&str> {
        self.continuation_token
            .as_deref()
            .filter(|token| !token.is_empty())
    }
}
