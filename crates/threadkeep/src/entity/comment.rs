//! Comment entity - one row per upstream comment or reply within a partition.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Comment model.
///
/// `(partition_id, item_id)` is the natural key and is unique. `id` is the
/// store-local surrogate key used to target updates in place.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "comments")]
pub struct Model {
    /// Internal UUID primary key.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    // ─── Identity ────────────────────────────────────────────────────────────
    /// Partition the comment belongs to (e.g. a video).
    pub partition_id: String,
    /// Stable upstream identifier.
    pub item_id: String,
    /// Upstream identifier of the parent comment, `None` for top-level comments.
    pub parent_id: Option<String>,
    /// 0 for top-level comments, 1 for replies.
    pub level: i16,

    // ─── Thread ──────────────────────────────────────────────────────────────
    /// Number of replies reported upstream.
    pub reply_count: i64,
    /// Continuation token for the first page of the reply thread.
    #[sea_orm(column_type = "Text", nullable)]
    pub reply_token: Option<String>,

    // ─── Content ─────────────────────────────────────────────────────────────
    pub author: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub text: Option<String>,
    pub like_count: Option<i64>,
    pub published_at: Option<DateTimeWithTimeZone>,

    /// The raw upstream item, kept verbatim.
    #[sea_orm(column_type = "Json")]
    pub payload: serde_json::Value,

    // ─── Tracking ────────────────────────────────────────────────────────────
    /// When this row was last written by the engine.
    pub synced_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Whether this row is a reply rather than a top-level comment.
    pub fn is_reply(&self) -> bool {
        self.parent_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_is_reply() {
        let mut model = Model {
            id: Uuid::new_v4(),
            partition_id: "v1".to_string(),
            item_id: "c1".to_string(),
            parent_id: None,
            level: 0,
            reply_count: 3,
            reply_token: Some("r1".to_string()),
            author: None,
            text: None,
            like_count: None,
            published_at: None,
            payload: serde_json::json!({}),
            synced_at: Utc::now().fixed_offset(),
        };
        assert!(!model.is_reply());

        model.parent_id = Some("c0".to_string());
        assert!(model.is_reply());
    }
}
