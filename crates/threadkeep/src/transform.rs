//! Raw page normalization.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::record::{CommentLevel, Record};
use crate::source::{FetchError, RawPage};

/// Context a page was fetched in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformContext {
    pub partition_id: String,
    /// Set when the page belongs to a reply thread.
    pub parent_item_id: Option<String>,
}

impl TransformContext {
    pub fn main_thread(partition_id: impl Into<String>) -> Self {
        Self {
            partition_id: partition_id.into(),
            parent_item_id: None,
        }
    }

    pub fn replies(partition_id: impl Into<String>, parent_item_id: impl Into<String>) -> Self {
        Self {
            partition_id: partition_id.into(),
            parent_item_id: Some(parent_item_id.into()),
        }
    }
}

/// Turns a raw page into normalized records.
pub trait Transform: Send + Sync {
    fn normalize(&self, context: &TransformContext, page: &RawPage)
    -> Result<Vec<Record>, FetchError>;
}

impl<T: Transform + ?Sized> Transform for std::sync::Arc<T> {
    fn normalize(
        &self,
        context: &TransformContext,
        page: &RawPage,
    ) -> Result<Vec<Record>, FetchError> {
        (**self).normalize(context, page)
    }
}

/// Maps common JSON field names onto [`Record`].
///
/// Recognised fields: `itemId`/`id`, `parentId`, `replyCount`,
/// `replyToken`/`replyContinuation`, `author`, `text`, `likeCount` and
/// `publishedAt` (RFC 3339). The whole item is kept as payload. Items
/// without an id are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTransform;

impl JsonTransform {
    fn record_from(&self, context: &TransformContext, item: &Value) -> Option<Record> {
        let item_id = string_field(item, &["itemId", "id"])?;

        let parent_id = string_field(item, &["parentId"]).or_else(|| context.parent_item_id.clone());
        let level = if parent_id.is_some() {
            CommentLevel::Reply
        } else {
            CommentLevel::TopLevel
        };

        Some(Record {
            item_id,
            partition_id: context.partition_id.clone(),
            parent_id,
            level,
            reply_count: item
                .get("replyCount")
                .and_then(count_value)
                .unwrap_or(0),
            reply_token: string_field(item, &["replyToken", "replyContinuation"]),
            author: string_field(item, &["author"]),
            text: string_field(item, &["text"]),
            like_count: item
                .get("likeCount")
                .and_then(count_value)
                .and_then(|n| i64::try_from(n).ok()),
            published_at: item
                .get("publishedAt")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc)),
            payload: item.clone(),
        })
    }
}

impl Transform for JsonTransform {
    fn normalize(
        &self,
        context: &TransformContext,
        page: &RawPage,
    ) -> Result<Vec<Record>, FetchError> {
        let mut records = Vec::with_capacity(page.items.len());
        for (index, item) in page.items.iter().enumerate() {
            if !item.is_object() {
                return Err(FetchError::malformed(format!(
                    "item {index} is not a JSON object"
                )));
            }
            match self.record_from(context, item) {
                Some(record) => records.push(record),
                None => tracing::warn!(
                    partition_id = %context.partition_id,
                    index,
                    "Skipping item without an id"
                ),
            }
        }
        Ok(records)
    }
}

/// First non-empty string (or number, rendered) among `keys`.
fn string_field(item: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match item.get(*key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Parse a count given as a number or a numeric string ("1,204" included).
fn count_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.replace(',', "").trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn maps_top_level_fields() {
        let page = RawPage::new(
            vec![json!({
                "id": "c1",
                "author": "ann",
                "text": "first!",
                "replyCount": "1,204",
                "replyToken": "rt-1",
                "likeCount": 7,
                "publishedAt": "2026-03-01T12:00:00Z",
            })],
            None,
        );
        let records = JsonTransform
            .normalize(&TransformContext::main_thread("v1"), &page)
            .expect("normalize");

        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.item_id, "c1");
        assert_eq!(r.partition_id, "v1");
        assert_eq!(r.level, CommentLevel::TopLevel);
        assert_eq!(r.reply_count, 1204);
        assert_eq!(r.reply_token.as_deref(), Some("rt-1"));
        assert_eq!(r.like_count, Some(7));
        assert!(r.published_at.is_some());
        assert_eq!(r.payload["author"], "ann");
    }

    #[test]
    fn reply_context_sets_parent_and_level() {
        let page = RawPage::new(vec![json!({"itemId": 42, "text": "re"})], None);
        let records = JsonTransform
            .normalize(&TransformContext::replies("v1", "c1"), &page)
            .expect("normalize");

        assert_eq!(records[0].item_id, "42");
        assert_eq!(records[0].parent_id.as_deref(), Some("c1"));
        assert_eq!(records[0].level, CommentLevel::Reply);
    }

    #[test]
    fn items_without_id_are_skipped() {
        let page = RawPage::new(vec![json!({"text": "anon"}), json!({"id": "c2"})], None);
        let records = JsonTransform
            .normalize(&TransformContext::main_thread("v1"), &page)
            .expect("normalize");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].item_id, "c2");
    }

    #[test]
    fn non_object_items_are_malformed() {
        let page = RawPage::new(vec![json!("just a string")], None);
        let err = JsonTransform
            .normalize(&TransformContext::main_thread("v1"), &page)
            .expect_err("malformed");
        assert!(matches!(err, FetchError::Malformed { .. }));
    }
}
