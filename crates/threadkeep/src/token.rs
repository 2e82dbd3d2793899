//! Continuation-token extraction.
//!
//! Upstream responses hide the next-page token in different places. The
//! [`TokenExtractor`] tries an ordered list of strategies and reports which
//! one matched, so callers can log when a fallback kicked in.

use serde_json::Value;

use crate::source::RawPage;

/// Where a continuation token was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenStrategy {
    /// The source set [`RawPage::next_token`] itself.
    Explicit,
    /// A known JSON pointer into the response envelope.
    ExactPath(String),
    /// A bounded-depth search of the envelope for a known key.
    DeepSearch,
}

/// An extracted token and the strategy that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenMatch {
    pub token: String,
    pub strategy: TokenStrategy,
}

const DEFAULT_PATHS: &[&str] = &[
    "/nextToken",
    "/next_token",
    "/continuation",
    "/nextPageToken",
    "/continuations/0/nextContinuationData/continuation",
];

const DEFAULT_DEEP_KEYS: &[&str] = &["continuation", "nextPageToken", "nextToken", "token"];

/// Default depth limit for [`TokenStrategy::DeepSearch`].
pub const DEFAULT_MAX_DEPTH: usize = 8;

/// Ordered token extraction strategies.
#[derive(Debug, Clone)]
pub struct TokenExtractor {
    paths: Vec<String>,
    deep_keys: Vec<String>,
    max_depth: usize,
}

impl Default for TokenExtractor {
    fn default() -> Self {
        Self {
            paths: DEFAULT_PATHS.iter().map(|p| (*p).to_string()).collect(),
            deep_keys: DEFAULT_DEEP_KEYS.iter().map(|k| (*k).to_string()).collect(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl TokenExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the exact JSON pointer paths, tried in order.
    #[must_use]
    pub fn with_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the key names matched by the deep search.
    #[must_use]
    pub fn with_deep_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deep_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Limit the deep search depth (0 disables it).
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Find the next-page token of a page.
    ///
    /// Strategies run in order: explicit, exact paths, deep search. Empty
    /// strings never count as tokens. Items are not searched, so a reply
    /// token inside a comment is never mistaken for the page cursor.
    pub fn extract(&self, page: &RawPage) -> Option<TokenMatch> {
        if let Some(token) = page.next_token.as_deref().filter(|t| !t.is_empty()) {
            return Some(TokenMatch {
                token: token.to_string(),
                strategy: TokenStrategy::Explicit,
            });
        }

        for path in &self.paths {
            if let Some(token) = page
                .envelope
                .pointer(path)
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
            {
                return Some(TokenMatch {
                    token: token.to_string(),
                    strategy: TokenStrategy::ExactPath(path.clone()),
                });
            }
        }

        self.deep_search(&page.envelope, 0).map(|token| TokenMatch {
            token,
            strategy: TokenStrategy::DeepSearch,
        })
    }

    fn deep_search(&self, value: &Value, depth: usize) -> Option<String> {
        if depth >= self.max_depth {
            return None;
        }

        match value {
            Value::Object(map) => {
                for key in &self.deep_keys {
                    if let Some(token) = map.get(key).and_then(Value::as_str)
                        && !token.is_empty()
                    {
                        return Some(token.to_string());
                    }
                }
                map.values()
                    .find_map(|child| self.deep_search(child, depth + 1))
            }
            Value::Array(items) => items
                .iter()
                .find_map(|child| self.deep_search(child, depth + 1)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn page(envelope: Value) -> RawPage {
        RawPage {
            items: Vec::new(),
            next_token: None,
            envelope,
        }
    }

    #[test]
    fn explicit_token_wins() {
        let mut p = page(json!({"nextToken": "from-envelope"}));
        p.next_token = Some("explicit".to_string());
        let found = TokenExtractor::new().extract(&p).expect("token");
        assert_eq!(found.token, "explicit");
        assert_eq!(found.strategy, TokenStrategy::Explicit);
    }

    #[test]
    fn exact_paths_are_tried_in_order() {
        let p = page(json!({
            "continuation": "second",
            "next_token": "first",
        }));
        let found = TokenExtractor::new().extract(&p).expect("token");
        assert_eq!(found.token, "first");
        assert_eq!(
            found.strategy,
            TokenStrategy::ExactPath("/next_token".to_string())
        );
    }

    #[test]
    fn nested_path_matches() {
        let p = page(json!({
            "continuations": [{"nextContinuationData": {"continuation": "deep-known"}}]
        }));
        let found = TokenExtractor::new().extract(&p).expect("token");
        assert_eq!(found.token, "deep-known");
        assert!(matches!(found.strategy, TokenStrategy::ExactPath(_)));
    }

    #[test]
    fn deep_search_finds_unknown_nesting() {
        let p = page(json!({
            "response": {"footer": [{"meta": {"token": "found-it"}}]}
        }));
        let found = TokenExtractor::new().extract(&p).expect("token");
        assert_eq!(found.token, "found-it");
        assert_eq!(found.strategy, TokenStrategy::DeepSearch);
    }

    #[test]
    fn deep_search_respects_depth_limit() {
        let p = page(json!({"a": {"b": {"c": {"token": "too-deep"}}}}));
        assert!(TokenExtractor::new().with_max_depth(2).extract(&p).is_none());
        assert!(TokenExtractor::new().with_max_depth(4).extract(&p).is_some());
    }

    #[test]
    fn empty_strings_and_items_are_ignored() {
        let mut p = page(json!({"nextToken": "", "meta": {"continuation": ""}}));
        p.items = vec![json!({"replyToken": "r", "continuation": "item-level"})];
        assert!(TokenExtractor::new().extract(&p).is_none());
    }

    #[test]
    fn custom_paths_replace_defaults() {
        let p = page(json!({"paging": {"after": "cursor-2"}}));
        let extractor = TokenExtractor::new()
            .with_paths(["/paging/after"])
            .with_deep_keys(Vec::<String>::new());
        let found = extractor.extract(&p).expect("token");
        assert_eq!(found.token, "cursor-2");
    }
}
