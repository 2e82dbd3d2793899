//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use threadkeep::{FetchError, FetchOptions, RawPage, RemoteCommentSource};

/// Replays scripted responses per continuation token.
///
/// Each token holds a queue of responses; the last one repeats once the
/// queue is down to a single entry. Unknown tokens fail permanently.
#[derive(Default)]
pub struct ScriptedSource {
    scripts: Mutex<HashMap<String, VecDeque<Result<RawPage, FetchError>>>>,
    latency: Duration,
    fetched: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn respond(self, token: &str, response: Result<RawPage, FetchError>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(token.to_string())
            .or_default()
            .push_back(response);
        self
    }

    pub fn page(self, token: &str, items: Vec<Value>, next: Option<&str>) -> Self {
        self.respond(token, Ok(RawPage::new(items, next.map(str::to_string))))
    }

    /// Tokens requested so far, in order.
    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetched.lock().unwrap().len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteCommentSource for ScriptedSource {
    async fn fetch_page(&self, token: &str, _options: &FetchOptions) -> Result<RawPage, FetchError> {
        self.fetched.lock().unwrap().push(token.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(token) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) if !queue.is_empty() => queue[0].clone(),
            _ => Err(FetchError::permanent(format!("unknown token {token}"))),
        }
    }
}

/// A top-level comment item.
pub fn comment(id: &str) -> Value {
    json!({ "id": id, "text": format!("comment {id}") })
}

/// A top-level comment item with a reply thread.
pub fn thread(id: &str, replies: u64, token: &str) -> Value {
    json!({ "id": id, "replyCount": replies, "replyToken": token })
}

pub fn items(ids: &[&str]) -> Vec<Value> {
    ids.iter().map(|id| comment(id)).collect()
}
