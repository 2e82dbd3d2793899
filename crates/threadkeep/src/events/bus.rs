use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ErrorReport;

use super::types::{ChangeEvent, ChangeEventType, EventPayload};

/// Error returned by a failing handler. Counted and logged, never propagated.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Shared event handler.
pub type EventHandler = Arc<dyn Fn(&ChangeEvent) -> Result<(), HandlerError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Type(ChangeEventType),
    All,
}

struct Subscriber {
    id: u64,
    target: Target,
    handler: EventHandler,
    once: bool,
    fired: AtomicBool,
}

/// Emission statistics. Snapshots returned by [`ChangeEventBus::stats`] are
/// copies.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStats {
    pub total_events_emitted: u64,
    pub events_by_type: HashMap<ChangeEventType, u64>,
    pub total_handler_errors: u64,
    pub last_event_timestamp: Option<DateTime<Utc>>,
}

impl EventStats {
    /// Events emitted of one type.
    pub fn count_of(&self, event_type: ChangeEventType) -> u64 {
        self.events_by_type.get(&event_type).copied().unwrap_or(0)
    }
}

#[derive(Default)]
struct BusInner {
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
    stats: Mutex<EventStats>,
}

impl BusInner {
    fn remove(&self, id: u64) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }
}

/// Handle returned by every subscription.
///
/// Dropping the handle keeps the subscription alive; call
/// [`Unsubscribe::unsubscribe`] to remove it.
#[derive(Debug, Clone)]
pub struct Unsubscribe {
    id: u64,
    bus: Weak<BusInner>,
}

impl Unsubscribe {
    /// Remove the subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self) -> bool {
        self.bus.upgrade().is_some_and(|bus| bus.remove(self.id))
    }
}

impl std::fmt::Debug for BusInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusInner").finish_non_exhaustive()
    }
}

/// In-process publish/subscribe for cache mutations.
///
/// Dispatch is synchronous: [`ChangeEventBus::emit`] runs every matching
/// per-type handler, then every global handler, in subscription order. The
/// handler set is captured before dispatch, so subscribing or unsubscribing
/// from inside a handler only affects later emits.
#[derive(Clone, Default)]
pub struct ChangeEventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for ChangeEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeEventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl ChangeEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribe<F>(&self, target: Target, once: bool, handler: F) -> Unsubscribe
    where
        F: Fn(&ChangeEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber {
            id,
            target,
            handler: Arc::new(handler),
            once,
            fired: AtomicBool::new(false),
        });
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(subscriber);

        Unsubscribe {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Subscribe to one event type.
    pub fn on<F>(&self, event_type: ChangeEventType, handler: F) -> Unsubscribe
    where
        F: Fn(&ChangeEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe(Target::Type(event_type), false, handler)
    }

    /// Subscribe to every event type.
    pub fn on_all<F>(&self, handler: F) -> Unsubscribe
    where
        F: Fn(&ChangeEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe(Target::All, false, handler)
    }

    /// Subscribe to the next event of one type only.
    pub fn once<F>(&self, event_type: ChangeEventType, handler: F) -> Unsubscribe
    where
        F: Fn(&ChangeEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe(Target::Type(event_type), true, handler)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Stamp and dispatch an event. Returns the dispatched event.
    pub fn emit(&self, event_type: ChangeEventType, payload: EventPayload) -> ChangeEvent {
        let event = ChangeEvent::new(event_type, payload);

        {
            let mut stats = self.inner.stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.total_events_emitted += 1;
            *stats.events_by_type.entry(event_type).or_insert(0) += 1;
            stats.last_event_timestamp = Some(event.timestamp);
        }

        let handlers: Vec<Arc<Subscriber>> = {
            let subscribers = self
                .inner
                .subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let typed = subscribers
                .iter()
                .filter(|s| s.target == Target::Type(event_type));
            let global = subscribers.iter().filter(|s| s.target == Target::All);
            typed.chain(global).cloned().collect()
        };

        let mut failures = 0u64;
        for subscriber in handlers {
            if subscriber.once {
                if subscriber.fired.swap(true, Ordering::AcqRel) {
                    continue;
                }
                self.inner.remove(subscriber.id);
            }

            match catch_unwind(AssertUnwindSafe(|| (subscriber.handler)(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    tracing::warn!(
                        event_type = %event_type,
                        subscriber = subscriber.id,
                        error = %e,
                        "Change event handler failed"
                    );
                }
                Err(_) => {
                    failures += 1;
                    tracing::warn!(
                        event_type = %event_type,
                        subscriber = subscriber.id,
                        "Change event handler panicked"
                    );
                }
            }
        }

        if failures > 0 {
            let mut stats = self.inner.stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.total_handler_errors += failures;
        }

        event
    }

    /// Copy of the current statistics.
    pub fn stats(&self) -> EventStats {
        self.inner
            .stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn reset_stats(&self) {
        *self.inner.stats.lock().unwrap_or_else(|e| e.into_inner()) = EventStats::default();
    }

    // ─── Convenience emitters ────────────────────────────────────────────────

    pub fn emit_added(&self, partition_id: &str, count: u64) -> ChangeEvent {
        self.emit(
            ChangeEventType::Added,
            EventPayload::new(partition_id).with_count(count),
        )
    }

    pub fn emit_updated(&self, partition_id: &str, ids: Vec<String>) -> ChangeEvent {
        let count = ids.len() as u64;
        self.emit(
            ChangeEventType::Updated,
            EventPayload::new(partition_id)
                .with_count(count)
                .with_ids(ids),
        )
    }

    pub fn emit_deleted(&self, partition_id: &str, ids: Vec<String>) -> ChangeEvent {
        let count = ids.len() as u64;
        self.emit(
            ChangeEventType::Deleted,
            EventPayload::new(partition_id)
                .with_count(count)
                .with_ids(ids),
        )
    }

    pub fn emit_bulk_added(&self, partition_id: &str, ids: Vec<String>) -> ChangeEvent {
        let count = ids.len() as u64;
        self.emit(
            ChangeEventType::BulkAdded,
            EventPayload::new(partition_id)
                .with_count(count)
                .with_ids(ids),
        )
    }

    pub fn emit_replies_added(
        &self,
        partition_id: &str,
        parent_item_id: &str,
        ids: Vec<String>,
    ) -> ChangeEvent {
        let count = ids.len() as u64;
        self.emit(
            ChangeEventType::RepliesAdded,
            EventPayload::new(partition_id)
                .with_count(count)
                .with_ids(ids)
                .with_metadata(serde_json::json!({ "parentId": parent_item_id })),
        )
    }

    pub fn emit_count_updated(&self, partition_id: &str, total: u64) -> ChangeEvent {
        self.emit(
            ChangeEventType::CountUpdated,
            EventPayload::new(partition_id).with_count(total),
        )
    }

    pub fn emit_error(
        &self,
        partition_id: &str,
        report: ErrorReport,
        metadata: Option<serde_json::Value>,
    ) -> ChangeEvent {
        let mut payload = EventPayload::new(partition_id).with_error(report);
        payload.metadata = metadata;
        self.emit(ChangeEventType::ErrorOccurred, payload)
    }
}
