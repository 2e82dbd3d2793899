use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Current concurrency allowance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitState {
    pub limit: usize,
    pub cooling_down: bool,
}

/// Queue-wide concurrency limit that halves during a rate limit cooldown.
///
/// Only one cooldown runs at a time: a rate limit reported while cooling
/// down joins the running cooldown instead of starting another.
#[derive(Debug)]
pub struct AdaptiveLimiter {
    base: usize,
    state: watch::Sender<LimitState>,
}

impl AdaptiveLimiter {
    pub fn new(base: usize) -> Self {
        let base = base.max(1);
        let (state, _) = watch::channel(LimitState {
            limit: base,
            cooling_down: false,
        });
        Self { base, state }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn current(&self) -> LimitState {
        *self.state.borrow()
    }

    pub fn limit(&self) -> usize {
        self.current().limit
    }

    /// Receiver notified whenever the limit changes.
    pub fn subscribe(&self) -> watch::Receiver<LimitState> {
        self.state.subscribe()
    }

    /// Halve the limit and start the cooldown timer, unless one is running.
    ///
    /// Returns `true` if this call started the cooldown.
    pub fn enter_cooldown(self: &Arc<Self>, cooldown: Duration) -> bool {
        let halved = (self.base / 2).max(1);
        let started = self.state.send_if_modified(|state| {
            if state.cooling_down {
                return false;
            }
            state.cooling_down = true;
            state.limit = halved;
            true
        });

        if started {
            tracing::warn!(
                limit = halved,
                cooldown_ms = cooldown.as_millis() as u64,
                "Rate limited, reducing reply concurrency"
            );
            let limiter = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(cooldown).await;
                limiter.restore();
            });
        }
        started
    }

    fn restore(&self) {
        let base = self.base;
        self.state.send_modify(|state| {
            state.cooling_down = false;
            state.limit = base;
        });
        tracing::info!(limit = base, "Rate limit cooldown elapsed, concurrency restored");
    }

    /// Resolves once no cooldown is running.
    pub async fn cooled_down(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|state| !state.cooling_down).await;
    }
}
