//! Change notifications for the comment cache.

mod bus;
mod types;

pub use bus::{ChangeEventBus, EventHandler, EventStats, HandlerError, Unsubscribe};
pub use types::{ChangeEvent, ChangeEventType, EventPayload};
