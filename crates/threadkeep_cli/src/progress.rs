//! Progress reporting for ingestion.
//!
//! This module provides two modes of progress reporting:
//! - Interactive mode (TTY): spinners using indicatif
//! - Logging mode (non-TTY): structured logging using tracing
//!
//! Both are fed from the session's change events. The interactive reporter
//! additionally polls reply queue progress, which has no event of its own.

mod interactive;
mod logging;

use std::sync::Arc;

use console::Term;
use threadkeep::events::Unsubscribe;
use threadkeep::{ChangeEvent, IngestSession, ReplyProgress};

pub use interactive::InteractiveReporter;
pub use logging::LoggingReporter;

/// Progress reporter that handles both interactive and logging modes.
pub enum ProgressReporter {
    /// Spinners for TTY.
    Interactive(InteractiveReporter),
    /// Structured logging for non-TTY (CI, pipes).
    Logging(LoggingReporter),
}

impl ProgressReporter {
    /// Create a new progress reporter, auto-detecting TTY mode.
    pub fn new() -> Self {
        if Term::stdout().is_term() {
            Self::Interactive(InteractiveReporter::new())
        } else {
            Self::Logging(LoggingReporter::new())
        }
    }

    /// Handle a change event.
    pub fn handle(&self, event: &ChangeEvent) {
        match self {
            Self::Interactive(r) => r.handle(event),
            Self::Logging(r) => r.handle(event),
        }
    }

    /// Reflect the reply queue's live counters.
    pub fn replies(&self, progress: &ReplyProgress) {
        if let Self::Interactive(r) = self {
            r.replies(progress);
        }
    }

    /// Subscribe to every event of the session.
    pub fn attach(self: &Arc<Self>, session: &IngestSession) -> Unsubscribe {
        let reporter = Arc::clone(self);
        session.subscribe_all(move |event| {
            reporter.handle(event);
            Ok(())
        })
    }

    /// Stop spinners (interactive mode only).
    pub fn finish(&self) {
        if let Self::Interactive(r) = self {
            r.finish();
        }
    }
}
