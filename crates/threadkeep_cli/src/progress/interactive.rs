use std::sync::Mutex;
use std::time::Duration;

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use threadkeep::{ChangeEvent, ChangeEventType, ReplyProgress};

#[derive(Default)]
struct ProgressState {
    /// Stored total reported by the last count update.
    stored: u64,
    errors: usize,
}

/// Interactive progress reporter using indicatif.
pub struct InteractiveReporter {
    multi: MultiProgress,
    comments: ProgressBar,
    replies: ProgressBar,
    state: Mutex<ProgressState>,
}

impl InteractiveReporter {
    pub fn new() -> Self {
        let multi = MultiProgress::new();

        let comments = multi.add(ProgressBar::new_spinner());
        comments.set_style(Self::counter_style());
        comments.set_prefix("comments");
        comments.enable_steady_tick(Duration::from_millis(100));

        let replies = multi.add(ProgressBar::new_spinner());
        replies.set_style(Self::counter_style());
        replies.set_prefix(" replies");
        replies.set_message("waiting for crawl");

        Self {
            multi,
            comments,
            replies,
            state: Mutex::new(ProgressState::default()),
        }
    }

    pub fn handle(&self, event: &ChangeEvent) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        match event.event_type {
            ChangeEventType::BulkAdded => {
                self.comments.inc(event.count.unwrap_or_default());
            }
            ChangeEventType::CountUpdated => {
                state.stored = event.count.unwrap_or_default();
                self.comments
                    .set_message(format!("fetched, {} stored", state.stored));
            }
            ChangeEventType::ErrorOccurred => {
                state.errors += 1;
                if let Some(error) = &event.error {
                    let _ = self.multi.println(format!(
                        "{} {}: {}",
                        style("⚠").yellow(),
                        error.kind,
                        error.message
                    ));
                }
            }
            _ => {}
        }
    }

    pub fn replies(&self, progress: &ReplyProgress) {
        if progress.total == 0 {
            return;
        }
        if self.replies.is_finished() {
            return;
        }
        if self.replies.length().is_none() {
            self.replies.set_style(Self::bar_style());
            self.replies.set_length(progress.total as u64);
            self.comments.finish();
        }
        self.replies.set_position(progress.settled() as u64);

        let mut message = format!(
            "{} replies, {} failed, {} active",
            progress.replies_fetched, progress.failed, progress.active
        );
        if progress.cooling_down {
            message.push_str(&format!(
                " {}",
                style(format!("(rate limited, limit {})", progress.concurrency_limit)).yellow()
            ));
        }
        self.replies.set_message(message);
    }

    pub fn finish(&self) {
        if !self.comments.is_finished() {
            self.comments.finish();
        }
        if !self.replies.is_finished() {
            self.replies.finish();
        }
        let errors = self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .errors;
        if errors > 0 {
            let _ = self
                .multi
                .println(format!("{} {} error(s) reported", style("⚠").yellow(), errors));
        }
    }

    fn counter_style() -> ProgressStyle {
        ProgressStyle::default_spinner()
            .template("{prefix:.bold.cyan} {spinner:.green} {pos:>6} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
    }

    fn bar_style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template("{prefix:.bold.cyan} [{bar:30.green/dim}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░")
    }
}
