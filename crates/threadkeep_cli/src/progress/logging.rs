use threadkeep::{ChangeEvent, ChangeEventType};

/// Logging reporter using tracing for structured output.
pub struct LoggingReporter;

impl LoggingReporter {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, event: &ChangeEvent) {
        let partition = event.partition_id.as_str();
        let count = event.count.unwrap_or_default();

        match event.event_type {
            ChangeEventType::BulkAdded => {
                tracing::info!(partition = %partition, count, "Comments stored");
            }

            ChangeEventType::RepliesAdded => {
                let parent = event
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("parentId"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                tracing::debug!(partition = %partition, parent = %parent, count, "Replies stored");
            }

            ChangeEventType::CountUpdated => {
                tracing::debug!(partition = %partition, total = count, "Stored total updated");
            }

            ChangeEventType::ErrorOccurred => {
                if let Some(error) = &event.error {
                    tracing::warn!(
                        partition = %partition,
                        kind = %error.kind,
                        error = %error.message,
                        "Ingestion error"
                    );
                }
            }

            ChangeEventType::Added | ChangeEventType::Updated | ChangeEventType::Deleted => {
                tracing::debug!(partition = %partition, event = %event.event_type, count, "Change");
            }
        }
    }
}
