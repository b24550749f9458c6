//! Scrape source update events.
//!
//! The control plane publishes source definitions here; the scheduler
//! subscribes and reconciles its jobs against every event.

use tokio::sync::broadcast;

use crate::domain::ScrapeSource;

/// Events broadcast when a scrape source definition changes.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// A source was created or its definition changed.
    ///
    /// A source with a `@never` schedule arrives here too; the scheduler
    /// unschedules it without deleting anything.
    Upserted(ScrapeSource),
    /// A source was deleted.
    Deleted { source_id: String },
}

impl SourceEvent {
    pub fn source_id(&self) -> &str {
        match self {
            Self::Upserted(source) => &source.id,
            Self::Deleted { source_id } => source_id,
        }
    }

    /// Get a description of the event for logging.
    pub fn description(&self) -> String {
        match self {
            Self::Upserted(source) => format!(
                "Scrape source upserted: {} ({}, v{})",
                source.id, source.source_type, source.version
            ),
            Self::Deleted { source_id } => format!("Scrape source deleted: {}", source_id),
        }
    }
}

/// Default channel capacity for source events.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Broadcaster for source update events.
#[derive(Clone)]
pub struct SourceEventBroadcaster {
    sender: broadcast::Sender<SourceEvent>,
}

impl SourceEventBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SourceEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Returns the number of receivers that got it.
    pub fn publish(&self, event: SourceEvent) -> usize {
        tracing::debug!("Publishing source event: {}", event.description());
        // send() returns Err if there are no receivers, which is fine
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for SourceEventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_description() {
        let event = SourceEvent::Deleted {
            source_id: "s1".to_string(),
        };
        assert_eq!(event.description(), "Scrape source deleted: s1");
        assert_eq!(event.source_id(), "s1");
    }

    #[tokio::test]
    async fn test_broadcaster_multiple_subscribers() {
        let broadcaster = SourceEventBroadcaster::new();
        let mut receiver1 = broadcaster.subscribe();
        let mut receiver2 = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 2);

        let event = SourceEvent::Upserted(ScrapeSource::new("s1", "cluster", "kubernetes"));
        assert_eq!(broadcaster.publish(event.clone()), 2);

        assert_eq!(receiver1.recv().await.unwrap(), event);
        assert_eq!(receiver2.recv().await.unwrap(), event);
    }

    #[test]
    fn test_broadcaster_no_subscribers() {
        let broadcaster = SourceEventBroadcaster::new();
        let count = broadcaster.publish(SourceEvent::Deleted {
            source_id: "s1".to_string(),
        });
        assert_eq!(count, 0);
    }
}
