//! Bounded in-process queue between watch loops and the consumer.
//!
//! Many producers, one consumer. Capacity is fixed at construction: producers
//! either wait for room ([`QueueSender::enqueue`]) or drop the item and count
//! it ([`QueueSender::try_enqueue`]).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::domain::{QueueItem, QueueOperation, Resource};
use crate::metrics::{EngineMetrics, SourceCounter};

/// Producer handle for a [`WatchQueue`].
#[derive(Clone)]
pub struct QueueSender {
    source_id: Arc<str>,
    sender: mpsc::Sender<QueueItem>,
    metrics: Arc<EngineMetrics>,
    clock: SharedClock,
}

impl QueueSender {
    /// Stamp a resource with the current time and operation.
    pub fn item(&self, resource: Resource, operation: QueueOperation) -> QueueItem {
        QueueItem::new(resource, operation, self.clock.now())
    }

    /// Wait for room, then enqueue. Returns `false` once the queue is gone.
    pub async fn enqueue(&self, item: QueueItem) -> bool {
        self.sender.send(item).await.is_ok()
    }

    /// Enqueue without waiting. A full queue drops the item.
    pub fn try_enqueue(&self, item: QueueItem) -> bool {
        match self.sender.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(item)) => {
                self.metrics
                    .incr(&self.source_id, SourceCounter::EnqueueDropped);
                warn!(
                    source_id = %self.source_id,
                    resource_id = %item.resource.id,
                    "Watch queue full, dropping item"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }
}

/// Fixed-capacity queue of [`QueueItem`]s for one scrape source.
pub struct WatchQueue {
    producer: QueueSender,
    receiver: Mutex<mpsc::Receiver<QueueItem>>,
    capacity: usize,
    /// Cancels pending delayed redeliveries.
    cancel: CancellationToken,
}

impl WatchQueue {
    pub fn new(
        source_id: &str,
        capacity: usize,
        metrics: Arc<EngineMetrics>,
        clock: SharedClock,
    ) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            producer: QueueSender {
                source_id: Arc::from(source_id),
                sender,
                metrics,
                clock,
            },
            receiver: Mutex::new(receiver),
            capacity,
            cancel: CancellationToken::new(),
        }
    }

    pub fn sender(&self) -> QueueSender {
        self.producer.clone()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items currently buffered.
    pub fn len(&self) -> usize {
        self.capacity - self.producer.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take up to `max` items.
    ///
    /// Waits at most `wait` for the first item, then takes whatever is
    /// already buffered without waiting further.
    pub async fn drain(&self, max: usize, wait: Duration) -> Vec<QueueItem> {
        let mut receiver = self.receiver.lock().await;
        let mut items = Vec::new();
        if max == 0 {
            return items;
        }

        match tokio::time::timeout(wait, receiver.recv()).await {
            Ok(Some(item)) => items.push(item),
            Ok(None) | Err(_) => return items,
        }

        while items.len() < max {
            match receiver.try_recv() {
                Ok(item) => items.push(item),
                Err(_) => break,
            }
        }
        items
    }

    /// Put `item` back on the queue after `delay`, as a redelivery.
    ///
    /// The payload and original enqueue time are kept.
    pub fn redeliver_later(&self, item: QueueItem, delay: Duration) {
        let producer = self.producer.clone();
        let cancel = self.cancel.clone();
        let item = item.into_redelivery();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    producer
                        .metrics
                        .incr(&producer.source_id, SourceCounter::Redeliveries);
                    debug!(
                        source_id = %producer.source_id,
                        resource_id = %item.resource.id,
                        attempt = item.redeliveries,
                        "Redelivering withheld item"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = producer.enqueue(item) => {}
                    }
                }
            }
        });
    }

    /// Stop pending redeliveries.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for WatchQueue {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
