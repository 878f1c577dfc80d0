//! In-process bus
//!
//! Fans published payloads out to every live subscription whose filter matches. Used by tests
//! and for running the bot without a broker.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, warn};

use super::topic;
use super::traits::{BusError, MessageBus, PayloadStream};

const DEFAULT_CAPACITY: usize = 256;

pub struct LocalBus {
    subscriptions: Mutex<Vec<(String, broadcast::Sender<Bytes>)>>,
    capacity: usize,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Per-subscription buffer size; slower consumers lose the oldest payloads.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Number of subscriptions that still have a live consumer
    pub fn subscriber_count(&self, filter: &str) -> usize {
        self.subscriptions
            .lock()
            .iter()
            .filter(|(existing, _)| existing == filter)
            .map(|(_, sender)| sender.receiver_count())
            .sum()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrap a broadcast receiver as a payload stream, skipping over lag gaps.
fn payload_stream(receiver: broadcast::Receiver<Bytes>, topic: String) -> PayloadStream {
    Box::pin(
        BroadcastStream::new(receiver).filter_map(move |item| match item {
            Ok(payload) => Some(payload),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(topic = %topic, skipped, "Subscriber lagged, payloads dropped");
                None
            }
        }),
    )
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError> {
        if !topic::is_valid_topic(topic) {
            return Err(BusError::InvalidTopic(topic.to_string()));
        }

        let mut subscriptions = self.subscriptions.lock();
        subscriptions.retain(|(_, sender)| sender.receiver_count() > 0);

        let mut delivered = 0usize;
        for (filter, sender) in subscriptions.iter() {
            if topic::matches(filter, topic) && sender.send(payload.clone()).is_ok() {
                delivered += 1;
            }
        }
        debug!(topic, delivered, "Published on local bus");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<PayloadStream, BusError> {
        if !topic::is_valid_filter(topic) {
            return Err(BusError::InvalidTopic(topic.to_string()));
        }

        let (sender, receiver) = broadcast::channel(self.capacity);
        self.subscriptions.lock().push((topic.to_string(), sender));
        Ok(payload_stream(receiver, topic.to_string()))
    }
}
