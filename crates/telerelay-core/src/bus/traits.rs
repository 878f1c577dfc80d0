//! Message Bus Trait

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use thiserror::Error;

/// Lazy, infinite stream of payloads for one subscription
///
/// Not restartable: after the consumer drops it, a fresh `subscribe` call is required.
pub type PayloadStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

/// Errors raised by bus adapters
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Failed to subscribe to '{topic}': {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("Failed to publish to '{topic}': {reason}")]
    Publish { topic: String, reason: String },

    #[error("Invalid topic '{0}'")]
    InvalidTopic(String),

    #[error("Bus connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Publish/subscribe transport
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a payload on a topic
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError>;

    /// Subscribe to a topic (or topic filter) and return its payload stream
    async fn subscribe(&self, topic: &str) -> Result<PayloadStream, BusError>;
}
