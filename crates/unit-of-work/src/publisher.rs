//! Event publication.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use domain::Payload;
use tokio::sync::RwLock;

use crate::error::PublishError;

/// Delivers domain events to subscribers.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, channel: &str, payload: &Payload) -> Result<(), PublishError>;
}

/// A message captured by [`InMemoryPublisher`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub channel: String,
    pub payload: Payload,
}

/// Records every published message in memory.
#[derive(Clone, Default)]
pub struct InMemoryPublisher {
    messages: Arc<RwLock<Vec<PublishedMessage>>>,
    fail: Arc<AtomicBool>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent publishes fail until reset.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.messages.read().await.clone()
    }

    pub async fn channels(&self) -> Vec<String> {
        self.messages
            .read()
            .await
            .iter()
            .map(|m| m.channel.clone())
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn clear(&self) {
        self.messages.write().await.clear();
    }
}

#[async_trait]
impl Publisher for InMemoryPublisher {
    async fn publish(&self, channel: &str, payload: &Payload) -> Result<(), PublishError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PublishError::new(channel, "publisher unavailable"));
        }
        self.messages.write().await.push(PublishedMessage {
            channel: channel.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }
}

/// Writes every event to the log. Used where no broker is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingPublisher;

#[async_trait]
impl Publisher for TracingPublisher {
    async fn publish(&self, channel: &str, payload: &Payload) -> Result<(), PublishError> {
        tracing::info!(channel, payload = %payload.to_wire_string(), "Domain event published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_publisher_records_in_order() {
        let publisher = InMemoryPublisher::new();
        publisher.publish("a", &Payload::from("1")).await.unwrap();
        publisher
            .publish("b", &Payload::from(serde_json::json!({ "n": 2 })))
            .await
            .unwrap();

        assert_eq!(publisher.channels().await, vec!["a", "b"]);
        assert_eq!(publisher.published().await[1].payload.to_wire_string(), r#"{"n":2}"#);
    }

    #[tokio::test]
    async fn failing_publisher_records_nothing() {
        let publisher = InMemoryPublisher::new();
        publisher.set_fail(true);

        let err = publisher.publish("a", &Payload::from("1")).await.unwrap_err();
        assert_eq!(err.channel, "a");
        assert_eq!(publisher.count().await, 0);
    }
}
