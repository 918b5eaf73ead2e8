use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};

use crate::error::PublishError;

/// Sink that hands events to internal consumers.
///
/// A publish is a synchronous handoff: no internal retry and no ordering
/// guarantee across topics. An `Err` is the caller's only signal to fall
/// back to the dead-letter queue.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Returns the identifier the bus assigned to the message.
    async fn publish(&self, topic: &str, payload: &Value) -> Result<String, PublishError>;
}

/// A message accepted by [`InMemoryEventBus`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub id: String,
    pub topic: String,
    pub payload: Value,
}

const DEFAULT_RETENTION: usize = 10_000;

/// Process-local bus that records messages and fans them out to
/// subscribers.
///
/// Meant for tests and single-process wiring. The recording keeps the most
/// recent `retention` messages; older ones are dropped from it but were
/// still delivered to subscribers.
pub struct InMemoryEventBus {
    next_id: AtomicU64,
    retention: usize,
    published: Mutex<VecDeque<PublishedMessage>>,
    fanout: broadcast::Sender<PublishedMessage>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// Bus recording at most `retention` messages.
    pub fn with_retention(retention: usize) -> Self {
        let (fanout, _) = broadcast::channel(1_024);
        Self {
            next_id: AtomicU64::new(1),
            retention,
            published: Mutex::new(VecDeque::new()),
            fanout,
        }
    }

    /// Receive every message published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedMessage> {
        self.fanout.subscribe()
    }

    /// Recorded messages, oldest first.
    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.iter().cloned().collect()
    }

    /// Take the recorded messages, leaving the recording empty.
    pub async fn drain(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.drain(..).collect()
    }

    pub async fn published_on(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, topic: &str, payload: &Value) -> Result<String, PublishError> {
        let id = format!("msg-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let message = PublishedMessage {
            id: id.clone(),
            topic: topic.to_string(),
            payload: payload.clone(),
        };
        {
            let mut recorded = self.published.lock().await;
            recorded.push_back(message.clone());
            while recorded.len() > self.retention {
                recorded.pop_front();
            }
        }
        // No subscribers is not a failure.
        let _ = self.fanout.send(message);
        Ok(id)
    }
}
