use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout_at, Instant};
use tracing::warn;

use crate::config::DlqConfig;
use crate::error::StoreError;
use crate::telemetry::metric_inc;
use crate::types::{deadline_after, DlqItem};

/// Bounded, ordered dead-letter buffer.
///
/// Items are pushed at the head and popped from the tail, so the consumer
/// sees them oldest first. Implementations trim to their maximum length on
/// every push, dropping the oldest entries.
#[async_trait]
pub trait DlqStore: Send + Sync {
    async fn push(&self, item: &DlqItem) -> Result<(), StoreError>;

    /// Wait up to `timeout` for the oldest item.
    async fn pop(&self, timeout: Duration) -> Result<Option<DlqItem>, StoreError>;

    async fn len(&self) -> Result<usize, StoreError>;

    /// All buffered items, newest first.
    async fn snapshot(&self) -> Result<Vec<DlqItem>, StoreError>;
}

/// In-process ring buffer.
pub struct InMemoryDlq {
    max_len: usize,
    items: Mutex<VecDeque<DlqItem>>,
    notify: Notify,
}

impl InMemoryDlq {
    pub fn new(max_len: usize) -> Self {
        let max_len = max_len.max(1);
        Self {
            max_len,
            items: Mutex::new(VecDeque::with_capacity(max_len.min(1_024))),
            notify: Notify::new(),
        }
    }

    /// Buffer bounded by `config.max_len`.
    pub fn from_config(config: &DlqConfig) -> Self {
        Self::new(config.max_len)
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }
}

impl Default for InMemoryDlq {
    fn default() -> Self {
        Self::new(1_000)
    }
}

#[async_trait]
impl DlqStore for InMemoryDlq {
    async fn push(&self, item: &DlqItem) -> Result<(), StoreError> {
        {
            let mut guard = self.items.lock().await;
            guard.push_front(item.clone());
            while guard.len() > self.max_len {
                if let Some(evicted) = guard.pop_back() {
                    warn!(
                        event_id = %evicted.event.id,
                        attempts = evicted.attempts,
                        "dlq full, evicting oldest entry"
                    );
                    metric_inc("ingest.dlq.evicted");
                }
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<DlqItem>, StoreError> {
        let deadline = deadline_after(Instant::now(), timeout);
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.items.lock().await.pop_back() {
                return Ok(Some(item));
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.items.lock().await.len())
    }

    async fn snapshot(&self) -> Result<Vec<DlqItem>, StoreError> {
        Ok(self.items.lock().await.iter().cloned().collect())
    }
}
