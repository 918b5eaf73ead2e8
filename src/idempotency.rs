use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::telemetry::metric_inc;
use crate::types::deadline_after;

/// Shared store able to record a marker only if it is not already present.
///
/// `set_if_absent` must be a single atomic operation: two concurrent callers
/// with the same key must never both get `Ok(true)`.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Returns `Ok(true)` when the marker was created by this call.
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;
}

/// Process-local marker map.
///
/// Used as the guard's fallback when the shared store is down. It does not
/// survive a restart and does not cover other instances.
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    expires_at: Mutex<HashMap<String, Instant>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live markers.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let guard = self.expires_at.lock().await;
        guard.values().filter(|deadline| **deadline > now).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut guard = self.expires_at.lock().await;
        guard.retain(|_, deadline| *deadline > now);

        if guard.contains_key(key) {
            return Ok(false);
        }
        guard.insert(key.to_string(), deadline_after(now, ttl));
        Ok(true)
    }
}

/// How an event id was classified by the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    /// First time within the window; the id is now recorded.
    First,
    /// Already recorded within the window.
    Duplicate,
    /// The event carried no id and is never deduplicated.
    Untracked,
}

/// Result of an idempotency check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupOutcome {
    pub sighting: Sighting,

    /// The shared store failed and the in-process fallback answered.
    pub degraded: bool,
}

impl DedupOutcome {
    pub fn is_duplicate(&self) -> bool {
        self.sighting == Sighting::Duplicate
    }
}

/// First line of defense against redelivered events.
pub struct IdempotencyGuard {
    primary: Option<Arc<dyn IdempotencyStore>>,
    fallback: InMemoryIdempotencyStore,
}

impl IdempotencyGuard {
    /// Guard backed by a shared store, falling back to process memory.
    pub fn new(primary: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            primary: Some(primary),
            fallback: InMemoryIdempotencyStore::new(),
        }
    }

    /// Guard with no shared store, for single-instance deployments and tests.
    pub fn in_memory() -> Self {
        Self {
            primary: None,
            fallback: InMemoryIdempotencyStore::new(),
        }
    }

    /// Store key for an event id.
    pub fn dedup_key(namespace: &str, event_id: &str) -> String {
        format!("{}:event:{}", namespace, event_id)
    }

    /// Classify an event id and record it when first seen.
    pub async fn check(&self, event_id: &str, ttl: Duration, namespace: &str) -> DedupOutcome {
        if event_id.is_empty() {
            return DedupOutcome {
                sighting: Sighting::Untracked,
                degraded: false,
            };
        }

        let key = Self::dedup_key(namespace, event_id);

        let (created, degraded) = match &self.primary {
            Some(store) => match store.set_if_absent(&key, ttl).await {
                Ok(created) => (created, false),
                Err(err) => {
                    warn!(error = %err, "idempotency store unavailable, using in-process fallback");
                    metric_inc("ingest.dedup.degraded");
                    (self.fallback_set(&key, ttl).await, true)
                }
            },
            None => (self.fallback_set(&key, ttl).await, false),
        };

        let sighting = if created {
            Sighting::First
        } else {
            debug!(event_id, namespace, "duplicate event id");
            Sighting::Duplicate
        };
        DedupOutcome { sighting, degraded }
    }

    /// `true` when the id was already processed within `ttl_secs`.
    pub async fn seen(&self, event_id: &str, ttl_secs: u64, namespace: &str) -> bool {
        self.check(event_id, Duration::from_secs(ttl_secs), namespace)
            .await
            .is_duplicate()
    }

    async fn fallback_set(&self, key: &str, ttl: Duration) -> bool {
        // The in-memory store never fails.
        self.fallback.set_if_absent(key, ttl).await.unwrap_or(true)
    }
}
