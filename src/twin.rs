use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::TwinError;
use crate::types::{DeviceTwin, TwinKey, TwinUpdate};

/// Per-device materialized state.
///
/// Upserts for the same key must be applied one at a time; upserts for
/// different keys must not wait on each other.
#[async_trait]
pub trait TwinStore: Send + Sync {
    /// Create or update the twin named by `update.key` and return the result.
    async fn upsert(&self, update: &TwinUpdate) -> Result<DeviceTwin, TwinError>;

    async fn get(&self, key: &TwinKey) -> Result<Option<DeviceTwin>, TwinError>;
}

/// In-memory twin store with one lock per device.
///
/// The outer map lock is only held to find or create the per-device slot.
#[derive(Default)]
pub struct InMemoryTwinStore {
    twins: RwLock<HashMap<TwinKey, Arc<Mutex<DeviceTwin>>>>,
}

impl InMemoryTwinStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, key: &TwinKey) -> Arc<Mutex<DeviceTwin>> {
        {
            let guard = self.twins.read().await;
            if let Some(slot) = guard.get(key) {
                return slot.clone();
            }
        }

        let mut guard = self.twins.write().await;
        guard
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(DeviceTwin::empty(key))))
            .clone()
    }

    /// Copy of every twin currently held.
    pub async fn snapshot(&self) -> Vec<DeviceTwin> {
        let slots: Vec<_> = {
            let guard = self.twins.read().await;
            guard.values().cloned().collect()
        };

        let mut twins = Vec::with_capacity(slots.len());
        for slot in slots {
            twins.push(slot.lock().await.clone());
        }
        twins.sort_by(|a, b| a.key().cmp(&b.key()));
        twins
    }

    pub async fn len(&self) -> usize {
        self.twins.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl TwinStore for InMemoryTwinStore {
    async fn upsert(&self, update: &TwinUpdate) -> Result<DeviceTwin, TwinError> {
        let slot = self.slot(&update.key).await;
        let mut twin = slot.lock().await;
        twin.apply(update);
        debug!(
            provider = %update.key.provider,
            external_id = %update.key.external_id,
            capabilities = twin.capabilities.len(),
            "twin updated"
        );
        Ok(twin.clone())
    }

    async fn get(&self, key: &TwinKey) -> Result<Option<DeviceTwin>, TwinError> {
        let slot = {
            let guard = self.twins.read().await;
            guard.get(key).cloned()
        };
        match slot {
            Some(slot) => Ok(Some(slot.lock().await.clone())),
            None => Ok(None),
        }
    }
}
