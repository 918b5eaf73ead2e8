use std::collections::BTreeSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;

/// Identifier assigned to a sub-event by the push source.
///
/// An empty id is legal and means "not deduplicated".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One device event, as forwarded to the event bus.
///
/// The payload is the raw sub-event document exactly as the push source
/// delivered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,

    #[serde(rename = "type")]
    pub event_type: String,

    pub payload: Value,
}

impl Event {
    pub fn new(id: impl Into<String>, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: EventId(id.into()),
            event_type: event_type.into(),
            payload,
        }
    }

    /// Structured document handed to the event bus.
    pub fn to_document(&self) -> Value {
        serde_json::json!({
            "id": self.id.0,
            "type": self.event_type,
            "payload": self.payload,
        })
    }
}

/// Unique key of a device twin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TwinKey {
    pub provider: String,
    pub external_id: String,
}

impl TwinKey {
    pub fn new(provider: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            external_id: external_id.into(),
        }
    }
}

/// Last known materialized state of one physical device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceTwin {
    pub provider: String,
    pub external_id: String,
    pub display_name: Option<String>,

    /// Grows by union on every upsert, never shrinks.
    pub capabilities: BTreeSet<String>,

    pub state: Map<String, Value>,
    pub updated_at_secs: u64,
}

impl DeviceTwin {
    /// Create an empty twin for the given key.
    pub fn empty(key: &TwinKey) -> Self {
        Self {
            provider: key.provider.clone(),
            external_id: key.external_id.clone(),
            display_name: None,
            capabilities: BTreeSet::new(),
            state: Map::new(),
            updated_at_secs: now_secs(),
        }
    }

    pub fn key(&self) -> TwinKey {
        TwinKey::new(self.provider.clone(), self.external_id.clone())
    }

    /// Fold an update into this twin.
    ///
    /// Capabilities are unioned, state is merged key by key with the update
    /// winning, and the display name is only filled when still unset.
    pub fn apply(&mut self, update: &TwinUpdate) {
        if self.display_name.is_none() {
            if let Some(name) = update.display_name.as_ref().filter(|n| !n.is_empty()) {
                self.display_name = Some(name.clone());
            }
        }
        self.capabilities.extend(update.capabilities.iter().cloned());
        for (key, value) in &update.state {
            self.state.insert(key.clone(), value.clone());
        }
        self.updated_at_secs = now_secs();
    }
}

/// Delta applied to a twin by a single event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwinUpdate {
    pub key: TwinKey,
    pub display_name: Option<String>,
    pub capabilities: BTreeSet<String>,
    pub state: Map<String, Value>,
}

impl TwinUpdate {
    pub fn new(key: TwinKey) -> Self {
        Self {
            key,
            display_name: None,
            capabilities: BTreeSet::new(),
            state: Map::new(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_state(mut self, key: impl Into<String>, value: Value) -> Self {
        self.state.insert(key.into(), value);
        self
    }
}

/// Dead-letter queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqItem {
    pub event: Event,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub enqueued_at_secs: u64,
}

impl DlqItem {
    pub fn new(event: Event, error: impl Into<String>) -> Self {
        Self {
            event,
            attempts: 0,
            last_error: Some(error.into()),
            enqueued_at_secs: now_secs(),
        }
    }

    /// Record a failed retry and prepare the item for requeueing.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_error = Some(error.into());
        self.enqueued_at_secs = now_secs();
    }
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Upper bound for marker lifetimes and blocking waits.
pub(crate) const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `now + after`, saturating instead of overflowing the clock.
pub(crate) fn deadline_after(now: Instant, after: Duration) -> Instant {
    now.checked_add(after)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}
