use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, error, info, instrument, warn};

use crate::bus::EventBus;
use crate::config::GatewayConfig;
use crate::dlq::DlqStore;
use crate::error::{ItemError, VerifyError};
use crate::idempotency::{IdempotencyGuard, Sighting};
use crate::signing::check_signature;
use crate::telemetry::{metric_inc, metric_inc_provider};
use crate::twin::TwinStore;
use crate::types::{DlqItem, Event, TwinKey, TwinUpdate};

const CONFIRMATION_LIFECYCLE: &str = "CONFIRMATION";
const UNKNOWN_EVENT_TYPE: &str = "UNKNOWN";

/// Counters for one verified event batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub received: usize,
    pub published: usize,
    pub duplicates: usize,
    pub dead_lettered: usize,
    /// Sub-events without an id; processed but never deduplicated.
    pub untracked: usize,
    /// At least one dedup check was answered by the in-process fallback.
    pub degraded: bool,
}

/// Outcome of one inbound delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayResponse {
    /// Lifecycle handshake; the target is echoed back verbatim.
    Confirmed { target: String },

    /// Verified delivery. Always a success, whatever happened per item.
    Accepted(BatchSummary),

    /// Signature check failed; nothing was processed.
    Rejected(VerifyError),
}

impl GatewayResponse {
    /// HTTP status for this outcome.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayResponse::Confirmed { .. } | GatewayResponse::Accepted(_) => 200,
            GatewayResponse::Rejected(_) => 401,
        }
    }

    /// JSON envelope returned to the push source.
    pub fn body(&self) -> Value {
        match self {
            GatewayResponse::Confirmed { target } => json!({ "targetUrl": target }),
            GatewayResponse::Accepted(_) => json!({ "ok": true }),
            GatewayResponse::Rejected(_) => json!({ "error": "invalid signature" }),
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, GatewayResponse::Rejected(_))
    }
}

enum Payload {
    Confirmation { target: String },
    Events(Vec<Value>),
    Unrecognized(&'static str),
}

/// Entry point for pushed webhook deliveries.
///
/// Authenticates the raw body, answers lifecycle handshakes, and for event
/// batches runs every sub-event through dedup, publish and twin upsert.
/// A failure on one sub-event sends that item to the DLQ and never affects
/// the rest of the batch or the response.
pub struct WebhookGateway {
    config: GatewayConfig,
    guard: Arc<IdempotencyGuard>,
    bus: Arc<dyn EventBus>,
    twins: Arc<dyn TwinStore>,
    dlq: Arc<dyn DlqStore>,
}

impl WebhookGateway {
    pub fn new(
        config: GatewayConfig,
        guard: Arc<IdempotencyGuard>,
        bus: Arc<dyn EventBus>,
        twins: Arc<dyn TwinStore>,
        dlq: Arc<dyn DlqStore>,
    ) -> Self {
        Self {
            config,
            guard,
            bus,
            twins,
            dlq,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Header the signature is expected in.
    pub fn signature_header(&self) -> &str {
        &self.config.signature.header
    }

    /// Handle one delivery: the exact raw body and the signature header value.
    #[instrument(
        name = "webhook_delivery",
        skip_all,
        fields(provider = %self.config.provider, body_len = body.len())
    )]
    pub async fn handle(&self, body: &[u8], signature: Option<&str>) -> GatewayResponse {
        let signature_config = &self.config.signature;
        if let Err(err) = check_signature(
            signature_config.secret.as_deref(),
            body,
            signature,
            signature_config.encoding,
        ) {
            warn!(reason = %err, "delivery rejected");
            metric_inc_provider("ingest.delivery.rejected", &self.config.provider);
            return GatewayResponse::Rejected(err);
        }

        match classify(body) {
            Payload::Confirmation { target } => {
                info!("lifecycle confirmation received");
                metric_inc_provider("ingest.delivery.confirmed", &self.config.provider);
                GatewayResponse::Confirmed { target }
            }
            Payload::Events(items) => GatewayResponse::Accepted(self.dispatch_batch(&items).await),
            Payload::Unrecognized(reason) => {
                warn!(reason, "verified delivery carried no events, acknowledging");
                GatewayResponse::Accepted(BatchSummary::default())
            }
        }
    }

    async fn dispatch_batch(&self, items: &[Value]) -> BatchSummary {
        let ttl = Duration::from_secs(self.config.dedup_ttl_secs);
        let mut summary = BatchSummary {
            received: items.len(),
            ..BatchSummary::default()
        };

        for raw in items {
            let event_id = field_str(raw, &["eventId", "id"]).unwrap_or_default();

            let dedup = self
                .guard
                .check(&event_id, ttl, &self.config.dedup_namespace)
                .await;
            summary.degraded |= dedup.degraded;
            match dedup.sighting {
                Sighting::Duplicate => {
                    summary.duplicates += 1;
                    metric_inc("ingest.event.duplicate");
                    continue;
                }
                Sighting::Untracked => summary.untracked += 1,
                Sighting::First => {}
            }

            match self.dispatch_item(raw, &event_id).await {
                Ok(()) => {
                    summary.published += 1;
                    metric_inc("ingest.event.published");
                }
                Err(err) => {
                    summary.dead_lettered += 1;
                    self.dead_letter(raw, &event_id, &err).await;
                }
            }
        }

        info!(
            received = summary.received,
            published = summary.published,
            duplicates = summary.duplicates,
            dead_lettered = summary.dead_lettered,
            degraded = summary.degraded,
            "event batch processed"
        );
        summary
    }

    async fn dispatch_item(&self, raw: &Value, event_id: &str) -> Result<(), ItemError> {
        if !raw.is_object() {
            return Err(ItemError::Malformed("sub-event is not a JSON object".to_string()));
        }

        let event = Event::new(event_id, event_type(raw), raw.clone());
        let update = twin_update(&self.config.provider, raw);

        let published = self.bus.publish(&self.config.topic, &event.to_document()).await;
        let upserted = match &update {
            Some(update) => self.twins.upsert(update).await.map(|_| ()),
            None => Ok(()),
        };

        match (published, upserted) {
            (Ok(message_id), Ok(())) => {
                debug!(event_id, message_id = %message_id, "event forwarded");
                Ok(())
            }
            (Err(publish), Ok(())) => Err(publish.into()),
            (Ok(_), Err(twin)) => Err(twin.into()),
            (Err(publish), Err(twin)) => Err(ItemError::PublishAndTwin { publish, twin }),
        }
    }

    async fn dead_letter(&self, raw: &Value, event_id: &str, err: &ItemError) {
        warn!(event_id, error = %err, "sub-event failed, dead-lettering");
        metric_inc("ingest.event.dead_lettered");

        let event = Event::new(event_id, event_type(raw), raw.clone());
        let item = DlqItem::new(event, err.to_string());
        if let Err(store_err) = self.dlq.push(&item).await {
            error!(event_id, error = %store_err, "dlq push failed, event dropped");
        }
    }
}

fn classify(body: &[u8]) -> Payload {
    let Ok(document) = serde_json::from_slice::<Value>(body) else {
        return Payload::Unrecognized("body is not JSON");
    };

    let lifecycle = document.get("lifecycle").and_then(Value::as_str);
    if lifecycle == Some(CONFIRMATION_LIFECYCLE) {
        let target = document
            .get("confirmationTarget")
            .or_else(|| document.pointer("/confirmationData/confirmationUrl"))
            .and_then(Value::as_str);
        return match target {
            Some(target) => Payload::Confirmation {
                target: target.to_string(),
            },
            None => Payload::Unrecognized("confirmation without target"),
        };
    }

    let events = document
        .get("events")
        .or_else(|| document.pointer("/eventData/events"))
        .and_then(Value::as_array);
    match events {
        Some(events) => Payload::Events(events.clone()),
        None => Payload::Unrecognized("no events array"),
    }
}

/// Look a field up on the sub-event, then on its nested `deviceEvent`.
fn field<'a>(raw: &'a Value, names: &[&str]) -> Option<&'a Value> {
    let nested = raw.get("deviceEvent");
    names.iter().find_map(|name| {
        raw.get(*name)
            .or_else(|| nested.and_then(|n| n.get(*name)))
            .filter(|v| !v.is_null())
    })
}

fn field_str(raw: &Value, names: &[&str]) -> Option<String> {
    match field(raw, names)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn event_type(raw: &Value) -> String {
    field_str(raw, &["eventType", "type"]).unwrap_or_else(|| UNKNOWN_EVENT_TYPE.to_string())
}

fn twin_update(provider: &str, raw: &Value) -> Option<TwinUpdate> {
    let device_id = field_str(raw, &["deviceId"])?;
    let mut update = TwinUpdate::new(TwinKey::new(provider, device_id));

    if let Some(name) = field_str(raw, &["deviceLabel", "displayName"]) {
        update = update.with_display_name(name);
    }
    if let Some(capability) = field_str(raw, &["capability"]) {
        update = update.with_capability(capability);
    }

    let mut state = Map::new();
    if let Some(Value::Object(delta)) = field(raw, &["state"]) {
        state.extend(delta.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    if let (Some(attribute), Some(value)) = (field_str(raw, &["attribute"]), field(raw, &["value"])) {
        state.insert(attribute, value.clone());
    }
    update.state = state;

    Some(update)
}
