use std::sync::Arc;
use std::time::Duration;

use device_webhook_ingest::{
    compute_signature, DlqConfig, DlqConsumer, GatewayConfig, IdempotencyGuard, InMemoryDlq,
    InMemoryEventBus, InMemoryTwinStore, SignatureConfig, SignatureEncoding, TwinKey, TwinStore,
    WebhookGateway,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let dlq_config = DlqConfig::default().with_max_len(500);

    let bus = Arc::new(InMemoryEventBus::with_retention(100));
    let twins = Arc::new(InMemoryTwinStore::new());
    let dlq = Arc::new(InMemoryDlq::from_config(&dlq_config));

    let config = GatewayConfig::for_provider("smartthings")
        .with_signature(SignatureConfig::default().with_secret("supersecret"));
    let gateway = WebhookGateway::new(
        config,
        Arc::new(IdempotencyGuard::in_memory()),
        bus.clone(),
        twins.clone(),
        dlq.clone(),
    );

    let consumer = DlqConsumer::new(dlq_config, dlq, bus.clone()).spawn();

    let body = serde_json::to_vec(&json!({
        "lifecycle": "EVENT",
        "eventData": {
            "events": [{
                "eventType": "DEVICE_EVENT",
                "deviceEvent": {
                    "eventId": "evt_123",
                    "deviceId": "lamp-1",
                    "capability": "switch",
                    "attribute": "switch",
                    "value": "on",
                }
            }]
        }
    }))
    .unwrap_or_default();
    let signature = compute_signature(b"supersecret", &body, SignatureEncoding::Hex);

    let response = gateway.handle(&body, Some(&signature)).await;
    println!("{} {}", response.status_code(), response.body());

    // Redelivery of the same batch is acknowledged but not forwarded again.
    let response = gateway.handle(&body, Some(&signature)).await;
    println!("{} {}", response.status_code(), response.body());

    if let Ok(Some(twin)) = twins.get(&TwinKey::new("smartthings", "lamp-1")).await {
        println!("twin {:?} state={:?}", twin.capabilities, twin.state);
    }
    println!("published {} event(s)", bus.published().await.len());

    tokio::time::sleep(Duration::from_millis(100)).await;
    consumer.shutdown().await;
}
