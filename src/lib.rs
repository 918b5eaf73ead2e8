//! Ingestion core for device-state webhooks pushed by a third-party cloud.
//!
//! The push source delivers at least once and retries on its own schedule.
//! This crate turns those deliveries into forwarded events and materialized
//! device twins:
//!
//! - HMAC-SHA256 authentication of the raw body (hex or base64)
//! - lifecycle confirmation handshakes
//! - per-event idempotency with a TTL, backed by a shared store with an
//!   in-process fallback
//! - publish to an injected event bus, upsert of the device twin
//! - per-item failure isolation into a bounded dead-letter queue, drained by
//!   a background consumer with exponential backoff
//!
//! ## Guarantees
//! - At most once forwarding per event id within the dedup window
//! - Bounded dead-letter memory; overflow evicts the oldest entry
//! - Per-device serialization of twin updates
//! - A verified delivery is always acknowledged
//!
//! ## Non-Guarantees
//! - Atomicity between marking an event seen, publishing it and updating
//!   its twin
//! - Delivery of events evicted from a full dead-letter queue
//! - Ordering across deliveries

mod bus;
mod config;
mod consumer;
mod dlq;
mod error;
mod gateway;
mod idempotency;
mod signing;
mod telemetry;
mod twin;
mod types;

#[cfg(feature = "redis")]
mod storage_redis;

#[cfg(feature = "postgres")]
mod storage_postgres;

#[cfg(feature = "axum")]
pub mod http;

pub use bus::{EventBus, InMemoryEventBus, PublishedMessage};
pub use config::{DlqConfig, GatewayConfig, SignatureConfig};
pub use consumer::{Backoff, ConsumerHandle, ConsumerStats, DlqConsumer};
pub use dlq::{DlqStore, InMemoryDlq};
pub use error::{ItemError, PublishError, StoreError, TwinError, VerifyError};
pub use gateway::{BatchSummary, GatewayResponse, WebhookGateway};
pub use idempotency::{
    DedupOutcome, IdempotencyGuard, IdempotencyStore, InMemoryIdempotencyStore, Sighting,
};
pub use signing::{
    check_signature, compute_signature, signature_from_headers, verify_signature,
    SignatureEncoding,
};
pub use twin::{InMemoryTwinStore, TwinStore};
pub use types::{DeviceTwin, DlqItem, Event, EventId, TwinKey, TwinUpdate};

#[cfg(feature = "redis")]
pub use storage_redis::{RedisDlq, RedisIdempotencyStore};

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresTwinStore;
