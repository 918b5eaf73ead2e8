use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::signing::SignatureEncoding;

/// How inbound deliveries are authenticated.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureConfig {
    /// Shared HMAC secret. `None` or empty runs the endpoint open.
    pub secret: Option<String>,

    /// Header carrying the signature.
    pub header: String,

    pub encoding: SignatureEncoding,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            secret: None,
            header: "X-Signature".to_string(),
            encoding: SignatureEncoding::Hex,
        }
    }
}

impl SignatureConfig {
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.header = header.into();
        self
    }

    pub fn with_encoding(mut self, encoding: SignatureEncoding) -> Self {
        self.encoding = encoding;
        self
    }
}

impl fmt::Debug for SignatureConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureConfig")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("header", &self.header)
            .field("encoding", &self.encoding)
            .finish()
    }
}

/// Webhook gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Provider name recorded on every twin this gateway touches.
    pub provider: String,

    /// Event bus topic for forwarded events.
    pub topic: String,

    /// Dedup namespace; one per producer.
    pub dedup_namespace: String,

    /// How long an event id stays marked as processed.
    pub dedup_ttl_secs: u64,

    pub signature: SignatureConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            provider: "smartthings".to_string(),
            topic: "device.events".to_string(),
            dedup_namespace: "smartthings".to_string(),
            dedup_ttl_secs: 24 * 60 * 60,
            signature: SignatureConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Create a config for a provider; the dedup namespace follows the provider.
    pub fn for_provider(provider: impl Into<String>) -> Self {
        let provider = provider.into();
        Self {
            dedup_namespace: provider.clone(),
            provider,
            ..Self::default()
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl_secs = ttl.as_secs();
        self
    }

    pub fn with_signature(mut self, signature: SignatureConfig) -> Self {
        self.signature = signature;
        self
    }
}

/// Dead-letter queue and retry consumer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    /// Ring buffer capacity; the oldest entry is evicted past this.
    pub max_len: usize,

    /// Blocking pop timeout.
    pub pop_timeout_ms: u64,

    /// Pause after an empty pop before polling again.
    pub idle_ms: u64,

    pub backoff_floor_ms: u64,
    pub backoff_ceiling_ms: u64,

    /// Retry cap. `None` retries until success.
    pub max_attempts: Option<u32>,

    /// Topic the consumer republishes to.
    pub topic: String,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_len: 1_000,
            pop_timeout_ms: 5_000,
            idle_ms: 250,
            backoff_floor_ms: 1_000,
            backoff_ceiling_ms: 30_000,
            max_attempts: None,
            topic: "device.events".to_string(),
        }
    }
}

impl DlqConfig {
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_backoff(mut self, floor: Duration, ceiling: Duration) -> Self {
        self.backoff_floor_ms = floor.as_millis() as u64;
        self.backoff_ceiling_ms = ceiling.as_millis() as u64;
        self
    }

    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }

    pub fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }
}
