use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use crate::config::DlqConfig;
use crate::dlq::DlqStore;
use crate::error::StoreError;
use crate::idempotency::IdempotencyStore;
use crate::types::{DlqItem, FAR_FUTURE};

/// Idempotency markers as `SET key 1 NX EX ttl`.
///
/// One multiplexed connection is opened up front and shared by every check.
pub struct RedisIdempotencyStore {
    conn: MultiplexedConnection,
}

impl RedisIdempotencyStore {
    pub async fn new(client: &redis::Client) -> Result<Self, StoreError> {
        Ok(Self {
            conn: client.get_multiplexed_async_connection().await?,
        })
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        // Redis rejects EX 0 and expiries past its own clock range.
        let ttl_secs = ttl.min(FAR_FUTURE).as_secs().max(1);
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }
}

/// Dead-letter list: `LPUSH` + `LTRIM` in one transaction, `BRPOP` to consume.
///
/// `BRPOP` holds its connection until it returns, so pops get their own
/// connection and never stall pushes from the gateway.
pub struct RedisDlq {
    commands: MultiplexedConnection,
    blocking: MultiplexedConnection,
    key: String,
    max_len: usize,
}

impl RedisDlq {
    pub async fn new(
        client: &redis::Client,
        key: impl Into<String>,
        max_len: usize,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            commands: client.get_multiplexed_async_connection().await?,
            blocking: client.get_multiplexed_async_connection().await?,
            key: key.into(),
            max_len: max_len.max(1),
        })
    }

    /// List bounded by `config.max_len`.
    pub async fn from_config(
        client: &redis::Client,
        key: impl Into<String>,
        config: &DlqConfig,
    ) -> Result<Self, StoreError> {
        Self::new(client, key, config.max_len).await
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }
}

#[async_trait]
impl DlqStore for RedisDlq {
    async fn push(&self, item: &DlqItem) -> Result<(), StoreError> {
        let payload = serde_json::to_string(item)?;
        let mut conn = self.commands.clone();
        let () = redis::pipe()
            .atomic()
            .lpush(&self.key, payload)
            .ignore()
            .ltrim(&self.key, 0, self.max_len as isize - 1)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<DlqItem>, StoreError> {
        let mut conn = self.blocking.clone();
        // BRPOP treats 0 as "wait forever".
        let timeout = timeout.min(FAR_FUTURE).as_secs_f64().max(0.001);
        let popped: Option<(String, String)> = conn.brpop(&self.key, timeout).await?;
        match popped {
            Some((_, payload)) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn len(&self) -> Result<usize, StoreError> {
        let mut conn = self.commands.clone();
        Ok(conn.llen(&self.key).await?)
    }

    async fn snapshot(&self) -> Result<Vec<DlqItem>, StoreError> {
        let mut conn = self.commands.clone();
        let values: Vec<String> = conn.lrange(&self.key, 0, -1).await?;
        Ok(values
            .into_iter()
            .filter_map(|v| serde_json::from_str::<DlqItem>(&v).ok())
            .collect())
    }
}
