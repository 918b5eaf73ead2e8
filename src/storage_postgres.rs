use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_postgres::{Client, Row};

use crate::error::TwinError;
use crate::twin::TwinStore;
use crate::types::{now_secs, DeviceTwin, TwinKey, TwinUpdate};

/// Twin store on a `device_twins` table.
///
/// Each upsert is one `INSERT .. ON CONFLICT DO UPDATE`, so row locking
/// serializes writers of the same device and leaves other devices alone.
pub struct PostgresTwinStore {
    client: Client,
}

impl PostgresTwinStore {
    pub async fn new(client: Client) -> Result<Self, TwinError> {
        client
            .execute(
                "CREATE TABLE IF NOT EXISTS device_twins (
                    provider TEXT NOT NULL,
                    external_id TEXT NOT NULL,
                    display_name TEXT,
                    capabilities TEXT[] NOT NULL DEFAULT '{}',
                    state JSONB NOT NULL DEFAULT '{}'::jsonb,
                    updated_at BIGINT NOT NULL,
                    PRIMARY KEY (provider, external_id)
                )",
                &[],
            )
            .await?;

        Ok(Self { client })
    }

    fn twin_from_row(row: &Row) -> Result<DeviceTwin, TwinError> {
        let capabilities: Vec<String> = row.try_get("capabilities")?;
        let state: Value = row.try_get("state")?;
        let updated_at: i64 = row.try_get("updated_at")?;
        Ok(DeviceTwin {
            provider: row.try_get("provider")?,
            external_id: row.try_get("external_id")?,
            display_name: row.try_get("display_name")?,
            capabilities: capabilities.into_iter().collect::<BTreeSet<_>>(),
            state: match state {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            updated_at_secs: updated_at.max(0) as u64,
        })
    }
}

#[async_trait]
impl TwinStore for PostgresTwinStore {
    async fn upsert(&self, update: &TwinUpdate) -> Result<DeviceTwin, TwinError> {
        let capabilities: Vec<String> = update.capabilities.iter().cloned().collect();
        let state = Value::Object(update.state.clone());
        let display_name = update.display_name.as_deref().filter(|n| !n.is_empty());
        let updated_at = now_secs() as i64;

        let row = self
            .client
            .query_one(
                "INSERT INTO device_twins
                    (provider, external_id, display_name, capabilities, state, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (provider, external_id) DO UPDATE SET
                    display_name = COALESCE(device_twins.display_name, EXCLUDED.display_name),
                    capabilities = ARRAY(
                        SELECT DISTINCT c
                        FROM unnest(device_twins.capabilities || EXCLUDED.capabilities) AS c
                        ORDER BY c
                    ),
                    state = device_twins.state || EXCLUDED.state,
                    updated_at = EXCLUDED.updated_at
                 RETURNING provider, external_id, display_name, capabilities, state, updated_at",
                &[
                    &update.key.provider,
                    &update.key.external_id,
                    &display_name,
                    &capabilities,
                    &state,
                    &updated_at,
                ],
            )
            .await?;

        Self::twin_from_row(&row)
    }

    async fn get(&self, key: &TwinKey) -> Result<Option<DeviceTwin>, TwinError> {
        let row = self
            .client
            .query_opt(
                "SELECT provider, external_id, display_name, capabilities, state, updated_at
                 FROM device_twins
                 WHERE provider = $1 AND external_id = $2",
                &[&key.provider, &key.external_id],
            )
            .await?;

        row.as_ref().map(Self::twin_from_row).transpose()
    }
}
