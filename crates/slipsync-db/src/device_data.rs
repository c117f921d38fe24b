//! Per-device E2EE bookkeeping
//!
//! Accumulates device_lists changed/left sets and one-time-key counts from
//! upstream responses; the whole blob is swallowed into the device's next
//! client response and reset.

use serde::{Deserialize, Serialize};
use sqlx::PgConnection;

use slipsync_core::{Result, SlipsyncError};

/// Accumulated device data blob
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceData {
    /// Users whose device lists changed since the last client drain
    #[serde(default)]
    pub changed: Vec<String>,

    /// Users the device no longer shares a room with
    #[serde(default)]
    pub left: Vec<String>,

    /// One-time key counts by algorithm
    #[serde(default)]
    pub otk_counts: serde_json::Map<String, serde_json::Value>,
}

/// Merge new upstream data into the stored blob
pub async fn upsert(
    conn: &mut PgConnection,
    user_id: &str,
    device_id: &str,
    changed: &[String],
    left: &[String],
    otk_counts: Option<&serde_json::Value>,
) -> Result<()> {
    let mut data = select(conn, user_id, device_id).await?.unwrap_or_default();
    for user in changed {
        if !data.changed.contains(user) {
            data.changed.push(user.clone());
        }
    }
    for user in left {
        if !data.left.contains(user) {
            data.left.push(user.clone());
        }
    }
    if let Some(serde_json::Value::Object(counts)) = otk_counts {
        data.otk_counts = counts.clone();
    }

    let blob = serde_json::to_value(&data)?;
    sqlx::query(
        "INSERT INTO syncv3_device_data (user_id, device_id, data) VALUES ($1, $2, $3) \
         ON CONFLICT (user_id, device_id) DO UPDATE SET data = EXCLUDED.data",
    )
    .bind(user_id)
    .bind(device_id)
    .bind(blob)
    .execute(&mut *conn)
    .await
    .map_err(|e| SlipsyncError::Database(e.to_string()))?;
    Ok(())
}

/// Read the stored blob
pub async fn select(
    conn: &mut PgConnection,
    user_id: &str,
    device_id: &str,
) -> Result<Option<DeviceData>> {
    let blob: Option<serde_json::Value> = sqlx::query_scalar(
        "SELECT data FROM syncv3_device_data WHERE user_id = $1 AND device_id = $2",
    )
    .bind(user_id)
    .bind(device_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| SlipsyncError::Database(e.to_string()))?;
    blob.map(|b| serde_json::from_value(b).map_err(|e| SlipsyncError::Deserialization(e.to_string())))
        .transpose()
}

/// Read and reset the changed/left lists, keeping the OTK counts.
/// Called when the blob is handed to the client.
pub async fn swallow(
    conn: &mut PgConnection,
    user_id: &str,
    device_id: &str,
) -> Result<Option<DeviceData>> {
    let data = select(conn, user_id, device_id).await?;
    if let Some(ref d) = data {
        let mut reset = d.clone();
        reset.changed.clear();
        reset.left.clear();
        let blob = serde_json::to_value(&reset)?;
        sqlx::query("UPDATE syncv3_device_data SET data = $3 WHERE user_id = $1 AND device_id = $2")
            .bind(user_id)
            .bind(device_id)
            .bind(blob)
            .execute(&mut *conn)
            .await
            .map_err(|e| SlipsyncError::Database(e.to_string()))?;
    }
    Ok(data)
}
