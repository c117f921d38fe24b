//! Device since-token storage
//!
//! One row per (user, device) holding the upstream sync cursor. The cursor
//! is written only after the response it came from has been fully
//! persisted, so a crashed poller resumes from the last committed batch
//! and re-processing the tail is idempotent via event-id dedup.

use sqlx::PgConnection;

use slipsync_core::{Result, SlipsyncError};

/// Ensure a device row exists
pub async fn insert_device(
    conn: &mut PgConnection,
    user_id: &str,
    device_id: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO syncv3_devices (user_id, device_id) VALUES ($1, $2) \
         ON CONFLICT (user_id, device_id) DO NOTHING",
    )
    .bind(user_id)
    .bind(device_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| SlipsyncError::Database(e.to_string()))?;
    Ok(())
}

/// The device's committed since token, empty string when never synced
pub async fn select_since(
    conn: &mut PgConnection,
    user_id: &str,
    device_id: &str,
) -> Result<String> {
    let since: Option<String> = sqlx::query_scalar(
        "SELECT since FROM syncv3_devices WHERE user_id = $1 AND device_id = $2",
    )
    .bind(user_id)
    .bind(device_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| SlipsyncError::Database(e.to_string()))?;
    Ok(since.unwrap_or_default())
}

/// Commit a new since token for the device
pub async fn update_since(
    conn: &mut PgConnection,
    user_id: &str,
    device_id: &str,
    since: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE syncv3_devices SET since = $3, since_updated_at = now() \
         WHERE user_id = $1 AND device_id = $2",
    )
    .bind(user_id)
    .bind(device_id)
    .bind(since)
    .execute(&mut *conn)
    .await
    .map_err(|e| SlipsyncError::Database(e.to_string()))?;
    Ok(())
}
