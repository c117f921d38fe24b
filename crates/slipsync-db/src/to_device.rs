//! To-device message queue
//!
//! FIFO per (user, device) with a monotonic position. Delivery is
//! at-least-once: the client acks by advancing the extension's since
//! watermark, at which point the acknowledged prefix is deleted.

use sqlx::PgConnection;
use tracing::debug;

use slipsync_core::{Result, SlipsyncError};

/// Append messages for a device, returning the highest queued position
pub async fn insert_messages(
    conn: &mut PgConnection,
    user_id: &str,
    device_id: &str,
    messages: &[serde_json::Value],
) -> Result<i64> {
    let mut latest = 0i64;
    for message in messages {
        latest = sqlx::query_scalar(
            "INSERT INTO syncv3_to_device_messages (user_id, device_id, message) \
             VALUES ($1, $2, $3) RETURNING position",
        )
        .bind(user_id)
        .bind(device_id)
        .bind(message)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| SlipsyncError::Database(e.to_string()))?;
    }
    if !messages.is_empty() {
        debug!(
            "🔧 Queued {} to-device messages for {}/{}",
            messages.len(),
            user_id,
            device_id
        );
    }
    Ok(latest)
}

/// Messages after `from` up to `limit`, with the new watermark
pub async fn select_messages(
    conn: &mut PgConnection,
    user_id: &str,
    device_id: &str,
    from: i64,
    limit: i64,
) -> Result<(Vec<serde_json::Value>, i64)> {
    let rows: Vec<(i64, serde_json::Value)> = sqlx::query_as(
        "SELECT position, message FROM syncv3_to_device_messages \
         WHERE user_id = $1 AND device_id = $2 AND position > $3 \
         ORDER BY position ASC LIMIT $4",
    )
    .bind(user_id)
    .bind(device_id)
    .bind(from)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| SlipsyncError::Database(e.to_string()))?;

    let watermark = rows.last().map(|(pos, _)| *pos).unwrap_or(from);
    Ok((rows.into_iter().map(|(_, msg)| msg).collect(), watermark))
}

/// Delete the acknowledged prefix up to and including `upto`
pub async fn delete_messages_upto(
    conn: &mut PgConnection,
    user_id: &str,
    device_id: &str,
    upto: i64,
) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM syncv3_to_device_messages \
         WHERE user_id = $1 AND device_id = $2 AND position <= $3",
    )
    .bind(user_id)
    .bind(device_id)
    .bind(upto)
    .execute(&mut *conn)
    .await
    .map_err(|e| SlipsyncError::Database(e.to_string()))?;
    Ok(result.rows_affected())
}
