//! Read receipt storage, latest receipt per (room, user, type)

use sqlx::PgConnection;

use slipsync_core::{Result, SlipsyncError};

/// Upsert one receipt
pub async fn upsert_receipt(
    conn: &mut PgConnection,
    room_id: &str,
    user_id: &str,
    receipt_type: &str,
    event_id: &str,
    data: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO syncv3_receipts (room_id, user_id, receipt_type, event_id, data) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (room_id, user_id, receipt_type) \
         DO UPDATE SET event_id = EXCLUDED.event_id, data = EXCLUDED.data",
    )
    .bind(room_id)
    .bind(user_id)
    .bind(receipt_type)
    .bind(event_id)
    .bind(data)
    .execute(&mut *conn)
    .await
    .map_err(|e| SlipsyncError::Database(e.to_string()))?;
    Ok(())
}

/// All stored receipts for a room as (user, type, event id, data)
pub async fn select_receipts_for_room(
    conn: &mut PgConnection,
    room_id: &str,
) -> Result<Vec<(String, String, String, serde_json::Value)>> {
    sqlx::query_as(
        "SELECT user_id, receipt_type, event_id, data FROM syncv3_receipts WHERE room_id = $1",
    )
    .bind(room_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| SlipsyncError::Database(e.to_string()))
}
