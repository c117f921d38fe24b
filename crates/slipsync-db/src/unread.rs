//! Unread notification counts per (user, room), replaced on every poll
//! that reports them

use sqlx::PgConnection;

use slipsync_core::{Result, SlipsyncError};

/// Store the latest counts for (user, room)
pub async fn upsert_unread(
    conn: &mut PgConnection,
    user_id: &str,
    room_id: &str,
    notification_count: i64,
    highlight_count: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO syncv3_unread (user_id, room_id, notification_count, highlight_count) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (user_id, room_id) DO UPDATE \
         SET notification_count = EXCLUDED.notification_count, \
             highlight_count = EXCLUDED.highlight_count",
    )
    .bind(user_id)
    .bind(room_id)
    .bind(notification_count)
    .bind(highlight_count)
    .execute(&mut *conn)
    .await
    .map_err(|e| SlipsyncError::Database(e.to_string()))?;
    Ok(())
}

/// The stored counts as (notification_count, highlight_count)
pub async fn select_unread(
    conn: &mut PgConnection,
    user_id: &str,
    room_id: &str,
) -> Result<Option<(i64, i64)>> {
    sqlx::query_as(
        "SELECT notification_count, highlight_count FROM syncv3_unread \
         WHERE user_id = $1 AND room_id = $2",
    )
    .bind(user_id)
    .bind(room_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| SlipsyncError::Database(e.to_string()))
}
