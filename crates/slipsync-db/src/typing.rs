//! Typing notifications
//!
//! One row per room with the currently-typing users and a strictly
//! increasing stream id, so conns can cheaply ask "anything new since my
//! last poll?".

use sqlx::PgConnection;

use slipsync_core::{Result, SlipsyncError};

/// Replace the set of typing users for a room, returning the new stream id
pub async fn set_typing(
    conn: &mut PgConnection,
    room_id: &str,
    user_ids: &[String],
) -> Result<i64> {
    sqlx::query_scalar(
        "INSERT INTO syncv3_typing (room_id, stream_id, user_ids) \
         VALUES ($1, nextval('syncv3_typing_seq'), $2) \
         ON CONFLICT (room_id) DO UPDATE \
         SET stream_id = nextval('syncv3_typing_seq'), user_ids = EXCLUDED.user_ids \
         RETURNING stream_id",
    )
    .bind(room_id)
    .bind(user_ids)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| SlipsyncError::Database(e.to_string()))
}

/// The typing users for a room if the stream has advanced past `from`
pub async fn typing_since(
    conn: &mut PgConnection,
    room_id: &str,
    from: i64,
) -> Result<Option<(Vec<String>, i64)>> {
    let row: Option<(Vec<String>, i64)> = sqlx::query_as(
        "SELECT user_ids, stream_id FROM syncv3_typing WHERE room_id = $1 AND stream_id > $2",
    )
    .bind(room_id)
    .bind(from)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| SlipsyncError::Database(e.to_string()))?;
    Ok(row)
}
