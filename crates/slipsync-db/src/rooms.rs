//! Room pointer table for Slipsync
//!
//! One row per room holding the current-after snapshot pointer and the
//! most recent upstream pagination token. The row doubles as the per-room
//! write lock: every accumulator transaction takes `FOR UPDATE` on it, so
//! the snapshot chain of a room is totally ordered under concurrent
//! writers.

use sqlx::PgConnection;

use slipsync_core::{Result, SlipsyncError, SnapshotId};

use crate::models::RoomRow;

/// Ensure the room row exists and lock it for the rest of the transaction
pub async fn lock_room(conn: &mut PgConnection, room_id: &str) -> Result<()> {
    sqlx::query("INSERT INTO syncv3_rooms (room_id) VALUES ($1) ON CONFLICT (room_id) DO NOTHING")
        .bind(room_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| SlipsyncError::Database(e.to_string()))?;
    sqlx::query("SELECT room_id FROM syncv3_rooms WHERE room_id = $1 FOR UPDATE")
        .bind(room_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| SlipsyncError::Database(e.to_string()))?;
    Ok(())
}

/// The room's current-after snapshot id, 0 when the room has no state yet
pub async fn current_after_snapshot_id(
    conn: &mut PgConnection,
    room_id: &str,
) -> Result<SnapshotId> {
    let id: Option<SnapshotId> = sqlx::query_scalar(
        "SELECT current_after_snapshot_id FROM syncv3_rooms WHERE room_id = $1",
    )
    .bind(room_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| SlipsyncError::Database(e.to_string()))?;
    Ok(id.unwrap_or(0))
}

/// Advance the room's current-after snapshot pointer
pub async fn set_current_after_snapshot_id(
    conn: &mut PgConnection,
    room_id: &str,
    snapshot_id: SnapshotId,
) -> Result<()> {
    sqlx::query("UPDATE syncv3_rooms SET current_after_snapshot_id = $2 WHERE room_id = $1")
        .bind(room_id)
        .bind(snapshot_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| SlipsyncError::Database(e.to_string()))?;
    Ok(())
}

/// Record the most recent upstream pagination token for the room
pub async fn set_last_prev_batch(
    conn: &mut PgConnection,
    room_id: &str,
    prev_batch: &str,
) -> Result<()> {
    sqlx::query("UPDATE syncv3_rooms SET last_prev_batch = $2 WHERE room_id = $1")
        .bind(room_id)
        .bind(prev_batch)
        .execute(&mut *conn)
        .await
        .map_err(|e| SlipsyncError::Database(e.to_string()))?;
    Ok(())
}

/// Select one room row
pub async fn select_room(conn: &mut PgConnection, room_id: &str) -> Result<Option<RoomRow>> {
    sqlx::query_as::<_, RoomRow>(
        "SELECT room_id, current_after_snapshot_id, last_prev_batch \
         FROM syncv3_rooms WHERE room_id = $1",
    )
    .bind(room_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| SlipsyncError::Database(e.to_string()))
}

/// All room ids known to the store
pub async fn all_room_ids(conn: &mut PgConnection) -> Result<Vec<String>> {
    sqlx::query_scalar("SELECT room_id FROM syncv3_rooms")
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| SlipsyncError::Database(e.to_string()))
}
