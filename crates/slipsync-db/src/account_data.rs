//! Account data storage, keyed by (user, room-or-global, type)

use sqlx::PgConnection;

use slipsync_core::{Result, SlipsyncError};

/// Global account data uses the empty room id
pub const GLOBAL_ROOM: &str = "";

/// Upsert one account data entry
pub async fn upsert(
    conn: &mut PgConnection,
    user_id: &str,
    room_id: &str,
    data_type: &str,
    content: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO syncv3_account_data (user_id, room_id, type, content) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (user_id, room_id, type) DO UPDATE SET content = EXCLUDED.content",
    )
    .bind(user_id)
    .bind(room_id)
    .bind(data_type)
    .bind(content)
    .execute(&mut *conn)
    .await
    .map_err(|e| SlipsyncError::Database(e.to_string()))?;
    Ok(())
}

/// All account data for a user scoped to one room ('' for global)
pub async fn select_for_room(
    conn: &mut PgConnection,
    user_id: &str,
    room_id: &str,
) -> Result<Vec<(String, serde_json::Value)>> {
    sqlx::query_as(
        "SELECT type, content FROM syncv3_account_data WHERE user_id = $1 AND room_id = $2",
    )
    .bind(user_id)
    .bind(room_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| SlipsyncError::Database(e.to_string()))
}
