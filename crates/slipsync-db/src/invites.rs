//! Invite storage
//!
//! The stripped invite_state block for each (user, room) pending invite,
//! replaced wholesale on each upstream invite block and deleted when the
//! invite resolves (join, leave, or retirement).

use sqlx::PgConnection;

use slipsync_core::{Result, SlipsyncError};

/// Store or replace the invite for (user, room)
pub async fn upsert_invite(
    conn: &mut PgConnection,
    user_id: &str,
    room_id: &str,
    invite_state: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO syncv3_invites (user_id, room_id, invite_state) VALUES ($1, $2, $3) \
         ON CONFLICT (user_id, room_id) DO UPDATE SET invite_state = EXCLUDED.invite_state",
    )
    .bind(user_id)
    .bind(room_id)
    .bind(invite_state)
    .execute(&mut *conn)
    .await
    .map_err(|e| SlipsyncError::Database(e.to_string()))?;
    Ok(())
}

/// Remove a resolved invite
pub async fn delete_invite(conn: &mut PgConnection, user_id: &str, room_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM syncv3_invites WHERE user_id = $1 AND room_id = $2")
        .bind(user_id)
        .bind(room_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| SlipsyncError::Database(e.to_string()))?;
    Ok(())
}

/// All pending invites for a user as (room id, invite_state events)
pub async fn select_invites_for_user(
    conn: &mut PgConnection,
    user_id: &str,
) -> Result<Vec<(String, serde_json::Value)>> {
    sqlx::query_as("SELECT room_id, invite_state FROM syncv3_invites WHERE user_id = $1")
        .bind(user_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| SlipsyncError::Database(e.to_string()))
}
