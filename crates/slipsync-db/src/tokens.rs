//! Bearer token bindings
//!
//! Maps client access tokens to (user, device). A user/device may hold
//! several historical tokens; each tracks when a client last presented it
//! so idle pollers can be expired.

use sqlx::PgConnection;

use slipsync_core::{Result, SlipsyncError};

use crate::models::TokenRow;

/// Insert or refresh a token binding
pub async fn upsert_token(
    conn: &mut PgConnection,
    token: &str,
    user_id: &str,
    device_id: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO syncv3_tokens (token, user_id, device_id, last_seen) \
         VALUES ($1, $2, $3, now()) \
         ON CONFLICT (token) DO UPDATE SET last_seen = now()",
    )
    .bind(token)
    .bind(user_id)
    .bind(device_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| SlipsyncError::Database(e.to_string()))?;
    Ok(())
}

/// Look up a token binding
pub async fn select_token(conn: &mut PgConnection, token: &str) -> Result<Option<TokenRow>> {
    sqlx::query_as::<_, TokenRow>(
        "SELECT token, user_id, device_id, last_seen FROM syncv3_tokens WHERE token = $1",
    )
    .bind(token)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| SlipsyncError::Database(e.to_string()))
}

/// Bump the last-seen timestamp for a token
pub async fn touch_token(conn: &mut PgConnection, token: &str) -> Result<()> {
    sqlx::query("UPDATE syncv3_tokens SET last_seen = now() WHERE token = $1")
        .bind(token)
        .execute(&mut *conn)
        .await
        .map_err(|e| SlipsyncError::Database(e.to_string()))?;
    Ok(())
}

/// Delete a token that upstream has declared expired
pub async fn delete_token(conn: &mut PgConnection, token: &str) -> Result<()> {
    sqlx::query("DELETE FROM syncv3_tokens WHERE token = $1")
        .bind(token)
        .execute(&mut *conn)
        .await
        .map_err(|e| SlipsyncError::Database(e.to_string()))?;
    Ok(())
}
