//! State snapshot storage for Slipsync
//!
//! Snapshots are immutable sets of state event NIDs, stored as two sorted
//! BIGINT arrays (memberships and everything else). A new snapshot row is
//! written for every state event the accumulator ingests; compaction later
//! deletes rows no client can still reach.

use std::collections::HashMap;

use sqlx::PgConnection;
use tracing::debug;

use slipsync_core::{Nid, Result, SlipsyncError, SnapshotId};

use crate::models::SnapshotRow;

/// Insert a snapshot, returning its assigned id
pub async fn insert_snapshot(
    conn: &mut PgConnection,
    room_id: &str,
    membership_events: &[Nid],
    other_events: &[Nid],
) -> Result<SnapshotId> {
    sqlx::query_scalar(
        "INSERT INTO syncv3_snapshots (room_id, membership_events, other_events) \
         VALUES ($1, $2, $3) RETURNING snapshot_id",
    )
    .bind(room_id)
    .bind(membership_events)
    .bind(other_events)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| SlipsyncError::Database(e.to_string()))
}

/// Select one snapshot by id
pub async fn select_snapshot(
    conn: &mut PgConnection,
    snapshot_id: SnapshotId,
) -> Result<SnapshotRow> {
    sqlx::query_as::<_, SnapshotRow>(
        "SELECT snapshot_id, room_id, membership_events, other_events \
         FROM syncv3_snapshots WHERE snapshot_id = $1",
    )
    .bind(snapshot_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| SlipsyncError::Database(e.to_string()))?
    .ok_or_else(|| SlipsyncError::NotFound(format!("snapshot {snapshot_id}")))
}

/// The current snapshot NIDs for every room, in one query.
/// Feeds the global cache rebuild at startup.
pub async fn current_snapshots(conn: &mut PgConnection) -> Result<HashMap<String, Vec<Nid>>> {
    let rows: Vec<SnapshotRow> = sqlx::query_as(
        "SELECT s.snapshot_id, s.room_id, s.membership_events, s.other_events \
         FROM syncv3_snapshots s \
         JOIN syncv3_rooms r ON r.current_after_snapshot_id = s.snapshot_id",
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| SlipsyncError::Database(e.to_string()))?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let nids = row.nids();
            (row.room_id, nids)
        })
        .collect())
}

/// Delete snapshots for this room beyond the newest `keep` rows, never
/// deleting the room's current snapshot. Returns the number deleted.
///
/// A client may walk back at most the timeline limit, so older snapshots
/// are unreachable.
pub async fn remove_inaccessible(
    conn: &mut PgConnection,
    room_id: &str,
    keep: i64,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM syncv3_snapshots
        WHERE room_id = $1
          AND snapshot_id NOT IN (
            SELECT snapshot_id FROM syncv3_snapshots
            WHERE room_id = $1
            ORDER BY snapshot_id DESC
            LIMIT $2
          )
          AND snapshot_id NOT IN (
            SELECT current_after_snapshot_id FROM syncv3_rooms WHERE room_id = $1
          )
        "#,
    )
    .bind(room_id)
    .bind(keep)
    .execute(&mut *conn)
    .await
    .map_err(|e| SlipsyncError::Database(e.to_string()))?;

    if result.rows_affected() > 0 {
        debug!(
            "🔧 Compacted {} snapshots in room {}",
            result.rows_affected(),
            room_id
        );
    }
    Ok(result.rows_affected())
}

/// Number of snapshots stored for a room
pub async fn count_for_room(conn: &mut PgConnection, room_id: &str) -> Result<i64> {
    sqlx::query_scalar("SELECT count(*) FROM syncv3_snapshots WHERE room_id = $1")
        .bind(room_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| SlipsyncError::Database(e.to_string()))
}
