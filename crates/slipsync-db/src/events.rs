// =============================================================================
// Slipsync Matrix Sliding Sync Proxy - Events Table
// =============================================================================
//
// Project: Slipsync - High Performance Matrix Sliding Sync Proxy (MSC3575)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Contributors: Matrixon Development Team
// Date: 2025-01-20
// Version: 0.1.0-alpha (PostgreSQL Backend)
// License: Apache 2.0 / MIT
//
// Description:
//   The append-only events table. Every event observed upstream lands here
//   exactly once, keyed by its globally unique event id and assigned a
//   monotonically increasing NID from a sequence. NIDs are never reused and
//   order rows by insertion, which within one accumulator transaction means
//   causal timeline order.
//
// =============================================================================

use std::collections::HashMap;

use sqlx::PgConnection;
use tracing::debug;

use slipsync_core::{Nid, Result, SlipsyncError};

use crate::models::{Event, EventToInsert, StrippedEvent};

const SELECT_COLUMNS: &str = "event_nid, event_id, room_id, event_type, state_key, sender, \
     origin_server_ts, event, is_state, missing_previous, prev_batch";

/// Insert one event, idempotent by event id.
///
/// Returns the NID (new or existing) and whether the row was newly
/// inserted. Rows are inserted one at a time so the sequence assigns NIDs
/// in input order.
pub async fn insert_event(
    conn: &mut PgConnection,
    room_id: &str,
    ev: &EventToInsert,
) -> Result<(Nid, bool)> {
    let inserted: Option<Nid> = sqlx::query_scalar(
        r#"
        INSERT INTO syncv3_events
            (event_id, room_id, event_type, state_key, sender, origin_server_ts,
             event, is_state, missing_previous, prev_batch)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (event_id) DO NOTHING
        RETURNING event_nid
        "#,
    )
    .bind(&ev.id)
    .bind(room_id)
    .bind(&ev.event_type)
    .bind(&ev.state_key)
    .bind(&ev.sender)
    .bind(ev.origin_server_ts)
    .bind(&ev.json)
    .bind(ev.is_state)
    .bind(ev.missing_previous)
    .bind(&ev.prev_batch)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| SlipsyncError::Database(e.to_string()))?;

    if let Some(nid) = inserted {
        return Ok((nid, true));
    }

    let existing: Nid = sqlx::query_scalar("SELECT event_nid FROM syncv3_events WHERE event_id = $1")
        .bind(&ev.id)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| SlipsyncError::Database(e.to_string()))?;
    Ok((existing, false))
}

/// Select full events by NID, ordered by NID ascending
pub async fn select_by_nids(conn: &mut PgConnection, nids: &[Nid]) -> Result<Vec<Event>> {
    let query = format!(
        "SELECT {SELECT_COLUMNS} FROM syncv3_events WHERE event_nid = ANY($1) ORDER BY event_nid ASC"
    );
    sqlx::query_as::<_, Event>(&query)
        .bind(nids)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| SlipsyncError::Database(e.to_string()))
}

/// Select full events by event id, ordered by NID ascending
pub async fn select_by_ids(conn: &mut PgConnection, ids: &[String]) -> Result<Vec<Event>> {
    let query = format!(
        "SELECT {SELECT_COLUMNS} FROM syncv3_events WHERE event_id = ANY($1) ORDER BY event_nid ASC"
    );
    sqlx::query_as::<_, Event>(&query)
        .bind(ids)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| SlipsyncError::Database(e.to_string()))
}

/// Map event ids to NIDs; missing ids are absent from the result
pub async fn select_nids_by_ids(
    conn: &mut PgConnection,
    ids: &[String],
) -> Result<HashMap<String, Nid>> {
    let rows: Vec<(String, Nid)> =
        sqlx::query_as("SELECT event_id, event_nid FROM syncv3_events WHERE event_id = ANY($1)")
            .bind(ids)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| SlipsyncError::Database(e.to_string()))?;
    Ok(rows.into_iter().collect())
}

/// The highest NID assigned so far, or 0 for an empty store
pub async fn select_highest_nid(conn: &mut PgConnection) -> Result<Nid> {
    let max: Option<Nid> = sqlx::query_scalar("SELECT max(event_nid) FROM syncv3_events")
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| SlipsyncError::Database(e.to_string()))?;
    Ok(max.unwrap_or(0))
}

/// The newest `limit` timeline events for a room with NID <= `upto`,
/// returned oldest-first. State-block rows are excluded.
pub async fn select_latest_events(
    conn: &mut PgConnection,
    room_id: &str,
    upto: Nid,
    limit: i64,
) -> Result<Vec<Event>> {
    let query = format!(
        "SELECT {SELECT_COLUMNS} FROM syncv3_events \
         WHERE room_id = $1 AND event_nid <= $2 AND is_state = FALSE \
         ORDER BY event_nid DESC LIMIT $3"
    );
    let mut events = sqlx::query_as::<_, Event>(&query)
        .bind(room_id)
        .bind(upto)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| SlipsyncError::Database(e.to_string()))?;
    events.reverse();
    Ok(events)
}

/// Timeline events in (from, to], oldest-first, capped at `limit`
pub async fn select_events_between(
    conn: &mut PgConnection,
    room_id: &str,
    from_excl: Nid,
    to_incl: Nid,
    limit: i64,
) -> Result<Vec<Event>> {
    let query = format!(
        "SELECT {SELECT_COLUMNS} FROM syncv3_events \
         WHERE room_id = $1 AND event_nid > $2 AND event_nid <= $3 AND is_state = FALSE \
         ORDER BY event_nid ASC LIMIT $4"
    );
    sqlx::query_as::<_, Event>(&query)
        .bind(room_id)
        .bind(from_excl)
        .bind(to_incl)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| SlipsyncError::Database(e.to_string()))
}

/// Events of a given (type, state key) in the NID range (from, to],
/// ordered by NID ascending. Used for membership log queries.
pub async fn select_events_with_type_state_key(
    conn: &mut PgConnection,
    event_type: &str,
    state_key: &str,
    from_excl: Nid,
    to_incl: Nid,
) -> Result<Vec<Event>> {
    let query = format!(
        "SELECT {SELECT_COLUMNS} FROM syncv3_events \
         WHERE event_type = $1 AND state_key = $2 AND event_nid > $3 AND event_nid <= $4 \
         ORDER BY event_nid ASC"
    );
    sqlx::query_as::<_, Event>(&query)
        .bind(event_type)
        .bind(state_key)
        .bind(from_excl)
        .bind(to_incl)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| SlipsyncError::Database(e.to_string()))
}

/// The prev_batch stored closest at-or-after the given NID in this room.
///
/// Timelines store their upstream pagination token against their first
/// event, so the closest token at or after an event's NID lets a client
/// back-paginate from that event.
pub async fn select_closest_prev_batch(
    conn: &mut PgConnection,
    room_id: &str,
    nid: Nid,
) -> Result<Option<String>> {
    sqlx::query_scalar(
        "SELECT prev_batch FROM syncv3_events \
         WHERE room_id = $1 AND event_nid >= $2 AND prev_batch IS NOT NULL \
         ORDER BY event_nid ASC LIMIT 1",
    )
    .bind(room_id)
    .bind(nid)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| SlipsyncError::Database(e.to_string()))
}

/// Reduce stored events to the fields snapshot arithmetic needs.
/// Errors if any requested NID is missing or is not a state event.
pub async fn select_stripped_by_nids(
    conn: &mut PgConnection,
    nids: &[Nid],
) -> Result<Vec<StrippedEvent>> {
    let rows: Vec<(Nid, String, Option<String>)> = sqlx::query_as(
        "SELECT event_nid, event_type, state_key FROM syncv3_events \
         WHERE event_nid = ANY($1) ORDER BY event_nid ASC",
    )
    .bind(nids)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| SlipsyncError::Database(e.to_string()))?;

    if rows.len() != nids.len() {
        return Err(SlipsyncError::InvalidState(format!(
            "select_stripped_by_nids: asked for {} nids, found {}",
            nids.len(),
            rows.len()
        )));
    }
    rows.into_iter()
        .map(|(nid, event_type, state_key)| {
            let state_key = state_key.ok_or_else(|| {
                SlipsyncError::InvalidState(format!("event nid {nid} is in a snapshot but has no state key"))
            })?;
            Ok(StrippedEvent {
                nid,
                event_type,
                state_key,
            })
        })
        .collect()
}

/// Prune the content of a redacted event in place
pub async fn redact_event(conn: &mut PgConnection, event_id: &str) -> Result<()> {
    debug!("🔧 Redacting event {}", event_id);
    sqlx::query(
        r#"UPDATE syncv3_events SET event = jsonb_set(event, '{content}', '{}') WHERE event_id = $1"#,
    )
    .bind(event_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| SlipsyncError::Database(e.to_string()))?;
    Ok(())
}
