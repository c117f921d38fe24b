// =============================================================================
// Slipsync Matrix Sliding Sync Proxy - Accumulator Module
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
//   The room state accumulator. Ingests upstream (state, timeline, limited,
//   prev_batch) tuples and materializes immutable snapshots of room state,
//   one snapshot per ingested state event. Detects and marks timeline gaps
//   via the missing_previous flag. All operations run inside a caller
//   supplied transaction holding the per-room row lock, so concurrent
//   accumulators for the same room serialize into a totally ordered
//   snapshot chain.
//
// Features:
//   • Initialise: seed or overlay a room's state block
//   • Accumulate: ingest a timeline, chaining one snapshot per state event
//   • Pure snapshot arithmetic with corrupt-snapshot guards
//   • State redaction detection for cache invalidation
//   • Snapshot compaction beyond the reachable horizon
//
// =============================================================================

use serde_json::Value;
use sqlx::PgConnection;
use tracing::{debug, warn};

use slipsync_core::{Nid, Result, SlipsyncError, SnapshotId};

use crate::models::{EventToInsert, StrippedEvent};
use crate::{events, rooms, snapshots};

/// A timeline block from one upstream sync response
#[derive(Debug, Clone, Default)]
pub struct TimelineInput {
    /// Raw timeline events, oldest first
    pub events: Vec<Value>,

    /// True when upstream omitted events between this batch and the last
    pub limited: bool,

    /// Upstream pagination token for the omitted history
    pub prev_batch: Option<String>,
}

/// Result of an Initialise call
#[derive(Debug, Clone, Default)]
pub struct InitialiseResult {
    /// True if at least one event in the state block was new
    pub added_events: bool,

    /// The snapshot made current by this call, 0 when nothing changed
    pub snapshot_id: SnapshotId,

    /// True when the state block was overlaid onto existing room state.
    /// Conns tracking this room can no longer trust their delta history.
    pub replaced_existing_snapshot: bool,
}

/// Result of an Accumulate call
#[derive(Debug, Clone, Default)]
pub struct AccumulateResult {
    /// Number of events newly inserted
    pub num_new: usize,

    /// NIDs of the newly inserted timeline events, in order
    pub timeline_nids: Vec<Nid>,

    /// True iff a newly inserted redaction targets an event in the final
    /// current snapshot; the room metadata cache must reload
    pub includes_state_redaction: bool,
}

/// The room state accumulator
#[derive(Debug, Clone)]
pub struct Accumulator {
    /// Snapshots per room are capped at this limit + 1 by compaction
    max_timeline_limit: i64,
}

impl Accumulator {
    pub fn new(max_timeline_limit: i64) -> Self {
        Self { max_timeline_limit }
    }

    /// Ingest a state block for a room.
    ///
    /// Unknown room: the block must contain an m.room.create event, and it
    /// becomes the room's first snapshot. Known room with unseen events:
    /// the block is overlaid onto the current snapshot, later-by-NID wins
    /// per (type, state_key), and the result replaces the current
    /// snapshot. A block with nothing new (or an empty block) is a no-op.
    pub async fn initialise(
        &self,
        conn: &mut PgConnection,
        room_id: &str,
        state_events: &[Value],
    ) -> Result<InitialiseResult> {
        let parsed = parse_state_events(room_id, state_events);
        if parsed.is_empty() {
            return Ok(InitialiseResult::default());
        }

        rooms::lock_room(conn, room_id).await?;

        let mut inserted: Vec<(Nid, bool, &EventToInsert)> = Vec::with_capacity(parsed.len());
        let mut any_new = false;
        for ev in &parsed {
            let (nid, new) = events::insert_event(conn, room_id, ev).await?;
            any_new = any_new || new;
            inserted.push((nid, new, ev));
        }
        if !any_new {
            return Ok(InitialiseResult::default());
        }

        let current_id = rooms::current_after_snapshot_id(conn, room_id).await?;
        let replacing = current_id != 0;

        let mut state = if replacing {
            let current = snapshots::select_snapshot(conn, current_id).await?;
            events::select_stripped_by_nids(conn, &current.nids()).await?
        } else {
            if !parsed.iter().any(|ev| ev.event_type == "m.room.create") {
                return Err(SlipsyncError::Validation(format!(
                    "initialise: room {room_id} is unknown and the state block has no m.room.create"
                )));
            }
            Vec::new()
        };

        // Overlay in NID order so a later event wins its (type, state_key)
        let mut overlay: Vec<StrippedEvent> = inserted
            .iter()
            .map(|(nid, _, ev)| StrippedEvent {
                nid: *nid,
                event_type: ev.event_type.clone(),
                state_key: ev.state_key.clone().unwrap_or_default(),
            })
            .collect();
        overlay.sort_by_key(|ev| ev.nid);
        for ev in overlay {
            if let Some(entry) = state
                .iter_mut()
                .find(|e| e.event_type == ev.event_type && e.state_key == ev.state_key)
            {
                if entry.nid < ev.nid {
                    *entry = ev;
                }
            } else {
                state.push(ev);
            }
        }

        let (membership_nids, other_nids) = split_snapshot_nids(&state);
        let snapshot_id =
            snapshots::insert_snapshot(conn, room_id, &membership_nids, &other_nids).await?;
        rooms::set_current_after_snapshot_id(conn, room_id, snapshot_id).await?;

        debug!(
            "🔧 Initialised room {} with snapshot {} ({} state events, replaced={})",
            room_id,
            snapshot_id,
            membership_nids.len() + other_nids.len(),
            replacing
        );
        Ok(InitialiseResult {
            added_events: true,
            snapshot_id,
            replaced_existing_snapshot: replacing,
        })
    }

    /// Ingest a timeline block for a room.
    ///
    /// Each newly inserted state event advances the room's snapshot chain
    /// by one replace-or-append step. The first event of a limited
    /// timeline, if newly inserted, is marked missing_previous; rows
    /// already present are never updated.
    pub async fn accumulate(
        &self,
        conn: &mut PgConnection,
        user_id: &str,
        room_id: &str,
        timeline: &TimelineInput,
    ) -> Result<AccumulateResult> {
        if timeline.events.is_empty() {
            return Ok(AccumulateResult::default());
        }

        rooms::lock_room(conn, room_id).await?;

        let mut parsed = parse_timeline_events(room_id, &timeline.events);
        if parsed.is_empty() {
            return Ok(AccumulateResult::default());
        }

        let prev_batch = timeline
            .prev_batch
            .as_deref()
            .filter(|pb| !pb.is_empty());
        if let Some(pb) = prev_batch {
            parsed[0].prev_batch = Some(pb.to_string());
            rooms::set_last_prev_batch(conn, room_id, pb).await?;
        }

        let mut result = AccumulateResult::default();
        let mut new_events: Vec<(Nid, EventToInsert)> = Vec::new();
        for (i, ev) in parsed.iter_mut().enumerate() {
            // The gap marker only ever applies to the head of a limited
            // batch, and only if that head is new to us.
            ev.missing_previous = timeline.limited && i == 0;
            let (nid, newly_inserted) = events::insert_event(conn, room_id, ev).await?;
            if newly_inserted {
                result.num_new += 1;
                result.timeline_nids.push(nid);
                new_events.push((nid, ev.clone()));
            }
        }
        if new_events.is_empty() {
            return Ok(result);
        }

        let final_snapshot = self
            .chain_snapshots(conn, user_id, room_id, &new_events)
            .await?;

        result.includes_state_redaction = self
            .apply_redactions(conn, &new_events, final_snapshot.as_deref())
            .await?;

        snapshots::remove_inaccessible(conn, room_id, self.max_timeline_limit + 1).await?;

        Ok(result)
    }

    /// Advance the snapshot chain by one step per new state event.
    /// Returns the final snapshot's NID set, if the room has one.
    async fn chain_snapshots(
        &self,
        conn: &mut PgConnection,
        user_id: &str,
        room_id: &str,
        new_events: &[(Nid, EventToInsert)],
    ) -> Result<Option<Vec<Nid>>> {
        let new_state: Vec<&(Nid, EventToInsert)> = new_events
            .iter()
            .filter(|(_, ev)| ev.state_key.is_some())
            .collect();

        let current_id = rooms::current_after_snapshot_id(conn, room_id).await?;
        let mut state = if current_id != 0 {
            let current = snapshots::select_snapshot(conn, current_id).await?;
            events::select_stripped_by_nids(conn, &current.nids()).await?
        } else {
            if new_state.is_empty() {
                return Ok(None);
            }
            if new_state[0].1.event_type != "m.room.create" {
                return Err(SlipsyncError::Validation(format!(
                    "accumulate: room {room_id} has no snapshot and the timeline from {user_id} does not start with m.room.create"
                )));
            }
            Vec::new()
        };
        if new_state.is_empty() {
            return Ok(Some(state.iter().map(|e| e.nid).collect()));
        }

        let mut snapshot_id = current_id;
        for (nid, ev) in new_state {
            let stripped = StrippedEvent {
                nid: *nid,
                event_type: ev.event_type.clone(),
                state_key: ev.state_key.clone().unwrap_or_default(),
            };
            state = calculate_new_snapshot(state, stripped)?;
            let (membership_nids, other_nids) = split_snapshot_nids(&state);
            snapshot_id =
                snapshots::insert_snapshot(conn, room_id, &membership_nids, &other_nids).await?;
            rooms::set_current_after_snapshot_id(conn, room_id, snapshot_id).await?;
        }

        debug!(
            "✅ Advanced room {} to snapshot {} ({} new state events)",
            room_id,
            snapshot_id,
            state.len()
        );
        Ok(Some(state.iter().map(|e| e.nid).collect()))
    }

    /// Prune redaction targets and report whether any target sits in the
    /// room's final current snapshot.
    async fn apply_redactions(
        &self,
        conn: &mut PgConnection,
        new_events: &[(Nid, EventToInsert)],
        final_snapshot: Option<&[Nid]>,
    ) -> Result<bool> {
        let mut redacted_ids: Vec<String> = Vec::new();
        for (_, ev) in new_events {
            if let Some(target) = redacts_target(&ev.json) {
                redacted_ids.push(target.to_string());
            }
        }
        if redacted_ids.is_empty() {
            return Ok(false);
        }

        let targets = events::select_nids_by_ids(conn, &redacted_ids).await?;
        let mut touches_state = false;
        for (event_id, nid) in &targets {
            events::redact_event(conn, event_id).await?;
            if let Some(snapshot) = final_snapshot {
                if snapshot.contains(nid) {
                    touches_state = true;
                }
            }
        }
        Ok(touches_state)
    }
}

/// Compute the snapshot that follows `current` after `new_event`.
///
/// Replaces the single entry with a matching (type, state_key) when one
/// exists, else appends. Errors on a duplicate NID or on a snapshot that
/// already holds more than one entry for the tuple: both indicate a
/// corrupt snapshot and must abort the transaction.
pub fn calculate_new_snapshot(
    current: Vec<StrippedEvent>,
    new_event: StrippedEvent,
) -> Result<Vec<StrippedEvent>> {
    if current.iter().any(|e| e.nid == new_event.nid) {
        return Err(SlipsyncError::InvalidState(format!(
            "snapshot already contains nid {}",
            new_event.nid
        )));
    }
    let matching = current
        .iter()
        .filter(|e| e.event_type == new_event.event_type && e.state_key == new_event.state_key)
        .count();
    if matching > 1 {
        return Err(SlipsyncError::InvalidState(format!(
            "snapshot holds {} entries for ({}, {})",
            matching, new_event.event_type, new_event.state_key
        )));
    }

    let mut next = current;
    if matching == 1 {
        let entry = next
            .iter_mut()
            .find(|e| e.event_type == new_event.event_type && e.state_key == new_event.state_key)
            .expect("matching == 1");
        *entry = new_event;
    } else {
        next.push(new_event);
    }
    Ok(next)
}

/// Split a snapshot into its sorted membership / other NID lists
fn split_snapshot_nids(state: &[StrippedEvent]) -> (Vec<Nid>, Vec<Nid>) {
    let mut membership: Vec<Nid> = state
        .iter()
        .filter(|e| e.is_membership())
        .map(|e| e.nid)
        .collect();
    let mut other: Vec<Nid> = state
        .iter()
        .filter(|e| !e.is_membership())
        .map(|e| e.nid)
        .collect();
    membership.sort_unstable();
    other.sort_unstable();
    (membership, other)
}

/// The event id a redaction event targets, if any
fn redacts_target(json: &Value) -> Option<&str> {
    if json.get("type").and_then(Value::as_str) != Some("m.room.redaction") {
        return None;
    }
    // Room v11 moved the field into content; check both locations.
    json.get("redacts")
        .and_then(Value::as_str)
        .or_else(|| json.get("content").and_then(|c| c.get("redacts")).and_then(Value::as_str))
}

/// Parse a state block, dropping malformed entries
fn parse_state_events(room_id: &str, raws: &[Value]) -> Vec<EventToInsert> {
    let mut seen = std::collections::HashSet::new();
    raws.iter()
        .filter_map(|raw| {
            let ev = parse_event(raw, true);
            if ev.is_none() {
                warn!("⚠️ Dropping malformed state event in room {}", room_id);
            }
            ev
        })
        .filter(|ev| seen.insert(ev.id.clone()))
        .collect()
}

/// Parse a timeline block, dropping malformed entries and in-batch dupes
fn parse_timeline_events(room_id: &str, raws: &[Value]) -> Vec<EventToInsert> {
    let mut seen = std::collections::HashSet::new();
    raws.iter()
        .filter_map(|raw| {
            let ev = parse_event(raw, false);
            if ev.is_none() {
                warn!("⚠️ Dropping malformed timeline event in room {}", room_id);
            }
            ev
        })
        .filter(|ev| seen.insert(ev.id.clone()))
        .collect()
}

fn parse_event(raw: &Value, is_state: bool) -> Option<EventToInsert> {
    let id = raw.get("event_id")?.as_str()?;
    let event_type = raw.get("type")?.as_str()?;
    if id.is_empty() || event_type.is_empty() {
        return None;
    }
    let state_key = raw.get("state_key").and_then(Value::as_str).map(String::from);
    if is_state && state_key.is_none() {
        return None;
    }
    Some(EventToInsert {
        id: id.to_string(),
        event_type: event_type.to_string(),
        state_key,
        sender: raw
            .get("sender")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        origin_server_ts: raw
            .get("origin_server_ts")
            .and_then(Value::as_i64)
            .unwrap_or(0),
        json: raw.clone(),
        is_state,
        missing_previous: false,
        prev_batch: None,
    })
}
