// =============================================================================
// Slipsync Matrix Sliding Sync Proxy - Storage Facade
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
//   One facade over the table modules. The poller data handler and the
//   connection manager talk to this type rather than to individual tables.
//   Writes that must be atomic per upstream response run inside a caller
//   held transaction; reads use pooled connections with MVCC.
//
// =============================================================================

use std::collections::HashMap;

use serde_json::Value;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use tracing::{debug, info, instrument};

use slipsync_core::{Nid, Result, SlipsyncError};

use crate::accumulator::{AccumulateResult, Accumulator, InitialiseResult, TimelineInput};
use crate::models::Event;
use crate::{
    account_data, device_data, devices, events, invites, receipts, rooms, snapshots, to_device,
    tokens, unread,
};

/// A bounded slice of a room's timeline, cut at the first gap
#[derive(Debug, Clone, Default)]
pub struct TimelineSlice {
    /// Events oldest first; the first one may sit just after a gap
    pub events: Vec<Event>,

    /// Token to back-paginate from the start of the slice
    pub prev_batch: Option<String>,
}

/// Per-room data loaded by the startup global snapshot
#[derive(Debug, Clone)]
pub struct RoomSnapshotInfo {
    /// Room id
    pub room_id: String,

    /// Full state events of the room's current snapshot
    pub state_events: Vec<Event>,

    /// origin_server_ts of the room's latest timeline event
    pub latest_timeline_ts: i64,

    /// NID of the room's latest timeline event
    pub latest_nid: Nid,
}

/// Everything the in-memory caches need, loaded in one transaction
#[derive(Debug, Clone, Default)]
pub struct GlobalSnapshot {
    /// One entry per known room
    pub rooms: Vec<RoomSnapshotInfo>,

    /// Highest NID at the time of the snapshot
    pub max_nid: Nid,

    /// Pending invites as (user id, room id, invite_state)
    pub invites: Vec<(String, String, Value)>,
}

/// The event store facade
#[derive(Clone)]
pub struct Storage {
    pool: PgPool,
    accumulator: Accumulator,
}

impl Storage {
    pub fn new(pool: PgPool, max_timeline_limit: i64) -> Self {
        Self {
            pool,
            accumulator: Accumulator::new(max_timeline_limit),
        }
    }

    /// The underlying pool, for callers that need raw access
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Begin a transaction for a multi-room write batch
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| SlipsyncError::Database(e.to_string()))
    }

    /// Commit a write batch
    pub async fn commit(&self, txn: Transaction<'static, Postgres>) -> Result<()> {
        txn.commit()
            .await
            .map_err(|e| SlipsyncError::Database(e.to_string()))
    }

    async fn conn(&self) -> Result<sqlx::pool::PoolConnection<Postgres>> {
        self.pool
            .acquire()
            .await
            .map_err(|e| SlipsyncError::Database(e.to_string()))
    }

    // ---- accumulator entry points ----

    /// Initialise a room's state inside its own transaction
    #[instrument(level = "debug", skip(self, state_events))]
    pub async fn initialise(&self, room_id: &str, state_events: &[Value]) -> Result<InitialiseResult> {
        let mut txn = self.begin().await?;
        let result = self
            .accumulator
            .initialise(&mut txn, room_id, state_events)
            .await?;
        self.commit(txn).await?;
        Ok(result)
    }

    /// Initialise within a caller-held transaction
    pub async fn initialise_in(
        &self,
        txn: &mut PgConnection,
        room_id: &str,
        state_events: &[Value],
    ) -> Result<InitialiseResult> {
        self.accumulator.initialise(txn, room_id, state_events).await
    }

    /// Accumulate a timeline inside its own transaction
    #[instrument(level = "debug", skip(self, timeline))]
    pub async fn accumulate(
        &self,
        user_id: &str,
        room_id: &str,
        timeline: &TimelineInput,
    ) -> Result<AccumulateResult> {
        let mut txn = self.begin().await?;
        let result = self
            .accumulator
            .accumulate(&mut txn, user_id, room_id, timeline)
            .await?;
        self.commit(txn).await?;
        Ok(result)
    }

    /// Accumulate within a caller-held transaction
    pub async fn accumulate_in(
        &self,
        txn: &mut PgConnection,
        user_id: &str,
        room_id: &str,
        timeline: &TimelineInput,
    ) -> Result<AccumulateResult> {
        self.accumulator
            .accumulate(txn, user_id, room_id, timeline)
            .await
    }

    // ---- timeline reads ----

    /// The newest `limit` timeline events with NID <= `upto`, cut at the
    /// first gap walking back from the tail. The returned prev_batch
    /// belongs to the oldest returned event.
    pub async fn latest_timeline(&self, room_id: &str, upto: Nid, limit: i64) -> Result<TimelineSlice> {
        let mut conn = self.conn().await?;
        let fetched = events::select_latest_events(&mut conn, room_id, upto, limit).await?;
        if fetched.is_empty() {
            return Ok(TimelineSlice::default());
        }

        // Walk back from the tail; the slice must not cross a gap, so the
        // newest event carrying missing_previous becomes the slice head.
        let start = fetched
            .iter()
            .rposition(|ev| ev.missing_previous)
            .unwrap_or(0);
        let slice: Vec<Event> = fetched[start..].to_vec();

        let head = &slice[0];
        let prev_batch = match &head.prev_batch {
            Some(pb) => Some(pb.clone()),
            None => events::select_closest_prev_batch(&mut conn, room_id, head.nid).await?,
        };
        Ok(TimelineSlice {
            events: slice,
            prev_batch,
        })
    }

    /// Timeline events in (from, to], oldest first, at most `limit`
    pub async fn timeline_between(
        &self,
        room_id: &str,
        from_excl: Nid,
        to_incl: Nid,
        limit: i64,
    ) -> Result<Vec<Event>> {
        let mut conn = self.conn().await?;
        events::select_events_between(&mut conn, room_id, from_excl, to_incl, limit).await
    }

    // ---- state reads ----

    /// The room's current state, optionally filtered to required
    /// (type, state_key) pairs where "*" matches any state key.
    pub async fn room_state(
        &self,
        room_id: &str,
        required: Option<&[(String, String)]>,
    ) -> Result<Vec<Event>> {
        let mut conn = self.conn().await?;
        let current_id = rooms::current_after_snapshot_id(&mut conn, room_id).await?;
        if current_id == 0 {
            return Ok(Vec::new());
        }
        let snapshot = snapshots::select_snapshot(&mut conn, current_id).await?;
        let state = events::select_by_nids(&mut conn, &snapshot.nids()).await?;
        match required {
            None => Ok(state),
            Some(filters) => Ok(state
                .into_iter()
                .filter(|ev| {
                    filters.iter().any(|(t, sk)| {
                        (t == "*" || *t == ev.event_type)
                            && (sk == "*" || Some(sk.as_str()) == ev.state_key.as_deref())
                    })
                })
                .collect()),
        }
    }

    /// Load everything the caches need in one transaction
    #[instrument(level = "debug", skip(self))]
    pub async fn global_snapshot(&self) -> Result<GlobalSnapshot> {
        debug!("🔧 Loading global snapshot");
        let mut txn = self.begin().await?;

        let max_nid = events::select_highest_nid(&mut txn).await?;
        let current = snapshots::current_snapshots(&mut txn).await?;

        // Latest timeline event per room, one pass
        let latest: Vec<(String, Nid, i64)> = sqlx::query_as(
            "SELECT DISTINCT ON (room_id) room_id, event_nid, origin_server_ts \
             FROM syncv3_events WHERE is_state = FALSE \
             ORDER BY room_id, event_nid DESC",
        )
        .fetch_all(&mut *txn)
        .await
        .map_err(|e| SlipsyncError::Database(e.to_string()))?;
        let latest_by_room: HashMap<String, (Nid, i64)> = latest
            .into_iter()
            .map(|(room, nid, ts)| (room, (nid, ts)))
            .collect();

        let mut snapshot_rooms = Vec::with_capacity(current.len());
        for (room_id, nids) in current {
            let state_events = events::select_by_nids(&mut txn, &nids).await?;
            let (latest_nid, latest_timeline_ts) =
                latest_by_room.get(&room_id).copied().unwrap_or((0, 0));
            snapshot_rooms.push(RoomSnapshotInfo {
                room_id,
                state_events,
                latest_timeline_ts,
                latest_nid,
            });
        }

        let invite_rows: Vec<(String, String, Value)> =
            sqlx::query_as("SELECT user_id, room_id, invite_state FROM syncv3_invites")
                .fetch_all(&mut *txn)
                .await
                .map_err(|e| SlipsyncError::Database(e.to_string()))?;

        self.commit(txn).await?;
        info!("✅ Global snapshot loaded: {} rooms", snapshot_rooms.len());
        Ok(GlobalSnapshot {
            rooms: snapshot_rooms,
            max_nid,
            invites: invite_rows,
        })
    }

    /// Startup compaction sweep over every room
    pub async fn remove_inaccessible_snapshots(&self, keep: i64) -> Result<u64> {
        let mut conn = self.conn().await?;
        let room_ids = rooms::all_room_ids(&mut conn).await?;
        let mut total = 0;
        for room_id in room_ids {
            total += snapshots::remove_inaccessible(&mut conn, &room_id, keep).await?;
        }
        Ok(total)
    }

    // ---- devices & tokens ----

    pub async fn ensure_device(&self, user_id: &str, device_id: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        devices::insert_device(&mut conn, user_id, device_id).await
    }

    pub async fn device_since(&self, user_id: &str, device_id: &str) -> Result<String> {
        let mut conn = self.conn().await?;
        devices::select_since(&mut conn, user_id, device_id).await
    }

    pub async fn update_device_since(
        &self,
        txn: &mut PgConnection,
        user_id: &str,
        device_id: &str,
        since: &str,
    ) -> Result<()> {
        devices::update_since(txn, user_id, device_id, since).await
    }

    pub async fn upsert_token(&self, token: &str, user_id: &str, device_id: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        tokens::upsert_token(&mut conn, token, user_id, device_id).await
    }

    pub async fn lookup_token(&self, token: &str) -> Result<Option<crate::models::TokenRow>> {
        let mut conn = self.conn().await?;
        tokens::select_token(&mut conn, token).await
    }

    pub async fn touch_token(&self, token: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        tokens::touch_token(&mut conn, token).await
    }

    pub async fn delete_token(&self, token: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        tokens::delete_token(&mut conn, token).await
    }

    // ---- extension stores ----

    pub async fn queue_to_device(
        &self,
        txn: &mut PgConnection,
        user_id: &str,
        device_id: &str,
        messages: &[Value],
    ) -> Result<i64> {
        to_device::insert_messages(txn, user_id, device_id, messages).await
    }

    pub async fn to_device_messages(
        &self,
        user_id: &str,
        device_id: &str,
        from: i64,
        limit: i64,
    ) -> Result<(Vec<Value>, i64)> {
        let mut conn = self.conn().await?;
        to_device::select_messages(&mut conn, user_id, device_id, from, limit).await
    }

    pub async fn ack_to_device(&self, user_id: &str, device_id: &str, upto: i64) -> Result<u64> {
        let mut conn = self.conn().await?;
        to_device::delete_messages_upto(&mut conn, user_id, device_id, upto).await
    }

    pub async fn upsert_account_data(
        &self,
        txn: &mut PgConnection,
        user_id: &str,
        room_id: &str,
        data_type: &str,
        content: &Value,
    ) -> Result<()> {
        account_data::upsert(txn, user_id, room_id, data_type, content).await
    }

    pub async fn account_data_for_room(
        &self,
        user_id: &str,
        room_id: &str,
    ) -> Result<Vec<(String, Value)>> {
        let mut conn = self.conn().await?;
        account_data::select_for_room(&mut conn, user_id, room_id).await
    }

    pub async fn upsert_invite(
        &self,
        txn: &mut PgConnection,
        user_id: &str,
        room_id: &str,
        invite_state: &Value,
    ) -> Result<()> {
        invites::upsert_invite(txn, user_id, room_id, invite_state).await
    }

    pub async fn delete_invite(
        &self,
        txn: &mut PgConnection,
        user_id: &str,
        room_id: &str,
    ) -> Result<()> {
        invites::delete_invite(txn, user_id, room_id).await
    }

    pub async fn invites_for_user(&self, user_id: &str) -> Result<Vec<(String, Value)>> {
        let mut conn = self.conn().await?;
        invites::select_invites_for_user(&mut conn, user_id).await
    }

    pub async fn merge_device_data(
        &self,
        txn: &mut PgConnection,
        user_id: &str,
        device_id: &str,
        changed: &[String],
        left: &[String],
        otk_counts: Option<&Value>,
    ) -> Result<()> {
        device_data::upsert(txn, user_id, device_id, changed, left, otk_counts).await
    }

    pub async fn swallow_device_data(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<device_data::DeviceData>> {
        let mut conn = self.conn().await?;
        device_data::swallow(&mut conn, user_id, device_id).await
    }

    pub async fn set_typing(
        &self,
        txn: &mut PgConnection,
        room_id: &str,
        user_ids: &[String],
    ) -> Result<i64> {
        crate::typing::set_typing(txn, room_id, user_ids).await
    }

    pub async fn typing_since(
        &self,
        room_id: &str,
        from: i64,
    ) -> Result<Option<(Vec<String>, i64)>> {
        let mut conn = self.conn().await?;
        crate::typing::typing_since(&mut conn, room_id, from).await
    }

    pub async fn upsert_unread(
        &self,
        txn: &mut PgConnection,
        user_id: &str,
        room_id: &str,
        notification_count: i64,
        highlight_count: i64,
    ) -> Result<()> {
        unread::upsert_unread(txn, user_id, room_id, notification_count, highlight_count).await
    }

    pub async fn unread_counts(
        &self,
        user_id: &str,
        room_id: &str,
    ) -> Result<Option<(i64, i64)>> {
        let mut conn = self.conn().await?;
        unread::select_unread(&mut conn, user_id, room_id).await
    }

    pub async fn upsert_receipt(
        &self,
        txn: &mut PgConnection,
        room_id: &str,
        user_id: &str,
        receipt_type: &str,
        event_id: &str,
        data: &Value,
    ) -> Result<()> {
        receipts::upsert_receipt(txn, room_id, user_id, receipt_type, event_id, data).await
    }

    pub async fn receipts_for_room(
        &self,
        room_id: &str,
    ) -> Result<Vec<(String, String, String, Value)>> {
        let mut conn = self.conn().await?;
        receipts::select_receipts_for_room(&mut conn, room_id).await
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}
