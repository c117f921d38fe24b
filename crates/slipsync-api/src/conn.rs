// =============================================================================
// Slipsync Matrix Sliding Sync Proxy - Connection Module
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
//   One long-lived sliding sync session. The conn owns the opaque position
//   discipline (a stale, unknown or concurrent pos destroys the session),
//   the sticky request state, the per-room delta trackers, and the long
//   poll wait. A new request for the same conn interrupts any in-flight
//   one, which returns early; the racing client then observes its stale
//   pos and rebuilds from scratch.
//
// =============================================================================

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep_until, Duration, Instant};

use slipsync_core::utils::retry_once;
use slipsync_core::{Nid, Result, SlipsyncError};
use slipsync_db::Storage;

use crate::cache::GlobalCache;
use crate::extensions;
use crate::lists::{self, ListState, SortableRoom};
use crate::types::{
    ListResponse, RoomResponse, RoomSubscription, SlidingSyncRequest, SlidingSyncResponse,
};

/// Everything a conn needs to project responses
#[derive(Clone)]
pub struct ConnContext {
    pub storage: Storage,
    pub cache: Arc<GlobalCache>,
    pub user_id: String,
    pub device_id: String,
}

/// Per-room delta tracking
#[derive(Debug, Clone, Default)]
struct RoomTracker {
    /// NID of the newest timeline event the client has seen
    last_sent_nid: Nid,

    /// Whether the initial payload went out
    sent_initial: bool,

    /// Last emitted metadata, for change detection
    last_name: Option<String>,
    last_join_count: usize,
    last_invite_count: usize,
    last_unread: Option<(i64, i64)>,
}

/// Sticky extension toggles
#[derive(Debug, Clone, Default)]
struct ExtensionsState {
    to_device: bool,
    to_device_limit: u64,
    e2ee: bool,
    account_data: bool,
    typing: bool,
    receipts: bool,
}

/// Mutable session state behind the conn's lock
#[derive(Default)]
struct ConnState {
    /// Position sequence; the client must echo the latest value
    seq: u64,

    lists: BTreeMap<String, ListState>,
    subscriptions: BTreeMap<String, RoomSubscription>,
    trackers: HashMap<String, RoomTracker>,
    extensions: ExtensionsState,

    /// Ack watermark for the to-device queue
    to_device_since: i64,

    /// Last seen typing stream id per room
    typing_streams: HashMap<String, i64>,

    /// Whether global account data went out
    sent_global_account_data: bool,
}

/// One sliding sync session
pub struct Conn {
    /// Random per-conn value baked into every pos so positions from a
    /// previous life of this (user, device, conn_id) never validate
    epoch: String,

    state: Mutex<ConnState>,

    /// New data arrived for this user
    notify: Notify,

    /// A newer request for this conn arrived
    interrupt: Notify,

    /// Generation counter backing the interrupt
    generation: AtomicU64,

    destroyed: AtomicBool,
}

impl Conn {
    pub fn new() -> Self {
        Self {
            epoch: uuid::Uuid::new_v4().simple().to_string(),
            state: Mutex::new(ConnState::default()),
            notify: Notify::new(),
            interrupt: Notify::new(),
            generation: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Wake the conn because new data may be visible to it
    pub fn wake(&self) {
        self.notify.notify_waiters();
    }

    /// Mark the session dead; waiters return and the next request fails
    /// with an unknown position
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        self.interrupt.notify_waiters();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Whether this conn currently tracks the room (window, subscription
    /// or already-emitted payload)
    pub async fn is_tracking(&self, room_id: &str) -> bool {
        let state = self.state.lock().await;
        state.trackers.contains_key(room_id) || state.subscriptions.contains_key(room_id)
    }

    fn pos_string(&self, seq: u64) -> String {
        BASE64.encode(format!("{}/{}", self.epoch, seq))
    }

    fn check_pos(&self, state: &ConnState, pos: &str) -> Result<()> {
        let decoded = BASE64
            .decode(pos)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or_else(|| SlipsyncError::UnknownPos(pos.to_string()))?;
        let (epoch, seq) = decoded
            .rsplit_once('/')
            .ok_or_else(|| SlipsyncError::UnknownPos(pos.to_string()))?;
        let seq: u64 = seq
            .parse()
            .map_err(|_| SlipsyncError::UnknownPos(pos.to_string()))?;
        if epoch != self.epoch || seq != state.seq {
            return Err(SlipsyncError::UnknownPos(pos.to_string()));
        }
        Ok(())
    }

    /// Serve one request. `pos` is the client's echoed position, None for
    /// a brand-new session on this conn.
    pub async fn handle(
        &self,
        ctx: &ConnContext,
        pos: Option<&str>,
        request: &SlidingSyncRequest,
        timeout: Duration,
    ) -> Result<SlidingSyncResponse> {
        if self.is_destroyed() {
            return Err(SlipsyncError::UnknownPos(pos.unwrap_or("").to_string()));
        }

        // Interrupt any in-flight long poll before taking the lock
        let my_generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.interrupt.notify_waiters();

        let mut state = self.state.lock().await;
        if self.is_destroyed() {
            return Err(SlipsyncError::UnknownPos(pos.unwrap_or("").to_string()));
        }

        match pos {
            Some(pos) if !pos.is_empty() => {
                if let Err(e) = self.check_pos(&state, pos) {
                    // The session cannot be trusted any more; the caller
                    // removes it from the registry
                    self.destroy();
                    return Err(e);
                }
            }
            _ => {
                if state.seq != 0 {
                    // Empty pos on a live conn: the client restarted, so
                    // the session does too
                    *state = ConnState::default();
                }
            }
        }

        let invalidated = self.merge_request(&mut state, request);

        let deadline = Instant::now() + timeout;
        let mut invalidated = invalidated;
        loop {
            // Register for wake-ups before projecting so a broadcast that
            // lands mid-projection is not lost
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut response = self.project(ctx, &mut state, &invalidated).await?;
            invalidated.clear();
            if response.has_data() {
                state.seq += 1;
                response.pos = self.pos_string(state.seq);
                return Ok(response);
            }

            let stop = tokio::select! {
                _ = &mut notified => false,
                _ = self.interrupt.notified() => true,
                _ = sleep_until(deadline) => true,
            };
            if self.is_destroyed() {
                return Err(SlipsyncError::UnknownPos(pos.unwrap_or("").to_string()));
            }
            if stop || self.generation.load(Ordering::SeqCst) != my_generation {
                // Deadline, or a racing request took over: emit an empty
                // delta on the advanced position
                state.seq += 1;
                return Ok(SlidingSyncResponse {
                    pos: self.pos_string(state.seq),
                    ..Default::default()
                });
            }
        }
    }

    /// Fold the request's sticky parameters into the session. Returns the
    /// names of lists whose windows must fully re-SYNC.
    fn merge_request(&self, state: &mut ConnState, request: &SlidingSyncRequest) -> BTreeSet<String> {
        let mut invalidated = BTreeSet::new();
        for (name, list_req) in &request.lists {
            let list_state = state.lists.entry(name.clone()).or_default();
            if list_state.merge_request(list_req) {
                invalidated.insert(name.clone());
            }
        }
        for (room_id, sub) in &request.room_subscriptions {
            state.subscriptions.insert(room_id.clone(), sub.clone());
        }
        for room_id in &request.unsubscribe_rooms {
            state.subscriptions.remove(room_id);
            state.trackers.remove(room_id);
        }

        let ext = &request.extensions;
        if let Some(to_device) = &ext.to_device {
            if let Some(enabled) = to_device.enabled {
                state.extensions.to_device = enabled;
            }
            if let Some(limit) = to_device.limit {
                state.extensions.to_device_limit = limit;
            }
            if let Some(since) = &to_device.since {
                if let Ok(since) = since.parse::<i64>() {
                    state.to_device_since = since;
                }
            }
        }
        for (toggle, flag) in [
            (&ext.e2ee, &mut state.extensions.e2ee),
            (&ext.account_data, &mut state.extensions.account_data),
            (&ext.typing, &mut state.extensions.typing),
            (&ext.receipts, &mut state.extensions.receipts),
        ] {
            if let Some(enabled) = toggle.as_ref().and_then(|t| t.enabled) {
                *flag = enabled;
            }
        }
        invalidated
    }

    /// Compute one response against current store and cache state
    async fn project(
        &self,
        ctx: &ConnContext,
        state: &mut ConnState,
        invalidated: &BTreeSet<String>,
    ) -> Result<SlidingSyncResponse> {
        let joined = ctx.cache.joined_metadata(&ctx.user_id).await;
        let invited = ctx.cache.invited_rooms(&ctx.user_id).await;

        let mut universe: Vec<SortableRoom> = joined
            .iter()
            .map(|metadata| SortableRoom::from_metadata(metadata, &ctx.user_id))
            .collect();
        for room_id in &invited {
            let mut entry = match ctx.cache.metadata(room_id).await {
                Some(metadata) => SortableRoom::from_metadata(&metadata, &ctx.user_id),
                None => SortableRoom {
                    room_id: room_id.clone(),
                    display_name: room_id.clone(),
                    last_message_ts: 0,
                    encrypted: false,
                    is_invite: true,
                    room_type: None,
                },
            };
            entry.is_invite = true;
            universe.push(entry);
        }

        // Lists: sort, filter, window, ops
        let mut lists_resp = BTreeMap::new();
        // room id -> subscription template that puts it in the window
        let mut windowed: BTreeMap<String, RoomSubscription> = BTreeMap::new();
        for (name, list_state) in &mut state.lists {
            let space_children = space_children(&ctx.cache, list_state.filters.as_ref()).await;
            let mut rooms: Vec<SortableRoom> = universe
                .iter()
                .filter(|room| lists::passes_filters(room, list_state.filters.as_ref(), &space_children))
                .cloned()
                .collect();
            lists::sort_rooms(&mut rooms, &list_state.sort);
            let order: Vec<String> = rooms.into_iter().map(|room| room.room_id).collect();

            let ops = lists::compute_ops(list_state, &order, invalidated.contains(name));
            for range in &list_state.ranges {
                for room_id in lists::window(&order, *range) {
                    windowed
                        .entry(room_id.clone())
                        .or_insert_with(|| list_state.room_details.clone());
                }
            }
            lists_resp.insert(
                name.clone(),
                ListResponse {
                    count: order.len() as u64,
                    ops,
                },
            );
        }
        // Explicit subscriptions override list templates
        for (room_id, sub) in &state.subscriptions {
            windowed.insert(room_id.clone(), sub.clone());
        }

        let invited_set: BTreeSet<&String> = invited.iter().collect();
        let mut rooms_resp = BTreeMap::new();
        let mut rooms_with_new_timeline = Vec::new();
        for (room_id, sub) in &windowed {
            let payload = if invited_set.contains(room_id) {
                self.build_invite_payload(ctx, state, room_id).await?
            } else {
                self.build_room_payload(ctx, state, room_id, sub, &mut rooms_with_new_timeline)
                    .await?
            };
            if let Some(payload) = payload {
                rooms_resp.insert(room_id.clone(), payload);
            }
        }

        let extensions = extensions::build(
            ctx,
            ExtensionsArgs {
                to_device: state.extensions.to_device,
                to_device_limit: state.extensions.to_device_limit,
                e2ee: state.extensions.e2ee,
                account_data: state.extensions.account_data,
                typing: state.extensions.typing,
                receipts: state.extensions.receipts,
                to_device_since: &mut state.to_device_since,
                typing_streams: &mut state.typing_streams,
                sent_global_account_data: &mut state.sent_global_account_data,
                window_rooms: windowed.keys().cloned().collect(),
                rooms_with_new_timeline,
            },
        )
        .await?;

        Ok(SlidingSyncResponse {
            pos: String::new(),
            lists: lists_resp,
            rooms: rooms_resp,
            extensions,
        })
    }

    async fn build_invite_payload(
        &self,
        ctx: &ConnContext,
        state: &mut ConnState,
        room_id: &str,
    ) -> Result<Option<RoomResponse>> {
        let tracker = state.trackers.entry(room_id.to_string()).or_default();
        if tracker.sent_initial {
            return Ok(None);
        }
        let invites = retry_once(|| ctx.storage.invites_for_user(&ctx.user_id)).await?;
        let Some((_, invite_state)) = invites.into_iter().find(|(room, _)| room == room_id) else {
            return Ok(None);
        };
        tracker.sent_initial = true;
        let events = invite_state.as_array().cloned().unwrap_or_default();
        Ok(Some(RoomResponse {
            initial: true,
            invite_state: Some(events),
            ..Default::default()
        }))
    }

    async fn build_room_payload(
        &self,
        ctx: &ConnContext,
        state: &mut ConnState,
        room_id: &str,
        sub: &RoomSubscription,
        rooms_with_new_timeline: &mut Vec<String>,
    ) -> Result<Option<RoomResponse>> {
        let metadata = ctx.cache.metadata(room_id).await.unwrap_or_default();
        let unread = retry_once(|| ctx.storage.unread_counts(&ctx.user_id, room_id)).await?;
        let timeline_limit = sub.timeline_limit.unwrap_or(10).max(1) as i64;
        let tracker = state.trackers.entry(room_id.to_string()).or_default();

        if !tracker.sent_initial {
            let slice =
                retry_once(|| ctx.storage.latest_timeline(room_id, i64::MAX, timeline_limit))
                    .await?;
            let required_state = if sub.required_state.is_empty() {
                Vec::new()
            } else {
                retry_once(|| ctx.storage.room_state(room_id, Some(&sub.required_state)))
                    .await?
                    .into_iter()
                    .map(|ev| ev.json)
                    .collect()
            };

            tracker.sent_initial = true;
            tracker.last_sent_nid = slice
                .events
                .last()
                .map(|ev| ev.nid)
                .unwrap_or(metadata.latest_nid);
            tracker.last_name = metadata.display_name(&ctx.user_id);
            tracker.last_join_count = metadata.join_count;
            tracker.last_invite_count = metadata.invite_count;
            tracker.last_unread = unread;
            if !slice.events.is_empty() {
                rooms_with_new_timeline.push(room_id.to_string());
            }

            let limited = slice.prev_batch.is_some();
            return Ok(Some(RoomResponse {
                name: tracker.last_name.clone(),
                initial: true,
                required_state,
                timeline: slice.events.into_iter().map(|ev| ev.json).collect(),
                prev_batch: slice.prev_batch,
                limited,
                joined_count: Some(metadata.join_count as u64),
                invited_count: Some(metadata.invite_count as u64),
                notification_count: unread.map(|(n, _)| n),
                highlight_count: unread.map(|(_, h)| h),
                invite_state: None,
            }));
        }

        // Incremental: new events since the last emission, cut at gaps
        let from = tracker.last_sent_nid;
        let mut events =
            retry_once(|| ctx.storage.timeline_between(room_id, from, i64::MAX, timeline_limit))
                .await?;
        let mut limited = false;
        let mut prev_batch = None;
        if let Some(gap) = events.iter().rposition(|ev| ev.missing_previous) {
            // Do not show events on both sides of a gap as contiguous
            prev_batch = events[gap].prev_batch.clone();
            events.drain(..gap);
            limited = true;
        }

        let mut payload = RoomResponse::default();
        if let Some(last) = events.last() {
            tracker.last_sent_nid = last.nid;
            rooms_with_new_timeline.push(room_id.to_string());
            payload.timeline = events.into_iter().map(|ev| ev.json).collect();
            payload.limited = limited;
            payload.prev_batch = prev_batch;
        }

        let name = metadata.display_name(&ctx.user_id);
        if name != tracker.last_name {
            tracker.last_name = name.clone();
            payload.name = name;
        }
        if metadata.join_count != tracker.last_join_count {
            tracker.last_join_count = metadata.join_count;
            payload.joined_count = Some(metadata.join_count as u64);
        }
        if metadata.invite_count != tracker.last_invite_count {
            tracker.last_invite_count = metadata.invite_count;
            payload.invited_count = Some(metadata.invite_count as u64);
        }
        if unread != tracker.last_unread {
            tracker.last_unread = unread;
            payload.notification_count = unread.map(|(n, _)| n);
            payload.highlight_count = unread.map(|(_, h)| h);
        }

        if payload.is_empty() {
            Ok(None)
        } else {
            Ok(Some(payload))
        }
    }
}

impl Default for Conn {
    fn default() -> Self {
        Self::new()
    }
}

/// Arguments threaded into the extensions builder
pub struct ExtensionsArgs<'a> {
    pub to_device: bool,
    pub to_device_limit: u64,
    pub e2ee: bool,
    pub account_data: bool,
    pub typing: bool,
    pub receipts: bool,
    pub to_device_since: &'a mut i64,
    pub typing_streams: &'a mut HashMap<String, i64>,
    pub sent_global_account_data: &'a mut bool,
    pub window_rooms: Vec<String>,
    pub rooms_with_new_timeline: Vec<String>,
}

/// The union of m.space.child room ids of the filter's spaces
async fn space_children(
    cache: &GlobalCache,
    filters: Option<&crate::types::ListFilters>,
) -> BTreeSet<String> {
    let mut children = BTreeSet::new();
    if let Some(spaces) = filters.and_then(|f| f.spaces.as_ref()) {
        for space in spaces {
            if let Some(metadata) = cache.metadata(space).await {
                children.extend(metadata.children.iter().cloned());
            }
        }
    }
    children
}
