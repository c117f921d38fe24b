// =============================================================================
// Slipsync Matrix Sliding Sync Proxy - Request Handler
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
//   The glue in the middle of the proxy. As the poll data receiver it
//   persists every upstream response in one transaction (to-device and
//   device data first, then rooms, then the since token), updates the
//   global cache, invalidates conns hit by gappy state, and wakes the
//   rest. As the request handler it resolves bearer tokens (via upstream
//   whoami on first contact), guarantees a live poller through
//   EnsurePolling, and routes the request to its conn.
//
// =============================================================================

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Duration;
use tracing::{debug, info, instrument, warn};

use slipsync_core::utils::retry_once;
use slipsync_core::{DeviceKey, Result, SlipsyncError};
use slipsync_db::{AccumulateResult, Storage, TimelineInput};
use slipsync_sync::client::{SyncError, SyncV2Client, SyncV2Response};
use slipsync_sync::poller::PollDataReceiver;
use slipsync_sync::pool::PollerPool;

use crate::cache::GlobalCache;
use crate::conn::ConnContext;
use crate::connmap::{ConnKey, ConnMap};
use crate::types::{ErrorBody, SlidingSyncRequest, SlidingSyncResponse};

/// Handler configuration
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Long poll timeout when the client omits one, in milliseconds
    pub default_timeout_ms: u64,

    /// Upper bound on client supplied timeouts, in milliseconds
    pub max_timeout_ms: u64,
}

/// The poll data receiver and request handler
pub struct SyncDataHandler {
    storage: Storage,
    cache: Arc<GlobalCache>,
    conns: Arc<ConnMap>,
    pool: Arc<PollerPool>,
    client: Arc<dyn SyncV2Client>,
    config: HandlerConfig,
}

/// What one room's ingest produced, for post-commit fan-out
struct RoomOutcome {
    room_id: String,
    replaced_snapshot: bool,
    /// A state block added events without replacing a snapshot (fresh
    /// room); the cache must read the room's state from the store
    state_added: bool,
    accumulate: AccumulateResult,
    timeline_events: Vec<Value>,
}

impl SyncDataHandler {
    pub fn new(
        storage: Storage,
        cache: Arc<GlobalCache>,
        conns: Arc<ConnMap>,
        pool: Arc<PollerPool>,
        client: Arc<dyn SyncV2Client>,
        config: HandlerConfig,
    ) -> Self {
        Self {
            storage,
            cache,
            conns,
            pool,
            client,
            config,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn cache(&self) -> &Arc<GlobalCache> {
        &self.cache
    }

    pub fn conns(&self) -> &Arc<ConnMap> {
        &self.conns
    }

    pub fn pool(&self) -> &Arc<PollerPool> {
        &self.pool
    }

    /// Rebuild the cache and compact snapshots. Call once at startup.
    #[instrument(level = "debug", skip(self))]
    pub async fn startup(&self, snapshot_keep: i64) -> Result<()> {
        let snapshot = self.storage.global_snapshot().await?;
        self.cache.load(&snapshot).await;
        let removed = self
            .storage
            .remove_inaccessible_snapshots(snapshot_keep)
            .await?;
        if removed > 0 {
            info!("✅ Startup compaction removed {} snapshots", removed);
        }
        Ok(())
    }

    /// Serve one sliding sync request
    pub async fn serve_sync(
        self: Arc<Self>,
        headers: &HeaderMap,
        query: SyncQuery,
        body: SlidingSyncRequest,
    ) -> Result<SlidingSyncResponse> {
        let token = bearer_token(headers)
            .ok_or_else(|| SlipsyncError::Auth("missing access token".to_string()))?;

        let (user_id, device_id) = self.resolve_token(&token).await?;
        let device_key = DeviceKey::new(
            user_id
                .as_str()
                .try_into()
                .map_err(|_| SlipsyncError::Validation(format!("bad user id {user_id}")))?,
            device_id.as_str().into(),
        );

        // The client must be represented by a live poller that has seen
        // at least one committed response before we answer
        let receiver: Arc<dyn PollDataReceiver> = self.clone() as Arc<dyn PollDataReceiver>;
        let started = self
            .pool
            .ensure_polling(receiver, &token, &device_key)
            .await;
        if !started {
            return Err(SlipsyncError::UnknownToken);
        }

        let conn_key = ConnKey {
            user_id: user_id.clone(),
            device_id: device_id.clone(),
            conn_id: body.conn_id.clone().unwrap_or_default(),
        };
        let fresh = query.pos.as_deref().map_or(true, str::is_empty);
        let conn = self.conns.get_or_create(&conn_key, fresh);

        let timeout_ms = body
            .timeout
            .or(query.timeout)
            .unwrap_or(self.config.default_timeout_ms)
            .min(self.config.max_timeout_ms);
        let ctx = ConnContext {
            storage: self.storage.clone(),
            cache: Arc::clone(&self.cache),
            user_id,
            device_id,
        };

        let result = conn
            .handle(
                &ctx,
                query.pos.as_deref(),
                &body,
                Duration::from_millis(timeout_ms),
            )
            .await;
        if matches!(result, Err(SlipsyncError::UnknownPos(_))) {
            self.conns.remove(&conn_key);
        }
        result
    }

    async fn resolve_token(&self, token: &str) -> Result<(String, String)> {
        if let Some(row) = retry_once(|| self.storage.lookup_token(token)).await? {
            retry_once(|| self.storage.touch_token(token)).await?;
            return Ok((row.user_id, row.device_id));
        }
        let whoami = self.client.whoami(token).await.map_err(|e| match e {
            SyncError::Unauthorized => SlipsyncError::UnknownToken,
            other => SlipsyncError::Network(other.to_string()),
        })?;
        retry_once(|| self.storage.ensure_device(&whoami.user_id, &whoami.device_id)).await?;
        retry_once(|| self.storage.upsert_token(token, &whoami.user_id, &whoami.device_id))
            .await?;
        debug!("🔧 Bound new token for {}/{}", whoami.user_id, whoami.device_id);
        Ok((whoami.user_id, whoami.device_id))
    }

    /// Persist one upstream response. To-device and device data go first,
    /// rooms next, the since token last; everything in one transaction so
    /// a crash re-processes from the previous since (idempotent via
    /// event-id dedup).
    async fn persist_response(
        &self,
        user_id: &str,
        device_id: &str,
        response: &SyncV2Response,
    ) -> Result<Vec<RoomOutcome>> {
        let mut txn = self.storage.begin().await?;
        let mut outcomes = Vec::new();

        if !response.to_device.events.is_empty() {
            self.storage
                .queue_to_device(&mut txn, user_id, device_id, &response.to_device.events)
                .await?;
        }

        let lists = &response.device_lists;
        if !lists.changed.is_empty()
            || !lists.left.is_empty()
            || response.device_one_time_keys_count.is_some()
        {
            self.storage
                .merge_device_data(
                    &mut txn,
                    user_id,
                    device_id,
                    &lists.changed,
                    &lists.left,
                    response.device_one_time_keys_count.as_ref(),
                )
                .await?;
        }

        for ev in &response.account_data.events {
            if let Some((data_type, content)) = split_type_content(ev) {
                self.storage
                    .upsert_account_data(&mut txn, user_id, "", data_type, content)
                    .await?;
            }
        }

        for (room_id, invite) in &response.rooms.invite {
            let stripped = Value::Array(invite.invite_state.events.clone());
            self.storage
                .upsert_invite(&mut txn, user_id, room_id, &stripped)
                .await?;
        }

        for (room_id, leave) in &response.rooms.leave {
            self.storage.delete_invite(&mut txn, user_id, room_id).await?;
            if !leave.timeline.events.is_empty() {
                let timeline = TimelineInput {
                    events: leave.timeline.events.clone(),
                    limited: leave.timeline.limited,
                    prev_batch: leave.timeline.prev_batch.clone(),
                };
                let accumulate = self
                    .storage
                    .accumulate_in(&mut txn, user_id, room_id, &timeline)
                    .await?;
                outcomes.push(RoomOutcome {
                    room_id: room_id.clone(),
                    replaced_snapshot: false,
                    state_added: false,
                    accumulate,
                    timeline_events: leave.timeline.events.clone(),
                });
            }
        }

        for (room_id, join) in &response.rooms.join {
            self.storage.delete_invite(&mut txn, user_id, room_id).await?;

            let mut replaced_snapshot = false;
            let mut state_added = false;
            if !join.state.events.is_empty() {
                let initialised = self
                    .storage
                    .initialise_in(&mut txn, room_id, &join.state.events)
                    .await?;
                replaced_snapshot = initialised.replaced_existing_snapshot;
                state_added = initialised.added_events && !replaced_snapshot;
            }

            let timeline = TimelineInput {
                events: join.timeline.events.clone(),
                limited: join.timeline.limited,
                prev_batch: join.timeline.prev_batch.clone(),
            };
            let accumulate = self
                .storage
                .accumulate_in(&mut txn, user_id, room_id, &timeline)
                .await?;

            let unread = &join.unread_notifications;
            if unread.notification_count.is_some() || unread.highlight_count.is_some() {
                self.storage
                    .upsert_unread(
                        &mut txn,
                        user_id,
                        room_id,
                        unread.notification_count.unwrap_or(0),
                        unread.highlight_count.unwrap_or(0),
                    )
                    .await?;
            }

            for edu in &join.ephemeral.events {
                self.persist_edu(&mut txn, room_id, edu).await?;
            }
            for ev in &join.account_data.events {
                if let Some((data_type, content)) = split_type_content(ev) {
                    self.storage
                        .upsert_account_data(&mut txn, user_id, room_id, data_type, content)
                        .await?;
                }
            }

            outcomes.push(RoomOutcome {
                room_id: room_id.clone(),
                replaced_snapshot,
                state_added,
                accumulate,
                timeline_events: join.timeline.events.clone(),
            });
        }

        self.storage
            .update_device_since(&mut txn, user_id, device_id, &response.next_batch)
            .await?;
        self.storage.commit(txn).await?;
        Ok(outcomes)
    }

    async fn persist_edu(
        &self,
        txn: &mut sqlx::Transaction<'static, sqlx::Postgres>,
        room_id: &str,
        edu: &Value,
    ) -> Result<()> {
        match edu.get("type").and_then(Value::as_str) {
            Some("m.typing") => {
                let user_ids: Vec<String> = edu
                    .get("content")
                    .and_then(|c| c.get("user_ids"))
                    .and_then(Value::as_array)
                    .map(|users| {
                        users
                            .iter()
                            .filter_map(Value::as_str)
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default();
                self.storage.set_typing(txn, room_id, &user_ids).await?;
            }
            Some("m.receipt") => {
                let Some(content) = edu.get("content").and_then(Value::as_object) else {
                    return Ok(());
                };
                for (event_id, by_type) in content {
                    let Some(by_type) = by_type.as_object() else { continue };
                    for (receipt_type, by_user) in by_type {
                        let Some(by_user) = by_user.as_object() else { continue };
                        for (receipt_user, data) in by_user {
                            self.storage
                                .upsert_receipt(
                                    txn,
                                    room_id,
                                    receipt_user,
                                    receipt_type,
                                    event_id,
                                    data,
                                )
                                .await?;
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Post-commit cache maintenance and conn fan-out for one response
    async fn fan_out(&self, user_id: &str, response: &SyncV2Response, outcomes: &[RoomOutcome]) {
        let mut woken: BTreeSet<String> = BTreeSet::new();
        woken.insert(user_id.to_string());

        for outcome in outcomes {
            let room_id = &outcome.room_id;
            let users_before = self.cache.users_in_room(room_id).await;

            let needs_reload = outcome.replaced_snapshot
                || outcome.state_added
                || outcome.accumulate.includes_state_redaction;
            if needs_reload {
                match self.storage.room_state(room_id, None).await {
                    Ok(state) => {
                        let (latest_nid, latest_ts) = latest_of(outcome);
                        self.cache
                            .reload_room(room_id, &state, latest_nid, latest_ts)
                            .await;
                    }
                    Err(e) => {
                        warn!("❌ Failed to reload cache for room {}: {}", room_id, e);
                    }
                }
            } else {
                self.cache
                    .apply_timeline(room_id, &outcome.timeline_events)
                    .await;
                let (latest_nid, latest_ts) = latest_of(outcome);
                self.cache.note_timeline(room_id, latest_nid, latest_ts).await;
            }

            let users_after = self.cache.users_in_room(room_id).await;
            let mut affected: BTreeSet<String> = users_before.into_iter().collect();
            affected.extend(users_after);

            if outcome.replaced_snapshot {
                // The state the clients were tracking silently changed; an
                // incremental delta cannot express that, so their sessions
                // are torn down and rebuilt from scratch
                let affected: Vec<String> = affected.iter().cloned().collect();
                self.conns
                    .destroy_conns_tracking_room(room_id, &affected)
                    .await;
            }
            woken.extend(affected);
        }

        for (room_id, _) in &response.rooms.invite {
            for invited_user in invited_users(response, room_id) {
                self.cache.set_invited(&invited_user, room_id, true).await;
                woken.insert(invited_user);
            }
        }
        for (room_id, _) in &response.rooms.leave {
            self.cache.set_invited(user_id, room_id, false).await;
        }

        let woken: Vec<String> = woken.into_iter().collect();
        self.conns.wake_users(&woken);
    }
}

/// Newest (nid, origin_server_ts) an outcome carries
fn latest_of(outcome: &RoomOutcome) -> (i64, i64) {
    let latest_nid = outcome
        .accumulate
        .timeline_nids
        .last()
        .copied()
        .unwrap_or(0);
    let latest_ts = outcome
        .timeline_events
        .iter()
        .filter_map(|ev| ev.get("origin_server_ts").and_then(Value::as_i64))
        .max()
        .unwrap_or(0);
    (latest_nid, latest_ts)
}

/// Users an invite block is for: the membership invite in the stripped
/// state targeting someone other than the sender
fn invited_users(response: &SyncV2Response, room_id: &str) -> Vec<String> {
    let Some(invite) = response.rooms.invite.get(room_id) else {
        return Vec::new();
    };
    invite
        .invite_state
        .events
        .iter()
        .filter(|ev| {
            ev.get("type").and_then(Value::as_str) == Some("m.room.member")
                && ev
                    .get("content")
                    .and_then(|c| c.get("membership"))
                    .and_then(Value::as_str)
                    == Some("invite")
        })
        .filter_map(|ev| ev.get("state_key").and_then(Value::as_str))
        .map(String::from)
        .collect()
}

fn split_type_content(ev: &Value) -> Option<(&str, &Value)> {
    let data_type = ev.get("type")?.as_str()?;
    let content = ev.get("content")?;
    Some((data_type, content))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(String::from)
}

#[async_trait]
impl PollDataReceiver for SyncDataHandler {
    async fn load_device_since(&self, user_id: &str, device_id: &str) -> Result<String> {
        self.storage.device_since(user_id, device_id).await
    }

    async fn on_sync_response(
        &self,
        user_id: &str,
        device_id: &str,
        response: &SyncV2Response,
    ) -> Result<()> {
        let outcomes = self.persist_response(user_id, device_id, response).await?;
        self.fan_out(user_id, response, &outcomes).await;
        Ok(())
    }

    async fn on_expired_token(&self, token: &str, user_id: &str, device_id: &str) {
        info!("Token for {}/{} expired upstream", user_id, device_id);
        if let Err(e) = self.storage.delete_token(token).await {
            warn!("❌ Failed to delete expired token: {}", e);
        }
        self.conns.destroy_conns_for_device(user_id, device_id);
    }
}

/// Query parameters of the sync endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncQuery {
    #[serde(default)]
    pub pos: Option<String>,

    #[serde(default)]
    pub timeout: Option<u64>,
}

/// The client-facing router
pub fn router(handler: Arc<SyncDataHandler>) -> Router {
    Router::new()
        .route(
            "/_matrix/client/unstable/org.matrix.msc3575/sync",
            post(sync_route),
        )
        .route("/health", get(health_route))
        .with_state(handler)
}

async fn sync_route(
    State(handler): State<Arc<SyncDataHandler>>,
    Query(query): Query<SyncQuery>,
    headers: HeaderMap,
    body: Option<Json<SlidingSyncRequest>>,
) -> Response {
    let Json(body) = body.unwrap_or_default();
    match handler.serve_sync(&headers, query, body).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn health_route(State(handler): State<Arc<SyncDataHandler>>) -> Response {
    match slipsync_db::pool::check_pool_health(handler.storage.pool()).await {
        Ok(true) => (StatusCode::OK, "ok").into_response(),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "db unavailable").into_response(),
    }
}

fn error_response(e: SlipsyncError) -> Response {
    let (status, errcode) = match &e {
        SlipsyncError::Auth(_) | SlipsyncError::UnknownToken => {
            (StatusCode::UNAUTHORIZED, "M_UNKNOWN_TOKEN")
        }
        SlipsyncError::UnknownPos(_) => (StatusCode::BAD_REQUEST, "M_UNKNOWN_POS"),
        SlipsyncError::Validation(_) => (StatusCode::BAD_REQUEST, "M_INVALID_PARAM"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "M_UNKNOWN"),
    };
    let body = ErrorBody {
        errcode: errcode.to_string(),
        error: e.to_string(),
    };
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", "Bearer SECRET".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("SECRET"));

        let mut bad = HeaderMap::new();
        bad.insert("Authorization", "Basic dXNlcg==".parse().unwrap());
        assert_eq!(bearer_token(&bad), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn test_invited_users_reads_stripped_membership() {
        let response: SyncV2Response = serde_json::from_value(json!({
            "next_batch": "s1",
            "rooms": {
                "invite": {
                    "!r:hs": {
                        "invite_state": {
                            "events": [
                                {"type": "m.room.name", "state_key": "", "content": {"name": "Lounge"}},
                                {"type": "m.room.member", "state_key": "@bob:hs", "sender": "@alice:hs",
                                 "content": {"membership": "invite"}}
                            ]
                        }
                    }
                }
            }
        }))
        .unwrap();
        assert_eq!(invited_users(&response, "!r:hs"), vec!["@bob:hs"]);
    }

    #[test]
    fn test_error_response_codes() {
        let resp = error_response(SlipsyncError::UnknownPos("p".into()));
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let resp = error_response(SlipsyncError::UnknownToken);
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let resp = error_response(SlipsyncError::Database("x".into()));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
