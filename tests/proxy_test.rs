//! End-to-end proxy scenarios against a mock upstream homeserver.
//!
//! The mock implements the sync v2 client trait directly, so no HTTP
//! server is involved; requests are driven through the handler the same
//! way the axum route drives it. These tests need PostgreSQL: set
//! SLIPSYNC_TEST_DB to a connection string to run them, otherwise they
//! no-op.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use slipsync_api::handler::{HandlerConfig, SyncDataHandler, SyncQuery};
use slipsync_api::types::SlidingSyncResponse;
use slipsync_api::{ConnMap, GlobalCache};
use slipsync_core::config::DatabaseConfig;
use slipsync_core::SlipsyncError;
use slipsync_db::{migrations, pool, Storage};
use slipsync_sync::client::{SyncError, SyncParams, SyncV2Client, SyncV2Response, WhoAmI};
use slipsync_sync::poller::PollerConfig;
use slipsync_sync::pool::{PollerPool, PollerPoolConfig};

// ---- mock upstream ----

#[derive(Default)]
struct MockUpstream {
    accounts: Mutex<HashMap<String, WhoAmI>>,
    queues: Mutex<HashMap<String, VecDeque<SyncV2Response>>>,
    invalidated: Mutex<HashSet<String>>,
    invalidate_on_whoami: Mutex<HashSet<String>>,
    /// Every do_sync call as (token, since, params)
    sync_calls: Mutex<Vec<(String, String, SyncParams)>>,
    /// Tokens currently blocked in an empty long poll
    idle_polls: Mutex<HashMap<String, u64>>,
}

impl MockUpstream {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn add_account(&self, token: &str, user_id: &str, device_id: &str) {
        self.accounts.lock().await.insert(
            token.to_string(),
            WhoAmI {
                user_id: user_id.to_string(),
                device_id: device_id.to_string(),
            },
        );
    }

    async fn queue(&self, token: &str, response: SyncV2Response) {
        self.queues
            .lock()
            .await
            .entry(token.to_string())
            .or_default()
            .push_back(response);
    }

    async fn invalidate(&self, token: &str) {
        self.invalidated.lock().await.insert(token.to_string());
    }

    async fn invalidate_after_whoami(&self, token: &str) {
        self.invalidate_on_whoami
            .lock()
            .await
            .insert(token.to_string());
    }

    /// Wait until the token's queue is drained, processed, and its poller
    /// is parked in an empty long poll again
    async fn wait_until_idle(&self, token: &str) {
        let baseline = self.idle_polls.lock().await.get(token).copied().unwrap_or(0);
        for _ in 0..500 {
            let drained = self
                .queues
                .lock()
                .await
                .get(token)
                .map(|queue| queue.is_empty())
                .unwrap_or(true);
            let parked = self.idle_polls.lock().await.get(token).copied().unwrap_or(0) > baseline;
            if drained && parked {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("mock upstream never went idle for {token}");
    }
}

#[async_trait]
impl SyncV2Client for MockUpstream {
    async fn whoami(&self, token: &str) -> Result<WhoAmI, SyncError> {
        if self.invalidated.lock().await.contains(token) {
            return Err(SyncError::Unauthorized);
        }
        let who = self
            .accounts
            .lock()
            .await
            .get(token)
            .cloned()
            .ok_or(SyncError::Unauthorized)?;
        if self.invalidate_on_whoami.lock().await.remove(token) {
            self.invalidated.lock().await.insert(token.to_string());
        }
        Ok(who)
    }

    async fn do_sync(
        &self,
        token: &str,
        since: &str,
        params: &SyncParams,
    ) -> Result<SyncV2Response, SyncError> {
        self.sync_calls
            .lock()
            .await
            .push((token.to_string(), since.to_string(), params.clone()));
        let mut marked_idle = false;
        loop {
            if self.invalidated.lock().await.contains(token) {
                return Err(SyncError::Unauthorized);
            }
            if let Some(response) = self
                .queues
                .lock()
                .await
                .get_mut(token)
                .and_then(VecDeque::pop_front)
            {
                return Ok(response);
            }
            if !marked_idle {
                marked_idle = true;
                *self
                    .idle_polls
                    .lock()
                    .await
                    .entry(token.to_string())
                    .or_default() += 1;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

// ---- test plumbing ----

fn unique(prefix: &str, suffix: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .subsec_nanos();
    let count = COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("{prefix}{nanos}x{count}{suffix}")
}

async fn test_handler(upstream: Arc<MockUpstream>) -> Option<Arc<SyncDataHandler>> {
    let url = std::env::var("SLIPSYNC_TEST_DB").ok()?;
    let config = DatabaseConfig {
        url,
        max_connections: 8,
        connection_timeout: 10,
        min_idle: None,
        max_lifetime: None,
    };
    let pg = pool::create_pool(&config).await.expect("connect test db");
    migrations::run_migrations(&pg).await.expect("migrations");
    let storage = Storage::new(pg, 50);

    let poller_pool = Arc::new(PollerPool::new(
        upstream.clone(),
        PollerPoolConfig {
            poller: PollerConfig {
                timeline_limit: 50,
                poll_timeout_ms: 30_000,
                backoff_initial_ms: 5,
                backoff_max_ms: 20,
            },
            expiry_secs: 3600,
        },
    ));

    let handler = Arc::new(SyncDataHandler::new(
        storage,
        Arc::new(GlobalCache::new()),
        Arc::new(ConnMap::new()),
        poller_pool,
        upstream,
        HandlerConfig {
            default_timeout_ms: 150,
            max_timeout_ms: 5_000,
        },
    ));
    handler.startup(51).await.expect("startup");
    Some(handler)
}

fn auth(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("Authorization", format!("Bearer {token}").parse().unwrap());
    headers
}

async fn sync3(
    handler: &Arc<SyncDataHandler>,
    token: &str,
    pos: Option<&str>,
    body: Value,
) -> Result<SlidingSyncResponse, SlipsyncError> {
    let body = serde_json::from_value(body).expect("request body");
    handler
        .clone()
        .serve_sync(
            &auth(token),
            SyncQuery {
                pos: pos.map(String::from),
                timeout: Some(150),
            },
            body,
        )
        .await
}

fn state_event(id: &str, event_type: &str, state_key: &str, content: Value) -> Value {
    json!({
        "event_id": id,
        "type": event_type,
        "state_key": state_key,
        "sender": "@server:localhost",
        "origin_server_ts": 1_700_000_000_000u64,
        "content": content
    })
}

fn message_event(id: &str, sender: &str, body: &str, ts: u64) -> Value {
    json!({
        "event_id": id,
        "type": "m.room.message",
        "sender": sender,
        "origin_server_ts": ts,
        "content": {"msgtype": "m.text", "body": body}
    })
}

fn room_state(room: &str, members: &[&str]) -> Vec<Value> {
    let mut events = vec![state_event(
        &format!("$create-{room}"),
        "m.room.create",
        "",
        json!({"creator": members[0]}),
    )];
    for member in members {
        events.push(state_event(
            &format!("$join-{member}-{room}"),
            "m.room.member",
            member,
            json!({"membership": "join"}),
        ));
    }
    events
}

fn join_response(room: &str, state: Vec<Value>, timeline: Vec<Value>, limited: bool, prev_batch: Option<&str>, next_batch: &str) -> SyncV2Response {
    serde_json::from_value(json!({
        "next_batch": next_batch,
        "rooms": {
            "join": {
                room: {
                    "state": {"events": state},
                    "timeline": {
                        "events": timeline,
                        "limited": limited,
                        "prev_batch": prev_batch
                    }
                }
            }
        }
    }))
    .expect("mock response")
}

// ---- scenarios ----

#[tokio::test]
async fn test_second_poller_uses_accelerated_filter() {
    let upstream = MockUpstream::new();
    let Some(handler) = test_handler(upstream.clone()).await else {
        return;
    };

    let alice = unique("@alice", ":localhost");
    let room = unique("!second", ":localhost");
    let token_a = unique("TOKEN_A_", "");
    let token_b = unique("TOKEN_B_", "");

    upstream.add_account(&token_a, &alice, "DEVICE_A").await;
    upstream
        .queue(
            &token_a,
            join_response(
                &room,
                room_state(&room, &[&alice]),
                vec![message_event("$seed", &alice, "hi", 1)],
                false,
                None,
                "a1",
            ),
        )
        .await;
    sync3(&handler, &token_a, None, json!({})).await.expect("seed device A");

    upstream.add_account(&token_b, &alice, "DEVICE_B").await;
    upstream
        .queue(
            &token_b,
            serde_json::from_value::<SyncV2Response>(json!({
                "next_batch": "b1",
                "to_device": {"events": [{"type": "f", "content": {"f": "b"}}]}
            }))
            .unwrap(),
        )
        .await;
    let response = sync3(
        &handler,
        &token_b,
        None,
        json!({"extensions": {"to_device": {"enabled": true}}}),
    )
    .await
    .expect("device B first request");

    // First poll for device B: initial sync, timeline limit 1, all room
    // timelines excluded
    let calls = upstream.sync_calls.lock().await;
    let first_b = calls
        .iter()
        .find(|(token, _, _)| *token == token_b)
        .expect("device B polled");
    assert_eq!(first_b.1, "");
    assert_eq!(first_b.2.timeline_limit, 1);
    assert!(first_b.2.exclude_all_rooms);
    drop(calls);

    // Second poll: incremental, normal limit, no room exclusion
    upstream
        .queue(
            &token_b,
            serde_json::from_value::<SyncV2Response>(json!({"next_batch": "b2"})).unwrap(),
        )
        .await;
    upstream.wait_until_idle(&token_b).await;
    let calls = upstream.sync_calls.lock().await;
    let second_b = calls
        .iter()
        .filter(|(token, _, _)| *token == token_b)
        .nth(1)
        .expect("device B polled twice");
    assert_eq!(second_b.1, "b1");
    assert_eq!(second_b.2.timeline_limit, 50);
    assert!(!second_b.2.exclude_all_rooms);
    drop(calls);

    // The queued to-device message arrives on the next request
    let response = sync3(
        &handler,
        &token_b,
        Some(&response.pos),
        json!({}),
    )
    .await
    .expect("device B second request");
    let to_device = response.extensions.to_device.expect("to-device payload");
    assert_eq!(to_device.events.len(), 1);
    assert_eq!(to_device.events[0]["type"], "f");
}

#[tokio::test]
async fn test_gappy_state_invalidates_session() {
    let upstream = MockUpstream::new();
    let Some(handler) = test_handler(upstream.clone()).await else {
        return;
    };

    let alice = unique("@alice", ":localhost");
    let room = unique("!gappy", ":localhost");
    let token = unique("TOKEN_", "");

    upstream.add_account(&token, &alice, "DEVICE_A").await;
    let mut initial_state = room_state(&room, &[&alice]);
    initial_state.push(state_event(
        &format!("$pl1-{room}"),
        "m.room.power_levels",
        "",
        json!({"users_default": 0}),
    ));
    upstream
        .queue(
            &token,
            join_response(
                &room,
                initial_state,
                vec![message_event(&format!("$m1-{room}"), &alice, "hello", 10)],
                false,
                None,
                "s1",
            ),
        )
        .await;

    let request = json!({
        "lists": {
            "all": {
                "ranges": [[0, 20]],
                "required_state": [["m.room.power_levels", ""]],
                "timeline_limit": 10
            }
        }
    });
    let first = sync3(&handler, &token, None, request.clone())
        .await
        .expect("initial request");
    assert!(first.rooms.contains_key(&room), "room should be in the window");

    // A gappy poll: upstream drops events and hands us replacement state
    upstream
        .queue(
            &token,
            join_response(
                &room,
                vec![
                    state_event(&format!("$name2-{room}"), "m.room.name", "", json!({"name": "banana"})),
                    state_event(&format!("$pl2-{room}"), "m.room.power_levels", "", json!({"users_default": 10})),
                ],
                vec![message_event(&format!("$m2-{room}"), &alice, "gap", 20)],
                true,
                Some("gap-pb"),
                "s2",
            ),
        )
        .await;
    upstream.wait_until_idle(&token).await;

    // The old position is dead
    let stale = sync3(&handler, &token, Some(&first.pos), request.clone()).await;
    assert!(
        matches!(stale, Err(SlipsyncError::UnknownPos(_))),
        "stale pos must fail with unknown pos, got {stale:?}"
    );

    // A fresh session sees the post-gap state
    let fresh = sync3(&handler, &token, None, request).await.expect("fresh request");
    let payload = fresh.rooms.get(&room).expect("room in fresh response");
    assert_eq!(payload.name.as_deref(), Some("banana"));
    let new_pl = payload
        .required_state
        .iter()
        .find(|ev| ev["type"] == "m.room.power_levels")
        .expect("power levels in required_state");
    assert_eq!(new_pl["content"]["users_default"], 10);
}

#[tokio::test]
async fn test_bob_departs_in_gap() {
    let upstream = MockUpstream::new();
    let Some(handler) = test_handler(upstream.clone()).await else {
        return;
    };

    let alice = unique("@alice", ":localhost");
    let bob = unique("@bob", ":localhost");
    let room = unique("!depart", ":localhost");
    let token_alice = unique("TOKEN_A_", "");
    let token_bob = unique("TOKEN_B_", "");

    upstream.add_account(&token_alice, &alice, "DEVICE_A").await;
    upstream.add_account(&token_bob, &bob, "DEVICE_B").await;
    upstream
        .queue(
            &token_alice,
            join_response(&room, room_state(&room, &[&alice, &bob]), vec![], false, None, "a1"),
        )
        .await;
    upstream
        .queue(
            &token_bob,
            join_response(&room, room_state(&room, &[&alice, &bob]), vec![], false, None, "b1"),
        )
        .await;

    let request = json!({"lists": {"all": {"ranges": [[0, 20]], "timeline_limit": 5}}});
    sync3(&handler, &token_alice, None, request.clone())
        .await
        .expect("alice initial");
    let bob_first = sync3(&handler, &token_bob, None, request.clone())
        .await
        .expect("bob initial");
    assert!(bob_first.rooms.contains_key(&room), "bob sees the room");

    // Bob leaves inside a gap observed by alice's poller
    upstream
        .queue(
            &token_alice,
            join_response(
                &room,
                vec![state_event(
                    &format!("$leave-{bob}"),
                    "m.room.member",
                    &bob,
                    json!({"membership": "leave"}),
                )],
                vec![message_event(&format!("$after-{room}"), &alice, "bye", 30)],
                true,
                Some("pb-gap"),
                "a2",
            ),
        )
        .await;
    upstream.wait_until_idle(&token_alice).await;

    let stale = sync3(&handler, &token_bob, Some(&bob_first.pos), request.clone()).await;
    assert!(
        matches!(stale, Err(SlipsyncError::UnknownPos(_))),
        "bob's old pos must fail, got {stale:?}"
    );

    let fresh = sync3(&handler, &token_bob, None, request).await.expect("bob fresh");
    assert!(
        !fresh.rooms.contains_key(&room),
        "bob must not see the departed room"
    );
    let list = fresh.lists.get("all").expect("list");
    assert_eq!(list.count, 0, "bob's room list must be empty");
}

#[tokio::test]
async fn test_poller_expiry_preserves_unadvanced_since() {
    let upstream = MockUpstream::new();
    let url = match std::env::var("SLIPSYNC_TEST_DB") {
        Ok(url) => url,
        Err(_) => return,
    };
    let config = DatabaseConfig {
        url,
        max_connections: 4,
        connection_timeout: 10,
        min_idle: None,
        max_lifetime: None,
    };
    let pg = pool::create_pool(&config).await.expect("connect");
    migrations::run_migrations(&pg).await.expect("migrations");
    let storage = Storage::new(pg, 50);

    let alice = unique("@alice", ":localhost");
    let token = unique("TOKEN_", "");
    upstream.add_account(&token, &alice, "DEVICE_A").await;

    // Seed a committed since token
    storage.ensure_device(&alice, "DEVICE_A").await.expect("device");
    let mut txn = storage.begin().await.expect("txn");
    storage
        .update_device_since(&mut txn, &alice, "DEVICE_A", "r1")
        .await
        .expect("seed since");
    storage.commit(txn).await.expect("commit");

    let poller_pool = Arc::new(PollerPool::new(
        upstream.clone(),
        PollerPoolConfig {
            poller: PollerConfig {
                timeline_limit: 50,
                poll_timeout_ms: 30_000,
                backoff_initial_ms: 5,
                backoff_max_ms: 20,
            },
            // Everything is instantly stale
            expiry_secs: 0,
        },
    ));
    let handler = Arc::new(SyncDataHandler::new(
        storage.clone(),
        Arc::new(GlobalCache::new()),
        Arc::new(ConnMap::new()),
        poller_pool.clone(),
        upstream.clone(),
        HandlerConfig {
            default_timeout_ms: 150,
            max_timeout_ms: 5_000,
        },
    ));

    // Nothing queued: the poller sits in an in-flight request forever
    let ensure_handler = handler.clone();
    let ensure_token = token.clone();
    let ensure_alice: slipsync_core::DeviceKey =
        slipsync_core::DeviceKey::new(alice.as_str().try_into().unwrap(), "DEVICE_A".into());
    let rendezvous = tokio::spawn(async move {
        let receiver: Arc<dyn slipsync_sync::poller::PollDataReceiver> = ensure_handler;
        poller_pool
            .ensure_polling(receiver, &ensure_token, &ensure_alice)
            .await
    });
    upstream.wait_until_idle(&token).await;

    // Expire while the request is in flight; the response that never came
    // must not have advanced since
    handler.pool().expire_old_pollers();
    let started = rendezvous.await.expect("join");
    assert!(!started, "expired poller must resolve EnsurePolling false");
    let since = storage.device_since(&alice, "DEVICE_A").await.expect("since");
    assert_eq!(since, "r1", "cancelled in-flight poll must not commit");
}

#[tokio::test]
async fn test_token_expiry_during_whoami_race_doesnt_wedge() {
    let upstream = MockUpstream::new();
    let Some(handler) = test_handler(upstream.clone()).await else {
        return;
    };

    let alice = unique("@alice", ":localhost");
    let token = unique("TOKEN_", "");
    let fresh_token = unique("TOKEN_FRESH_", "");

    // whoami succeeds, then the token dies before the poller's first poll
    upstream.add_account(&token, &alice, "DEVICE_A").await;
    upstream.invalidate_after_whoami(&token).await;

    let first = sync3(&handler, &token, None, json!({})).await;
    assert!(
        matches!(first, Err(SlipsyncError::UnknownToken)),
        "dead token must 401, got {first:?}"
    );

    // A fresh token for the same device must not inherit the failure
    upstream.add_account(&fresh_token, &alice, "DEVICE_A").await;
    upstream
        .queue(
            &fresh_token,
            serde_json::from_value::<SyncV2Response>(json!({"next_batch": "n1"})).unwrap(),
        )
        .await;
    sync3(&handler, &fresh_token, None, json!({}))
        .await
        .expect("fresh token must start a fresh poller");
}

#[tokio::test]
async fn test_timeline_stops_at_gap_boundary() {
    let upstream = MockUpstream::new();
    let Some(handler) = test_handler(upstream.clone()).await else {
        return;
    };

    let alice = unique("@alice", ":localhost");
    let room = unique("!gapcut", ":localhost");
    let token = unique("TOKEN_", "");
    upstream.add_account(&token, &alice, "DEVICE_A").await;

    upstream
        .queue(
            &token,
            join_response(
                &room,
                room_state(&room, &[&alice]),
                vec![
                    message_event(&format!("$e1-{room}"), &alice, "one", 1),
                    message_event(&format!("$e2-{room}"), &alice, "two", 2),
                    message_event(&format!("$e3-{room}"), &alice, "three", 3),
                ],
                false,
                None,
                "s1",
            ),
        )
        .await;
    // Processed before any client connects
    let seed = sync3(&handler, &token, None, json!({})).await.expect("seed");

    upstream
        .queue(
            &token,
            join_response(
                &room,
                vec![],
                vec![message_event(&format!("$e4-{room}"), &alice, "four", 4)],
                true,
                Some("pb-e4"),
                "s2",
            ),
        )
        .await;
    upstream.wait_until_idle(&token).await;

    let response = sync3(
        &handler,
        &token,
        Some(&seed.pos),
        json!({"lists": {"all": {"ranges": [[0, 20]], "timeline_limit": 10}}}),
    )
    .await
    .expect("windowed request");

    let payload = response.rooms.get(&room).expect("room payload");
    let ids: Vec<&str> = payload
        .timeline
        .iter()
        .filter_map(|ev| ev["event_id"].as_str())
        .collect();
    assert_eq!(
        ids,
        vec![format!("$e4-{room}").as_str()],
        "timeline must stop at the gap"
    );
    assert_eq!(payload.prev_batch.as_deref(), Some("pb-e4"));
    assert!(payload.limited);
}

#[tokio::test]
async fn test_pos_reuse_fails_after_advance() {
    let upstream = MockUpstream::new();
    let Some(handler) = test_handler(upstream.clone()).await else {
        return;
    };

    let alice = unique("@alice", ":localhost");
    let token = unique("TOKEN_", "");
    upstream.add_account(&token, &alice, "DEVICE_A").await;
    upstream
        .queue(
            &token,
            serde_json::from_value::<SyncV2Response>(json!({"next_batch": "p1"})).unwrap(),
        )
        .await;

    let first = sync3(&handler, &token, None, json!({})).await.expect("first");
    let second = sync3(&handler, &token, Some(&first.pos), json!({}))
        .await
        .expect("second");
    assert_ne!(first.pos, second.pos, "positions are strictly monotonic");

    let replay = sync3(&handler, &token, Some(&first.pos), json!({})).await;
    assert!(
        matches!(replay, Err(SlipsyncError::UnknownPos(_))),
        "replaying an old pos must fail, got {replay:?}"
    );
}
