//! Storage and accumulator tests against a real PostgreSQL.
//!
//! Set SLIPSYNC_TEST_DB to a connection string to run these; without it
//! every test no-ops. Room and user ids are unique per run so the tests
//! can share one database.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{json, Value};

use slipsync_db::{events, migrations, rooms, snapshots};
use slipsync_core::config::DatabaseConfig;
use slipsync_db::{DatabasePool, Storage, TimelineInput};

async fn test_db(max_timeline_limit: i64) -> Option<(DatabasePool, Storage)> {
    let url = std::env::var("SLIPSYNC_TEST_DB").ok()?;
    let config = DatabaseConfig {
        url,
        max_connections: 8,
        connection_timeout: 10,
        min_idle: None,
        max_lifetime: None,
    };
    let db = DatabasePool::new(&config).await.expect("connect test db");
    migrations::run_migrations(db.pool()).await.expect("migrations");
    let storage = Storage::new(db.pool().clone(), max_timeline_limit);
    Some((db, storage))
}

fn unique(prefix: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .subsec_nanos();
    format!(
        "{prefix}{nanos}x{}:localhost",
        COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

fn state_event(id: &str, event_type: &str, state_key: &str, content: Value) -> Value {
    json!({
        "event_id": id,
        "type": event_type,
        "state_key": state_key,
        "sender": "@me:localhost",
        "content": content
    })
}

fn initial_state(room: &str) -> Vec<Value> {
    vec![
        state_event(&format!("$create{room}"), "m.room.create", "", json!({"creator": "@me:localhost"})),
        state_event(
            &format!("$me{room}"),
            "m.room.member",
            "@me:localhost",
            json!({"membership": "join"}),
        ),
        state_event(&format!("$jr{room}"), "m.room.join_rules", "", json!({"join_rule": "public"})),
    ]
}

fn timeline(events: Vec<Value>) -> TimelineInput {
    TimelineInput {
        events,
        limited: false,
        prev_batch: None,
    }
}

#[tokio::test]
async fn test_initialise_then_accumulate_builds_snapshots() {
    let Some((db, storage)) = test_db(50).await else { return };
    let room = unique("!accumulate");

    let init = storage
        .initialise(&room, &initial_state(&room))
        .await
        .expect("initialise");
    assert!(init.added_events);
    assert!(!init.replaced_existing_snapshot);
    assert_ne!(init.snapshot_id, 0);

    // A message does not advance state; two state events chain two
    // snapshots, the join_rules one clobbering the initial entry
    let new_events = vec![
        json!({"event_id": format!("$msg{room}"), "type": "m.room.message",
               "sender": "@me:localhost", "content": {"msgtype": "m.text", "body": "hi"}}),
        state_event(&format!("$jr2{room}"), "m.room.join_rules", "", json!({"join_rule": "invite"})),
        state_event(&format!("$hv{room}"), "m.room.history_visibility", "", json!({"visibility": "public"})),
    ];
    let result = storage
        .accumulate("@me:localhost", &room, &timeline(new_events.clone()))
        .await
        .expect("accumulate");
    assert_eq!(result.num_new, 3);
    assert_eq!(result.timeline_nids.len(), 3);
    assert!(!result.includes_state_redaction);

    let mut conn = db.get_conn().await.expect("conn");
    let row = rooms::select_room(&mut conn, &room)
        .await
        .expect("select room")
        .expect("room exists");
    assert_ne!(row.current_after_snapshot_id, init.snapshot_id);

    let snapshot = snapshots::select_snapshot(&mut conn, row.current_after_snapshot_id)
        .await
        .expect("snapshot");
    assert_eq!(snapshot.membership_events.len(), 1);
    // create + join_rules + history_visibility
    assert_eq!(snapshot.other_events.len(), 3);

    let stored = events::select_by_ids(
        &mut conn,
        &[format!("$jr2{room}"), format!("$hv{room}"), format!("$jr{room}")],
    )
    .await
    .expect("select by ids");
    assert_eq!(stored.len(), 3);
    let jr2 = stored.iter().find(|ev| ev.id == format!("$jr2{room}")).unwrap();
    assert!(snapshot.other_events.contains(&jr2.nid), "join_rules replaced");
    let jr1 = stored.iter().find(|ev| ev.id == format!("$jr{room}")).unwrap();
    assert!(!snapshot.other_events.contains(&jr1.nid), "old join_rules dropped");

    // Subsequent identical calls do nothing and are not an error
    let again = storage
        .accumulate("@me:localhost", &room, &timeline(new_events))
        .await
        .expect("re-accumulate");
    assert_eq!(again.num_new, 0);
}

#[tokio::test]
async fn test_initialise_unknown_room_requires_create() {
    let Some((_db, storage)) = test_db(50).await else { return };
    let room = unique("!nocreate");
    let not_create = vec![state_event(
        "$potato",
        "com.example.notacreate",
        "potato",
        json!({}),
    )];
    let err = storage.initialise(&room, &not_create).await;
    assert!(err.is_err(), "initialise without m.room.create must fail");
}

#[tokio::test]
async fn test_initialise_overlay_replaces_existing_snapshot() {
    let Some((_db, storage)) = test_db(50).await else { return };
    let room = unique("!overlay");

    let first = storage
        .initialise(&room, &initial_state(&room))
        .await
        .expect("initialise");

    // Same block again: no-op
    let noop = storage
        .initialise(&room, &initial_state(&room))
        .await
        .expect("re-initialise");
    assert!(!noop.added_events);

    // A subset: still a no-op
    let subset = storage
        .initialise(&room, &initial_state(&room)[..2])
        .await
        .expect("subset initialise");
    assert!(!subset.added_events);

    // One unseen event: overlay onto the current snapshot
    let overlay = vec![
        state_event(&format!("$jr{room}"), "m.room.join_rules", "", json!({"join_rule": "public"})),
        state_event(&format!("$topic{room}"), "m.room.topic", "", json!({"topic": "Dr Rick Dagless MD"})),
    ];
    let replaced = storage.initialise(&room, &overlay).await.expect("overlay");
    assert!(replaced.added_events);
    assert!(replaced.replaced_existing_snapshot);
    assert_ne!(replaced.snapshot_id, first.snapshot_id);

    let state = storage.room_state(&room, None).await.expect("room state");
    // create + member + join_rules + topic
    assert_eq!(state.len(), 4);
}

#[tokio::test]
async fn test_missing_previous_markers() {
    let Some((db, storage)) = test_db(50).await else { return };
    let room = unique("!markers");
    storage
        .initialise(&room, &initial_state(&room))
        .await
        .expect("initialise");

    let msg = |id: &str| {
        json!({"event_id": id, "type": "m.room.message", "sender": "@me:localhost",
               "content": {"msgtype": "m.text", "body": "Hello, world!"}})
    };
    let d = format!("$msgD{room}");
    let e = format!("$msgE{room}");
    let f = format!("$msgF{room}");

    // (events, limited, expected num_new, expected flags)
    let steps: Vec<(Vec<Value>, bool, usize, Vec<(&String, bool)>)> = vec![
        (vec![msg(&d)], false, 1, vec![(&d, false)]),
        (vec![msg(&e)], true, 1, vec![(&e, true)]),
        (vec![msg(&e), msg(&f)], true, 1, vec![(&e, true), (&f, false)]),
        (vec![msg(&f)], true, 0, vec![(&f, false)]),
        (vec![msg(&d), msg(&e), msg(&f)], false, 0, vec![(&d, false), (&e, true), (&f, false)]),
    ];
    for (i, (batch, limited, want_new, want_flags)) in steps.into_iter().enumerate() {
        let result = storage
            .accumulate(
                "@me:localhost",
                &room,
                &TimelineInput {
                    events: batch,
                    limited,
                    prev_batch: None,
                },
            )
            .await
            .expect("accumulate");
        assert_eq!(result.num_new, want_new, "step {i}: num_new");

        let mut conn = db.get_conn().await.expect("conn");
        let ids: Vec<String> = want_flags.iter().map(|(id, _)| (*id).clone()).collect();
        let fetched = events::select_by_ids(&mut conn, &ids).await.expect("select");
        for (id, want) in want_flags {
            let ev = fetched.iter().find(|ev| ev.id == *id).expect("event stored");
            assert_eq!(ev.missing_previous, want, "step {i}: {id} missing_previous");
        }
    }
}

#[tokio::test]
async fn test_redaction_of_current_state_requires_reload() {
    let Some((_db, storage)) = test_db(50).await else { return };
    let room = unique("!redact");
    let mut state = initial_state(&room);
    state.push(state_event(
        &format!("$name1{room}"),
        "m.room.name",
        "",
        json!({"name": "Barry Cryer Appreciation Society"}),
    ));
    storage.initialise(&room, &state).await.expect("initialise");

    // A newer name, a message, then an even newer name
    let result = storage
        .accumulate(
            "@dummy:localhost",
            &room,
            &TimelineInput {
                events: vec![
                    state_event(&format!("$name2{room}"), "m.room.name", "", json!({"name": "Jeremy Hardy Appreciation Society"})),
                    json!({"event_id": format!("$chat{room}"), "type": "m.room.message",
                           "sender": "@me:localhost", "content": {"body": "Hello, world!", "msgtype": "m.text"}}),
                    state_event(&format!("$name3{room}"), "m.room.name", "", json!({"name": "Humphrey Lyttelton Appreciation Society"})),
                ],
                limited: false,
                prev_batch: Some("prevBatch".to_string()),
            },
        )
        .await
        .expect("accumulate");
    assert_eq!(result.num_new, 3);
    assert!(!result.includes_state_redaction);

    // Redacting the superseded name and the message touches nothing in
    // the current snapshot
    let result = storage
        .accumulate(
            "@dummy:localhost",
            &room,
            &timeline(vec![
                json!({"event_id": format!("$r1{room}"), "type": "m.room.redaction",
                       "content": {"redacts": format!("$name2{room}")}}),
                json!({"event_id": format!("$r2{room}"), "type": "m.room.redaction",
                       "content": {"redacts": format!("$chat{room}")}}),
            ]),
        )
        .await
        .expect("accumulate redactions");
    assert_eq!(result.num_new, 2);
    assert!(!result.includes_state_redaction);

    // Redacting the latest name hits the current snapshot
    let result = storage
        .accumulate(
            "@dummy:localhost",
            &room,
            &timeline(vec![json!({"event_id": format!("$r3{room}"), "type": "m.room.redaction",
                                  "content": {"redacts": format!("$name3{room}")}})]),
        )
        .await
        .expect("accumulate state redaction");
    assert_eq!(result.num_new, 1);
    assert!(result.includes_state_redaction);
}

#[tokio::test]
async fn test_membership_log_query() {
    let Some((db, storage)) = test_db(50).await else { return };
    let room = unique("!memberlog");
    let me = "@me:localhost";
    let alice = format!("@alice{room}");
    storage
        .initialise(&room, &initial_state(&room))
        .await
        .expect("initialise");

    let join = state_event(&format!("$aj{room}"), "m.room.member", &alice, json!({"membership": "join"}));
    let rename = state_event(
        &format!("$an{room}"),
        "m.room.member",
        &alice,
        json!({"membership": "join", "displayname": "Garth"}),
    );
    let leave = state_event(&format!("$al{room}"), "m.room.member", &alice, json!({"membership": "leave"}));
    storage
        .accumulate(me, &room, &timeline(vec![join, rename, leave]))
        .await
        .expect("accumulate memberships");

    let mut conn = db.get_conn().await.expect("conn");
    let all = events::select_events_with_type_state_key(&mut conn, "m.room.member", &alice, 0, i64::MAX)
        .await
        .expect("membership log");
    assert_eq!(all.len(), 3, "join, profile change, leave");
    assert!(all.windows(2).all(|pair| pair[0].nid < pair[1].nid));

    // A sub-range excludes the endpoints outside it
    let middle = events::select_events_with_type_state_key(
        &mut conn,
        "m.room.member",
        &alice,
        all[0].nid,
        all[1].nid,
    )
    .await
    .expect("sub-range");
    assert_eq!(middle.len(), 1);
    assert_eq!(middle[0].id, all[1].id);
}

#[tokio::test]
async fn test_closest_prev_batch() {
    let Some((db, storage)) = test_db(50).await else { return };
    let room = unique("!prevbatch");
    storage
        .initialise(&room, &initial_state(&room))
        .await
        .expect("initialise");

    let first = format!("$pb1{room}");
    let second = format!("$pb2{room}");
    storage
        .accumulate(
            "@me:localhost",
            &room,
            &TimelineInput {
                events: vec![
                    json!({"event_id": first, "type": "m.room.message", "sender": "@me:localhost", "content": {}}),
                ],
                limited: false,
                prev_batch: Some("tok-one".to_string()),
            },
        )
        .await
        .expect("first batch");
    storage
        .accumulate(
            "@me:localhost",
            &room,
            &TimelineInput {
                events: vec![
                    json!({"event_id": second, "type": "m.room.message", "sender": "@me:localhost", "content": {}}),
                ],
                limited: false,
                prev_batch: Some("tok-two".to_string()),
            },
        )
        .await
        .expect("second batch");

    let mut conn = db.get_conn().await.expect("conn");
    let nids = events::select_nids_by_ids(&mut conn, &[first.clone(), second.clone()])
        .await
        .expect("nids");
    let closest = events::select_closest_prev_batch(&mut conn, &room, nids[&first])
        .await
        .expect("closest");
    assert_eq!(closest.as_deref(), Some("tok-one"));
    let closest = events::select_closest_prev_batch(&mut conn, &room, nids[&second])
        .await
        .expect("closest");
    assert_eq!(closest.as_deref(), Some("tok-two"));
}

#[tokio::test]
async fn test_snapshot_compaction_caps_history() {
    // Tiny timeline limit so the cap is easy to hit: keep at most 3
    let Some((db, storage)) = test_db(2).await else { return };
    let room = unique("!compact");
    storage
        .initialise(&room, &initial_state(&room))
        .await
        .expect("initialise");

    let names: Vec<Value> = (0..10)
        .map(|i| {
            state_event(
                &format!("$n{i}{room}"),
                "m.room.name",
                "",
                json!({"name": format!("{i}")}),
            )
        })
        .collect();
    storage
        .accumulate("@me:localhost", &room, &timeline(names))
        .await
        .expect("accumulate names");

    let mut conn = db.get_conn().await.expect("conn");
    let count = snapshots::count_for_room(&mut conn, &room).await.expect("count");
    assert!(count <= 3, "snapshot count {count} exceeds the cap");

    // The current snapshot survives compaction and carries the last name
    let state = storage.room_state(&room, None).await.expect("state");
    let name = state
        .iter()
        .find(|ev| ev.event_type == "m.room.name")
        .expect("name in state");
    assert_eq!(name.json["content"]["name"], "9");
}

#[tokio::test]
async fn test_concurrent_accumulate_serializes() {
    let Some((_db, storage)) = test_db(50).await else { return };
    let room = unique("!concurrent");
    storage
        .initialise(&room, &initial_state(&room))
        .await
        .expect("initialise");

    // Overlapping prefixes [1], [1,2], ... [1..5] racing each other; the
    // per-room row lock serializes them and dedup keeps num_new exact
    let names: Vec<Value> = (1..=5)
        .map(|i| {
            state_event(
                &format!("$con{i}{room}"),
                "m.room.name",
                "",
                json!({"name": format!("{i}")}),
            )
        })
        .collect();
    let mut handles = Vec::new();
    for i in 1..=5usize {
        let storage = storage.clone();
        let room = room.clone();
        let subset = names[..i].to_vec();
        handles.push(tokio::spawn(async move {
            storage
                .accumulate("@me:localhost", &room, &timeline(subset))
                .await
                .expect("concurrent accumulate")
                .num_new
        }));
    }
    let mut total_new = 0;
    for handle in handles {
        total_new += handle.await.expect("join");
    }
    assert_eq!(total_new, 5, "each event inserted exactly once");

    let state = storage.room_state(&room, None).await.expect("state");
    let name = state
        .iter()
        .find(|ev| ev.event_type == "m.room.name")
        .expect("name");
    assert_eq!(name.json["content"]["name"], "5", "latest writer wins");
}
