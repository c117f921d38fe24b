// =============================================================================
// Slipsync Matrix Sliding Sync Proxy - Global Cache
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
//   The in-memory index of per-room metadata: names, aliases, encryption,
//   membership counts, heroes, space children and last-message timing,
//   plus the per-user joined/invited room sets the list projection sorts
//   over. Rebuilt from the store in one transaction at startup; kept
//   current by the poller data handler as state flows through the
//   accumulator. Readers clone values out of the RW lock.
//
// =============================================================================

use std::collections::{BTreeSet, HashMap, HashSet};

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use slipsync_core::Nid;
use slipsync_db::{Event, GlobalSnapshot};

/// Everything the proxy remembers about one room
#[derive(Debug, Clone, Default)]
pub struct RoomMetadata {
    /// Room id
    pub room_id: String,

    /// m.room.name content, if any
    pub name: Option<String>,

    /// m.room.canonical_alias content, if any
    pub canonical_alias: Option<String>,

    /// Joined member count
    pub join_count: usize,

    /// Invited member count
    pub invite_count: usize,

    /// Up to six member ids for display name calculation, joined members
    /// first, then invited, then left; the viewing user is filtered out
    /// at projection time
    pub heroes: Vec<String>,

    /// Whether m.room.encryption is set
    pub encrypted: bool,

    /// The m.room.create type field
    pub room_type: Option<String>,

    /// Room this one replaced
    pub predecessor_room_id: Option<String>,

    /// Room this one was upgraded to (m.room.tombstone)
    pub upgraded_room_id: Option<String>,

    /// Child rooms declared via m.space.child
    pub children: BTreeSet<String>,

    /// origin_server_ts of the latest timeline event
    pub last_message_ts: i64,

    /// NID of the latest timeline event
    pub latest_nid: Nid,
}

impl RoomMetadata {
    fn new(room_id: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            ..Default::default()
        }
    }

    /// The display name for this room as seen by `me`
    pub fn display_name(&self, me: &str) -> Option<String> {
        if let Some(name) = &self.name {
            return Some(name.clone());
        }
        if let Some(alias) = &self.canonical_alias {
            return Some(alias.clone());
        }
        let heroes: Vec<&str> = self
            .heroes
            .iter()
            .filter(|h| h.as_str() != me)
            .take(5)
            .map(String::as_str)
            .collect();
        if heroes.is_empty() {
            None
        } else {
            Some(heroes.join(", "))
        }
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    rooms: HashMap<String, RoomMetadata>,

    /// room -> user -> membership
    memberships: HashMap<String, HashMap<String, String>>,

    /// user -> rooms currently joined
    joined_rooms: HashMap<String, HashSet<String>>,

    /// user -> rooms currently invited to
    invited_rooms: HashMap<String, HashSet<String>>,
}

/// The process-wide room metadata cache
#[derive(Debug, Default)]
pub struct GlobalCache {
    inner: RwLock<CacheInner>,
}

impl GlobalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the whole cache from a startup global snapshot
    pub async fn load(&self, snapshot: &GlobalSnapshot) {
        let mut inner = self.inner.write().await;
        *inner = CacheInner::default();
        for room in &snapshot.rooms {
            let mut metadata = RoomMetadata::new(&room.room_id);
            metadata.last_message_ts = room.latest_timeline_ts;
            metadata.latest_nid = room.latest_nid;
            let mut memberships = HashMap::new();
            for ev in &room.state_events {
                apply_state_event(&mut metadata, &mut memberships, ev.state_key.as_deref(), &ev.event_type, &ev.json);
            }
            finish_membership_bookkeeping(&mut inner, &room.room_id, &mut metadata, memberships);
        }
        for (user_id, room_id, _invite_state) in &snapshot.invites {
            inner
                .invited_rooms
                .entry(user_id.clone())
                .or_default()
                .insert(room_id.clone());
        }
        info!("✅ Global cache rebuilt with {} rooms", inner.rooms.len());
    }

    /// Fold freshly accumulated timeline events into the cache
    pub async fn apply_timeline(&self, room_id: &str, events: &[Value]) {
        let mut inner = self.inner.write().await;
        let mut metadata = inner
            .rooms
            .get(room_id)
            .cloned()
            .unwrap_or_else(|| RoomMetadata::new(room_id));
        let mut memberships = inner.memberships.get(room_id).cloned().unwrap_or_default();

        for ev in events {
            let event_type = ev.get("type").and_then(Value::as_str).unwrap_or_default();
            let state_key = ev.get("state_key").and_then(Value::as_str);
            if state_key.is_some() {
                apply_state_event(&mut metadata, &mut memberships, state_key, event_type, ev);
            } else {
                let ts = ev
                    .get("origin_server_ts")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                if ts > metadata.last_message_ts {
                    metadata.last_message_ts = ts;
                }
            }
        }
        finish_membership_bookkeeping(&mut inner, room_id, &mut metadata, memberships);
    }

    /// Replace a room wholesale from its stored state. Used after gappy
    /// state overlays and state redactions, where incremental updates
    /// cannot be trusted.
    pub async fn reload_room(
        &self,
        room_id: &str,
        state_events: &[Event],
        latest_nid: Nid,
        latest_ts: i64,
    ) {
        let mut inner = self.inner.write().await;
        let mut metadata = RoomMetadata::new(room_id);
        if let Some(old) = inner.rooms.get(room_id) {
            metadata.last_message_ts = old.last_message_ts;
            metadata.latest_nid = old.latest_nid;
        }
        if latest_ts > metadata.last_message_ts {
            metadata.last_message_ts = latest_ts;
        }
        if latest_nid > metadata.latest_nid {
            metadata.latest_nid = latest_nid;
        }
        // Stale membership indexes for this room are dropped and rebuilt
        if let Some(old_members) = inner.memberships.remove(room_id) {
            for user in old_members.keys() {
                if let Some(set) = inner.joined_rooms.get_mut(user) {
                    set.remove(room_id);
                }
            }
        }
        let mut memberships = HashMap::new();
        for ev in state_events {
            apply_state_event(
                &mut metadata,
                &mut memberships,
                ev.state_key.as_deref(),
                &ev.event_type,
                &ev.json,
            );
        }
        finish_membership_bookkeeping(&mut inner, room_id, &mut metadata, memberships);
        debug!("🔧 Reloaded cache metadata for room {}", room_id);
    }

    /// Record the newest timeline position for a room
    pub async fn note_timeline(&self, room_id: &str, latest_nid: Nid, latest_ts: i64) {
        let mut inner = self.inner.write().await;
        let metadata = inner
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| RoomMetadata::new(room_id));
        if latest_nid > metadata.latest_nid {
            metadata.latest_nid = latest_nid;
        }
        if latest_ts > metadata.last_message_ts {
            metadata.last_message_ts = latest_ts;
        }
    }

    /// Track or retire an invite for a user
    pub async fn set_invited(&self, user_id: &str, room_id: &str, invited: bool) {
        let mut inner = self.inner.write().await;
        if invited {
            inner
                .invited_rooms
                .entry(user_id.to_string())
                .or_default()
                .insert(room_id.to_string());
        } else if let Some(set) = inner.invited_rooms.get_mut(user_id) {
            set.remove(room_id);
        }
    }

    /// Clone one room's metadata out of the lock
    pub async fn metadata(&self, room_id: &str) -> Option<RoomMetadata> {
        self.inner.read().await.rooms.get(room_id).cloned()
    }

    /// Metadata for every room the user is currently joined to
    pub async fn joined_metadata(&self, user_id: &str) -> Vec<RoomMetadata> {
        let inner = self.inner.read().await;
        inner
            .joined_rooms
            .get(user_id)
            .map(|rooms| {
                rooms
                    .iter()
                    .filter_map(|room_id| inner.rooms.get(room_id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Room ids the user is invited to
    pub async fn invited_rooms(&self, user_id: &str) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .invited_rooms
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Users currently joined to or invited to a room
    pub async fn users_in_room(&self, room_id: &str) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .memberships
            .get(room_id)
            .map(|members| {
                members
                    .iter()
                    .filter(|(_, m)| m.as_str() == "join" || m.as_str() == "invite")
                    .map(|(user, _)| user.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether the user is currently joined to the room
    pub async fn is_joined(&self, user_id: &str, room_id: &str) -> bool {
        let inner = self.inner.read().await;
        inner
            .joined_rooms
            .get(user_id)
            .is_some_and(|set| set.contains(room_id))
    }
}

/// Fold one state event into metadata and the membership map
fn apply_state_event(
    metadata: &mut RoomMetadata,
    memberships: &mut HashMap<String, String>,
    state_key: Option<&str>,
    event_type: &str,
    json: &Value,
) {
    let Some(state_key) = state_key else { return };
    let content = json.get("content").cloned().unwrap_or(Value::Null);
    match event_type {
        "m.room.member" => {
            let membership = content
                .get("membership")
                .and_then(Value::as_str)
                .unwrap_or("leave")
                .to_string();
            memberships.insert(state_key.to_string(), membership);
        }
        "m.room.name" => {
            metadata.name = content
                .get("name")
                .and_then(Value::as_str)
                .filter(|n| !n.is_empty())
                .map(String::from);
        }
        "m.room.canonical_alias" => {
            metadata.canonical_alias = content
                .get("alias")
                .and_then(Value::as_str)
                .filter(|a| !a.is_empty())
                .map(String::from);
        }
        "m.room.encryption" => {
            metadata.encrypted = true;
        }
        "m.room.create" => {
            metadata.room_type = content.get("type").and_then(Value::as_str).map(String::from);
            metadata.predecessor_room_id = content
                .get("predecessor")
                .and_then(|p| p.get("room_id"))
                .and_then(Value::as_str)
                .map(String::from);
        }
        "m.room.tombstone" => {
            metadata.upgraded_room_id = content
                .get("replacement_room")
                .and_then(Value::as_str)
                .map(String::from);
        }
        "m.space.child" => {
            let has_via = content
                .get("via")
                .and_then(Value::as_array)
                .map(|v| !v.is_empty())
                .unwrap_or(false);
            if has_via {
                metadata.children.insert(state_key.to_string());
            } else {
                metadata.children.remove(state_key);
            }
        }
        _ => {}
    }
}

/// Recompute counts, heroes and per-user indexes, then store the room
fn finish_membership_bookkeeping(
    inner: &mut CacheInner,
    room_id: &str,
    metadata: &mut RoomMetadata,
    memberships: HashMap<String, String>,
) {
    metadata.join_count = memberships.values().filter(|m| m.as_str() == "join").count();
    metadata.invite_count = memberships
        .values()
        .filter(|m| m.as_str() == "invite")
        .count();
    metadata.heroes = compute_heroes(&memberships);

    for (user, membership) in &memberships {
        let joined = inner.joined_rooms.entry(user.clone()).or_default();
        if membership == "join" {
            joined.insert(room_id.to_string());
        } else {
            joined.remove(room_id);
        }
        if membership != "invite" {
            if let Some(set) = inner.invited_rooms.get_mut(user) {
                set.remove(room_id);
            }
        }
    }

    inner
        .memberships
        .insert(room_id.to_string(), memberships);
    inner.rooms.insert(room_id.to_string(), metadata.clone());
}

/// Up to six member ids, joined first, then invited, then left, each
/// group sorted for determinism
fn compute_heroes(memberships: &HashMap<String, String>) -> Vec<String> {
    let mut heroes: Vec<String> = Vec::with_capacity(6);
    for wanted in ["join", "invite", "leave"] {
        let mut group: Vec<&String> = memberships
            .iter()
            .filter(|(_, m)| m.as_str() == wanted)
            .map(|(user, _)| user)
            .collect();
        group.sort();
        for user in group {
            if heroes.len() == 6 {
                return heroes;
            }
            heroes.push(user.clone());
        }
    }
    heroes
}
