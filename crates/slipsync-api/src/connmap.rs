//! Conn registry
//!
//! Holds every live sliding sync session, sharded by user hash. Conns are
//! destroyed here on token expiry, on gappy state replacement and on
//! position violations; destruction removes the registry entry so the
//! client's next request builds a fresh session.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::conn::Conn;

const SHARD_COUNT: usize = 16;

/// Identity of one sliding sync session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub user_id: String,
    pub device_id: String,
    pub conn_id: String,
}

/// The sharded conn registry
pub struct ConnMap {
    shards: Vec<Mutex<HashMap<ConnKey, Arc<Conn>>>>,
}

impl ConnMap {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        }
    }

    fn shard(&self, user_id: &str) -> &Mutex<HashMap<ConnKey, Arc<Conn>>> {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Fetch the conn for a key. When `fresh` is set (the client sent an
    /// empty pos) any existing session is replaced outright.
    pub fn get_or_create(&self, key: &ConnKey, fresh: bool) -> Arc<Conn> {
        let mut shard = self.shard(&key.user_id).lock().expect("conn shard lock");
        if fresh {
            if let Some(old) = shard.remove(key) {
                old.destroy();
            }
        }
        shard
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Conn::new()))
            .clone()
    }

    /// Drop one conn from the registry
    pub fn remove(&self, key: &ConnKey) {
        let mut shard = self.shard(&key.user_id).lock().expect("conn shard lock");
        if let Some(conn) = shard.remove(key) {
            conn.destroy();
        }
    }

    /// Destroy every session of one device. Used on token expiry.
    pub fn destroy_conns_for_device(&self, user_id: &str, device_id: &str) {
        let mut shard = self.shard(user_id).lock().expect("conn shard lock");
        shard.retain(|key, conn| {
            if key.user_id == user_id && key.device_id == device_id {
                debug!("🔧 Destroying conn {:?} on token expiry", key);
                conn.destroy();
                false
            } else {
                true
            }
        });
    }

    /// Destroy the sessions of the given users that track `room_id`.
    /// Used when a gappy poll replaced the room's state out from under
    /// them; their next request observes an unknown pos and rebuilds.
    pub async fn destroy_conns_tracking_room(&self, room_id: &str, user_ids: &[String]) {
        let mut candidates: Vec<(ConnKey, Arc<Conn>)> = Vec::new();
        for user_id in user_ids {
            let shard = self.shard(user_id).lock().expect("conn shard lock");
            for (key, conn) in shard.iter() {
                if key.user_id == *user_id {
                    candidates.push((key.clone(), conn.clone()));
                }
            }
        }
        for (key, conn) in candidates {
            if conn.is_tracking(room_id).await {
                debug!("🔧 Destroying conn {:?}: gappy state in {}", key, room_id);
                conn.destroy();
                let mut shard = self.shard(&key.user_id).lock().expect("conn shard lock");
                shard.remove(&key);
            }
        }
    }

    /// Wake the sessions of the given users so they recompute their
    /// projections
    pub fn wake_users(&self, user_ids: &[String]) {
        for user_id in user_ids {
            let shard = self.shard(user_id).lock().expect("conn shard lock");
            for (key, conn) in shard.iter() {
                if key.user_id == *user_id {
                    conn.wake();
                }
            }
        }
    }

    /// Number of live conns
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().expect("conn shard lock").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnMap {
    fn default() -> Self {
        Self::new()
    }
}
