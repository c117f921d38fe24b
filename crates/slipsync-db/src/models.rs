//! Database models for Slipsync
//!
//! This module defines the row types used throughout the Slipsync store.

use serde::{Deserialize, Serialize};
use slipsync_core::{Nid, SnapshotId};

/// One stored event row
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic numeric id, the global stream position
    #[sqlx(rename = "event_nid")]
    pub nid: Nid,

    /// Globally unique event id
    #[sqlx(rename = "event_id")]
    pub id: String,

    /// Room the event belongs to
    pub room_id: String,

    /// Event type, e.g. m.room.member
    pub event_type: String,

    /// State key; None for non-state events
    pub state_key: Option<String>,

    /// Sender user id
    pub sender: String,

    /// Origin server timestamp in milliseconds
    pub origin_server_ts: i64,

    /// Raw event JSON
    #[sqlx(rename = "event")]
    pub json: serde_json::Value,

    /// True when the event arrived in a state block rather than a timeline
    pub is_state: bool,

    /// True when this event opened a limited timeline with unknown history
    pub missing_previous: bool,

    /// Pagination token stored against the first event of a timeline batch
    pub prev_batch: Option<String>,
}

impl Event {
    /// Whether this event carries state
    pub fn is_state_event(&self) -> bool {
        self.state_key.is_some()
    }
}

/// Input to the events table: one event parsed out of an upstream block
#[derive(Debug, Clone)]
pub struct EventToInsert {
    /// Globally unique event id
    pub id: String,

    /// Event type
    pub event_type: String,

    /// State key; None for non-state events
    pub state_key: Option<String>,

    /// Sender user id
    pub sender: String,

    /// Origin server timestamp in milliseconds
    pub origin_server_ts: i64,

    /// Raw event JSON
    pub json: serde_json::Value,

    /// Whether the event came from a state block
    pub is_state: bool,

    /// Gap marker to store with the row
    pub missing_previous: bool,

    /// Pagination token to store with the row
    pub prev_batch: Option<String>,
}

/// A state event reduced to the fields snapshot arithmetic needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrippedEvent {
    /// Event NID
    pub nid: Nid,

    /// Event type
    pub event_type: String,

    /// State key
    pub state_key: String,
}

impl StrippedEvent {
    /// Whether this entry belongs in the snapshot's membership list
    pub fn is_membership(&self) -> bool {
        self.event_type == "m.room.member"
    }
}

/// One room state snapshot row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SnapshotRow {
    /// Snapshot id
    pub snapshot_id: SnapshotId,

    /// Room id
    pub room_id: String,

    /// NIDs of m.room.member state events, sorted
    pub membership_events: Vec<Nid>,

    /// NIDs of all other state events, sorted
    pub other_events: Vec<Nid>,
}

impl SnapshotRow {
    /// All NIDs in the snapshot (other first, then memberships)
    pub fn nids(&self) -> Vec<Nid> {
        let mut nids = self.other_events.clone();
        nids.extend_from_slice(&self.membership_events);
        nids
    }
}

/// Current state pointer for one room
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RoomRow {
    /// Room id
    pub room_id: String,

    /// Snapshot reflecting state after the highest state event NID observed
    pub current_after_snapshot_id: SnapshotId,

    /// Most recent upstream pagination token for this room
    pub last_prev_batch: Option<String>,
}

/// Bearer token binding
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TokenRow {
    /// The access token
    pub token: String,

    /// User the token belongs to
    pub user_id: String,

    /// Device the token belongs to
    pub device_id: String,

    /// When the token was last used by a client
    pub last_seen: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stripped_event_membership() {
        let member = StrippedEvent {
            nid: 1,
            event_type: "m.room.member".into(),
            state_key: "@alice:localhost".into(),
        };
        let name = StrippedEvent {
            nid: 2,
            event_type: "m.room.name".into(),
            state_key: "".into(),
        };
        assert!(member.is_membership());
        assert!(!name.is_membership());
    }

    #[test]
    fn test_snapshot_nids_concatenation() {
        let snapshot = SnapshotRow {
            snapshot_id: 1,
            room_id: "!r:localhost".into(),
            membership_events: vec![2, 4],
            other_events: vec![1, 3],
        };
        assert_eq!(snapshot.nids(), vec![1, 3, 2, 4]);
    }
}
