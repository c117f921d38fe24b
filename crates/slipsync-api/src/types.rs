//! Sliding sync wire types
//!
//! The MSC3575 request and response envelope, reduced to the fields the
//! proxy serves. Unknown fields are ignored on the way in and empty
//! sections are omitted on the way out.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One client sliding sync request body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlidingSyncRequest {
    /// Distinguishes concurrent sessions of one device
    #[serde(default)]
    pub conn_id: Option<String>,

    /// Long poll timeout in milliseconds
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Named windowed room lists; sticky across requests
    #[serde(default)]
    pub lists: BTreeMap<String, ListRequest>,

    /// Explicit per-room subscriptions; sticky across requests
    #[serde(default)]
    pub room_subscriptions: BTreeMap<String, RoomSubscription>,

    /// Rooms to drop from room_subscriptions
    #[serde(default)]
    pub unsubscribe_rooms: Vec<String>,

    /// Extension toggles
    #[serde(default)]
    pub extensions: ExtensionsRequest,
}

/// One windowed room list in a request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListRequest {
    /// Inclusive [lo, hi] index windows over the sorted room list
    #[serde(default)]
    pub ranges: Vec<(u64, u64)>,

    /// Sort orders, first applicable wins: by_recency | by_name
    #[serde(default)]
    pub sort: Option<Vec<String>>,

    /// Room filters
    #[serde(default)]
    pub filters: Option<ListFilters>,

    /// Room payload template for rooms in this list's windows
    #[serde(flatten)]
    pub room_details: RoomSubscription,
}

/// Filters on a room list
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListFilters {
    /// Only rooms with (true) / without (false) m.room.encryption
    #[serde(default)]
    pub is_encrypted: Option<bool>,

    /// Only rooms the user is invited to (true) / joined (false)
    #[serde(default)]
    pub is_invite: Option<bool>,

    /// Match on the m.room.create type field; None entry matches rooms
    /// with no type
    #[serde(default)]
    pub room_types: Option<Vec<Option<String>>>,

    /// Only rooms that are children of these space room ids
    #[serde(default)]
    pub spaces: Option<Vec<String>>,
}

/// What to send for a room: state entries and timeline depth
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoomSubscription {
    /// (type, state_key) pairs; "*" is a wildcard on either side
    #[serde(default)]
    pub required_state: Vec<(String, String)>,

    /// Maximum timeline events per response
    #[serde(default)]
    pub timeline_limit: Option<u64>,
}

/// Extension toggles in a request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtensionsRequest {
    #[serde(default)]
    pub to_device: Option<ToDeviceRequest>,

    #[serde(default)]
    pub e2ee: Option<ExtensionToggle>,

    #[serde(default)]
    pub account_data: Option<ExtensionToggle>,

    #[serde(default)]
    pub typing: Option<ExtensionToggle>,

    #[serde(default)]
    pub receipts: Option<ExtensionToggle>,
}

/// Plain enable/disable extension request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtensionToggle {
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl ExtensionToggle {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }
}

/// To-device extension request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToDeviceRequest {
    #[serde(default)]
    pub enabled: Option<bool>,

    /// Maximum messages per response
    #[serde(default)]
    pub limit: Option<u64>,

    /// Ack watermark from the previous response's next_batch
    #[serde(default)]
    pub since: Option<String>,
}

impl ToDeviceRequest {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }
}

/// One sliding sync response body
#[derive(Debug, Clone, Default, Serialize)]
pub struct SlidingSyncResponse {
    /// Opaque position superseding the request's pos
    pub pos: String,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub lists: BTreeMap<String, ListResponse>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub rooms: BTreeMap<String, RoomResponse>,

    #[serde(skip_serializing_if = "ExtensionsResponse::is_empty")]
    pub extensions: ExtensionsResponse,
}

impl SlidingSyncResponse {
    /// Whether this response carries anything worth ending a long poll for
    pub fn has_data(&self) -> bool {
        !self.rooms.is_empty()
            || !self.extensions.is_empty()
            || self.lists.values().any(|l| !l.ops.is_empty())
    }
}

/// One list in a response
#[derive(Debug, Clone, Default, Serialize)]
pub struct ListResponse {
    /// Total rooms matching the list's filters
    pub count: u64,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ops: Vec<ListOp>,
}

/// Operations a client applies to its local copy of a list
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op")]
pub enum ListOp {
    #[serde(rename = "SYNC")]
    Sync {
        range: (u64, u64),
        room_ids: Vec<String>,
    },

    #[serde(rename = "INSERT")]
    Insert { index: u64, room_id: String },

    #[serde(rename = "DELETE")]
    Delete { index: u64 },

    #[serde(rename = "INVALIDATE")]
    Invalidate { range: (u64, u64) },
}

/// One room in a response; only changed fields are present
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoomResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// True when this is the first payload for the room on this conn and
    /// the client must replace any local state
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub initial: bool,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required_state: Vec<Value>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub timeline: Vec<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_batch: Option<String>,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub limited: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub joined_count: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub invited_count: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_count: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub highlight_count: Option<i64>,

    /// Stripped state events for rooms the user is invited to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invite_state: Option<Vec<Value>>,
}

impl RoomResponse {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && !self.initial
            && self.required_state.is_empty()
            && self.timeline.is_empty()
            && self.joined_count.is_none()
            && self.invited_count.is_none()
            && self.notification_count.is_none()
            && self.highlight_count.is_none()
            && self.invite_state.is_none()
    }
}

/// Extension payloads in a response
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtensionsResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_device: Option<ToDeviceResponse>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub e2ee: Option<E2eeResponse>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_data: Option<AccountDataResponse>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub typing: Option<TypingResponse>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipts: Option<ReceiptsResponse>,
}

impl ExtensionsResponse {
    pub fn is_empty(&self) -> bool {
        self.to_device.is_none()
            && self.e2ee.is_none()
            && self.account_data.is_none()
            && self.typing.is_none()
            && self.receipts.is_none()
    }
}

/// To-device extension response
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToDeviceResponse {
    /// Ack token for the next request's since
    pub next_batch: String,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<Value>,
}

/// E2EE extension response
#[derive(Debug, Clone, Default, Serialize)]
pub struct E2eeResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_lists: Option<DeviceListsDelta>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_one_time_keys_count: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceListsDelta {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changed: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub left: Vec<String>,
}

/// Account data extension response
#[derive(Debug, Clone, Default, Serialize)]
pub struct AccountDataResponse {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub global: Vec<Value>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub rooms: BTreeMap<String, Vec<Value>>,
}

/// Typing extension response: room id -> m.typing EDU
#[derive(Debug, Clone, Default, Serialize)]
pub struct TypingResponse {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub rooms: BTreeMap<String, Value>,
}

/// Receipts extension response: room id -> m.receipt EDU
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiptsResponse {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub rooms: BTreeMap<String, Value>,
}

/// The Matrix error body for the client wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub errcode: String,
    pub error: String,
}
