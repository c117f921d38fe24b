//! Upstream sync v2 client
//!
//! Author: arkSong <arksong2018@gmail.com>
//! Date: 2025-01-20
//! Version: 0.1.0
//!
//! The trait the pollers speak, the wire types for the fields the proxy
//! consumes, and the production reqwest implementation. Errors are
//! classified so the poller can tell "re-authenticate" from "retry with
//! backoff" from "give up".

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

/// Errors from the upstream homeserver, classified by required reaction
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The access token is invalid or expired; the poller must terminate
    #[error("unauthorized")]
    Unauthorized,

    /// Retriable failure: network trouble, 5xx, rate limiting
    #[error("transient upstream error: {0}")]
    Transient(String),

    /// Non-retriable failure other than auth
    #[error("fatal upstream error: {0}")]
    Fatal(String),
}

/// Result of /account/whoami
#[derive(Debug, Clone, Deserialize)]
pub struct WhoAmI {
    /// The user the token belongs to
    pub user_id: String,

    /// The device the token belongs to
    pub device_id: String,
}

/// Parameters for one sync poll
#[derive(Debug, Clone)]
pub struct SyncParams {
    /// room.timeline.limit in the filter
    pub timeline_limit: u32,

    /// When true the filter carries room.rooms=[] so no room timelines are
    /// returned; used for the accelerated initial sync of second devices
    pub exclude_all_rooms: bool,

    /// Upstream long poll timeout in milliseconds; 0 for an initial sync
    pub timeout_ms: u64,
}

impl SyncParams {
    /// The filter JSON this poll sends upstream
    pub fn filter_json(&self) -> Value {
        if self.exclude_all_rooms {
            json!({
                "room": {
                    "rooms": [],
                    "timeline": { "limit": self.timeline_limit }
                }
            })
        } else {
            json!({
                "room": {
                    "timeline": { "limit": self.timeline_limit }
                }
            })
        }
    }
}

/// A timeline block as returned by sync v2
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimelineResponse {
    /// Events, oldest first
    #[serde(default)]
    pub events: Vec<Value>,

    /// True when upstream omitted events before this batch
    #[serde(default)]
    pub limited: bool,

    /// Token to fetch the omitted events
    #[serde(default)]
    pub prev_batch: Option<String>,
}

/// A bag of events
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventsResponse {
    #[serde(default)]
    pub events: Vec<Value>,
}

/// One joined room in a sync v2 response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinedRoomResponse {
    #[serde(default)]
    pub state: EventsResponse,

    #[serde(default)]
    pub timeline: TimelineResponse,

    #[serde(default)]
    pub ephemeral: EventsResponse,

    #[serde(default)]
    pub account_data: EventsResponse,

    #[serde(default)]
    pub unread_notifications: UnreadNotifications,
}

/// Unread counters attached to a joined room
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnreadNotifications {
    #[serde(default)]
    pub notification_count: Option<i64>,

    #[serde(default)]
    pub highlight_count: Option<i64>,
}

/// One invited room in a sync v2 response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvitedRoomResponse {
    #[serde(default)]
    pub invite_state: EventsResponse,
}

/// One left room in a sync v2 response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeftRoomResponse {
    #[serde(default)]
    pub state: EventsResponse,

    #[serde(default)]
    pub timeline: TimelineResponse,
}

/// The rooms section of a sync v2 response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomsResponse {
    #[serde(default)]
    pub join: HashMap<String, JoinedRoomResponse>,

    #[serde(default)]
    pub invite: HashMap<String, InvitedRoomResponse>,

    #[serde(default)]
    pub leave: HashMap<String, LeftRoomResponse>,
}

/// Device list deltas
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceListsResponse {
    #[serde(default)]
    pub changed: Vec<String>,

    #[serde(default)]
    pub left: Vec<String>,
}

/// The subset of a sync v2 response the proxy consumes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncV2Response {
    pub next_batch: String,

    #[serde(default)]
    pub rooms: RoomsResponse,

    #[serde(default)]
    pub to_device: EventsResponse,

    #[serde(default)]
    pub account_data: EventsResponse,

    #[serde(default)]
    pub device_lists: DeviceListsResponse,

    #[serde(default)]
    pub device_one_time_keys_count: Option<Value>,
}

/// The upstream homeserver as the pollers see it
#[async_trait]
pub trait SyncV2Client: Send + Sync + 'static {
    /// Resolve a bearer token to its (user, device)
    async fn whoami(&self, token: &str) -> Result<WhoAmI, SyncError>;

    /// One long poll of /sync
    async fn do_sync(
        &self,
        token: &str,
        since: &str,
        params: &SyncParams,
    ) -> Result<SyncV2Response, SyncError>;
}

/// Production client over reqwest
#[derive(Debug, Clone)]
pub struct HttpSyncClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpSyncClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| SyncError::Fatal(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SyncV2Client for HttpSyncClient {
    async fn whoami(&self, token: &str) -> Result<WhoAmI, SyncError> {
        let url = format!("{}/_matrix/client/r0/account/whoami", self.base_url);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;

        match resp.status().as_u16() {
            200 => resp
                .json::<WhoAmI>()
                .await
                .map_err(|e| SyncError::Fatal(format!("whoami: bad response body: {e}"))),
            401 | 403 => Err(SyncError::Unauthorized),
            code if code >= 500 => Err(SyncError::Transient(format!("whoami: HTTP {code}"))),
            code => Err(SyncError::Fatal(format!("whoami: HTTP {code}"))),
        }
    }

    async fn do_sync(
        &self,
        token: &str,
        since: &str,
        params: &SyncParams,
    ) -> Result<SyncV2Response, SyncError> {
        let url = format!("{}/_matrix/client/r0/sync", self.base_url);
        let filter = params.filter_json().to_string();
        let timeout = params.timeout_ms.to_string();
        let mut query: Vec<(&str, &str)> = vec![
            ("timeout", timeout.as_str()),
            ("filter", filter.as_str()),
            ("set_presence", "offline"),
        ];
        if !since.is_empty() {
            query.push(("since", since));
        }

        debug!("🔧 Polling upstream sync since={:?}", since);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(&query)
            .send()
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;

        match resp.status().as_u16() {
            200 => resp
                .json::<SyncV2Response>()
                .await
                .map_err(|e| SyncError::Transient(format!("sync: bad response body: {e}"))),
            401 | 403 => Err(SyncError::Unauthorized),
            429 => {
                warn!("⚠️ Upstream rate limited a poller");
                Err(SyncError::Transient("rate limited".to_string()))
            }
            code if code >= 500 => Err(SyncError::Transient(format!("sync: HTTP {code}"))),
            code => Err(SyncError::Fatal(format!("sync: HTTP {code}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accelerated_filter_shape() {
        let params = SyncParams {
            timeline_limit: 1,
            exclude_all_rooms: true,
            timeout_ms: 0,
        };
        let filter = params.filter_json();
        assert_eq!(filter["room"]["timeline"]["limit"], 1);
        assert_eq!(filter["room"]["rooms"], json!([]));
    }

    #[test]
    fn test_normal_filter_has_no_rooms_key() {
        let params = SyncParams {
            timeline_limit: 50,
            exclude_all_rooms: false,
            timeout_ms: 30_000,
        };
        let filter = params.filter_json();
        assert_eq!(filter["room"]["timeline"]["limit"], 50);
        assert!(filter["room"].get("rooms").is_none());
    }

    #[test]
    fn test_sync_response_parses_sparse_json() {
        let raw = json!({
            "next_batch": "s1",
            "rooms": {
                "join": {
                    "!a:hs": {
                        "timeline": {
                            "events": [{"event_id": "$x", "type": "m.room.message"}],
                            "limited": true,
                            "prev_batch": "pb"
                        }
                    }
                }
            }
        });
        let resp: SyncV2Response = serde_json::from_value(raw).unwrap();
        assert_eq!(resp.next_batch, "s1");
        let joined = &resp.rooms.join["!a:hs"];
        assert!(joined.timeline.limited);
        assert_eq!(joined.timeline.prev_batch.as_deref(), Some("pb"));
        assert!(joined.state.events.is_empty());
        assert!(resp.to_device.events.is_empty());
    }
}
