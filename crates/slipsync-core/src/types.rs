//! Shared value types for Slipsync
//!
//! Small types that cross crate boundaries: the global event stream
//! position, snapshot identifiers, and the (user, device) key that
//! identifies a poller.

use ruma::{OwnedDeviceId, OwnedUserId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric id assigned to every event, monotonically increasing across the
/// whole store. Serves as the global stream position.
pub type Nid = i64;

/// Identifier of an immutable room state snapshot.
pub type SnapshotId = i64;

/// The (user, device) pair a poller acts on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceKey {
    /// Matrix user id
    pub user_id: OwnedUserId,

    /// Device id of that user
    pub device_id: OwnedDeviceId,
}

impl DeviceKey {
    pub fn new(user_id: OwnedUserId, device_id: OwnedDeviceId) -> Self {
        Self { user_id, device_id }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.device_id)
    }
}
