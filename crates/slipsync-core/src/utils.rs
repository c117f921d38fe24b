//! Utility functions for Slipsync
//!
//! Author: arkSong <arksong2018@gmail.com>
//! Date: 2025-01-20
//! Version: 0.1.0

use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::{Result, SlipsyncError};

/// Returns the current time in milliseconds since Unix epoch
///
/// High-precision timestamp generation for event ordering and token
/// last-seen tracking.
pub fn millis_since_unix_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time is valid")
        .as_millis() as u64
}

/// Run a storage operation, retrying once on a database error before
/// surfacing it.
///
/// Transient transaction aborts (serialization failures, dropped
/// connections) deserve one more attempt; every other error kind is
/// returned as-is.
pub async fn retry_once<T, F, Fut>(op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match op().await {
        Err(SlipsyncError::Database(e)) => {
            debug!("Retrying storage operation after database error: {}", e);
            op().await
        }
        other => other,
    }
}
