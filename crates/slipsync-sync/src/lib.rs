// =============================================================================
// Slipsync Matrix Sliding Sync Proxy - Sync v2 Library
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
//   The upstream-facing half of the proxy: the sync v2 HTTP client, the
//   per-device poller state machine, and the poller pool with its
//   EnsurePolling rendezvous. One cooperative task per (user, device)
//   long-polls the homeserver and feeds responses into the data receiver.
//
// =============================================================================

pub mod client;
pub mod poller;
pub mod pool;

pub use client::{
    HttpSyncClient, SyncError, SyncParams, SyncV2Client, SyncV2Response, TimelineResponse, WhoAmI,
};
pub use poller::PollDataReceiver;
pub use pool::{PollerPool, PollerPoolConfig};
