// =============================================================================
// Slipsync Matrix Sliding Sync Proxy - API Library
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
//   The client-facing half of the proxy: the in-memory room metadata
//   cache, per-connection sliding sync sessions with their opaque position
//   discipline, windowed room list projection, extensions, and the axum
//   request handler that glues token auth, EnsurePolling and the conn
//   registry together.
//
// =============================================================================

pub mod cache;
pub mod conn;
pub mod connmap;
pub mod extensions;
pub mod handler;
pub mod lists;
pub mod types;

pub use cache::{GlobalCache, RoomMetadata};
pub use connmap::{ConnKey, ConnMap};
pub use handler::{router, SyncDataHandler};
pub use types::{SlidingSyncRequest, SlidingSyncResponse};
