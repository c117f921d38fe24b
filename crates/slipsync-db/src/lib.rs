// =============================================================================
// Slipsync Matrix Sliding Sync Proxy - Database Library
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
//   PostgreSQL persistence for the sliding sync proxy. This crate owns the
//   append-only event store, the immutable room state snapshots, and the
//   accumulator that turns upstream sync v2 responses into snapshot chains.
//   All room mutations are serialized through per-room row locks so the
//   snapshot sequence of a room is totally ordered under concurrent writers.
//
// Features:
//   • Append-only events table with monotonic NID assignment
//   • Content-addressed state snapshots (membership / other NID arrays)
//   • Transactional accumulator with gap detection
//   • Device since-token and bearer-token storage
//   • To-device, account data, invite, typing and receipt stores
//
// Architecture:
//   • sqlx with the PostgreSQL driver, no compile-time query checking
//   • Structured logging with tracing
//   • Error handling with thiserror via slipsync-core
//
// =============================================================================

pub mod accumulator;
pub mod account_data;
pub mod device_data;
pub mod devices;
pub mod events;
pub mod invites;
pub mod migrations;
pub mod models;
pub mod pool;
pub mod receipts;
pub mod rooms;
pub mod snapshots;
pub mod storage;
pub mod to_device;
pub mod tokens;
pub mod typing;
pub mod unread;

pub use accumulator::{AccumulateResult, Accumulator, InitialiseResult, TimelineInput};
pub use models::{Event, EventToInsert, RoomRow, SnapshotRow, StrippedEvent, TokenRow};
pub use pool::{create_pool, DatabasePool};
pub use storage::{GlobalSnapshot, RoomSnapshotInfo, Storage};
