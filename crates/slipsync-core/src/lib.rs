// =============================================================================
// Slipsync Matrix Sliding Sync Proxy - Core Library
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
//   Shared foundation for the Slipsync sliding sync proxy: the error type
//   used across all crates, configuration structures, and common value
//   types. Every other crate in the workspace depends on this one.
//
// Architecture:
//   • Async/await native implementation
//   • Structured logging with tracing
//   • Error handling with thiserror
//   • Configuration via TOML + environment variables
//
// References:
//   • Matrix.org specification: https://matrix.org/
//   • MSC3575 sliding sync: https://github.com/matrix-org/matrix-spec-proposals/pull/3575
//
// =============================================================================

pub mod config;
pub mod error;
pub mod types;
pub mod utils;

pub use config::Config;
pub use error::{Result, SlipsyncError};
pub use types::{DeviceKey, Nid, SnapshotId};
