//! Error types for Slipsync
//!
//! This module defines the error types used throughout the Slipsync system.
//! All errors are designed to be user-friendly and provide clear context
//! about what went wrong and how to fix it.

use std::io;
use thiserror::Error;

/// Slipsync error types
#[derive(Debug, Error)]
pub enum SlipsyncError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// Authentication error
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The client supplied a stale or unknown sliding sync position
    #[error("Unknown position: {0}")]
    UnknownPos(String),

    /// The access token is unknown or has expired upstream
    #[error("Unknown token")]
    UnknownToken,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for Slipsync operations
pub type Result<T> = std::result::Result<T, SlipsyncError>;

impl From<serde_json::Error> for SlipsyncError {
    fn from(err: serde_json::Error) -> Self {
        SlipsyncError::Serialization(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for SlipsyncError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        SlipsyncError::Timeout(err.to_string())
    }
}

impl SlipsyncError {
    /// The Matrix errcode this error maps to on the client wire, if any
    pub fn errcode(&self) -> Option<&'static str> {
        match self {
            SlipsyncError::Auth(_) | SlipsyncError::UnknownToken => Some("M_UNKNOWN_TOKEN"),
            SlipsyncError::UnknownPos(_) => Some("M_UNKNOWN_POS"),
            SlipsyncError::Validation(_) => Some("M_INVALID_PARAM"),
            _ => None,
        }
    }
}
