// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for the quota sync engine.
//!
//! Remote failures are split into retryable ([`SyncError::Network`],
//! [`SyncError::RateLimited`]) and fatal ([`SyncError::Auth`],
//! [`SyncError::Validation`]) variants. See
//! [`crate::resilience::retry::ErrorClass`] for how they drive retries.

use std::time::Duration;
use thiserror::Error;

use crate::action::ActionId;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Transient transport failure or a 5xx-class answer from the remote store.
    #[error("network error{}: {message}", .status.as_ref().map(|s| format!(" ({s})")).unwrap_or_default())]
    Network {
        status: Option<u16>,
        message: String,
    },

    /// The remote store asked us to slow down.
    #[error("rate limited by remote store (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// The request (or one action in it) is malformed or not allowed.
    #[error("validation failed{}: {reason}", .action_id.as_ref().map(|id| format!(" for action {id}")).unwrap_or_default())]
    Validation {
        action_id: Option<ActionId>,
        reason: String,
    },

    /// Session is no longer valid; the caller has to re-authenticate.
    #[error("authentication failed: {message}")]
    Auth { message: String },

    /// Local state failed integrity checks.
    #[error("corrupt local state in {record}: {details}")]
    CorruptState { record: String, details: String },

    /// Local state store could not be read or written.
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// Stopped by suspend or shutdown before it could finish.
    #[error("{operation} cancelled after {attempts} attempts")]
    Cancelled { operation: String, attempts: u32 },
}

impl SyncError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            status: None,
            message: message.into(),
        }
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::Network {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn corrupt(record: impl Into<String>, details: impl Into<String>) -> Self {
        Self::CorruptState {
            record: record.into(),
            details: details.into(),
        }
    }

    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::RateLimited { .. } => "rate_limited",
            Self::Validation { .. } => "validation",
            Self::Auth { .. } => "auth",
            Self::CorruptState { .. } => "corrupt_state",
            Self::Persistence(_) => "persistence",
            Self::Config(_) => "config",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::corrupt("state blob", err.to_string())
    }
}
