//! Unified error handling for the tracking and sync engine.
//!
//! Sample-level problems are not errors: they come back from the filter as a
//! [`RejectReason`] and are only logged. Everything else flows through
//! [`TrackerError`], with remote failures classified by [`RemoteError::failure_kind`].

use std::fmt;

use thiserror::Error;

use crate::session::SessionState;

/// Why the filter dropped a raw fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// Latitude/longitude not finite or out of range
    InvalidCoordinates,
    /// Horizontal accuracy worse than the configured threshold
    LowAccuracy,
    /// Implied speed from the last accepted fix exceeds human-scale motion
    ImplausibleSpeed,
    /// Timestamp not after the last accepted fix (duplicate or late delivery)
    OutOfOrder,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RejectReason::InvalidCoordinates => "invalid coordinates",
            RejectReason::LowAccuracy => "low accuracy",
            RejectReason::ImplausibleSpeed => "implausible speed",
            RejectReason::OutOfOrder => "out of order",
        };
        f.write_str(text)
    }
}

/// How the sync engine should react to a failed upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Retry automatically with backoff
    Transient,
    /// Credentials rejected; needs the user to sign in again
    Unauthorized,
    /// Server refused the payload; needs explicit user action
    Rejected,
}

/// Failure reported by a [`RemoteStore`](crate::sync::RemoteStore).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RemoteError {
    #[error("HTTP error ({status}): {message}")]
    Status { status: u16, message: String },
    #[error("Request timed out")]
    Timeout,
    #[error("Connectivity error: {0}")]
    Connectivity(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        RemoteError::Status {
            status,
            message: message.into(),
        }
    }

    /// 5xx, 408, 429, timeouts and connectivity problems are retried; 401/403
    /// need fresh credentials; any other 4xx is a permanent rejection.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            RemoteError::Status { status, .. } => match *status {
                401 | 403 => FailureKind::Unauthorized,
                408 | 429 => FailureKind::Transient,
                400..=499 => FailureKind::Rejected,
                _ => FailureKind::Transient,
            },
            RemoteError::Timeout
            | RemoteError::Connectivity(_)
            | RemoteError::InvalidResponse(_) => FailureKind::Transient,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.failure_kind() == FailureKind::Transient
    }
}

/// Unified error type for tracking and sync operations.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// Operation not allowed in the session's current state
    #[error("Session '{session_id}' cannot {action} while {state}")]
    InvalidTransition {
        session_id: String,
        action: &'static str,
        state: SessionState,
    },
    /// Another session is already recording or paused
    #[error("Session '{active}' is already active")]
    SessionAlreadyActive { active: String },
    #[error("Session '{0}' not found")]
    SessionNotFound(String),
    #[error("Persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),
    #[error("Encoding error: {0}")]
    Encoding(String),
    /// The worker thread for the session is gone
    #[error("Worker for session '{0}' has stopped")]
    WorkerStopped(String),
    #[error("Failed to spawn worker: {0}")]
    Spawn(std::io::Error),
    #[error("Configuration error: {message}")]
    Config { message: String },
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl TrackerError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        TrackerError::Config {
            message: message.into(),
        }
    }

    /// True for contract violations that should fail the call immediately.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            TrackerError::InvalidTransition { .. } | TrackerError::SessionAlreadyActive { .. }
        )
    }
}

impl From<rmp_serde::encode::Error> for TrackerError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        TrackerError::Encoding(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for TrackerError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        TrackerError::Encoding(e.to_string())
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(e: serde_json::Error) -> Self {
        TrackerError::Encoding(e.to_string())
    }
}

/// Unknown text value for a stored enum.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: '{value}'")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Result type alias for tracking and sync operations.
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Extension trait for converting Option to TrackerError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a session-not-found error.
    fn ok_or_not_found(self, session_id: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, session_id: &str) -> Result<T> {
        self.ok_or_else(|| TrackerError::SessionNotFound(session_id.to_string()))
    }
}
