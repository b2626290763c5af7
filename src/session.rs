//! Session records shared by the state machine, the store and the sync engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::accumulator::StatisticsSnapshot;
use crate::error::ParseEnumError;
use crate::{ActivityKind, TrackPoint};

/// Lifecycle state of a recording session.
///
/// `Idle → Recording ⇄ Paused → Finished`. `Discarded` is terminal and never
/// stored: a discarded session has no local record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Recording,
    Paused,
    Finished,
    Discarded,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Recording => "recording",
            SessionState::Paused => "paused",
            SessionState::Finished => "finished",
            SessionState::Discarded => "discarded",
        }
    }

    /// Recording or paused: counts against the one-active-session limit.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Recording | SessionState::Paused)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(SessionState::Idle),
            "recording" => Ok(SessionState::Recording),
            "paused" => Ok(SessionState::Paused),
            "finished" => Ok(SessionState::Finished),
            "discarded" => Ok(SessionState::Discarded),
            other => Err(ParseEnumError::new("session state", other)),
        }
    }
}

/// Upload status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Not finished yet, nothing to upload
    #[default]
    Local,
    /// Waiting for (another) upload attempt
    Pending,
    /// An upload attempt is in flight
    Uploading,
    /// The remote confirmed persistence and assigned a remote id
    Uploaded,
    /// Rejected by the remote; needs user action
    Failed,
    /// Local copy preserved after a conflict; waiting for user review
    Conflicted,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Local => "local",
            SyncStatus::Pending => "pending",
            SyncStatus::Uploading => "uploading",
            SyncStatus::Uploaded => "uploaded",
            SyncStatus::Failed => "failed",
            SyncStatus::Conflicted => "conflicted",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(SyncStatus::Local),
            "pending" => Ok(SyncStatus::Pending),
            "uploading" => Ok(SyncStatus::Uploading),
            "uploaded" => Ok(SyncStatus::Uploaded),
            "failed" => Ok(SyncStatus::Failed),
            "conflicted" => Ok(SyncStatus::Conflicted),
            other => Err(ParseEnumError::new("sync status", other)),
        }
    }
}

/// Everything about a session except its track points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHeader {
    /// Locally generated id, stable for the lifetime of the session
    pub id: String,
    pub activity: ActivityKind,
    pub title: Option<String>,
    pub state: SessionState,
    /// Unix timestamp (ms) of `start()`
    pub started_at: Option<i64>,
    /// Unix timestamp (ms) of `stop()`
    pub ended_at: Option<i64>,
    pub statistics: StatisticsSnapshot,
    /// Active time of closed recording segments in ms
    pub active_ms: i64,
    /// Start of the open recording segment, if recording
    pub segment_started_at: Option<i64>,
    pub sync_status: SyncStatus,
}

/// A session with its full track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub header: SessionHeader,
    pub points: Vec<TrackPoint>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.header.id
    }

    pub fn state(&self) -> SessionState {
        self.header.state
    }
}

/// Upload bookkeeping for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub session_id: String,
    /// Id assigned by the server on confirmed upload
    pub remote_id: Option<String>,
    pub status: SyncStatus,
    pub attempt_count: u32,
    /// Unix timestamp (ms) of the last upload attempt
    pub last_attempt_at: Option<i64>,
    /// Earliest time (ms) for the next automatic attempt; None means now
    pub next_attempt_at: Option<i64>,
    pub last_error: Option<String>,
    /// Unix timestamp (ms) of the confirmed upload
    pub uploaded_at: Option<i64>,
}

impl SyncRecord {
    pub fn pending(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            remote_id: None,
            status: SyncStatus::Pending,
            attempt_count: 0,
            last_attempt_at: None,
            next_attempt_at: None,
            last_error: None,
            uploaded_at: None,
        }
    }

    /// Due for an automatic attempt at `now_ms`.
    pub fn is_due(&self, now_ms: i64) -> bool {
        matches!(self.status, SyncStatus::Pending | SyncStatus::Uploading)
            && self.next_attempt_at.map_or(true, |at| at <= now_ms)
    }
}
