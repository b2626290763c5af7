//! Remote contract for session upload.
//!
//! The remote is an idempotent upsert keyed by the client session id
//! (`PUT /sessions/{clientSessionId}`): repeating a put with the same content
//! returns the same remote id and never creates a second record.

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::accumulator::StatisticsSnapshot;
use crate::error::RemoteError;
use crate::session::Session;
use crate::{ActivityKind, TrackPoint};

/// Full session body sent to (and returned by) the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPayload {
    pub client_session_id: String,
    pub activity: ActivityKind,
    #[serde(default)]
    pub title: Option<String>,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub statistics: StatisticsSnapshot,
    pub track_points: Vec<TrackPoint>,
}

impl SessionPayload {
    pub fn from_session(session: &Session) -> Self {
        let header = &session.header;
        Self {
            client_session_id: header.id.clone(),
            activity: header.activity,
            title: header.title.clone(),
            started_at: header.started_at,
            ended_at: header.ended_at,
            statistics: header.statistics.clone(),
            track_points: session.points.clone(),
        }
    }
}

/// The remote's current version of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSession {
    pub remote_id: String,
    pub session: SessionPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PutOutcome {
    /// Persisted (or already persisted with identical content)
    Stored { remote_id: String },
    /// The id exists remotely with different content
    Conflict { remote: RemoteSession },
}

/// Backend that stores finished sessions.
pub trait RemoteStore: Send + Sync {
    fn put_session(
        &self,
        payload: &SessionPayload,
    ) -> impl Future<Output = Result<PutOutcome, RemoteError>> + Send;
}
