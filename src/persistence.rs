//! # Local Session Store
//!
//! Crash-safe SQLite persistence of sessions, track points and sync records.
//!
//! ## Layout
//!
//! 1. **sessions**: one row per session id with state, timing and the latest
//!    statistics snapshot (rewritten in place on every checkpoint, small)
//! 2. **track_points**: one row per accepted point, keyed by `(session_id, seq)`;
//!    only new points are inserted, so a checkpoint costs O(new points)
//! 3. **sync_records**: upload bookkeeping per session
//! 4. **sync_conflicts**: remote versions kept for user review, MessagePack encoded
//!
//! A checkpoint is a single transaction, so process death leaves either the
//! previous or the new checkpoint, never a half-written one.

use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{info, warn};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use crate::accumulator::{pace_seconds_per_km, StatisticsSnapshot};
use crate::error::{OptionExt, Result};
use crate::session::{Session, SessionHeader, SessionState, SyncRecord, SyncStatus};
use crate::sync::{RemoteSession, SessionPayload};
use crate::{ActivityKind, TrackPoint};

// ============================================================================
// Types
// ============================================================================

/// A preserved local copy awaiting user review after a sync conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictRecord {
    /// Id of the local copy (a finished session with `SyncStatus::Conflicted`)
    pub copy_id: String,
    /// Id of the session that now holds the remote version
    pub original_id: String,
    pub remote_id: String,
    /// Unix timestamp (ms)
    pub detected_at: i64,
}

/// Store statistics for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub session_count: u32,
    pub point_count: u32,
    pub active_count: u32,
    pub pending_sync_count: u32,
    pub failed_sync_count: u32,
    pub conflict_count: u32,
}

macro_rules! sql_text_enum {
    ($($ty:ty),* $(,)?) => {
        $(
            impl ToSql for $ty {
                fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                    Ok(ToSqlOutput::from(self.as_str()))
                }
            }

            impl FromSql for $ty {
                fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                    value
                        .as_str()?
                        .parse()
                        .map_err(|e| FromSqlError::Other(Box::new(e)))
                }
            }
        )*
    };
}

sql_text_enum!(ActivityKind, SessionState, SyncStatus);

const HEADER_SELECT: &str = "
    SELECT s.id, s.activity, s.title, s.state, s.started_at, s.ended_at,
           s.total_distance, s.duration_seconds, s.average_pace, s.current_pace,
           s.elevation_gain, s.elevation_loss, s.point_count,
           s.active_ms, s.segment_started_at, COALESCE(r.status, 'local')
    FROM sessions s
    LEFT JOIN sync_records r ON r.session_id = s.id";

const SYNC_SELECT: &str = "
    SELECT session_id, remote_id, status, attempt_count, last_attempt_at,
           next_attempt_at, last_error, uploaded_at
    FROM sync_records";

fn header_from_row(row: &Row<'_>) -> rusqlite::Result<SessionHeader> {
    Ok(SessionHeader {
        id: row.get(0)?,
        activity: row.get(1)?,
        title: row.get(2)?,
        state: row.get(3)?,
        started_at: row.get(4)?,
        ended_at: row.get(5)?,
        statistics: StatisticsSnapshot {
            total_distance: row.get(6)?,
            duration_seconds: row.get(7)?,
            average_pace: row.get(8)?,
            current_pace: row.get(9)?,
            elevation_gain: row.get(10)?,
            elevation_loss: row.get(11)?,
            point_count: row.get(12)?,
        },
        active_ms: row.get(13)?,
        segment_started_at: row.get(14)?,
        sync_status: row.get(15)?,
    })
}

fn sync_record_from_row(row: &Row<'_>) -> rusqlite::Result<SyncRecord> {
    Ok(SyncRecord {
        session_id: row.get(0)?,
        remote_id: row.get(1)?,
        status: row.get(2)?,
        attempt_count: row.get(3)?,
        last_attempt_at: row.get(4)?,
        next_attempt_at: row.get(5)?,
        last_error: row.get(6)?,
        uploaded_at: row.get(7)?,
    })
}

fn point_from_row(row: &Row<'_>) -> rusqlite::Result<TrackPoint> {
    Ok(TrackPoint {
        timestamp_ms: row.get(0)?,
        latitude: row.get(1)?,
        longitude: row.get(2)?,
        altitude: row.get(3)?,
        horizontal_accuracy: row.get(4)?,
        speed: row.get(5)?,
        cumulative_distance: row.get(6)?,
        cumulative_elevation_gain: row.get(7)?,
    })
}

fn upsert_header(tx: &Transaction<'_>, header: &SessionHeader) -> rusqlite::Result<()> {
    let stats = &header.statistics;
    tx.execute(
        "INSERT INTO sessions (id, activity, title, state, started_at, ended_at,
                               total_distance, duration_seconds, average_pace, current_pace,
                               elevation_gain, elevation_loss, point_count,
                               active_ms, segment_started_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                 strftime('%s', 'now'))
         ON CONFLICT(id) DO UPDATE SET
            activity = excluded.activity,
            title = excluded.title,
            state = excluded.state,
            started_at = excluded.started_at,
            ended_at = excluded.ended_at,
            total_distance = excluded.total_distance,
            duration_seconds = excluded.duration_seconds,
            average_pace = excluded.average_pace,
            current_pace = excluded.current_pace,
            elevation_gain = excluded.elevation_gain,
            elevation_loss = excluded.elevation_loss,
            point_count = excluded.point_count,
            active_ms = excluded.active_ms,
            segment_started_at = excluded.segment_started_at,
            updated_at = excluded.updated_at",
        params![
            header.id,
            header.activity,
            header.title,
            header.state,
            header.started_at,
            header.ended_at,
            stats.total_distance,
            stats.duration_seconds,
            stats.average_pace,
            stats.current_pace,
            stats.elevation_gain,
            stats.elevation_loss,
            stats.point_count,
            header.active_ms,
            header.segment_started_at,
        ],
    )?;
    Ok(())
}

fn insert_points(
    tx: &Transaction<'_>,
    session_id: &str,
    points: &[TrackPoint],
    first_seq: usize,
) -> rusqlite::Result<()> {
    if points.is_empty() {
        return Ok(());
    }
    let mut stmt = tx.prepare_cached(
        "INSERT OR IGNORE INTO track_points
            (session_id, seq, timestamp_ms, latitude, longitude, altitude,
             horizontal_accuracy, speed, cumulative_distance, cumulative_elevation_gain)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )?;
    for (i, p) in points.iter().enumerate() {
        stmt.execute(params![
            session_id,
            (first_seq + i) as i64,
            p.timestamp_ms,
            p.latitude,
            p.longitude,
            p.altitude,
            p.horizontal_accuracy,
            p.speed,
            p.cumulative_distance,
            p.cumulative_elevation_gain,
        ])?;
    }
    Ok(())
}

fn delete_session_rows(tx: &Transaction<'_>, session_id: &str) -> rusqlite::Result<usize> {
    tx.execute("DELETE FROM sync_conflicts WHERE copy_id = ?", params![session_id])?;
    tx.execute("DELETE FROM track_points WHERE session_id = ?", params![session_id])?;
    tx.execute("DELETE FROM sync_records WHERE session_id = ?", params![session_id])?;
    tx.execute("DELETE FROM sessions WHERE id = ?", params![session_id])
}

fn save_sync_record_tx(tx: &Connection, record: &SyncRecord) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO sync_records (session_id, remote_id, status, attempt_count,
                                   last_attempt_at, next_attempt_at, last_error, uploaded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(session_id) DO UPDATE SET
            remote_id = excluded.remote_id,
            status = excluded.status,
            attempt_count = excluded.attempt_count,
            last_attempt_at = excluded.last_attempt_at,
            next_attempt_at = excluded.next_attempt_at,
            last_error = excluded.last_error,
            uploaded_at = excluded.uploaded_at",
        params![
            record.session_id,
            record.remote_id,
            record.status,
            record.attempt_count,
            record.last_attempt_at,
            record.next_attempt_at,
            record.last_error,
            record.uploaded_at,
        ],
    )?;
    Ok(())
}

// ============================================================================
// Session Store
// ============================================================================

/// SQLite-backed store for sessions and their sync records.
///
/// All access goes through one connection behind a mutex, which gives the
/// single-writer discipline per session id for free.
pub struct SessionStore {
    db: Mutex<Connection>,
    db_path: String,
}

impl SessionStore {
    // ========================================================================
    // Initialization
    // ========================================================================

    /// Open (or create) a store at the given database path.
    pub fn new(db_path: &str) -> Result<Self> {
        let db = Connection::open(db_path)?;
        if db_path != ":memory:" {
            let mode: String =
                db.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            if !mode.eq_ignore_ascii_case("wal") {
                warn!("[SessionStore] WAL unavailable, journal mode is {}", mode);
            }
            db.pragma_update(None, "synchronous", "NORMAL")?;
        }
        db.pragma_update(None, "foreign_keys", "ON")?;
        Self::init_schema(&db)?;

        Ok(Self {
            db: Mutex::new(db),
            db_path: db_path.to_string(),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            -- One row per session, rewritten on each checkpoint
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                activity TEXT NOT NULL,
                title TEXT,
                state TEXT NOT NULL,
                started_at INTEGER,
                ended_at INTEGER,
                total_distance REAL NOT NULL DEFAULT 0,
                duration_seconds REAL NOT NULL DEFAULT 0,
                average_pace REAL,
                current_pace REAL,
                elevation_gain REAL NOT NULL DEFAULT 0,
                elevation_loss REAL NOT NULL DEFAULT 0,
                point_count INTEGER NOT NULL DEFAULT 0,
                active_ms INTEGER NOT NULL DEFAULT 0,
                segment_started_at INTEGER,
                updated_at INTEGER DEFAULT (strftime('%s', 'now'))
            );

            -- Append-only track points
            CREATE TABLE IF NOT EXISTS track_points (
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                altitude REAL,
                horizontal_accuracy REAL NOT NULL,
                speed REAL,
                cumulative_distance REAL NOT NULL,
                cumulative_elevation_gain REAL NOT NULL,
                PRIMARY KEY (session_id, seq),
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            );

            -- Upload bookkeeping
            CREATE TABLE IF NOT EXISTS sync_records (
                session_id TEXT PRIMARY KEY,
                remote_id TEXT,
                status TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                last_attempt_at INTEGER,
                next_attempt_at INTEGER,
                last_error TEXT,
                uploaded_at INTEGER,
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            );

            -- Remote versions kept after a conflict
            CREATE TABLE IF NOT EXISTS sync_conflicts (
                copy_id TEXT PRIMARY KEY,
                original_id TEXT NOT NULL,
                remote_id TEXT NOT NULL,
                remote_payload BLOB NOT NULL,
                detected_at INTEGER NOT NULL,
                FOREIGN KEY (copy_id) REFERENCES sessions(id) ON DELETE CASCADE
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_sessions_state ON sessions(state);
            CREATE INDEX IF NOT EXISTS idx_sync_records_status ON sync_records(status);
        "#,
        )
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    /// Refuse (or allow again) every write. Used for low-storage mode and to
    /// exercise write-failure handling.
    pub fn set_query_only(&self, enabled: bool) -> Result<()> {
        self.conn()
            .pragma_update(None, "query_only", if enabled { "ON" } else { "OFF" })?;
        Ok(())
    }

    // ========================================================================
    // Session Writes
    // ========================================================================

    /// Durably record the session header plus points appended since the last
    /// checkpoint. `first_seq` is the index of `new_points[0]` in the track.
    ///
    /// Re-sending points that are already stored is harmless. A finished
    /// session gets a pending sync record in the same transaction.
    pub fn checkpoint(
        &self,
        header: &SessionHeader,
        new_points: &[TrackPoint],
        first_seq: usize,
    ) -> Result<()> {
        let mut db = self.conn();
        let tx = db.transaction()?;
        upsert_header(&tx, header)?;
        insert_points(&tx, &header.id, new_points, first_seq)?;
        if header.state == SessionState::Finished {
            tx.execute(
                "INSERT OR IGNORE INTO sync_records (session_id, status) VALUES (?, ?)",
                params![header.id, SyncStatus::Pending],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete a session with its points and sync bookkeeping.
    ///
    /// Returns false if no such session was stored.
    pub fn delete(&self, session_id: &str) -> Result<bool> {
        let mut db = self.conn();
        let tx = db.transaction()?;
        let deleted = delete_session_rows(&tx, session_id)?;
        tx.commit()?;
        if deleted > 0 {
            info!("[SessionStore] Deleted session {}", session_id);
        }
        Ok(deleted > 0)
    }

    // ========================================================================
    // Session Reads
    // ========================================================================

    pub fn load_header(&self, session_id: &str) -> Result<Option<SessionHeader>> {
        let db = self.conn();
        let header = db
            .query_row(
                &format!("{} WHERE s.id = ?", HEADER_SELECT),
                params![session_id],
                header_from_row,
            )
            .optional()?;
        Ok(header)
    }

    /// Load a session with its full track.
    pub fn load_session(&self, session_id: &str) -> Result<Option<Session>> {
        let Some(header) = self.load_header(session_id)? else {
            return Ok(None);
        };
        let points = self.load_points(session_id)?;
        Ok(Some(Session { header, points }))
    }

    pub fn load_points(&self, session_id: &str) -> Result<Vec<TrackPoint>> {
        let db = self.conn();
        let mut stmt = db.prepare_cached(
            "SELECT timestamp_ms, latitude, longitude, altitude, horizontal_accuracy, speed,
                    cumulative_distance, cumulative_elevation_gain
             FROM track_points WHERE session_id = ? ORDER BY seq",
        )?;
        let points = stmt
            .query_map(params![session_id], point_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(points)
    }

    /// Number of durably stored points for a session.
    pub fn point_count(&self, session_id: &str) -> Result<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM track_points WHERE session_id = ?",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// All sessions without track points, newest first (history list).
    pub fn session_summaries(&self) -> Result<Vec<SessionHeader>> {
        self.query_headers("ORDER BY s.started_at DESC, s.id", &[])
    }

    /// Ids of sessions left recording or paused.
    pub fn active_session_ids(&self) -> Result<Vec<String>> {
        let db = self.conn();
        let mut stmt =
            db.prepare("SELECT id FROM sessions WHERE state IN ('recording', 'paused') ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// Finished sessions that are not confirmed by the remote yet (pending,
    /// uploading or failed).
    pub fn list_finished_unsynced(&self) -> Result<Vec<SessionHeader>> {
        self.query_headers(
            "WHERE s.state = 'finished'
               AND COALESCE(r.status, 'pending') IN ('pending', 'uploading', 'failed')
             ORDER BY s.ended_at, s.id",
            &[],
        )
    }

    fn query_headers(&self, tail: &str, args: &[&dyn ToSql]) -> Result<Vec<SessionHeader>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!("{} {}", HEADER_SELECT, tail))?;
        let headers = stmt
            .query_map(args, header_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(headers)
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Surface sessions interrupted by process death as resumable.
    ///
    /// Each recording or paused session becomes paused. An open recording
    /// segment is closed at the last durably stored point, so recorded
    /// distance and time are kept and nothing after the last flush is invented.
    pub fn recover_interrupted(&self) -> Result<Vec<Session>> {
        let interrupted =
            self.query_headers("WHERE s.state IN ('recording', 'paused') ORDER BY s.id", &[])?;
        if interrupted.is_empty() {
            return Ok(Vec::new());
        }

        {
            let mut db = self.conn();
            let tx = db.transaction()?;
            for header in &interrupted {
                let mut recovered = header.clone();
                if let Some(segment_start) = header.segment_started_at {
                    let last_point: Option<i64> = tx.query_row(
                        "SELECT MAX(timestamp_ms) FROM track_points WHERE session_id = ?",
                        params![header.id],
                        |row| row.get(0),
                    )?;
                    let segment_end = last_point.unwrap_or(segment_start);
                    recovered.active_ms += (segment_end - segment_start).max(0);
                }
                recovered.state = SessionState::Paused;
                recovered.segment_started_at = None;
                recovered.statistics.duration_seconds = recovered.active_ms as f64 / 1000.0;
                recovered.statistics.average_pace = pace_seconds_per_km(
                    recovered.statistics.duration_seconds,
                    recovered.statistics.total_distance,
                );
                upsert_header(&tx, &recovered)?;
            }
            tx.commit()?;
        }

        let mut sessions = Vec::with_capacity(interrupted.len());
        for header in &interrupted {
            let session = self.load_session(&header.id)?.ok_or_not_found(&header.id)?;
            info!(
                "[SessionStore] Recovered interrupted session {} ({} points, {:.0}m)",
                session.id(),
                session.points.len(),
                session.header.statistics.total_distance
            );
            sessions.push(session);
        }
        Ok(sessions)
    }

    // ========================================================================
    // Sync Records
    // ========================================================================

    pub fn sync_record(&self, session_id: &str) -> Result<Option<SyncRecord>> {
        let record = self
            .conn()
            .query_row(
                &format!("{} WHERE session_id = ?", SYNC_SELECT),
                params![session_id],
                sync_record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn save_sync_record(&self, record: &SyncRecord) -> Result<()> {
        save_sync_record_tx(&self.conn(), record)?;
        Ok(())
    }

    /// Put a session (back) in the upload queue, due immediately.
    ///
    /// Uploaded sessions are left alone. Returns whether anything changed.
    pub fn mark_pending(&self, session_id: &str) -> Result<bool> {
        let changed = self.conn().execute(
            "INSERT INTO sync_records (session_id, status) VALUES (?1, 'pending')
             ON CONFLICT(session_id) DO UPDATE SET
                status = 'pending',
                next_attempt_at = NULL,
                last_error = NULL
             WHERE sync_records.status != 'uploaded'",
            params![session_id],
        )?;
        Ok(changed > 0)
    }

    /// Records due for an automatic attempt at `now_ms`, oldest schedule first.
    pub fn due_sync_records(&self, now_ms: i64) -> Result<Vec<SyncRecord>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!(
            "{} WHERE status IN ('pending', 'uploading')
                AND (next_attempt_at IS NULL OR next_attempt_at <= ?)
              ORDER BY COALESCE(next_attempt_at, 0), session_id",
            SYNC_SELECT
        ))?;
        let records = stmt
            .query_map(params![now_ms], sync_record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Earliest scheduled attempt among queued records (0 if one is due now).
    pub fn earliest_scheduled_attempt(&self) -> Result<Option<i64>> {
        let at: Option<i64> = self.conn().query_row(
            "SELECT MIN(COALESCE(next_attempt_at, 0)) FROM sync_records
             WHERE status IN ('pending', 'uploading')",
            [],
            |row| row.get(0),
        )?;
        Ok(at)
    }

    /// Clear every pending record's schedule (connectivity is back).
    pub fn make_pending_due(&self) -> Result<usize> {
        let changed = self.conn().execute(
            "UPDATE sync_records SET next_attempt_at = NULL
             WHERE status = 'pending' AND next_attempt_at IS NOT NULL",
            [],
        )?;
        Ok(changed)
    }

    /// Delete uploaded sessions whose upload is older than `cutoff_ms`.
    pub fn purge_uploaded(&self, cutoff_ms: i64) -> Result<u32> {
        let mut db = self.conn();
        let tx = db.transaction()?;
        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT r.session_id FROM sync_records r
                 JOIN sessions s ON s.id = r.session_id
                 WHERE r.status = 'uploaded' AND r.uploaded_at < ? AND s.state = 'finished'",
            )?;
            let ids = stmt
                .query_map(params![cutoff_ms], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            ids
        };
        for id in &ids {
            delete_session_rows(&tx, id)?;
        }
        tx.commit()?;

        if !ids.is_empty() {
            info!("[SessionStore] Purged {} uploaded sessions", ids.len());
        }
        Ok(ids.len() as u32)
    }

    // ========================================================================
    // Conflicts
    // ========================================================================

    /// Apply the conflict policy atomically.
    ///
    /// - the local content is kept under `copy_id` with `SyncStatus::Conflicted`
    /// - the original id takes the remote version and is marked uploaded
    /// - the remote payload is recorded for review
    pub fn record_conflict(
        &self,
        local: &Session,
        copy_id: &str,
        remote: &RemoteSession,
        now_ms: i64,
    ) -> Result<()> {
        let remote_blob = rmp_serde::to_vec_named(&remote.session)?;

        let mut db = self.conn();
        let tx = db.transaction()?;

        let mut copy_header = local.header.clone();
        copy_header.id = copy_id.to_string();
        copy_header.state = SessionState::Finished;
        upsert_header(&tx, &copy_header)?;
        insert_points(&tx, copy_id, &local.points, 0)?;
        save_sync_record_tx(
            &tx,
            &SyncRecord {
                status: SyncStatus::Conflicted,
                ..SyncRecord::pending(copy_id)
            },
        )?;

        let payload = &remote.session;
        let original = SessionHeader {
            id: local.header.id.clone(),
            activity: payload.activity,
            title: payload.title.clone(),
            state: SessionState::Finished,
            started_at: payload.started_at,
            ended_at: payload.ended_at,
            statistics: StatisticsSnapshot {
                point_count: payload.track_points.len() as u32,
                ..payload.statistics.clone()
            },
            active_ms: (payload.statistics.duration_seconds * 1000.0).round() as i64,
            segment_started_at: None,
            sync_status: SyncStatus::Uploaded,
        };
        upsert_header(&tx, &original)?;
        tx.execute(
            "DELETE FROM track_points WHERE session_id = ?",
            params![original.id],
        )?;
        insert_points(&tx, &original.id, &payload.track_points, 0)?;

        let previous_attempts: u32 = tx
            .query_row(
                "SELECT attempt_count FROM sync_records WHERE session_id = ?",
                params![original.id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        save_sync_record_tx(
            &tx,
            &SyncRecord {
                session_id: original.id.clone(),
                remote_id: Some(remote.remote_id.clone()),
                status: SyncStatus::Uploaded,
                attempt_count: previous_attempts,
                last_attempt_at: Some(now_ms),
                next_attempt_at: None,
                last_error: None,
                uploaded_at: Some(now_ms),
            },
        )?;

        tx.execute(
            "INSERT OR REPLACE INTO sync_conflicts
                (copy_id, original_id, remote_id, remote_payload, detected_at)
             VALUES (?, ?, ?, ?, ?)",
            params![copy_id, original.id, remote.remote_id, remote_blob, now_ms],
        )?;
        tx.commit()?;

        info!(
            "[SessionStore] Conflict on {}: remote version kept, local copy saved as {}",
            original.id, copy_id
        );
        Ok(())
    }

    pub fn conflicts(&self) -> Result<Vec<ConflictRecord>> {
        let db = self.conn();
        let mut stmt = db.prepare(
            "SELECT copy_id, original_id, remote_id, detected_at
             FROM sync_conflicts ORDER BY detected_at, copy_id",
        )?;
        let conflicts = stmt
            .query_map([], |row| {
                Ok(ConflictRecord {
                    copy_id: row.get(0)?,
                    original_id: row.get(1)?,
                    remote_id: row.get(2)?,
                    detected_at: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(conflicts)
    }

    pub fn conflict(&self, copy_id: &str) -> Result<Option<ConflictRecord>> {
        Ok(self.conflicts()?.into_iter().find(|c| c.copy_id == copy_id))
    }

    /// The remote version recorded when the conflict was detected.
    pub fn conflict_remote_version(&self, copy_id: &str) -> Result<Option<SessionPayload>> {
        let blob: Option<Vec<u8>> = self
            .conn()
            .query_row(
                "SELECT remote_payload FROM sync_conflicts WHERE copy_id = ?",
                params![copy_id],
                |row| row.get(0),
            )
            .optional()?;
        match blob {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Forget a conflict record (the copy itself is untouched).
    pub fn remove_conflict(&self, copy_id: &str) -> Result<bool> {
        let removed = self
            .conn()
            .execute("DELETE FROM sync_conflicts WHERE copy_id = ?", params![copy_id])?;
        Ok(removed > 0)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> Result<StoreStats> {
        let db = self.conn();
        let count = |sql: &str| -> rusqlite::Result<u32> { db.query_row(sql, [], |row| row.get(0)) };
        Ok(StoreStats {
            session_count: count("SELECT COUNT(*) FROM sessions")?,
            point_count: count("SELECT COUNT(*) FROM track_points")?,
            active_count: count(
                "SELECT COUNT(*) FROM sessions WHERE state IN ('recording', 'paused')",
            )?,
            pending_sync_count: count(
                "SELECT COUNT(*) FROM sync_records WHERE status IN ('pending', 'uploading')",
            )?,
            failed_sync_count: count("SELECT COUNT(*) FROM sync_records WHERE status = 'failed'")?,
            conflict_count: count("SELECT COUNT(*) FROM sync_conflicts")?,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
