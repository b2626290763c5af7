//! # Session State Machine
//!
//! Drives one session through `Idle → Recording ⇄ Paused → Finished` and feeds
//! accepted fixes through the filter into the accumulator.
//!
//! Every transition and every accepted point is checkpointed to the store. A
//! failed write is reported as [`WriteStatus::Deferred`] and never rolls back
//! in-memory state; points past the flushed watermark are re-sent on the next
//! write.
//!
//! The "at most one active session" rule lives in [`ActiveSessionSlot`], an
//! explicit state-holder shared by every machine created from the same tracker.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use uuid::Uuid;

use crate::accumulator::{StatisticsSnapshot, TrackAccumulator};
use crate::clock::Clock;
use crate::config::{AccumulatorConfig, FilterConfig};
use crate::error::{RejectReason, Result, TrackerError};
use crate::filter::{FilterStats, GeoFilter};
use crate::persistence::SessionStore;
use crate::session::{Session, SessionHeader, SessionState, SyncStatus};
use crate::sync::SyncTrigger;
use crate::{ActivityKind, GeoSample, TrackPoint};

// ============================================================================
// Active Session Slot
// ============================================================================

/// Holder of the one active (recording or paused) session id.
#[derive(Debug, Clone, Default)]
pub struct ActiveSessionSlot {
    current: Arc<Mutex<Option<String>>>,
}

impl ActiveSessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<String>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the slot for `session_id`. Re-claiming by the holder is a no-op.
    pub fn claim(&self, session_id: &str) -> Result<()> {
        let mut current = self.lock();
        match current.as_deref() {
            Some(active) if active != session_id => Err(TrackerError::SessionAlreadyActive {
                active: active.to_string(),
            }),
            _ => {
                *current = Some(session_id.to_string());
                Ok(())
            }
        }
    }

    /// Release the slot if `session_id` holds it.
    pub fn release(&self, session_id: &str) -> bool {
        let mut current = self.lock();
        if current.as_deref() == Some(session_id) {
            *current = None;
            true
        } else {
            false
        }
    }

    pub fn current(&self) -> Option<String> {
        self.lock().clone()
    }
}

// ============================================================================
// Types
// ============================================================================

/// Result of the durable write that follows a transition or accepted point.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteStatus {
    Flushed,
    /// The write failed and will be retried with the next one
    Deferred(String),
}

impl WriteStatus {
    pub fn is_flushed(&self) -> bool {
        matches!(self, WriteStatus::Flushed)
    }
}

/// What happened to a pushed fix.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleOutcome {
    Accepted {
        snapshot: StatisticsSnapshot,
        write: WriteStatus,
    },
    Rejected(RejectReason),
    /// The session is not recording
    Ignored,
}

/// Shared dependencies of the machines created by one tracker.
#[derive(Clone)]
pub struct MachineContext {
    pub store: Arc<SessionStore>,
    pub clock: Arc<dyn Clock>,
    pub slot: ActiveSessionSlot,
    pub filter: FilterConfig,
    pub accumulator: AccumulatorConfig,
    pub sync_trigger: Option<SyncTrigger>,
}

// ============================================================================
// Session Machine
// ============================================================================

pub struct SessionMachine {
    id: String,
    activity: ActivityKind,
    title: Option<String>,
    state: SessionState,
    started_at: Option<i64>,
    ended_at: Option<i64>,
    filter: GeoFilter,
    accumulator: TrackAccumulator,
    /// Number of points known to be stored
    flushed_points: usize,
    last_write_error: Option<String>,
    sync_notified: bool,
    ctx: MachineContext,
}

impl SessionMachine {
    /// A new idle session with a fresh client id.
    pub fn new(ctx: MachineContext, activity: ActivityKind, title: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            activity,
            title,
            state: SessionState::Idle,
            started_at: None,
            ended_at: None,
            filter: GeoFilter::new(ctx.filter.clone()),
            accumulator: TrackAccumulator::new(ctx.accumulator.clone()),
            flushed_points: 0,
            last_write_error: None,
            sync_notified: false,
            ctx,
        }
    }

    /// Take over a session surfaced by recovery. It stays paused until resumed.
    pub fn from_recovered(ctx: MachineContext, session: Session) -> Result<Self> {
        let Session { header, points } = session;
        if header.state != SessionState::Paused {
            return Err(TrackerError::InvalidTransition {
                session_id: header.id,
                action: "resume after recovery",
                state: header.state,
            });
        }
        ctx.slot.claim(&header.id)?;

        let filter = match points.last() {
            Some(last) => GeoFilter::seeded(ctx.filter.clone(), last),
            None => GeoFilter::new(ctx.filter.clone()),
        };
        let flushed_points = points.len();
        let accumulator =
            TrackAccumulator::restore(ctx.accumulator.clone(), points, header.active_ms);

        info!(
            "[SessionMachine] Adopted recovered session {} ({} points)",
            header.id, flushed_points
        );

        Ok(Self {
            id: header.id,
            activity: header.activity,
            title: header.title,
            state: SessionState::Paused,
            started_at: header.started_at,
            ended_at: None,
            filter,
            accumulator,
            flushed_points,
            last_write_error: None,
            sync_notified: false,
            ctx,
        })
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    fn invalid(&self, action: &'static str) -> TrackerError {
        TrackerError::InvalidTransition {
            session_id: self.id.clone(),
            action,
            state: self.state,
        }
    }

    /// Idle → Recording. Fails if another session holds the active slot.
    pub fn start(&mut self) -> Result<WriteStatus> {
        if self.state != SessionState::Idle {
            return Err(self.invalid("start"));
        }
        self.ctx.slot.claim(&self.id)?;

        let now = self.ctx.clock.now_ms();
        self.started_at = Some(now);
        self.accumulator.begin_segment(now);
        self.filter.restart(now);
        self.state = SessionState::Recording;
        info!("[SessionMachine] Started {} session {}", self.activity, self.id);
        Ok(self.persist())
    }

    /// Recording → Paused. The paused interval is excluded from duration.
    pub fn pause(&mut self) -> Result<WriteStatus> {
        if self.state != SessionState::Recording {
            return Err(self.invalid("pause"));
        }
        self.accumulator.end_segment(self.ctx.clock.now_ms());
        self.state = SessionState::Paused;
        debug!("[SessionMachine] Paused {}", self.id);
        Ok(self.persist())
    }

    /// Paused → Recording. Fixes stamped before now are dropped as out of
    /// order; they were taken while paused.
    pub fn resume(&mut self) -> Result<WriteStatus> {
        if self.state != SessionState::Paused {
            return Err(self.invalid("resume"));
        }
        let now = self.ctx.clock.now_ms();
        self.accumulator.begin_segment(now);
        self.filter.restart(now);
        self.state = SessionState::Recording;
        debug!("[SessionMachine] Resumed {}", self.id);
        Ok(self.persist())
    }

    /// Recording or Paused → Finished. Freezes the track and queues it for sync.
    pub fn stop(&mut self) -> Result<WriteStatus> {
        if !self.state.is_active() {
            return Err(self.invalid("stop"));
        }
        let now = self.ctx.clock.now_ms();
        self.accumulator.end_segment(now);
        self.ended_at = Some(now);
        self.state = SessionState::Finished;
        self.ctx.slot.release(&self.id);

        let snapshot = self.accumulator.snapshot();
        info!(
            "[SessionMachine] Finished {}: {:.0}m in {:.0}s, {} points",
            self.id, snapshot.total_distance, snapshot.duration_seconds, snapshot.point_count
        );
        Ok(self.persist())
    }

    /// Abandon a non-finished session and remove its partial save.
    pub fn discard(&mut self) -> Result<WriteStatus> {
        if matches!(self.state, SessionState::Finished | SessionState::Discarded) {
            return Err(self.invalid("discard"));
        }
        let was_stored = self.state != SessionState::Idle;
        self.state = SessionState::Discarded;
        self.ctx.slot.release(&self.id);
        info!("[SessionMachine] Discarded {}", self.id);

        if was_stored {
            Ok(self.persist())
        } else {
            Ok(WriteStatus::Flushed)
        }
    }

    // ========================================================================
    // Samples
    // ========================================================================

    /// Filter and append a fix. Only a recording session takes fixes.
    pub fn push_sample(&mut self, sample: GeoSample) -> SampleOutcome {
        if self.state != SessionState::Recording {
            return SampleOutcome::Ignored;
        }

        let filtered = match self.filter.evaluate(sample) {
            Ok(filtered) => filtered,
            Err(reason) => {
                debug!(
                    "[SessionMachine] {} dropped fix at {}: {}",
                    self.id, sample.timestamp_ms, reason
                );
                return SampleOutcome::Rejected(reason);
            }
        };

        let Some(snapshot) = self.accumulator.append(filtered) else {
            return SampleOutcome::Ignored;
        };
        let write = self.persist();
        SampleOutcome::Accepted { snapshot, write }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    fn persist(&mut self) -> WriteStatus {
        let result = if self.state == SessionState::Discarded {
            self.ctx.store.delete(&self.id).map(|_| ())
        } else {
            let header = self.header();
            let pending = &self.accumulator.points()[self.flushed_points..];
            self.ctx.store.checkpoint(&header, pending, self.flushed_points)
        };

        match result {
            Ok(()) => {
                self.flushed_points = self.accumulator.points().len();
                if self.last_write_error.take().is_some() {
                    info!("[SessionMachine] Writes for {} caught up", self.id);
                }
                if self.state == SessionState::Finished && !self.sync_notified {
                    self.sync_notified = true;
                    if let Some(trigger) = &self.ctx.sync_trigger {
                        trigger.notify();
                    }
                }
                WriteStatus::Flushed
            }
            Err(e) => {
                warn!(
                    "[SessionMachine] Write for {} failed ({} unflushed points): {}",
                    self.id,
                    self.accumulator.points().len() - self.flushed_points,
                    e
                );
                let message = e.to_string();
                self.last_write_error = Some(message.clone());
                WriteStatus::Deferred(message)
            }
        }
    }

    /// Retry any deferred write. A no-op when everything is stored.
    pub fn flush(&mut self) -> WriteStatus {
        let caught_up = self.last_write_error.is_none()
            && self.flushed_points == self.accumulator.points().len();
        if self.state == SessionState::Idle || caught_up {
            return WriteStatus::Flushed;
        }
        self.persist()
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn activity(&self) -> ActivityKind {
        self.activity
    }

    /// Live statistics, with the open segment counted up to now.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        self.accumulator.snapshot_at(self.ctx.clock.now_ms())
    }

    pub fn points(&self) -> &[TrackPoint] {
        self.accumulator.points()
    }

    pub fn filter_stats(&self) -> FilterStats {
        self.filter.stats()
    }

    pub fn flushed_points(&self) -> usize {
        self.flushed_points
    }

    pub fn last_write_error(&self) -> Option<&str> {
        self.last_write_error.as_deref()
    }

    pub fn header(&self) -> SessionHeader {
        SessionHeader {
            id: self.id.clone(),
            activity: self.activity,
            title: self.title.clone(),
            state: self.state,
            started_at: self.started_at,
            ended_at: self.ended_at,
            statistics: self.accumulator.snapshot().clone(),
            active_ms: self.accumulator.closed_ms(),
            segment_started_at: self.accumulator.segment_started_at(),
            sync_status: if self.state == SessionState::Finished {
                SyncStatus::Pending
            } else {
                SyncStatus::Local
            },
        }
    }

    pub fn session(&self) -> Session {
        Session {
            header: self.header(),
            points: self.accumulator.points().to_vec(),
        }
    }
}

impl Drop for SessionMachine {
    fn drop(&mut self) {
        // The stored copy stays recoverable; only the in-process claim goes
        self.ctx.slot.release(&self.id);
    }
}

// ============================================================================
// Tests
// ============================================================================
