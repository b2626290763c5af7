//! # Sync Engine
//!
//! Offline-first upload of finished sessions.
//!
//! - Uploads are idempotent upserts keyed by the client session id, so a retry
//!   after a lost response never creates a second remote record
//! - Transient failures (5xx, 408, 429, timeouts, connectivity) are retried with
//!   exponential backoff; the schedule is stored with each record
//! - Other 4xx and auth failures mark the record failed until `retry_failed`
//! - Conflicts keep both versions: the remote one under the original id, the
//!   local one under a `{id}-conflict-{suffix}` copy awaiting review
//! - Distinct sessions upload concurrently; attempts for one id never overlap

mod backoff;
mod memory;
mod remote;

pub use backoff::Backoff;
pub use memory::MemoryRemote;
pub use remote::{PutOutcome, RemoteSession, RemoteStore, SessionPayload};

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use tokio::sync::{watch, Notify};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::{FailureKind, OptionExt, RemoteError, Result, TrackerError};
use crate::persistence::{ConflictRecord, SessionStore};
use crate::session::{SessionState, SyncRecord, SyncStatus};

const DAY_MS: i64 = 86_400_000;

// ============================================================================
// Types
// ============================================================================

/// Wakes the engine's background loop. Cheap to clone and usable from any thread.
#[derive(Debug, Clone, Default)]
pub struct SyncTrigger {
    wake: Arc<Notify>,
}

impl SyncTrigger {
    pub fn notify(&self) {
        self.wake.notify_one();
    }
}

/// Status updates for UI badges and prompts.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StatusChanged {
        session_id: String,
        status: SyncStatus,
    },
    /// Both versions were kept; the local one lives under `copy_id`
    ConflictDetected {
        session_id: String,
        copy_id: String,
    },
    /// Credentials were rejected
    AuthRequired { session_id: String },
}

pub type SyncListener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Result of one upload attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Uploaded { remote_id: String },
    /// Transient failure; retried automatically at `next_attempt_at`
    Retrying { next_attempt_at: i64, error: String },
    /// Needs user action before another attempt
    Failed { error: String },
    Conflict { copy_id: String },
    /// Another attempt for this id is running
    AlreadyInFlight,
    /// Nothing to do (uploaded, failed, conflicted or not finished)
    Skipped,
}

/// Tally of one `drain_queue` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub uploaded: usize,
    pub retrying: usize,
    pub failed: usize,
    pub conflicts: usize,
    pub skipped: usize,
    /// Local errors (store failures) while syncing
    pub errors: usize,
}

struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    session_id: String,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, session_id: &str) -> Option<Self> {
        let mut ids = set.lock().unwrap_or_else(PoisonError::into_inner);
        if !ids.insert(session_id.to_string()) {
            return None;
        }
        Some(Self {
            set,
            session_id: session_id.to_string(),
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.session_id);
    }
}

// ============================================================================
// Sync Engine
// ============================================================================

pub struct SyncEngine<R: RemoteStore> {
    store: Arc<SessionStore>,
    remote: Arc<R>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    backoff: Backoff,
    /// Consecutive transient failures across all sessions; reset by a success
    consecutive_failures: AtomicU32,
    in_flight: Mutex<HashSet<String>>,
    trigger: SyncTrigger,
    listener: Option<SyncListener>,
}

impl<R: RemoteStore> SyncEngine<R> {
    pub fn new(
        store: Arc<SessionStore>,
        remote: Arc<R>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        let backoff = Backoff::from_config(&config);
        Self {
            store,
            remote,
            clock,
            config,
            backoff,
            consecutive_failures: AtomicU32::new(0),
            in_flight: Mutex::new(HashSet::new()),
            trigger: SyncTrigger::default(),
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: SyncListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Handle for waking the background loop (hand it to the tracker).
    pub fn trigger(&self) -> SyncTrigger {
        self.trigger.clone()
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    fn emit(&self, event: SyncEvent) {
        if let Some(listener) = &self.listener {
            listener(&event);
        }
    }

    fn emit_status(&self, session_id: &str, status: SyncStatus) {
        self.emit(SyncEvent::StatusChanged {
            session_id: session_id.to_string(),
            status,
        });
    }

    fn require_finished(&self, session_id: &str, action: &'static str) -> Result<()> {
        let header = self
            .store
            .load_header(session_id)?
            .ok_or_not_found(session_id)?;
        if header.state != SessionState::Finished {
            return Err(TrackerError::InvalidTransition {
                session_id: session_id.to_string(),
                action,
                state: header.state,
            });
        }
        Ok(())
    }

    // ========================================================================
    // Queue
    // ========================================================================

    /// Queue a finished session for upload, due immediately.
    ///
    /// Finishing a session already queues it; this is for explicit requests.
    pub fn enqueue(&self, session_id: &str) -> Result<()> {
        self.require_finished(session_id, "enqueue for sync")?;
        if self.store.mark_pending(session_id)? {
            self.emit_status(session_id, SyncStatus::Pending);
        }
        self.trigger.notify();
        Ok(())
    }

    /// Re-queue a failed session after user action. Returns false if the
    /// session was not failed.
    pub fn retry_failed(&self, session_id: &str) -> Result<bool> {
        self.require_finished(session_id, "retry sync")?;
        let record = self
            .store
            .sync_record(session_id)?
            .ok_or_not_found(session_id)?;
        if record.status != SyncStatus::Failed {
            return Ok(false);
        }
        self.store.mark_pending(session_id)?;
        info!("[SyncEngine] Re-queued failed session {}", session_id);
        self.emit_status(session_id, SyncStatus::Pending);
        self.trigger.notify();
        Ok(true)
    }

    /// Connectivity came back: make every scheduled retry due now.
    pub fn connectivity_restored(&self) -> Result<()> {
        let made_due = self.store.make_pending_due()?;
        if made_due > 0 {
            debug!("[SyncEngine] {} scheduled retries made due", made_due);
        }
        self.trigger.notify();
        Ok(())
    }

    pub fn status(&self, session_id: &str) -> Result<SyncStatus> {
        Ok(self
            .store
            .sync_record(session_id)?
            .map_or(SyncStatus::Local, |r| r.status))
    }

    // ========================================================================
    // Upload
    // ========================================================================

    /// Attempt one upload of `session_id` now, ignoring its schedule.
    pub async fn sync_session(&self, session_id: &str) -> Result<SyncOutcome> {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, session_id) else {
            debug!("[SyncEngine] {} already in flight", session_id);
            return Ok(SyncOutcome::AlreadyInFlight);
        };

        let Some(mut record) = self.store.sync_record(session_id)? else {
            return Ok(SyncOutcome::Skipped);
        };
        if !matches!(record.status, SyncStatus::Pending | SyncStatus::Uploading) {
            return Ok(SyncOutcome::Skipped);
        }
        let session = self
            .store
            .load_session(session_id)?
            .ok_or_not_found(session_id)?;
        if session.state() != SessionState::Finished {
            return Ok(SyncOutcome::Skipped);
        }
        let payload = SessionPayload::from_session(&session);

        record.status = SyncStatus::Uploading;
        record.attempt_count += 1;
        record.last_attempt_at = Some(self.clock.now_ms());
        self.store.save_sync_record(&record)?;
        self.emit_status(session_id, SyncStatus::Uploading);
        debug!(
            "[SyncEngine] Uploading {} (attempt {}, {} points)",
            session_id,
            record.attempt_count,
            payload.track_points.len()
        );

        match self.remote.put_session(&payload).await {
            Ok(PutOutcome::Stored { remote_id }) => self.record_success(record, remote_id),
            Ok(PutOutcome::Conflict { remote }) if remote.session == payload => {
                // The remote already holds exactly this content
                self.record_success(record, remote.remote_id)
            }
            Ok(PutOutcome::Conflict { remote }) => {
                self.reset_failures();
                let copy_id = conflict_copy_id(session_id);
                self.store
                    .record_conflict(&session, &copy_id, &remote, self.clock.now_ms())?;
                self.emit(SyncEvent::ConflictDetected {
                    session_id: session_id.to_string(),
                    copy_id: copy_id.clone(),
                });
                self.emit_status(session_id, SyncStatus::Uploaded);
                self.emit_status(&copy_id, SyncStatus::Conflicted);
                Ok(SyncOutcome::Conflict { copy_id })
            }
            Err(e) => self.record_failure(record, e),
        }
    }

    fn reset_failures(&self) {
        if self.consecutive_failures.swap(0, Ordering::Relaxed) > 0 {
            // Round-trip succeeded: whatever was waiting on backoff can go now
            if let Err(e) = self.store.make_pending_due() {
                warn!("[SyncEngine] Failed to reschedule retries: {}", e);
            }
        }
    }

    fn record_success(&self, mut record: SyncRecord, remote_id: String) -> Result<SyncOutcome> {
        let now = self.clock.now_ms();
        record.status = SyncStatus::Uploaded;
        record.remote_id = Some(remote_id.clone());
        record.uploaded_at = Some(now);
        record.next_attempt_at = None;
        record.last_error = None;
        self.store.save_sync_record(&record)?;
        self.reset_failures();

        info!(
            "[SyncEngine] Uploaded {} as {} after {} attempt(s)",
            record.session_id, remote_id, record.attempt_count
        );
        self.emit_status(&record.session_id, SyncStatus::Uploaded);
        Ok(SyncOutcome::Uploaded { remote_id })
    }

    fn record_failure(&self, mut record: SyncRecord, error: RemoteError) -> Result<SyncOutcome> {
        let message = error.to_string();
        record.last_error = Some(message.clone());

        match error.failure_kind() {
            FailureKind::Transient => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                let delay = self.backoff.delay_ms(failures);
                let next_attempt_at = self.clock.now_ms() + delay as i64;
                record.status = SyncStatus::Pending;
                record.next_attempt_at = Some(next_attempt_at);
                self.store.save_sync_record(&record)?;

                warn!(
                    "[SyncEngine] Upload of {} failed ({}), retry in {:?}",
                    record.session_id,
                    message,
                    Duration::from_millis(delay)
                );
                self.emit_status(&record.session_id, SyncStatus::Pending);
                Ok(SyncOutcome::Retrying {
                    next_attempt_at,
                    error: message,
                })
            }
            kind => {
                record.status = SyncStatus::Failed;
                record.next_attempt_at = None;
                self.store.save_sync_record(&record)?;

                warn!(
                    "[SyncEngine] Upload of {} rejected: {}",
                    record.session_id, message
                );
                self.emit_status(&record.session_id, SyncStatus::Failed);
                if kind == FailureKind::Unauthorized {
                    self.emit(SyncEvent::AuthRequired {
                        session_id: record.session_id.clone(),
                    });
                }
                Ok(SyncOutcome::Failed { error: message })
            }
        }
    }

    /// Attempt every due record once, up to `max_concurrency` at a time.
    pub async fn drain_queue(&self) -> Result<DrainReport> {
        let due = self.store.due_sync_records(self.clock.now_ms())?;
        let mut report = DrainReport::default();
        if due.is_empty() {
            return Ok(report);
        }

        let results: Vec<(String, Result<SyncOutcome>)> = stream::iter(due)
            .map(|record| async move {
                let outcome = self.sync_session(&record.session_id).await;
                (record.session_id, outcome)
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        for (session_id, result) in results {
            match result {
                Ok(SyncOutcome::Uploaded { .. }) => report.uploaded += 1,
                Ok(SyncOutcome::Retrying { .. }) => report.retrying += 1,
                Ok(SyncOutcome::Failed { .. }) => report.failed += 1,
                Ok(SyncOutcome::Conflict { .. }) => report.conflicts += 1,
                Ok(SyncOutcome::AlreadyInFlight | SyncOutcome::Skipped) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!("[SyncEngine] Sync of {} failed locally: {}", session_id, e);
                    report.errors += 1;
                }
            }
            report.attempted += 1;
        }

        debug!("[SyncEngine] Drain finished: {:?}", report);
        Ok(report)
    }

    /// How long the background loop may sleep before something is due.
    pub fn next_wakeup(&self) -> Result<Duration> {
        let idle = self.config.idle_poll_ms;
        let wait_ms = match self.store.earliest_scheduled_attempt()? {
            Some(at) => (at - self.clock.now_ms()).clamp(0, idle as i64) as u64,
            None => idle,
        };
        Ok(Duration::from_millis(wait_ms))
    }

    /// Background loop: drain, clean up, sleep until the next due attempt, a
    /// trigger, or shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("[SyncEngine] Background sync started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.drain_queue().await {
                warn!("[SyncEngine] Drain failed: {}", e);
            }
            if let Err(e) = self.cleanup_uploaded() {
                warn!("[SyncEngine] Cleanup failed: {}", e);
            }

            let wait = self
                .next_wakeup()
                .unwrap_or(Duration::from_millis(self.config.idle_poll_ms));
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.trigger.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("[SyncEngine] Background sync stopped");
    }

    // ========================================================================
    // Retention
    // ========================================================================

    /// Delete uploaded sessions older than the retention period.
    pub fn cleanup_uploaded(&self) -> Result<u32> {
        let retention_ms = self.config.uploaded_retention_days as i64 * DAY_MS;
        self.store.purge_uploaded(self.clock.now_ms() - retention_ms)
    }

    // ========================================================================
    // Conflict Review
    // ========================================================================

    pub fn conflicts(&self) -> Result<Vec<ConflictRecord>> {
        self.store.conflicts()
    }

    /// Keep the preserved local copy: it is uploaded as a session of its own.
    pub fn keep_local_copy(&self, copy_id: &str) -> Result<()> {
        self.store.conflict(copy_id)?.ok_or_not_found(copy_id)?;
        self.store.remove_conflict(copy_id)?;
        self.store.mark_pending(copy_id)?;
        info!("[SyncEngine] Keeping local copy {}", copy_id);
        self.emit_status(copy_id, SyncStatus::Pending);
        self.trigger.notify();
        Ok(())
    }

    /// Drop the preserved local copy, accepting the remote version.
    pub fn discard_local_copy(&self, copy_id: &str) -> Result<()> {
        self.store.conflict(copy_id)?.ok_or_not_found(copy_id)?;
        self.store.delete(copy_id)?;
        info!("[SyncEngine] Discarded local copy {}", copy_id);
        Ok(())
    }
}

fn conflict_copy_id(session_id: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-conflict-{}", session_id, &suffix[..8])
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::StatisticsSnapshot;
    use crate::clock::ManualClock;
    use crate::session::SessionHeader;
    use crate::{ActivityKind, TrackPoint};

    fn finished(store: &SessionStore, id: &str) {
        let header = SessionHeader {
            id: id.to_string(),
            activity: ActivityKind::Run,
            title: None,
            state: SessionState::Finished,
            started_at: Some(0),
            ended_at: Some(60_000),
            statistics: StatisticsSnapshot {
                total_distance: 11.1,
                point_count: 2,
                ..Default::default()
            },
            active_ms: 60_000,
            segment_started_at: None,
            sync_status: SyncStatus::Pending,
        };
        let points: Vec<TrackPoint> = (0..2)
            .map(|i| TrackPoint {
                timestamp_ms: i * 1_000,
                latitude: i as f64 * 0.0001,
                longitude: 0.0,
                altitude: None,
                horizontal_accuracy: 5.0,
                speed: None,
                cumulative_distance: i as f64 * 11.1,
                cumulative_elevation_gain: 0.0,
            })
            .collect();
        store.checkpoint(&header, &points, 0).unwrap();
    }

    fn engine() -> (SyncEngine<MemoryRemote>, Arc<SessionStore>, ManualClock) {
        let store = Arc::new(SessionStore::in_memory().unwrap());
        let clock = ManualClock::new(1_000_000);
        let engine = SyncEngine::new(
            store.clone(),
            Arc::new(MemoryRemote::new()),
            Arc::new(clock.clone()),
            SyncConfig::default(),
        );
        (engine, store, clock)
    }

    #[tokio::test]
    async fn test_upload_marks_uploaded() {
        let (engine, store, _clock) = engine();
        finished(&store, "s-1");

        let outcome = engine.sync_session("s-1").await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Uploaded { .. }));
        let record = store.sync_record("s-1").unwrap().unwrap();
        assert_eq!(record.status, SyncStatus::Uploaded);
        assert_eq!(record.attempt_count, 1);
        assert_eq!(record.remote_id.as_deref(), Some("rem-1"));

        // Uploaded records are not attempted again
        assert_eq!(engine.sync_session("s-1").await.unwrap(), SyncOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_transient_failure_schedules_retry() {
        let (engine, store, clock) = engine();
        finished(&store, "s-1");
        engine.remote().push_failure(RemoteError::status(503, "unavailable"));

        let report = engine.drain_queue().await.unwrap();
        assert_eq!(report.retrying, 1);
        let record = store.sync_record("s-1").unwrap().unwrap();
        assert_eq!(record.status, SyncStatus::Pending);
        let next = record.next_attempt_at.unwrap();
        assert!((1_001_600..=1_002_400).contains(&next), "got {}", next);

        // Not due yet
        assert_eq!(engine.drain_queue().await.unwrap(), DrainReport::default());
        clock.advance(3_000);
        assert_eq!(engine.drain_queue().await.unwrap().uploaded, 1);
        assert_eq!(engine.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_rejection_needs_explicit_retry() {
        let (engine, store, clock) = engine();
        finished(&store, "s-1");
        engine.remote().push_failure(RemoteError::status(422, "bad payload"));

        let outcome = engine.sync_session("s-1").await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Failed { .. }));
        assert_eq!(engine.status("s-1").unwrap(), SyncStatus::Failed);

        clock.advance(3_600_000);
        assert_eq!(engine.drain_queue().await.unwrap().attempted, 0);

        assert!(engine.retry_failed("s-1").unwrap());
        assert_eq!(engine.drain_queue().await.unwrap().uploaded, 1);
        assert!(!engine.retry_failed("s-1").unwrap());
    }

    #[tokio::test]
    async fn test_auth_failure_raises_event() {
        let store = Arc::new(SessionStore::in_memory().unwrap());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let engine = SyncEngine::new(
            store.clone(),
            Arc::new(MemoryRemote::new()),
            Arc::new(ManualClock::new(0)),
            SyncConfig::default(),
        )
        .with_listener(Arc::new(move |e: &SyncEvent| sink.lock().unwrap().push(e.clone())));
        finished(&store, "s-1");
        engine.remote().push_failure(RemoteError::status(401, "expired"));

        engine.sync_session("s-1").await.unwrap();
        assert_eq!(engine.status("s-1").unwrap(), SyncStatus::Failed);
        let events = events.lock().unwrap();
        assert!(events.contains(&SyncEvent::AuthRequired {
            session_id: "s-1".into()
        }));
    }

    #[tokio::test]
    async fn test_enqueue_refuses_unfinished() {
        let (engine, store, _clock) = engine();
        assert!(matches!(
            engine.enqueue("missing"),
            Err(TrackerError::SessionNotFound(_))
        ));

        finished(&store, "s-1");
        engine.enqueue("s-1").unwrap();
        assert_eq!(engine.status("s-1").unwrap(), SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_identical_remote_counts_as_confirmation() {
        let (engine, store, _clock) = engine();
        finished(&store, "s-1");
        let session = store.load_session("s-1").unwrap().unwrap();
        let remote_id = engine
            .remote()
            .insert_remote(SessionPayload::from_session(&session));

        let outcome = engine.sync_session("s-1").await.unwrap();
        assert_eq!(outcome, SyncOutcome::Uploaded { remote_id });
        assert!(store.conflicts().unwrap().is_empty());
    }

    #[test]
    fn test_conflict_copy_id_format() {
        let id = conflict_copy_id("abc");
        assert!(id.starts_with("abc-conflict-"));
        assert_eq!(id.len(), "abc-conflict-".len() + 8);
    }

    #[tokio::test]
    async fn test_cleanup_after_grace_period() {
        let (engine, store, clock) = engine();
        finished(&store, "s-1");
        engine.sync_session("s-1").await.unwrap();

        clock.advance(6 * DAY_MS);
        assert_eq!(engine.cleanup_uploaded().unwrap(), 0);
        clock.advance(2 * DAY_MS);
        assert_eq!(engine.cleanup_uploaded().unwrap(), 1);
        assert!(store.load_header("s-1").unwrap().is_none());
    }
}
