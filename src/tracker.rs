//! Application-facing entry point for recording.
//!
//! A `Tracker` owns the shared pieces (store, clock, active-session slot,
//! configuration) and hands out one [`SessionWorker`] per workout.

use std::sync::Arc;

use log::info;

use crate::clock::{Clock, SystemClock};
use crate::config::TrackerConfig;
use crate::error::{OptionExt, Result, TrackerError};
use crate::machine::{ActiveSessionSlot, MachineContext, SessionMachine};
use crate::persistence::SessionStore;
use crate::session::{Session, SessionHeader, SessionState};
use crate::sync::SyncTrigger;
use crate::worker::{SessionWorker, SnapshotListener};
use crate::ActivityKind;

pub struct Tracker {
    store: Arc<SessionStore>,
    clock: Arc<dyn Clock>,
    slot: ActiveSessionSlot,
    config: TrackerConfig,
    sync_trigger: Option<SyncTrigger>,
}

impl Tracker {
    pub fn new(store: Arc<SessionStore>, clock: Arc<dyn Clock>, config: TrackerConfig) -> Self {
        Self {
            store,
            clock,
            slot: ActiveSessionSlot::new(),
            config,
            sync_trigger: None,
        }
    }

    pub fn with_system_clock(store: Arc<SessionStore>, config: TrackerConfig) -> Self {
        Self::new(store, Arc::new(SystemClock), config)
    }

    /// Open the store at `db_path` after validating the configuration.
    pub fn open(db_path: &str, config: TrackerConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(SessionStore::new(db_path)?);
        Ok(Self::with_system_clock(store, config))
    }

    /// Wake the given sync engine whenever a session is finished.
    pub fn with_sync_trigger(mut self, trigger: SyncTrigger) -> Self {
        self.sync_trigger = Some(trigger);
        self
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn active_session(&self) -> Option<String> {
        self.slot.current()
    }

    fn context(&self) -> MachineContext {
        MachineContext {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            slot: self.slot.clone(),
            filter: self.config.filter.clone(),
            accumulator: self.config.accumulator.clone(),
            sync_trigger: self.sync_trigger.clone(),
        }
    }

    // ========================================================================
    // Recording
    // ========================================================================

    /// Create a session and start recording it.
    ///
    /// Fails with `SessionAlreadyActive` while any session, including one left
    /// by a previous process, is recording or paused.
    pub fn start_workout(
        &self,
        activity: ActivityKind,
        listener: Option<SnapshotListener>,
    ) -> Result<SessionWorker> {
        self.start_titled_workout(activity, None, listener)
    }

    pub fn start_titled_workout(
        &self,
        activity: ActivityKind,
        title: Option<String>,
        listener: Option<SnapshotListener>,
    ) -> Result<SessionWorker> {
        if let Some(active) = self.slot.current() {
            return Err(TrackerError::SessionAlreadyActive { active });
        }
        if let Some(active) = self.store.active_session_ids()?.into_iter().next() {
            return Err(TrackerError::SessionAlreadyActive { active });
        }

        let machine = SessionMachine::new(self.context(), activity, title);
        let worker = SessionWorker::spawn(machine, self.config.worker.queue_capacity, listener)?;
        worker.start()?;
        Ok(worker)
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Surface sessions interrupted by a previous process as paused.
    ///
    /// Call once at startup, before recording.
    pub fn recover(&self) -> Result<Vec<Session>> {
        if let Some(active) = self.slot.current() {
            return Err(TrackerError::SessionAlreadyActive { active });
        }
        let recovered = self.store.recover_interrupted()?;
        if !recovered.is_empty() {
            info!(
                "[Tracker] {} interrupted session(s) ready to resume",
                recovered.len()
            );
        }
        Ok(recovered)
    }

    /// Take over a recovered (paused) session on a new worker.
    ///
    /// The worker starts paused; call `resume()` to continue or `stop()` to
    /// finish it.
    pub fn adopt_recovered(
        &self,
        session_id: &str,
        listener: Option<SnapshotListener>,
    ) -> Result<SessionWorker> {
        let session = self.store.load_session(session_id)?.ok_or_not_found(session_id)?;
        let machine = SessionMachine::from_recovered(self.context(), session)?;
        SessionWorker::spawn(machine, self.config.worker.queue_capacity, listener)
    }

    /// Drop a recovered session without resuming it.
    pub fn discard_recovered(&self, session_id: &str) -> Result<()> {
        let header = self.store.load_header(session_id)?.ok_or_not_found(session_id)?;
        if !header.state.is_active() || self.slot.current().as_deref() == Some(session_id) {
            return Err(TrackerError::InvalidTransition {
                session_id: session_id.to_string(),
                action: "discard after recovery",
                state: header.state,
            });
        }
        self.store.delete(session_id)?;
        Ok(())
    }

    // ========================================================================
    // History
    // ========================================================================

    /// All stored sessions without track points, newest first.
    pub fn history(&self) -> Result<Vec<SessionHeader>> {
        self.store.session_summaries()
    }

    pub fn finished_sessions(&self) -> Result<Vec<SessionHeader>> {
        Ok(self
            .history()?
            .into_iter()
            .filter(|h| h.state == SessionState::Finished)
            .collect())
    }

    pub fn session(&self, session_id: &str) -> Result<Session> {
        self.store.load_session(session_id)?.ok_or_not_found(session_id)
    }
}
