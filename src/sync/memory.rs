//! In-process remote with upsert semantics and scripted failures.
//!
//! Useful for offline demos and for exercising retry behaviour: queued
//! failures are consumed one per `put_session` call, in order.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::RemoteError;
use crate::sync::remote::{PutOutcome, RemoteSession, RemoteStore, SessionPayload};

enum Scripted {
    /// Fail before storing anything
    Fail(RemoteError),
    /// Store the session, then fail as if the response was lost
    LoseResponse(RemoteError),
}

#[derive(Default)]
struct State {
    records: HashMap<String, RemoteSession>,
    script: VecDeque<Scripted>,
    put_calls: u32,
    next_id: u64,
    in_flight: HashMap<String, u32>,
    max_in_flight_per_id: u32,
}

#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<State>,
    latency: Option<Duration>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every put, so overlapping attempts can be observed.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_failure(&self, error: RemoteError) {
        self.state().script.push_back(Scripted::Fail(error));
    }

    pub fn push_lost_response(&self, error: RemoteError) {
        self.state().script.push_back(Scripted::LoseResponse(error));
    }

    /// Seed a version as if written by another device.
    pub fn insert_remote(&self, payload: SessionPayload) -> String {
        let mut state = self.state();
        let remote_id = Self::assign_id(&mut state);
        state.records.insert(
            payload.client_session_id.clone(),
            RemoteSession {
                remote_id: remote_id.clone(),
                session: payload,
            },
        );
        remote_id
    }

    pub fn record(&self, client_session_id: &str) -> Option<RemoteSession> {
        self.state().records.get(client_session_id).cloned()
    }

    pub fn record_count(&self) -> usize {
        self.state().records.len()
    }

    pub fn put_calls(&self) -> u32 {
        self.state().put_calls
    }

    /// Highest number of overlapping puts seen for any single id.
    pub fn max_in_flight_per_id(&self) -> u32 {
        self.state().max_in_flight_per_id
    }

    fn assign_id(state: &mut State) -> String {
        state.next_id += 1;
        format!("rem-{}", state.next_id)
    }

    fn upsert(state: &mut State, payload: &SessionPayload) -> PutOutcome {
        if let Some(existing) = state.records.get(&payload.client_session_id) {
            return if existing.session == *payload {
                PutOutcome::Stored {
                    remote_id: existing.remote_id.clone(),
                }
            } else {
                PutOutcome::Conflict {
                    remote: existing.clone(),
                }
            };
        }
        let remote_id = Self::assign_id(state);
        state.records.insert(
            payload.client_session_id.clone(),
            RemoteSession {
                remote_id: remote_id.clone(),
                session: payload.clone(),
            },
        );
        PutOutcome::Stored { remote_id }
    }

    fn begin(&self, id: &str) {
        let mut state = self.state();
        state.put_calls += 1;
        let count = state.in_flight.entry(id.to_string()).or_insert(0);
        *count += 1;
        let count = *count;
        state.max_in_flight_per_id = state.max_in_flight_per_id.max(count);
    }

    fn finish(&self, payload: &SessionPayload) -> Result<PutOutcome, RemoteError> {
        let mut state = self.state();
        if let Some(count) = state.in_flight.get_mut(&payload.client_session_id) {
            *count = count.saturating_sub(1);
        }
        match state.script.pop_front() {
            Some(Scripted::Fail(error)) => Err(error),
            Some(Scripted::LoseResponse(error)) => {
                Self::upsert(&mut state, payload);
                Err(error)
            }
            None => Ok(Self::upsert(&mut state, payload)),
        }
    }
}

impl RemoteStore for MemoryRemote {
    async fn put_session(&self, payload: &SessionPayload) -> Result<PutOutcome, RemoteError> {
        self.begin(&payload.client_session_id);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.finish(payload)
    }
}
