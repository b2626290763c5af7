//! Dedicated sequential worker per active session.
//!
//! The filter → accumulator → machine → store pipeline of one session runs on
//! its own thread, fed through a bounded queue. Fixes and control calls share
//! that queue, so `pause`/`resume`/`stop` only run after every fix queued
//! before them has been appended.

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};

use crate::accumulator::StatisticsSnapshot;
use crate::error::{Result, TrackerError};
use crate::machine::{SampleOutcome, SessionMachine, WriteStatus};
use crate::session::{Session, SessionState};
use crate::GeoSample;

/// Callback fired on the worker thread after every accepted point.
pub type SnapshotListener = Arc<dyn Fn(&StatisticsSnapshot) + Send + Sync>;

/// Last published view of a session, readable from any thread.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveStatus {
    pub session_id: String,
    pub state: SessionState,
    pub snapshot: StatisticsSnapshot,
    pub accepted_samples: u64,
    pub rejected_samples: u64,
    /// Set while a durable write is failing
    pub persistence_warning: Option<String>,
}

type Reply<T> = mpsc::Sender<T>;

enum Command {
    Sample(GeoSample, Option<Reply<SampleOutcome>>),
    Start(Reply<Result<WriteStatus>>),
    Pause(Reply<Result<WriteStatus>>),
    Resume(Reply<Result<WriteStatus>>),
    Stop(Reply<Result<Session>>),
    Discard(Reply<Result<WriteStatus>>),
    Flush(Reply<WriteStatus>),
    Shutdown,
}

/// Push-side handle for the platform location callback.
#[derive(Clone)]
pub struct SampleSink {
    session_id: String,
    tx: SyncSender<Command>,
}

impl SampleSink {
    /// Queue a fix, blocking while the queue is full.
    pub fn push(&self, sample: GeoSample) -> Result<()> {
        self.tx
            .send(Command::Sample(sample, None))
            .map_err(|_| TrackerError::WorkerStopped(self.session_id.clone()))
    }

    /// Queue a fix without blocking. Returns false if it was dropped.
    pub fn offer(&self, sample: GeoSample) -> bool {
        match self.tx.try_send(Command::Sample(sample, None)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "[SessionWorker] Queue full for {}, dropped fix at {}",
                    self.session_id, sample.timestamp_ms
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Owner of the worker thread of one session.
#[derive(Debug)]
pub struct SessionWorker {
    session_id: String,
    tx: SyncSender<Command>,
    live: Arc<RwLock<LiveStatus>>,
    handle: Option<JoinHandle<()>>,
}

impl SessionWorker {
    /// Move the machine onto its own thread.
    pub fn spawn(
        machine: SessionMachine,
        queue_capacity: usize,
        listener: Option<SnapshotListener>,
    ) -> Result<Self> {
        let session_id = machine.id().to_string();
        let live = Arc::new(RwLock::new(LiveStatus {
            session_id: session_id.clone(),
            state: machine.state(),
            snapshot: machine.snapshot(),
            accepted_samples: 0,
            rejected_samples: 0,
            persistence_warning: None,
        }));
        let (tx, rx) = mpsc::sync_channel(queue_capacity.max(1));

        let thread_live = Arc::clone(&live);
        let name: String = format!("session-{}", session_id.chars().take(8).collect::<String>());
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || run(machine, rx, thread_live, listener))
            .map_err(TrackerError::Spawn)?;

        Ok(Self {
            session_id,
            tx,
            live,
            handle: Some(handle),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn sink(&self) -> SampleSink {
        SampleSink {
            session_id: self.session_id.clone(),
            tx: self.tx.clone(),
        }
    }

    fn stopped(&self) -> TrackerError {
        TrackerError::WorkerStopped(self.session_id.clone())
    }

    fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx.send(make(reply_tx)).map_err(|_| self.stopped())?;
        reply_rx.recv().map_err(|_| self.stopped())
    }

    /// Queue a fix without waiting for it to be processed.
    pub fn push_sample(&self, sample: GeoSample) -> Result<()> {
        self.tx
            .send(Command::Sample(sample, None))
            .map_err(|_| self.stopped())
    }

    /// Queue a fix and wait for its outcome.
    pub fn record_sample(&self, sample: GeoSample) -> Result<SampleOutcome> {
        self.request(|reply| Command::Sample(sample, Some(reply)))
    }

    pub fn start(&self) -> Result<WriteStatus> {
        self.request(Command::Start)?
    }

    pub fn pause(&self) -> Result<WriteStatus> {
        self.request(Command::Pause)?
    }

    pub fn resume(&self) -> Result<WriteStatus> {
        self.request(Command::Resume)?
    }

    /// Finish the session and return its frozen record.
    pub fn stop(&self) -> Result<Session> {
        self.request(Command::Stop)?
    }

    pub fn discard(&self) -> Result<WriteStatus> {
        self.request(Command::Discard)?
    }

    /// Wait for queued fixes and retry any deferred write.
    pub fn flush(&self) -> Result<WriteStatus> {
        self.request(Command::Flush)
    }

    pub fn live(&self) -> LiveStatus {
        self.live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drain the queue, finish in-flight writes and join the thread.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.tx.send(Command::Shutdown);
            if handle.join().is_err() {
                warn!("[SessionWorker] Worker for {} panicked", self.session_id);
            }
        }
    }
}

impl Drop for SessionWorker {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

fn publish(live: &RwLock<LiveStatus>, machine: &SessionMachine, outcome: Option<&SampleOutcome>) {
    let mut status = live.write().unwrap_or_else(PoisonError::into_inner);
    status.state = machine.state();
    status.snapshot = machine.snapshot();
    status.persistence_warning = machine.last_write_error().map(str::to_string);
    match outcome {
        Some(SampleOutcome::Accepted { .. }) => status.accepted_samples += 1,
        Some(SampleOutcome::Rejected(_)) => status.rejected_samples += 1,
        _ => {}
    }
}

fn run(
    mut machine: SessionMachine,
    rx: Receiver<Command>,
    live: Arc<RwLock<LiveStatus>>,
    listener: Option<SnapshotListener>,
) {
    debug!("[SessionWorker] Worker for {} running", machine.id());

    while let Ok(command) = rx.recv() {
        match command {
            Command::Sample(sample, reply) => {
                let outcome = machine.push_sample(sample);
                publish(&live, &machine, Some(&outcome));
                if let (SampleOutcome::Accepted { snapshot, .. }, Some(listener)) =
                    (&outcome, &listener)
                {
                    listener(snapshot);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            Command::Start(reply) => {
                let result = machine.start();
                publish(&live, &machine, None);
                let _ = reply.send(result);
            }
            Command::Pause(reply) => {
                let result = machine.pause();
                publish(&live, &machine, None);
                let _ = reply.send(result);
            }
            Command::Resume(reply) => {
                let result = machine.resume();
                publish(&live, &machine, None);
                let _ = reply.send(result);
            }
            Command::Stop(reply) => {
                let result = machine.stop().map(|_| machine.session());
                publish(&live, &machine, None);
                let _ = reply.send(result);
            }
            Command::Discard(reply) => {
                let result = machine.discard();
                publish(&live, &machine, None);
                let _ = reply.send(result);
            }
            Command::Flush(reply) => {
                let status = machine.flush();
                publish(&live, &machine, None);
                let _ = reply.send(status);
            }
            Command::Shutdown => break,
        }
    }

    if let WriteStatus::Deferred(e) = machine.flush() {
        warn!(
            "[SessionWorker] {} shut down with unflushed writes: {}",
            machine.id(),
            e
        );
    }
    info!("[SessionWorker] Worker for {} stopped", machine.id());
}

// ============================================================================
// Tests
// ============================================================================
