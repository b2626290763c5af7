//! Upload queue scenarios: retries, idempotency, conflicts and concurrency.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use trackrs::{
    ActivityKind, Clock, GeoSample, ManualClock, MemoryRemote, RemoteError, SessionPayload,
    SessionStore, SyncConfig, SyncEngine, SyncEvent, SyncOutcome, SyncStatus, Tracker,
    TrackerConfig,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Harness {
    tracker: Tracker,
    engine: Arc<SyncEngine<MemoryRemote>>,
    clock: ManualClock,
    events: Arc<Mutex<Vec<SyncEvent>>>,
}

impl Harness {
    fn new() -> Self {
        Self::with_remote(MemoryRemote::new())
    }

    fn with_remote(remote: MemoryRemote) -> Self {
        init_logging();
        let clock = ManualClock::new(1_700_000_000_000);
        let store = Arc::new(SessionStore::in_memory().unwrap());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let engine = SyncEngine::new(
            store.clone(),
            Arc::new(remote),
            Arc::new(clock.clone()),
            SyncConfig::default(),
        )
        .with_listener(Arc::new(move |event: &SyncEvent| {
            sink.lock().unwrap().push(event.clone())
        }));
        let tracker = Tracker::new(store, Arc::new(clock.clone()), TrackerConfig::default())
            .with_sync_trigger(engine.trigger());
        Self {
            tracker,
            engine: Arc::new(engine),
            clock,
            events,
        }
    }

    fn remote(&self) -> &MemoryRemote {
        self.engine.remote()
    }

    fn store(&self) -> &SessionStore {
        self.tracker.store()
    }

    /// Record and finish a short run, returning its id.
    fn finished_run(&self) -> String {
        let worker = self.tracker.start_workout(ActivityKind::Run, None).unwrap();
        let start = self.clock.now_ms();
        for i in 0..10i64 {
            self.clock.set(start + i * 1_000);
            worker
                .record_sample(GeoSample::new(
                    start + i * 1_000,
                    51.5 + i as f64 * 0.00003,
                    -0.12,
                    5.0,
                ))
                .unwrap();
        }
        let session = worker.stop().unwrap();
        self.clock.advance(1_000);
        session.id().to_string()
    }
}

#[tokio::test]
async fn two_503s_then_success_uploads_once() {
    let h = Harness::new();
    let id = h.finished_run();
    h.remote().push_failure(RemoteError::status(503, "unavailable"));
    h.remote().push_failure(RemoteError::status(503, "unavailable"));

    assert_eq!(h.engine.drain_queue().await.unwrap().retrying, 1);
    h.clock.advance(3_000);
    assert_eq!(h.engine.drain_queue().await.unwrap().retrying, 1);
    h.clock.advance(10_000);
    assert_eq!(h.engine.drain_queue().await.unwrap().uploaded, 1);

    let record = h.store().sync_record(&id).unwrap().unwrap();
    assert_eq!(record.attempt_count, 3);
    assert_eq!(record.status, SyncStatus::Uploaded);
    assert!(record.remote_id.is_some());
    assert_eq!(h.remote().record_count(), 1);
    assert_eq!(h.remote().put_calls(), 3);
}

#[tokio::test]
async fn backoff_grows_between_failures() {
    let h = Harness::new();
    let id = h.finished_run();
    for _ in 0..3 {
        h.remote().push_failure(RemoteError::Timeout);
    }

    let mut delays = Vec::new();
    for _ in 0..3 {
        let now = h.clock.now_ms();
        let outcome = h.engine.sync_session(&id).await.unwrap();
        let SyncOutcome::Retrying { next_attempt_at, .. } = outcome else {
            panic!("expected retry, got {:?}", outcome);
        };
        delays.push(next_attempt_at - now);
    }
    // Base 2s, 4s, 8s with ±20% jitter
    assert!((1_600..=2_400).contains(&delays[0]), "{:?}", delays);
    assert!((3_200..=4_800).contains(&delays[1]), "{:?}", delays);
    assert!((6_400..=9_600).contains(&delays[2]), "{:?}", delays);
    assert_eq!(h.engine.consecutive_failures(), 3);
}

#[tokio::test]
async fn lost_response_retry_does_not_duplicate() {
    let h = Harness::new();
    let id = h.finished_run();
    h.remote().push_lost_response(RemoteError::Timeout);

    let outcome = h.engine.sync_session(&id).await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Retrying { .. }));
    assert_eq!(h.remote().record_count(), 1);

    h.clock.advance(5_000);
    let outcome = h.engine.sync_session(&id).await.unwrap();
    let remote_id = h.remote().record(&id).unwrap().remote_id;
    assert_eq!(outcome, SyncOutcome::Uploaded { remote_id });
    assert_eq!(h.remote().record_count(), 1);

    // A stray duplicate put of the same payload is harmless too
    let session = h.store().load_session(&id).unwrap().unwrap();
    let payload = SessionPayload::from_session(&session);
    let first = h.remote().record(&id).unwrap();
    trackrs::RemoteStore::put_session(h.remote(), &payload)
        .await
        .unwrap();
    assert_eq!(h.remote().record_count(), 1);
    assert_eq!(h.remote().record(&id).unwrap().remote_id, first.remote_id);
}

#[tokio::test]
async fn conflict_keeps_both_versions() {
    let h = Harness::new();
    let id = h.finished_run();
    let local = h.store().load_session(&id).unwrap().unwrap();

    // Edited on another device: new title, shorter track
    let mut edited = SessionPayload::from_session(&local);
    edited.title = Some("Edited elsewhere".into());
    edited.track_points.truncate(4);
    edited.statistics.total_distance = edited.track_points[3].cumulative_distance;
    let remote_id = h.remote().insert_remote(edited.clone());

    let outcome = h.engine.sync_session(&id).await.unwrap();
    let SyncOutcome::Conflict { copy_id } = outcome else {
        panic!("expected conflict, got {:?}", outcome);
    };
    assert!(copy_id.starts_with(&format!("{}-conflict-", id)));

    // Original id now carries the remote version
    let original = h.store().load_session(&id).unwrap().unwrap();
    assert_eq!(original.header.title.as_deref(), Some("Edited elsewhere"));
    assert_eq!(original.points.len(), 4);
    assert_eq!(original.header.sync_status, SyncStatus::Uploaded);
    let record = h.store().sync_record(&id).unwrap().unwrap();
    assert_eq!(record.remote_id.as_deref(), Some(remote_id.as_str()));

    // Local content preserved under the copy id
    let copy = h.store().load_session(&copy_id).unwrap().unwrap();
    assert_eq!(copy.points, local.points);
    assert_eq!(copy.header.title, None);
    assert_eq!(copy.header.sync_status, SyncStatus::Conflicted);

    let conflicts = h.engine.conflicts().unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].original_id, id);
    assert_eq!(
        h.store().conflict_remote_version(&copy_id).unwrap(),
        Some(edited)
    );
    assert!(h.events.lock().unwrap().contains(&SyncEvent::ConflictDetected {
        session_id: id.clone(),
        copy_id: copy_id.clone(),
    }));

    // The copy is never uploaded on its own
    h.clock.advance(60_000);
    assert_eq!(h.engine.drain_queue().await.unwrap().attempted, 0);

    // Until the user keeps it
    h.engine.keep_local_copy(&copy_id).unwrap();
    assert_eq!(h.engine.drain_queue().await.unwrap().uploaded, 1);
    assert_eq!(h.remote().record_count(), 2);
    assert!(h.engine.conflicts().unwrap().is_empty());
}

#[tokio::test]
async fn discarding_conflict_copy_accepts_remote() {
    let h = Harness::new();
    let id = h.finished_run();
    let local = h.store().load_session(&id).unwrap().unwrap();
    let mut edited = SessionPayload::from_session(&local);
    edited.title = Some("Renamed".into());
    h.remote().insert_remote(edited);

    let SyncOutcome::Conflict { copy_id } = h.engine.sync_session(&id).await.unwrap() else {
        panic!("expected conflict");
    };
    h.engine.discard_local_copy(&copy_id).unwrap();

    assert!(h.store().load_session(&copy_id).unwrap().is_none());
    assert!(h.engine.conflicts().unwrap().is_empty());
    assert_eq!(h.store().load_header(&id).unwrap().unwrap().title.as_deref(), Some("Renamed"));
    assert!(h.engine.discard_local_copy(&copy_id).is_err());
}

#[tokio::test]
async fn rejected_and_unauthorized_need_user_action() {
    let h = Harness::new();
    let bad = h.finished_run();
    let unauthorized = h.finished_run();

    h.remote().push_failure(RemoteError::status(400, "malformed"));
    h.engine.sync_session(&bad).await.unwrap();
    h.remote().push_failure(RemoteError::status(403, "forbidden"));
    h.engine.sync_session(&unauthorized).await.unwrap();

    for id in [&bad, &unauthorized] {
        assert_eq!(h.engine.status(id).unwrap(), SyncStatus::Failed);
    }
    assert!(h.events.lock().unwrap().contains(&SyncEvent::AuthRequired {
        session_id: unauthorized.clone()
    }));
    assert_eq!(h.store().list_finished_unsynced().unwrap().len(), 2);

    h.clock.advance(24 * 3_600_000);
    assert_eq!(h.engine.drain_queue().await.unwrap().attempted, 0);

    assert!(h.engine.retry_failed(&unauthorized).unwrap());
    let report = h.engine.drain_queue().await.unwrap();
    assert_eq!(report.uploaded, 1);
    assert_eq!(h.engine.status(&bad).unwrap(), SyncStatus::Failed);
}

#[tokio::test]
async fn success_makes_scheduled_retries_due() {
    let h = Harness::new();
    let first = h.finished_run();
    let second = h.finished_run();
    h.remote().push_failure(RemoteError::Connectivity("offline".into()));
    let outcome = h.engine.sync_session(&first).await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Retrying { .. }));

    // Only the second session is due; its success lifts the first one's backoff
    assert_eq!(h.engine.drain_queue().await.unwrap().uploaded, 1);
    assert_eq!(h.engine.status(&second).unwrap(), SyncStatus::Uploaded);
    assert_eq!(h.engine.status(&first).unwrap(), SyncStatus::Pending);
    assert_eq!(h.engine.drain_queue().await.unwrap().uploaded, 1);
    assert_eq!(h.engine.status(&first).unwrap(), SyncStatus::Uploaded);
}

#[tokio::test]
async fn one_attempt_in_flight_per_session() {
    let h = Harness::with_remote(MemoryRemote::new().with_latency(Duration::from_millis(50)));
    let id = h.finished_run();

    let (a, b) = tokio::join!(h.engine.sync_session(&id), h.engine.sync_session(&id));
    let outcomes = [a.unwrap(), b.unwrap()];
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == SyncOutcome::AlreadyInFlight)
            .count(),
        1
    );
    assert_eq!(h.remote().put_calls(), 1);
    assert_eq!(h.remote().max_in_flight_per_id(), 1);
}

#[tokio::test]
async fn distinct_sessions_upload_concurrently() {
    let h = Harness::with_remote(MemoryRemote::new().with_latency(Duration::from_millis(20)));
    let ids: Vec<String> = (0..6).map(|_| h.finished_run()).collect();

    let report = h.engine.drain_queue().await.unwrap();
    assert_eq!(report.uploaded, 6);
    assert_eq!(h.remote().record_count(), 6);
    for id in &ids {
        assert_eq!(h.engine.status(id).unwrap(), SyncStatus::Uploaded);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_loop_uploads_finished_sessions() {
    let h = Harness::new();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine = h.engine.clone();
    let task = tokio::spawn(async move { engine.run(shutdown_rx).await });

    // Finishing a session wakes the loop through the tracker's trigger
    let id = h.finished_run();
    let mut uploaded = false;
    for _ in 0..100 {
        if h.engine.status(&id).unwrap() == SyncStatus::Uploaded {
            uploaded = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(uploaded);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn uploaded_sessions_kept_for_grace_period() {
    let h = Harness::new();
    let id = h.finished_run();
    h.engine.drain_queue().await.unwrap();

    h.clock.advance(3 * 86_400_000);
    assert_eq!(h.engine.cleanup_uploaded().unwrap(), 0);
    assert!(h.tracker.session(&id).is_ok());

    h.clock.advance(5 * 86_400_000);
    assert_eq!(h.engine.cleanup_uploaded().unwrap(), 1);
    assert!(h.tracker.session(&id).is_err());
}
