//! Process-restart scenarios against an on-disk database.

use std::sync::Arc;

use trackrs::{
    ActivityKind, GeoSample, ManualClock, SessionState, SessionStore, SessionWorker, Tracker,
    TrackerConfig, TrackerError,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn tracker_at(path: &str, clock: &ManualClock) -> Tracker {
    let store = Arc::new(SessionStore::new(path).unwrap());
    Tracker::new(store, Arc::new(clock.clone()), TrackerConfig::default())
}

fn fix(i: i64) -> GeoSample {
    GeoSample::new(i * 1_000, 48.85 + i as f64 * 0.00003, 2.35, 5.0)
}

/// Abandon a worker the way process death would: no shutdown, no final flush.
fn crash(worker: SessionWorker) {
    std::mem::forget(worker);
}

#[test]
fn restart_mid_recording_recovers_flushed_points_as_paused() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sessions.db");
    let path = path.to_str().unwrap();
    let clock = ManualClock::new(0);

    let (session_id, flushed, distance_before) = {
        let tracker = tracker_at(path, &clock);
        let worker = tracker.start_workout(ActivityKind::Run, None).unwrap();
        for i in 0..8 {
            clock.set(i * 1_000);
            worker.record_sample(fix(i)).unwrap();
        }
        // The disk "fills up": the last fixes never reach the store
        tracker.store().set_query_only(true).unwrap();
        for i in 8..11 {
            clock.set(i * 1_000);
            worker.record_sample(fix(i)).unwrap();
        }
        assert_eq!(worker.live().snapshot.point_count, 11);

        let id = worker.session_id().to_string();
        let flushed = tracker.store().point_count(&id).unwrap();
        let distance = tracker.store().load_header(&id).unwrap().unwrap().statistics.total_distance;
        crash(worker);
        (id, flushed, distance)
    };
    assert_eq!(flushed, 8);

    // Next process
    clock.set(600_000);
    let tracker = tracker_at(path, &clock);
    let recovered = tracker.recover().unwrap();
    assert_eq!(recovered.len(), 1);
    let session = &recovered[0];
    assert_eq!(session.id(), session_id);
    assert_eq!(session.state(), SessionState::Paused);
    assert_eq!(session.points.len(), flushed);
    assert_eq!(session.header.statistics.total_distance, distance_before);
    // Open segment closed at the last stored fix (t=7s)
    assert_eq!(session.header.active_ms, 7_000);

    let err = tracker.start_workout(ActivityKind::Run, None).unwrap_err();
    assert!(matches!(err, TrackerError::SessionAlreadyActive { ref active } if *active == session_id));

    // Resume and keep going
    let worker = tracker.adopt_recovered(&session_id, None).unwrap();
    assert_eq!(worker.live().state, SessionState::Paused);
    worker.resume().unwrap();
    for i in 600..605 {
        clock.set(i * 1_000);
        worker.record_sample(fix(i)).unwrap();
    }
    let finished = worker.stop().unwrap();
    assert_eq!(finished.points.len(), flushed + 5);
    assert!(finished.header.statistics.total_distance > distance_before);
    // 7s before the crash plus 600s..604s after resuming
    assert_eq!(finished.header.statistics.duration_seconds, 11.0);
}

#[test]
fn restart_while_paused_keeps_active_time() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sessions.db");
    let path = path.to_str().unwrap();
    let clock = ManualClock::new(0);

    let session_id = {
        let tracker = tracker_at(path, &clock);
        let worker = tracker.start_workout(ActivityKind::Walk, None).unwrap();
        for i in 0..5 {
            clock.set(i * 1_000);
            worker.record_sample(fix(i)).unwrap();
        }
        clock.set(9_000);
        worker.pause().unwrap();
        let id = worker.session_id().to_string();
        crash(worker);
        id
    };

    clock.set(100_000);
    let tracker = tracker_at(path, &clock);
    let recovered = tracker.recover().unwrap();
    assert_eq!(recovered[0].header.active_ms, 9_000);
    assert_eq!(recovered[0].points.len(), 5);

    let worker = tracker.adopt_recovered(&session_id, None).unwrap();
    let finished = worker.stop().unwrap();
    assert_eq!(finished.header.statistics.duration_seconds, 9.0);
    assert_eq!(finished.state(), SessionState::Finished);
}

#[test]
fn recovered_session_can_be_discarded() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sessions.db");
    let path = path.to_str().unwrap();
    let clock = ManualClock::new(0);

    let session_id = {
        let tracker = tracker_at(path, &clock);
        let worker = tracker.start_workout(ActivityKind::Ride, None).unwrap();
        worker.record_sample(fix(0)).unwrap();
        let id = worker.session_id().to_string();
        crash(worker);
        id
    };

    let tracker = tracker_at(path, &clock);
    assert_eq!(tracker.recover().unwrap().len(), 1);
    tracker.discard_recovered(&session_id).unwrap();
    assert!(tracker.history().unwrap().is_empty());
    tracker.start_workout(ActivityKind::Run, None).unwrap();
}

#[test]
fn clean_shutdown_leaves_nothing_to_recover_after_stop() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sessions.db");
    let path = path.to_str().unwrap();
    let clock = ManualClock::new(0);

    {
        let tracker = tracker_at(path, &clock);
        let worker = tracker.start_workout(ActivityKind::Run, None).unwrap();
        worker.record_sample(fix(0)).unwrap();
        worker.stop().unwrap();
        worker.shutdown();
    }

    let tracker = tracker_at(path, &clock);
    assert!(tracker.recover().unwrap().is_empty());
    assert_eq!(tracker.finished_sessions().unwrap().len(), 1);
}
