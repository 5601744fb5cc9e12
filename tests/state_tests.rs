use kiln_controller::bus::{Failure, FailureKind, Meta, Pattern, TemperatureReading};
use kiln_controller::error::SnapshotError;
use kiln_controller::pid::PidGains;
use kiln_controller::profile::{FiringProfile, FiringSegment, TempUnit};
use kiln_controller::state::*;
use std::fs;
use std::time::{Duration, SystemTime};

fn settings() -> RunSettings {
    RunSettings {
        gains: PidGains::default(),
        control_window: 10.0,
        throttle: None,
        duty_cycle: Duration::from_secs(2),
        kwh_rate: 0.1319,
        currency: "$".to_string(),
        element_kw: 5.45,
    }
}

fn ramp() -> FiringProfile {
    FiringProfile::new(
        "ramp",
        TempUnit::Celsius,
        vec![FiringSegment::new(0.0, 100.0), FiringSegment::new(3600.0, 1000.0)],
    )
}

fn running_state(now: SystemTime) -> OvenState {
    let mut state = OvenState::with_profile(settings(), Some(ramp()), 600.0, now);
    state.resume();
    state.record_temperature(&TemperatureReading::single(248.0, now));
    state
}

#[test]
fn test_new_state_is_idle() {
    let state = OvenState::new(settings(), SystemTime::now());
    assert_eq!(state.lifecycle(), Lifecycle::Idle);
    assert!(state.idling());
    assert!(state.profile().is_none());
    assert_eq!(state.total_time(), 0.0);
    assert_eq!(state.target(), 0.0);
}

#[test]
fn test_lifecycle_transitions() {
    let mut state = OvenState::with_profile(settings(), Some(ramp()), 0.0, SystemTime::now());
    assert!(state.idling());
    state.resume();
    assert!(state.running());
    state.pause();
    assert!(state.paused());
    state.idle();
    assert_eq!(state.lifecycle(), Lifecycle::Idle);
}

#[test]
fn test_finished_after_total_time() {
    let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(100_000);
    let mut state = OvenState::with_profile(settings(), Some(ramp()), 0.0, t0);
    state.update_runtime(t0 + Duration::from_secs(3600));
    assert!(!state.finished());
    state.update_runtime(t0 + Duration::from_secs(3601));
    assert!(state.finished());
    assert_eq!(state.target(), 0.0);
}

#[test]
fn test_renewed_keeps_sensor_data() {
    let now = SystemTime::now();
    let mut state = running_state(now);
    let mut meta = Meta::new();
    meta.insert("ambient_room".to_string(), serde_json::json!(22.0));
    state.record_meta(&meta);
    state.set_failure(Some(Failure::new(FailureKind::EStop, "E-stop engaged", Pattern::Fail)));

    let idle = state.renewed(None, 0.0, now);
    assert!(idle.idling());
    assert!(idle.profile().is_none());
    assert_eq!(idle.temperature(), 248.0);
    assert_eq!(idle.meta().get("ambient_room"), Some(&serde_json::json!(22.0)));
    assert_eq!(idle.failure().map(|f| f.kind), Some(FailureKind::EStop));
    assert_eq!(idle.cost(), 0.0);
}

#[test]
fn test_resume_after_restart_discards_downtime() {
    let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(100_000);
    let mut state = running_state(t0);
    state.heat_off();
    state.pause();

    let later = t0 + Duration::from_secs(300);
    state.resume_after_restart(later);
    assert!(state.running());
    assert_eq!(state.runtime(), 600.0);
    assert_eq!(state.start_time(), later - Duration::from_secs(600));
    assert_eq!(state.heat(), 0.0);

    state.update_runtime(later + Duration::from_secs(10));
    assert_eq!(state.runtime(), 610.0);
}

#[test]
fn test_oversized_runtime_anchors_at_epoch() {
    let now = SystemTime::now();
    let mut state = OvenState::with_profile(settings(), Some(ramp()), 1e20, now);
    assert_eq!(state.start_time(), SystemTime::UNIX_EPOCH);

    state.resume();
    state.resume_after_restart(now + Duration::from_secs(60));
    assert!(state.running());
    assert_eq!(state.start_time(), SystemTime::UNIX_EPOCH);
}

#[test]
fn test_status_surface_fields() {
    let now = SystemTime::now();
    let state = running_state(now);
    let status = state.status();
    assert_eq!(status.state, Lifecycle::Running);
    assert_eq!(status.profile.as_deref(), Some("ramp"));
    assert_eq!(status.runtime, 600.0);
    assert_eq!(status.totaltime, 3600.0);
    assert_eq!(status.target, 250.0);
    assert_eq!(status.temperature, 248.0);
    assert_eq!(status.currency, "$");
    assert!(!status.catching_up);

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["state"], "RUNNING");
    assert_eq!(json["profile"], "ramp");
    assert!(json.get("pidstats").is_some());
}

#[test]
fn test_snapshot_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = SnapshotStore::new(dir.path().join("state.json"), Duration::from_secs(15 * 60));
    let now = SystemTime::now();
    let state = running_state(now);

    store.store(&state).unwrap();
    assert!(!dir.path().join("state.tmp").exists());

    let restored = store.restore().unwrap();
    assert!(restored.running());
    assert_eq!(restored.profile().map(FiringProfile::name), Some("ramp"));
    assert_eq!(restored.runtime(), 600.0);
    assert_eq!(restored.start_time(), state.start_time());
    assert_eq!(restored.temperature(), 248.0);
    assert_eq!(restored.settings().duty_cycle, Duration::from_secs(2));
    assert_eq!(restored.settings().currency, "$");
}

#[test]
fn test_snapshot_too_old() {
    let dir = tempfile::tempdir().unwrap();
    let store = SnapshotStore::new(dir.path().join("state.json"), Duration::from_secs(15 * 60));
    store.store(&running_state(SystemTime::now())).unwrap();

    let later = SystemTime::now() + Duration::from_secs(3600);
    match store.restore_at(later) {
        Err(SnapshotError::TooOld {
            age_minutes,
            window_minutes,
        }) => {
            assert!(age_minutes >= 59.0);
            assert_eq!(window_minutes, 15.0);
        }
        other => panic!("expected TooOld, got {other:?}"),
    }
}

#[test]
fn test_snapshot_exactly_window_old_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let store = SnapshotStore::new(&path, Duration::from_secs(15 * 60));
    store.store(&running_state(SystemTime::now())).unwrap();

    let written = fs::metadata(&path).unwrap().modified().unwrap();
    let at_window = written + Duration::from_secs(15 * 60);
    assert!(matches!(store.restore_at(at_window), Err(SnapshotError::TooOld { .. })));
    assert!(store.restore_at(at_window - Duration::from_secs(1)).is_ok());
}

#[test]
fn test_snapshot_not_running() {
    let dir = tempfile::tempdir().unwrap();
    let store = SnapshotStore::new(dir.path().join("state.json"), Duration::from_secs(15 * 60));
    let mut state = running_state(SystemTime::now());
    state.pause();
    store.store(&state).unwrap();

    assert!(matches!(
        store.restore(),
        Err(SnapshotError::NotRunning(Lifecycle::Paused))
    ));
    // still loadable directly
    assert!(store.load().unwrap().paused());
}

#[test]
fn test_snapshot_missing_and_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let store = SnapshotStore::new(&path, Duration::from_secs(15 * 60));
    assert!(matches!(store.restore(), Err(SnapshotError::Missing)));
    assert!(matches!(store.load(), Err(SnapshotError::Missing)));

    fs::write(&path, b"{\"lifecycle\":").unwrap();
    assert!(matches!(store.restore(), Err(SnapshotError::Corrupt(_))));
}

#[test]
fn test_snapshot_delete_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let store = SnapshotStore::new(&path, Duration::from_secs(60));
    store.delete().unwrap();

    store.store(&running_state(SystemTime::now())).unwrap();
    assert!(path.exists());
    store.delete().unwrap();
    assert!(!path.exists());
    store.delete().unwrap();
}
