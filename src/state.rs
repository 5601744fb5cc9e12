//! Run lifecycle, bookkeeping and the durable crash-recovery snapshot.

use crate::bus::{Failure, Meta, ProbeReading, TemperatureReading};
use crate::config::KilnConfig;
use crate::error::SnapshotError;
use crate::pid::{HeatCycle, PidController, PidGains, PidStats, Throttle};
use crate::profile::FiringProfile;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

/// Prefix applied to merged metric keys on the status surface.
pub const META_PREFIX: &str = "ext_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Lifecycle {
    #[default]
    Idle,
    Paused,
    Running,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Lifecycle::Idle => "IDLE",
            Lifecycle::Paused => "PAUSED",
            Lifecycle::Running => "RUNNING",
        };
        f.write_str(name)
    }
}

/// Per-run constants taken from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSettings {
    pub gains: PidGains,
    pub control_window: f64,
    pub throttle: Option<Throttle>,
    pub duty_cycle: Duration,
    pub kwh_rate: f64,
    pub currency: String,
    /// Connected element load.
    pub element_kw: f64,
}

impl From<&KilnConfig> for RunSettings {
    fn from(config: &KilnConfig) -> Self {
        Self {
            gains: config.oven.pid,
            control_window: config.oven.control_window,
            throttle: config.oven.throttle,
            duty_cycle: config.oven.duty_cycle,
            kwh_rate: config.general.cost.kwh_rate,
            currency: config.general.cost.currency.clone(),
            element_kw: config.oven.element_kw(),
        }
    }
}

/// Serializable view of the oven for operators and front ends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OvenStatus {
    pub state: Lifecycle,
    pub profile: Option<String>,
    pub runtime: f64,
    pub totaltime: f64,
    pub temperature: f64,
    pub target: f64,
    pub heat: f64,
    pub heat_rate: f64,
    #[serde(default)]
    pub thermocouples: BTreeMap<String, ProbeReading>,
    pub catching_up: bool,
    /// Total seconds the schedule has been pushed back by catch-up.
    pub catchup_shift: f64,
    pub kwh_rate: f64,
    pub currency: String,
    pub cost: f64,
    pub pidstats: PidStats,
    pub failure: Option<Failure>,
    #[serde(flatten)]
    pub ext: Meta,
}

fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

/// Everything the control loop knows about the current firing.
///
/// Only the controller thread owns one of these. Sensor data arrives as
/// owned events and is copied in with [`OvenState::record_temperature`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OvenState {
    lifecycle: Lifecycle,
    profile: Option<FiringProfile>,
    start_time: SystemTime,
    runtime: f64,
    total_time: f64,
    target: f64,
    temperature: f64,
    heat_rate: f64,
    thermocouples: BTreeMap<String, ProbeReading>,
    heat: f64,
    heat_seconds: f64,
    catching_up: bool,
    catchup_shift: f64,
    cost: f64,
    pid: PidController,
    meta: Meta,
    failure: Option<Failure>,
    settings: RunSettings,
}

impl OvenState {
    /// An idle oven with no profile.
    pub fn new(settings: RunSettings, now: SystemTime) -> Self {
        Self::with_profile(settings, None, 0.0, now)
    }

    /// A fresh aggregate for `profile`, anchored so that `runtime` seconds
    /// have already elapsed. Lifecycle starts Idle.
    pub fn with_profile(
        settings: RunSettings,
        profile: Option<FiringProfile>,
        runtime: f64,
        now: SystemTime,
    ) -> Self {
        let total_time = profile.as_ref().map_or(0.0, FiringProfile::duration);
        let pid = PidController::new(settings.gains, settings.control_window, settings.throttle, now);
        let mut state = Self {
            lifecycle: Lifecycle::Idle,
            profile,
            start_time: now,
            runtime: runtime.max(0.0),
            total_time,
            target: 0.0,
            temperature: 0.0,
            heat_rate: 0.0,
            thermocouples: BTreeMap::new(),
            heat: 0.0,
            heat_seconds: 0.0,
            catching_up: false,
            catchup_shift: 0.0,
            cost: 0.0,
            pid,
            meta: Meta::new(),
            failure: None,
            settings,
        };
        state.reanchor(now);
        state.update_target();
        state
    }

    /// Replace this aggregate with a fresh one for `profile`, keeping the
    /// latest sensor readings, metrics and any active failure.
    pub fn renewed(&self, profile: Option<FiringProfile>, runtime: f64, now: SystemTime) -> Self {
        let mut next = Self::with_profile(self.settings.clone(), profile, runtime, now);
        next.temperature = self.temperature;
        next.heat_rate = self.heat_rate;
        next.thermocouples = self.thermocouples.clone();
        next.meta = self.meta.clone();
        next.failure = self.failure.clone();
        next
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn idle(&mut self) {
        self.lifecycle = Lifecycle::Idle;
    }

    pub fn idling(&self) -> bool {
        self.lifecycle == Lifecycle::Idle
    }

    pub fn pause(&mut self) {
        self.lifecycle = Lifecycle::Paused;
    }

    pub fn paused(&self) -> bool {
        self.lifecycle == Lifecycle::Paused
    }

    pub fn resume(&mut self) {
        self.lifecycle = Lifecycle::Running;
    }

    pub fn running(&self) -> bool {
        self.lifecycle == Lifecycle::Running
    }

    pub fn finished(&self) -> bool {
        self.runtime > self.total_time
    }

    pub fn catchup(&mut self) {
        self.catching_up = true;
    }

    pub fn caughtup(&mut self) {
        self.catching_up = false;
    }

    pub fn catching_up(&self) -> bool {
        self.catching_up
    }

    pub fn catchup_shift(&self) -> f64 {
        self.catchup_shift
    }

    pub fn profile(&self) -> Option<&FiringProfile> {
        self.profile.as_ref()
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    pub fn runtime(&self) -> f64 {
        self.runtime
    }

    pub fn total_time(&self) -> f64 {
        self.total_time
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn heat(&self) -> f64 {
        self.heat
    }

    pub fn cost(&self) -> f64 {
        self.cost
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    pub fn pid_stats(&self) -> PidStats {
        self.pid.stats()
    }

    /// Move the anchor so that `now - start_time == runtime`. Elapsed time
    /// since the last recompute is thereby discarded. Returns the shift.
    pub fn reanchor(&mut self, now: SystemTime) -> f64 {
        let previous = self.start_time;
        self.start_time = Duration::try_from_secs_f64(self.runtime)
            .ok()
            .and_then(|runtime| now.checked_sub(runtime))
            .unwrap_or(SystemTime::UNIX_EPOCH);
        match self.start_time.duration_since(previous) {
            Ok(forward) => forward.as_secs_f64(),
            Err(backward) => -backward.duration().as_secs_f64(),
        }
    }

    /// Push the schedule back to wait for the kiln.
    pub fn shift_schedule(&mut self, now: SystemTime) {
        self.catchup_shift += self.reanchor(now);
        self.catchup();
    }

    /// Runtime is always derived from the anchor, never accumulated.
    pub fn update_runtime(&mut self, now: SystemTime) {
        self.runtime = now
            .duration_since(self.start_time)
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();
        self.update_target();
    }

    pub fn update_target(&mut self) {
        self.target = self
            .profile
            .as_ref()
            .map_or(0.0, |profile| profile.target_temperature(self.runtime));
    }

    pub fn record_temperature(&mut self, reading: &TemperatureReading) {
        self.temperature = reading.temperature;
        self.heat_rate = reading.heat_rate;
        if !reading.thermocouples.is_empty() {
            self.thermocouples = reading.thermocouples.clone();
        }
    }

    pub fn record_meta(&mut self, meta: &Meta) {
        for (key, value) in meta {
            self.meta.insert(key.clone(), value.clone());
        }
    }

    pub fn set_failure(&mut self, failure: Option<Failure>) {
        self.failure = failure;
    }

    /// Charge for the heat delivered during the previous duty cycle.
    pub fn update_cost(&mut self) {
        if self.heat_seconds > 0.0 {
            self.cost += self.settings.kwh_rate * self.settings.element_kw * self.heat_seconds / 3600.0;
        }
    }

    pub fn cost_display(&self) -> String {
        format!("{}{:.2}", self.settings.currency, self.cost)
    }

    /// Run the PID against the current target and split the next duty cycle.
    pub fn pid_compute(&mut self, now: SystemTime) -> HeatCycle {
        let output = self.pid.compute(self.target, self.temperature, now);
        let cycle = HeatCycle::new(self.settings.duty_cycle, output);
        self.heat_seconds = cycle.heat_seconds();
        self.heat = if cycle.on > Duration::ZERO { cycle.output } else { 0.0 };

        let stats = self.pid.stats();
        debug!(
            "temp={:.2}, target={:.2}, error={:.2}, pid={:.2}, p={:.2}, i={:.2}, d={:.2}, heat_on={:.2}, heat_off={:.2}, run_time={:.2}, total_time={:.2}",
            stats.measured,
            stats.setpoint,
            stats.error,
            stats.raw_output,
            stats.p,
            stats.i,
            stats.d,
            cycle.on.as_secs_f64(),
            cycle.off.as_secs_f64(),
            self.runtime,
            self.total_time
        );
        cycle
    }

    /// Heater off with nothing delivered; used while paused and on abort.
    pub fn heat_off(&mut self) {
        self.heat = 0.0;
        self.heat_seconds = 0.0;
    }

    /// Continue a restored run: re-anchor so downtime is not counted as
    /// schedule progress, and restart the PID clock.
    pub fn resume_after_restart(&mut self, now: SystemTime) {
        self.reanchor(now);
        self.pid = PidController::new(
            self.settings.gains,
            self.settings.control_window,
            self.settings.throttle,
            now,
        );
        self.heat_off();
        self.resume();
        self.update_target();
    }

    pub fn status(&self) -> OvenStatus {
        OvenStatus {
            state: self.lifecycle,
            profile: self.profile.as_ref().map(|p| p.name().to_string()),
            runtime: round_to(self.runtime, 2),
            totaltime: self.total_time,
            temperature: self.temperature.round(),
            target: self.target.round(),
            heat: self.heat,
            heat_rate: self.heat_rate,
            thermocouples: self.thermocouples.clone(),
            catching_up: self.catching_up,
            catchup_shift: round_to(self.catchup_shift, 2),
            kwh_rate: self.settings.kwh_rate,
            currency: self.settings.currency.clone(),
            cost: round_to(self.cost, 2),
            pidstats: self.pid.stats(),
            failure: self.failure.clone(),
            ext: self
                .meta
                .iter()
                .map(|(k, v)| (format!("{META_PREFIX}{k}"), v.clone()))
                .collect(),
        }
    }
}

/// The on-disk crash-recovery snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
    window: Duration,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>, window: Duration) -> Self {
        Self {
            path: path.into(),
            window,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Written to a sibling file then renamed, so a crash mid-write leaves
    /// the previous snapshot intact.
    pub fn store(&self, state: &OvenState) -> Result<(), SnapshotError> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(state)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn load(&self) -> Result<OvenState, SnapshotError> {
        let contents = fs::read(&self.path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => SnapshotError::Missing,
            _ => SnapshotError::Io(e),
        })?;
        Ok(serde_json::from_slice(&contents)?)
    }

    /// Removing a snapshot that does not exist is not an error.
    pub fn delete(&self) -> Result<(), SnapshotError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("removed restart state {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SnapshotError::Io(e)),
        }
    }

    /// Time since the snapshot was last written, measured at `now`.
    pub fn age_at(&self, now: SystemTime) -> Result<Duration, SnapshotError> {
        let modified = fs::metadata(&self.path)
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => SnapshotError::Missing,
                _ => SnapshotError::Io(e),
            })?
            .modified()?;
        Ok(now.duration_since(modified).unwrap_or(Duration::ZERO))
    }

    pub fn restore(&self) -> Result<OvenState, SnapshotError> {
        self.restore_at(SystemTime::now())
    }

    /// Load the snapshot only if it is fresh and was taken mid-run.
    pub fn restore_at(&self, now: SystemTime) -> Result<OvenState, SnapshotError> {
        let age = self.age_at(now)?;
        if age >= self.window {
            return Err(SnapshotError::TooOld {
                age_minutes: age.as_secs_f64() / 60.0,
                window_minutes: self.window.as_secs_f64() / 60.0,
            });
        }
        let state = self.load()?;
        if !state.running() {
            return Err(SnapshotError::NotRunning(state.lifecycle()));
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{FiringSegment, TempUnit};

    fn settings() -> RunSettings {
        RunSettings {
            gains: PidGains::default(),
            control_window: 9.0,
            throttle: None,
            duty_cycle: Duration::from_secs(2),
            kwh_rate: 0.25,
            currency: "$".to_string(),
            element_kw: 4.0,
        }
    }

    fn ramp() -> FiringProfile {
        FiringProfile::new(
            "ramp",
            TempUnit::Fahrenheit,
            vec![FiringSegment::new(0.0, 100.0), FiringSegment::new(1000.0, 1100.0)],
        )
    }

    #[test]
    fn test_runtime_follows_anchor() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(10_000);
        let mut state = OvenState::with_profile(settings(), Some(ramp()), 100.0, t0);
        assert_eq!(state.target(), 200.0);

        state.update_runtime(t0 + Duration::from_secs(50));
        assert_eq!(state.runtime(), 150.0);
        assert_eq!(state.target(), 250.0);
    }

    #[test]
    fn test_shift_schedule_accumulates() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(10_000);
        let mut state = OvenState::with_profile(settings(), Some(ramp()), 0.0, t0);
        state.shift_schedule(t0 + Duration::from_secs(2));
        state.shift_schedule(t0 + Duration::from_secs(4));
        assert!(state.catching_up());
        assert_eq!(state.catchup_shift(), 4.0);
        state.update_runtime(t0 + Duration::from_secs(4));
        assert_eq!(state.runtime(), 0.0);
    }

    #[test]
    fn test_cost_uses_heat_seconds() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(10_000);
        let mut state = OvenState::with_profile(settings(), Some(ramp()), 0.0, t0);
        state.update_cost();
        assert_eq!(state.cost(), 0.0);

        // far below target: full output for the whole 2s cycle
        state.record_temperature(&TemperatureReading::single(20.0, t0));
        let cycle = state.pid_compute(t0 + Duration::from_secs(2));
        assert_eq!(cycle.on, Duration::from_secs(2));
        state.update_cost();
        assert!((state.cost() - 0.25 * 4.0 * 2.0 / 3600.0).abs() < 1e-12);
        assert_eq!(state.cost_display(), "$0.00");
    }

    #[test]
    fn test_status_prefixes_meta() {
        let mut state = OvenState::new(settings(), SystemTime::UNIX_EPOCH);
        let mut meta = Meta::new();
        meta.insert("caution".to_string(), serde_json::json!("Okay"));
        state.record_meta(&meta);
        let status = state.status();
        assert_eq!(status.ext.get("ext_caution"), Some(&serde_json::json!("Okay")));
        assert_eq!(status.state, Lifecycle::Idle);
        assert_eq!(status.profile, None);
    }
}
