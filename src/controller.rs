//! The control loop.
//!
//! One controller thread owns the [`OvenState`]. Collaborators publish on the
//! [`EventBus`](crate::bus::EventBus); a channel forwarder turns those events
//! into [`Message`]s, and operator commands arrive on the same channel. Each
//! call to [`Controller::step`] runs one duty cycle and reports a
//! [`TickOutcome`].

use crate::bus::{Event, EventBus, Failure, FailureKind, Pattern, TemperatureReading};
use crate::config::KilnConfig;
use crate::error::ControlError;
use crate::profile::FiringProfile;
use crate::state::{Lifecycle, OvenState, OvenStatus, RunSettings, SnapshotStore};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

/// Latest status, readable from any thread.
pub type StatusBoard = Arc<RwLock<OvenStatus>>;

#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Run {
        profile: FiringProfile,
        start_at_minutes: f64,
    },
    Pause,
    Resume,
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Event(Event),
    Command(ControlCommand),
}

impl From<Event> for Message {
    fn from(event: Event) -> Self {
        Message::Event(event)
    }
}

impl From<ControlCommand> for Message {
    fn from(command: ControlCommand) -> Self {
        Message::Command(command)
    }
}

/// Result of one duty cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// The schedule ran to completion; carries the profile name.
    Finished(String),
    /// The run was cut short; carries the reason.
    Aborted(String),
}

/// Time source and channel wait for the control loop.
pub trait Clock {
    fn now(&self) -> SystemTime;
    fn recv_timeout(
        &self,
        rx: &Receiver<Message>,
        timeout: Duration,
    ) -> Result<Message, RecvTimeoutError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn recv_timeout(
        &self,
        rx: &Receiver<Message>,
        timeout: Duration,
    ) -> Result<Message, RecvTimeoutError> {
        rx.recv_timeout(timeout)
    }
}

/// Deterministic clock: queued messages are delivered instantly, and an
/// empty channel advances time by the full timeout instead of sleeping.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<SystemTime>>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn recv_timeout(
        &self,
        rx: &Receiver<Message>,
        timeout: Duration,
    ) -> Result<Message, RecvTimeoutError> {
        match rx.try_recv() {
            Ok(message) => Ok(message),
            Err(TryRecvError::Empty) => {
                self.advance(timeout);
                Err(RecvTimeoutError::Timeout)
            }
            Err(TryRecvError::Disconnected) => Err(RecvTimeoutError::Disconnected),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControlSettings {
    pub run: RunSettings,
    pub seek_start: bool,
    pub must_catch_up: bool,
    pub emergency_shutoff_temp: f64,
    /// Percent of failed sensor reads that trips the confidence interlock.
    pub error_limit_percent: f64,
    pub ignore_temp_too_high: bool,
    pub ignore_too_many_errors: bool,
    pub ignore_estop: bool,
    pub automatic_restart: bool,
}

impl From<&KilnConfig> for ControlSettings {
    fn from(config: &KilnConfig) -> Self {
        Self {
            run: RunSettings::from(config),
            seek_start: config.oven.seek_start,
            must_catch_up: config.oven.must_catch_up,
            emergency_shutoff_temp: config.oven.emergency_shutoff_temp,
            error_limit_percent: config.safety.error_limit_percent,
            ignore_temp_too_high: config.safety.ignore_temp_too_high,
            ignore_too_many_errors: config.safety.ignore_too_many_errors,
            ignore_estop: config.safety.ignore_estop,
            automatic_restart: config.general.restart.enabled,
        }
    }
}

pub struct Controller<C: Clock = SystemClock> {
    settings: ControlSettings,
    state: OvenState,
    bus: EventBus,
    snapshots: SnapshotStore,
    rx: Receiver<Message>,
    clock: C,
    status: StatusBoard,
    /// Interlock currently tripped, so entry and exit are logged once.
    interlock: Option<FailureKind>,
}

impl<C: Clock> Controller<C> {
    pub fn new(
        settings: ControlSettings,
        bus: EventBus,
        snapshots: SnapshotStore,
        rx: Receiver<Message>,
        clock: C,
    ) -> Self {
        let state = OvenState::new(settings.run.clone(), clock.now());
        let status = Arc::new(RwLock::new(state.status()));
        Self {
            settings,
            state,
            bus,
            snapshots,
            rx,
            clock,
            status,
            interlock: None,
        }
    }

    pub fn state(&self) -> &OvenState {
        &self.state
    }

    pub fn status_board(&self) -> StatusBoard {
        Arc::clone(&self.status)
    }

    /// Restore, then loop until every sender is gone.
    pub fn run(&mut self) {
        self.automatic_restart();
        loop {
            match self.step() {
                Ok(TickOutcome::Continue) => {}
                Ok(TickOutcome::Finished(name)) => info!("firing profile {} finished", name),
                Ok(TickOutcome::Aborted(reason)) => warn!("firing aborted: {}", reason),
                Err(e) => {
                    self.bus.set_heat(false);
                    info!("controller stopping: {}", e);
                    return;
                }
            }
        }
    }

    /// One duty cycle.
    pub fn step(&mut self) -> Result<TickOutcome, ControlError> {
        self.bus.activity();
        let duty = self.settings.run.duty_cycle;

        let outcome = match self.state.lifecycle() {
            Lifecycle::Idle => self.wait(duty)?.unwrap_or(TickOutcome::Continue),
            Lifecycle::Paused => {
                let now = self.clock.now();
                self.state.heat_off();
                self.bus.set_heat(false);
                self.state.reanchor(now);
                self.state.update_runtime(now);
                self.wait(duty)?.unwrap_or(TickOutcome::Continue)
            }
            Lifecycle::Running => self.tick()?,
        };

        self.publish_status();
        Ok(outcome)
    }

    fn tick(&mut self) -> Result<TickOutcome, ControlError> {
        self.state.update_cost();
        self.save_automatic_restart_state();
        self.kiln_must_catch_up();

        let now = self.clock.now();
        self.state.update_runtime(now);

        let cycle = self.state.pid_compute(now);
        if !cycle.on.is_zero() {
            self.bus.set_heat(true);
            if let Some(outcome) = self.wait(cycle.on)? {
                return Ok(outcome);
            }
        }
        self.bus.set_heat(false);
        if !self.state.running() {
            return Ok(TickOutcome::Continue);
        }
        if !cycle.off.is_zero() {
            if let Some(outcome) = self.wait(cycle.off)? {
                return Ok(outcome);
            }
        }

        if self.state.running() && self.state.finished() {
            return Ok(self.finish());
        }
        Ok(TickOutcome::Continue)
    }

    /// Process messages for up to `duration`. Returns early with an outcome
    /// if a message ended the run, or with `None` if the lifecycle changed.
    fn wait(&mut self, duration: Duration) -> Result<Option<TickOutcome>, ControlError> {
        let lifecycle = self.state.lifecycle();
        let deadline = self.clock.now() + duration;
        loop {
            let remaining = deadline
                .duration_since(self.clock.now())
                .unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                return Ok(None);
            }
            match self.clock.recv_timeout(&self.rx, remaining) {
                Ok(message) => {
                    if let Some(outcome) = self.handle(message) {
                        return Ok(Some(outcome));
                    }
                    if self.state.lifecycle() != lifecycle {
                        return Ok(None);
                    }
                }
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => return Err(ControlError::ChannelClosed),
            }
        }
    }

    fn handle(&mut self, message: Message) -> Option<TickOutcome> {
        match message {
            Message::Event(Event::Temperature(reading)) => {
                self.state.record_temperature(&reading);
                self.check_interlocks(&reading)
            }
            Message::Event(Event::Meta(meta)) => {
                self.state.record_meta(&meta);
                None
            }
            Message::Event(Event::Failure(failure)) => {
                let aborts = !self.state.idling() && self.failure_aborts(failure.kind);
                let reason = failure.reason.clone();
                self.state.set_failure(Some(failure));
                aborts.then(|| self.abort(reason))
            }
            Message::Event(Event::ClearFailure(failure)) => {
                info!("failure cleared: {}", failure.reason);
                self.state.set_failure(None);
                None
            }
            Message::Command(command) => self.command(command),
        }
    }

    fn command(&mut self, command: ControlCommand) -> Option<TickOutcome> {
        match command {
            ControlCommand::Run {
                profile,
                start_at_minutes,
            } => {
                self.run_profile(profile, start_at_minutes);
                None
            }
            ControlCommand::Pause => {
                if self.state.running() {
                    self.state.pause();
                    self.state.heat_off();
                    self.bus.set_heat(false);
                    info!("firing paused at {:.0} s", self.state.runtime());
                }
                None
            }
            ControlCommand::Resume => {
                if self.state.paused() {
                    self.state.reanchor(self.clock.now());
                    self.state.resume();
                    info!("firing resumed at {:.0} s", self.state.runtime());
                }
                None
            }
            ControlCommand::Stop => {
                (!self.state.idling()).then(|| self.abort("stopped by operator".to_string()))
            }
        }
    }

    fn run_profile(&mut self, profile: FiringProfile, start_at_minutes: f64) {
        if !self.state.idling() {
            warn!(
                "ignoring run of {}: oven is {}",
                profile.name(),
                self.state.lifecycle()
            );
            return;
        }
        let mut runtime = start_at_minutes.max(0.0) * 60.0;
        if self.settings.seek_start && start_at_minutes == 0.0 {
            runtime += profile.seek_offset(self.state.temperature());
        }

        let now = self.clock.now();
        info!(
            "starting firing profile {} at {:.2} minutes",
            profile.name(),
            runtime / 60.0
        );
        self.state = self.state.renewed(Some(profile), runtime, now);
        self.state.resume();
        self.bus.start();
    }

    /// Shift the schedule by one duty cycle while the kiln is outside the
    /// control window in either direction.
    fn kiln_must_catch_up(&mut self) {
        if !self.settings.must_catch_up {
            return;
        }
        let gap = self.state.target() - self.state.temperature();
        let window = self.settings.run.control_window;
        if gap.abs() > window {
            if !self.state.catching_up() {
                let direction = if gap > 0.0 { "too cold" } else { "too hot" };
                warn!("kiln must catch up, {}, shifting schedule", direction);
            }
            self.state.shift_schedule(self.clock.now());
        } else if self.state.catching_up() {
            info!(
                "kiln caught up, schedule shifted {:.0} s in total",
                self.state.catchup_shift()
            );
            self.state.caughtup();
        }
    }

    fn check_interlocks(&mut self, reading: &TemperatureReading) -> Option<TickOutcome> {
        let tripped = if reading.temperature >= self.settings.emergency_shutoff_temp {
            Some(Failure::new(
                FailureKind::EmergencyTemperature,
                "Emergency!!! temperature too high",
                Pattern::Fail2,
            ))
        } else if reading.error_percent > self.settings.error_limit_percent {
            Some(Failure::new(
                FailureKind::SensorConfidence,
                "Emergency!!! too many errors in a short period",
                Pattern::Fail3,
            ))
        } else {
            None
        };

        let Some(failure) = tripped else {
            if let Some(kind) = self.interlock.take() {
                info!("interlock {:?} cleared", kind);
                self.state.set_failure(None);
                self.bus
                    .clear_failure(&Failure::new(kind, "interlock cleared", Pattern::Off));
            }
            return None;
        };

        if self.interlock != Some(failure.kind) {
            error!("{} ({:.0} deg)", failure.reason, reading.temperature);
            self.interlock = Some(failure.kind);
        }
        self.state.set_failure(Some(failure.clone()));
        self.bus.failure(&failure);

        if !self.state.idling() && self.failure_aborts(failure.kind) {
            return Some(self.abort(failure.reason));
        }
        None
    }

    fn failure_aborts(&self, kind: FailureKind) -> bool {
        match kind {
            FailureKind::EmergencyTemperature => !self.settings.ignore_temp_too_high,
            FailureKind::SensorConfidence => !self.settings.ignore_too_many_errors,
            FailureKind::EStop => !self.settings.ignore_estop,
            FailureKind::Other => false,
        }
    }

    fn finish(&mut self) -> TickOutcome {
        let name = self
            .state
            .profile()
            .map(|p| p.name().to_string())
            .unwrap_or_default();
        info!(
            "firing profile {} ended, shutting down (total cost = {})",
            name,
            self.state.cost_display()
        );
        self.end_run();
        TickOutcome::Finished(name)
    }

    fn abort(&mut self, reason: String) -> TickOutcome {
        if let Some(profile) = self.state.profile() {
            warn!("aborting firing profile {}: {}", profile.name(), reason);
        }
        self.end_run();
        TickOutcome::Aborted(reason)
    }

    fn end_run(&mut self) {
        self.bus.set_heat(false);
        self.state = self.state.renewed(None, 0.0, self.clock.now());
        if let Err(e) = self.snapshots.delete() {
            error!("could not remove restart state: {}", e);
        }
    }

    fn save_automatic_restart_state(&self) {
        if !self.settings.automatic_restart {
            return;
        }
        if let Err(e) = self.snapshots.store(&self.state) {
            error!("could not save restart state: {}", e);
        }
    }

    /// Resume a firing interrupted by a crash or power loss.
    pub fn automatic_restart(&mut self) -> bool {
        if !self.settings.automatic_restart {
            return false;
        }
        match self.snapshots.restore_at(self.clock.now()) {
            Ok(mut state) => {
                state.resume_after_restart(self.clock.now());
                info!(
                    "automatically restarting firing profile {} at {:.2} minutes",
                    state.profile().map(FiringProfile::name).unwrap_or_default(),
                    state.runtime() / 60.0
                );
                self.state = state;
                self.bus.start();
                self.publish_status();
                true
            }
            Err(e) => {
                warn!("automatic restart not possible: {}", e);
                false
            }
        }
    }

    fn publish_status(&self) {
        let status = self.state.status();
        debug!(state = %status.state, runtime = status.runtime, "status");
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
    }
}
