use super::{Collaborator, DigitalInput};
use crate::bus::{EventBus, Failure, FailureKind, Pattern};
use crate::config::EstopConfig;
use std::thread;
use std::time::Duration;
use tracing::warn;

const DEBOUNCE_READS: usize = 5;
const DEBOUNCE_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_POLL: Duration = Duration::from_secs(1);

/// Watches the emergency stop button. The button cuts kiln power in
/// hardware; this only tells the rest of the system about it.
pub struct EstopMonitor {
    bus: EventBus,
    /// `None` when no button is wired; such a button is never pressed.
    input: Option<Box<dyn DigitalInput>>,
    pressed_level: bool,
    engaged: bool,
    period: Duration,
    debounce_interval: Duration,
}

impl EstopMonitor {
    pub fn new(config: &EstopConfig, bus: EventBus, input: Option<Box<dyn DigitalInput>>) -> Self {
        if input.is_none() {
            warn!("no e-stop input, e-stop monitoring simulated");
        }
        Self {
            bus,
            input,
            pressed_level: !config.invert,
            // start engaged so the first poll announces the release
            engaged: true,
            period: Duration::try_from_secs_f64(config.poll_secs).unwrap_or(DEFAULT_POLL),
            debounce_interval: DEBOUNCE_INTERVAL,
        }
    }

    pub fn with_debounce_interval(mut self, interval: Duration) -> Self {
        self.debounce_interval = interval;
        self
    }

    pub fn engaged(&self) -> bool {
        self.engaged
    }

    /// True only if the input reads `pressed` now and on every debounce read.
    fn stable(&mut self, pressed: bool) -> bool {
        let level = if pressed { self.pressed_level } else { !self.pressed_level };
        let interval = self.debounce_interval;
        let Some(input) = self.input.as_mut() else {
            return !pressed;
        };
        if input.is_high() != level {
            return false;
        }
        for _ in 0..DEBOUNCE_READS {
            thread::sleep(interval);
            if input.is_high() != level {
                warn!("e-stop needed to be debounced");
                return false;
            }
        }
        true
    }

    /// Check the button and publish on a transition.
    pub fn check(&mut self) {
        if !self.engaged && self.stable(true) {
            self.bus.failure(&Failure::new(
                FailureKind::EStop,
                "E-stop engaged",
                Pattern::Fail,
            ));
            self.engaged = true;
        } else if self.engaged && self.stable(false) {
            self.bus.clear_failure(&Failure::new(
                FailureKind::EStop,
                "E-stop released",
                Pattern::Off,
            ));
            self.engaged = false;
        }
    }
}

impl Collaborator for EstopMonitor {
    fn name(&self) -> &'static str {
        "estop"
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn poll(&mut self) {
        self.check();
    }
}
