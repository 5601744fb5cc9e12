//! Status LEDs: a heartbeat driven by controller activity and a caution
//! light that blinks the current failure's pattern.

use super::{Collaborator, DigitalOutput};
use crate::bus::{ActivityObserver, EventBus, Failure, FailureObserver, Pattern, Subscription};
use crate::config::IndicatorConfig;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::info;

/// `(lit, seconds)` steps for one pass of `pattern`.
pub fn blink_steps(pattern: Pattern) -> &'static [(bool, f64)] {
    match pattern {
        Pattern::Off => &[(false, 1.0)],
        Pattern::Heartbeat => &[(true, 0.1), (false, 0.1), (true, 0.1), (false, 0.7)],
        Pattern::Fail => &[(true, 0.2), (false, 0.2)],
        Pattern::Fail1 => &[(true, 0.2), (false, 1.0)],
        Pattern::Fail2 => &[(true, 0.2), (false, 0.2), (true, 0.2), (false, 1.0)],
        Pattern::Fail3 => &[
            (true, 0.2), (false, 0.2), (true, 0.2), (false, 0.2), (true, 0.2), (false, 1.0),
        ],
        Pattern::Fail4 => &[
            (true, 0.2), (false, 0.2), (true, 0.2), (false, 0.2),
            (true, 0.2), (false, 0.2), (true, 0.2), (false, 1.0),
        ],
        Pattern::Fail5 => &[
            (true, 0.2), (false, 0.2), (true, 0.2), (false, 0.2), (true, 0.2),
            (false, 0.2), (true, 0.2), (false, 0.2), (true, 0.2), (false, 1.0),
        ],
        Pattern::Fail6 => &[
            (true, 0.2), (false, 0.2), (true, 0.2), (false, 0.2), (true, 0.2), (false, 0.2),
            (true, 0.2), (false, 0.2), (true, 0.2), (false, 0.2), (true, 0.2), (false, 1.0),
        ],
        Pattern::Sos => &[
            (true, 0.1), (false, 0.2), (true, 0.1), (false, 0.2), (true, 0.1), (false, 0.4),
            (true, 0.5), (false, 0.2), (true, 0.5), (false, 0.2), (true, 0.5), (false, 0.4),
            (true, 0.1), (false, 0.2), (true, 0.1), (false, 0.2), (true, 0.1), (false, 1.0),
        ],
    }
}

pub struct Led {
    output: Option<Box<dyn DigitalOutput>>,
    lit_level: bool,
}

impl Led {
    pub fn new(output: Option<Box<dyn DigitalOutput>>, invert: bool) -> Self {
        let mut led = Self {
            output,
            lit_level: !invert,
        };
        led.set(false);
        led
    }

    fn set(&mut self, lit: bool) {
        let level = lit == self.lit_level;
        if let Some(output) = self.output.as_mut() {
            output.set_high(level);
        }
    }

    /// Blocks for the length of the pattern, wired or not.
    pub fn play(&mut self, pattern: Pattern) {
        for &(lit, seconds) in blink_steps(pattern) {
            self.set(lit);
            thread::sleep(Duration::from_secs_f64(seconds));
        }
    }
}

struct ActivityCountdown {
    remaining: AtomicU32,
    period: u32,
}

impl ActivityObserver for ActivityCountdown {
    fn activity(&self) {
        self.remaining.store(self.period, Ordering::SeqCst);
    }
}

/// Beats while the control loop keeps pinging `activity`; falls back to
/// SOS after `period` beats of silence.
pub struct Heartbeat {
    bus: EventBus,
    countdown: Arc<ActivityCountdown>,
    led: Led,
    verbose: bool,
    status: Option<&'static str>,
    _subscription: Subscription,
}

impl Heartbeat {
    pub fn new(config: &IndicatorConfig, bus: EventBus, output: Option<Box<dyn DigitalOutput>>) -> Self {
        let countdown = Arc::new(ActivityCountdown {
            remaining: AtomicU32::new(config.heartbeat_period),
            period: config.heartbeat_period,
        });
        let subscription = bus.subscribe_activity(countdown.clone());
        Self {
            bus,
            countdown,
            led: Led::new(output, config.heartbeat_invert),
            verbose: config.verbose,
            status: None,
            _subscription: subscription,
        }
    }

    /// Spend one beat and pick the pattern to play for it.
    pub fn beat(&mut self) -> Pattern {
        let alive = self
            .countdown
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let (pattern, status) = if alive {
            (Pattern::Heartbeat, "Okay")
        } else {
            (Pattern::Sos, "SOS")
        };
        if self.status != Some(status) {
            self.bus.record_meta_value("heartbeat", status);
            self.status = Some(status);
        }
        pattern
    }
}

impl Collaborator for Heartbeat {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    fn period(&self) -> Duration {
        Duration::ZERO
    }

    fn poll(&mut self) {
        let pattern = self.beat();
        if self.verbose {
            info!("heartbeat {:?}", pattern);
        }
        self.led.play(pattern);
    }
}

struct CautionSignal {
    bus: EventBus,
    current: Mutex<(Pattern, Option<String>)>,
}

impl CautionSignal {
    fn set(&self, pattern: Pattern, reason: Option<String>, status: &str) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = (pattern, reason);
        self.bus.record_meta_value("caution", status);
    }
}

impl FailureObserver for CautionSignal {
    fn failure(&self, failure: &Failure) {
        info!("failure: {}", failure.reason);
        let pattern = match failure.pattern {
            Pattern::Off | Pattern::Heartbeat => Pattern::Fail,
            other => other,
        };
        self.set(pattern, Some(failure.reason.clone()), "Fail");
    }

    fn clear_failure(&self, failure: &Failure) {
        info!("clear failure: {}", failure.reason);
        self.set(Pattern::Off, None, "Okay");
    }
}

pub struct Caution {
    signal: Arc<CautionSignal>,
    led: Led,
    verbose: bool,
    _subscription: Subscription,
}

impl Caution {
    pub fn new(config: &IndicatorConfig, bus: EventBus, output: Option<Box<dyn DigitalOutput>>) -> Self {
        let signal = Arc::new(CautionSignal {
            bus: bus.clone(),
            current: Mutex::new((Pattern::Off, None)),
        });
        signal.set(Pattern::Off, None, "Okay");
        let subscription = bus.subscribe_failure(signal.clone());
        Self {
            signal,
            led: Led::new(output, config.caution_invert),
            verbose: config.verbose,
            _subscription: subscription,
        }
    }

    pub fn pattern(&self) -> Pattern {
        self.signal
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .0
    }

    pub fn reason(&self) -> Option<String> {
        self.signal
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .1
            .clone()
    }
}

impl Collaborator for Caution {
    fn name(&self) -> &'static str {
        "caution"
    }

    fn period(&self) -> Duration {
        Duration::ZERO
    }

    fn poll(&mut self) {
        if self.verbose {
            if let Some(reason) = self.reason() {
                info!("{}", reason);
            }
        }
        let pattern = self.pattern();
        self.led.play(pattern);
    }
}
