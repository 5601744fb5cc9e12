use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Raw PID output is clamped to ±this before being scaled into [0, 1].
const OUTPUT_WINDOW: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            kp: 10.0,
            ki: 80.0,
            kd: 220.834_979_102_615_6,
        }
    }
}

/// Cap on full-power output while the setpoint is still at or below
/// `below_temp`, to avoid overshooting low-temperature segments.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Throttle {
    pub below_temp: f64,
    /// Fraction in (0, 1].
    pub percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ControlRegion {
    MaxCooling,
    MaxHeating,
    Throttled,
    Proportional,
}

/// Internals exposed on the status surface.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PidStats {
    pub time_delta: f64,
    pub setpoint: f64,
    pub measured: f64,
    pub error: f64,
    pub error_delta: f64,
    pub p: f64,
    pub i: f64,
    pub d: f64,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub raw_output: f64,
    pub output: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidController {
    gains: PidGains,
    control_window: f64,
    throttle: Option<Throttle>,
    integral: f64,
    last_error: f64,
    last_time: SystemTime,
    last_region: Option<ControlRegion>,
    stats: PidStats,
}

impl PidController {
    pub fn new(gains: PidGains, control_window: f64, throttle: Option<Throttle>, now: SystemTime) -> Self {
        Self {
            gains,
            control_window,
            throttle,
            integral: 0.0,
            last_error: 0.0,
            last_time: now,
            last_region: None,
            stats: PidStats {
                kp: gains.kp,
                ki: gains.ki,
                kd: gains.kd,
                ..PidStats::default()
            },
        }
    }

    /// Heater duty fraction in [0, 1] for this sample.
    ///
    /// Outside the control window the output saturates and the integral is
    /// frozen; inside it the usual P + I + D sum applies.
    pub fn compute(&mut self, setpoint: f64, measured: f64, now: SystemTime) -> f64 {
        let dt = now
            .duration_since(self.last_time)
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();
        let error = setpoint - measured;

        self.stats.time_delta = dt;
        self.stats.setpoint = setpoint;
        self.stats.measured = measured;
        self.stats.error_delta = 0.0;

        let (region, output) = if error < -self.control_window {
            (ControlRegion::MaxCooling, 0.0)
        } else if error > self.control_window {
            match self.throttle {
                Some(throttle) if setpoint <= throttle.below_temp => {
                    (ControlRegion::Throttled, throttle.percent)
                }
                _ => (ControlRegion::MaxHeating, 1.0),
            }
        } else {
            if dt > 0.0 {
                self.integral += error * dt / self.gains.ki;
                self.stats.error_delta = (error - self.last_error) / dt;
            }
            self.stats.i = self.integral;
            self.stats.d = self.gains.kd * self.stats.error_delta;
            let raw = self.gains.kp * error + self.integral + self.stats.d;
            self.stats.raw_output = raw.clamp(-OUTPUT_WINDOW, OUTPUT_WINDOW);
            (ControlRegion::Proportional, self.stats.raw_output / OUTPUT_WINDOW)
        };

        self.log_region_change(region, setpoint);

        self.last_time = now;
        self.last_error = error;
        self.stats.error = error;
        self.stats.p = self.gains.kp * error;

        // no active cooling
        self.stats.output = output.max(0.0);
        self.stats.output
    }

    fn log_region_change(&mut self, region: ControlRegion, setpoint: f64) {
        if self.last_region == Some(region) {
            return;
        }
        match region {
            ControlRegion::MaxCooling => warn!("kiln outside pid control window, max cooling"),
            ControlRegion::MaxHeating => warn!("kiln outside pid control window, max heating"),
            ControlRegion::Throttled => {
                if let Some(throttle) = self.throttle {
                    warn!(
                        "max heating throttled at {:.0}% below {} degrees (setpoint {:.0})",
                        throttle.percent * 100.0,
                        throttle.below_temp,
                        setpoint
                    );
                }
            }
            ControlRegion::Proportional => debug!("kiln inside pid control window"),
        }
        self.last_region = Some(region);
    }

    pub fn stats(&self) -> PidStats {
        self.stats
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn control_window(&self) -> f64 {
        self.control_window
    }
}

/// One duty cycle split into heat-on then heat-off.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeatCycle {
    pub on: Duration,
    pub off: Duration,
    pub output: f64,
}

impl HeatCycle {
    pub fn new(duty_cycle: Duration, output: f64) -> Self {
        let output = output.clamp(0.0, 1.0);
        let on = duty_cycle.mul_f64(output);
        Self {
            on,
            off: duty_cycle.saturating_sub(on),
            output,
        }
    }

    pub fn heat_seconds(&self) -> f64 {
        self.on.as_secs_f64()
    }
}
