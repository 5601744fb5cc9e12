use super::{DigitalOutput, TemperatureProbe};
use crate::bus::Actuator;
use crate::config::SimulationConfig;
use crate::error::SensorError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Longest single integration step of the thermal model, seconds.
const MAX_STEP_SECS: f64 = 1.0;

/// Solid-state or mechanical relays switching the elements.
pub struct RelayHeater {
    outputs: Mutex<Vec<Box<dyn DigitalOutput>>>,
    invert: bool,
    on: AtomicBool,
}

impl RelayHeater {
    pub fn new(outputs: Vec<Box<dyn DigitalOutput>>, invert: bool) -> Self {
        let heater = Self {
            outputs: Mutex::new(outputs),
            invert,
            on: AtomicBool::new(true),
        };
        heater.set_heat(false);
        heater
    }

    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }
}

impl Actuator for RelayHeater {
    fn set_heat(&self, on: bool) {
        let mut outputs = self.outputs.lock().unwrap_or_else(PoisonError::into_inner);
        for output in outputs.iter_mut() {
            output.set_high(on != self.invert);
        }
        if self.on.swap(on, Ordering::SeqCst) != on {
            debug!("heat {}", if on { "on" } else { "off" });
        }
    }
}

/// Element and oven as two lumped heat capacities, losing heat to the
/// room through a fixed resistance. Temperatures in Celsius.
#[derive(Debug, Clone)]
pub struct KilnModel {
    params: SimulationConfig,
    oven: f64,
    element: f64,
    heating: bool,
}

impl KilnModel {
    pub fn new(params: SimulationConfig) -> Self {
        Self {
            oven: params.t_env,
            element: params.t_env,
            params,
            heating: false,
        }
    }

    pub fn set_heating(&mut self, heating: bool) {
        self.heating = heating;
    }

    pub fn oven_temperature(&self) -> f64 {
        self.oven
    }

    pub fn element_temperature(&self) -> f64 {
        self.element
    }

    pub fn advance(&mut self, elapsed: Duration) {
        let mut remaining = elapsed.as_secs_f64();
        while remaining > 0.0 {
            let dt = remaining.min(MAX_STEP_SECS);
            self.step(dt);
            remaining -= dt;
        }
    }

    fn step(&mut self, dt: f64) {
        let p = &self.params;
        if self.heating {
            self.element += p.p_heat * dt / p.c_heat;
        }
        // element -> oven
        let p_ho = (self.element - self.oven) / p.r_ho_noair;
        self.oven += p_ho * dt / p.c_oven;
        self.element -= p_ho * dt / p.c_heat;
        // oven -> room
        let p_env = (self.oven - p.t_env) / p.r_o_nocool;
        self.oven -= p_env * dt / p.c_oven;
    }
}

/// Stands in for both the relay and the thermocouple when no hardware is
/// attached. The model is advanced by wall-clock time on every access.
pub struct SimulatedKiln {
    model: Mutex<(KilnModel, Instant)>,
}

impl SimulatedKiln {
    pub fn new(params: SimulationConfig) -> Self {
        info!("simulated kiln at {:.0}C", params.t_env);
        Self {
            model: Mutex::new((KilnModel::new(params), Instant::now())),
        }
    }

    fn current(&self) -> MutexGuard<'_, (KilnModel, Instant)> {
        let mut guard = self.model.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.duration_since(guard.1);
        guard.0.advance(elapsed);
        guard.1 = now;
        guard
    }

    pub fn temperature(&self) -> f64 {
        self.current().0.oven_temperature()
    }

    pub fn probe(self: &Arc<Self>, name: impl Into<String>) -> SimulatedProbe {
        SimulatedProbe {
            kiln: Arc::clone(self),
            name: name.into(),
        }
    }
}

impl Actuator for SimulatedKiln {
    fn set_heat(&self, on: bool) {
        self.current().0.set_heating(on);
    }
}

pub struct SimulatedProbe {
    kiln: Arc<SimulatedKiln>,
    name: String,
}

impl TemperatureProbe for SimulatedProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_celsius(&mut self) -> Result<f64, SensorError> {
        Ok(self.kiln.temperature())
    }
}
