//! Sensor and actuator threads that talk to the controller only through the bus.

pub mod ambient;
pub mod estop;
pub mod heater;
pub mod indicator;
pub mod thermocouple;

pub use ambient::AmbientSensor;
pub use estop::EstopMonitor;
pub use heater::{KilnModel, RelayHeater, SimulatedKiln, SimulatedProbe};
pub use indicator::{Caution, Heartbeat, Led};
pub use thermocouple::{IgnorePolicy, SensorConfidence, TempSamples, ThermocoupleSampler};

use crate::error::SensorError;
use std::io;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// A thermocouple amplifier. Reads are in Celsius.
pub trait TemperatureProbe: Send {
    fn name(&self) -> &str;
    fn read_celsius(&mut self) -> Result<f64, SensorError>;
}

/// A labelled room/enclosure temperature sensor. Reads are in Celsius.
pub trait AmbientProbe: Send {
    fn label(&self) -> &str;
    fn read_celsius(&mut self) -> Result<f64, SensorError>;
}

pub trait DigitalInput: Send {
    fn is_high(&mut self) -> bool;
}

pub trait DigitalOutput: Send {
    fn set_high(&mut self, high: bool);
}

/// A periodic sampling or actuation job owned by its own thread.
pub trait Collaborator: Send + Sized + 'static {
    fn name(&self) -> &'static str;

    /// Time between the starts of consecutive polls.
    fn period(&self) -> Duration;

    /// One unit of work. May block (indicator patterns, multi-sample reads).
    fn poll(&mut self);
}

/// Start `collaborator` on a named thread that polls it forever.
pub fn spawn<T: Collaborator>(mut collaborator: T) -> io::Result<JoinHandle<()>> {
    let name = collaborator.name();
    thread::Builder::new().name(name.to_string()).spawn(move || {
        info!("starting {}", name);
        loop {
            let started = Instant::now();
            collaborator.poll();
            let elapsed = started.elapsed();
            match collaborator.period().checked_sub(elapsed) {
                Some(rest) => thread::sleep(rest),
                None if !collaborator.period().is_zero() => {
                    warn!("{} overran its period by {:?}", name, elapsed - collaborator.period());
                }
                None => {}
            }
        }
    })
}
