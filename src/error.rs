use std::path::PathBuf;
use thiserror::Error;

/// Missing or invalid settings. Fatal for the subsystem that needs them.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Fault reported by a thermocouple amplifier chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorFault {
    NotConnected,
    ShortCircuit,
    ColdJunctionRange,
    ThermocoupleRange,
    ColdJunctionHigh,
    ColdJunctionLow,
    TemperatureHigh,
    TemperatureLow,
    Voltage,
    Unsupported,
    Unknown,
}

impl SensorFault {
    pub fn description(self) -> &'static str {
        match self {
            SensorFault::NotConnected => "Not connected",
            SensorFault::ShortCircuit => "Short circuit",
            SensorFault::ColdJunctionRange => "Cold junction range fault",
            SensorFault::ThermocoupleRange => "Thermocouple range fault",
            SensorFault::ColdJunctionHigh => "Cold junction temp too high",
            SensorFault::ColdJunctionLow => "Cold junction temp too low",
            SensorFault::TemperatureHigh => "Thermocouple temp too high",
            SensorFault::TemperatureLow => "Thermocouple temp too low",
            SensorFault::Voltage => "Voltage too high or low",
            SensorFault::Unsupported => "Unsupported Thermocouple",
            SensorFault::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("sensor `{sensor}` read failed: {}", .fault.description())]
pub struct SensorError {
    pub sensor: String,
    pub fault: SensorFault,
}

impl SensorError {
    pub fn new(sensor: impl Into<String>, fault: SensorFault) -> Self {
        Self { sensor: sensor.into(), fault }
    }
}

/// Profile storage failures. Schedule math never raises; it returns sentinels.
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("profile storage i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed profile: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("profile `{0}` not found")]
    NotFound(String),
    #[error("profile `{0}` already exists")]
    AlreadyExists(String),
    #[error("invalid profile name `{0}`")]
    InvalidName(String),
}

/// Reasons an automatic restart is declined. Never fatal.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("saved state missing")]
    Missing,
    #[error("saved state corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("saved state is {age_minutes:.1} minutes old (window {window_minutes} minutes)")]
    TooOld { age_minutes: f64, window_minutes: f64 },
    #[error("saved state was {0:?}, not running")]
    NotRunning(crate::state::Lifecycle),
    #[error("saved state i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid json message")]
    InvalidJson,
    #[error("message too large")]
    MessageTooLarge,
    #[error("serialization failed")]
    Serialization,
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control channel closed")]
    ChannelClosed,
}
