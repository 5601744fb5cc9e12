//! Startup configuration.
//!
//! Loaded once from a JSON file and handed to each component's constructor.
//! Temperatures are in `general.unit`. Settings that protect the kiln
//! (duty cycle, control window, emergency shutoff) have no defaults.

use crate::error::{ConfigError, SensorFault};
use crate::pid::{PidGains, Throttle};
use crate::profile::TempUnit;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub unit: TempUnit,
    pub profiles_dir: PathBuf,
    pub restart: RestartConfig,
    pub cost: CostConfig,
    pub log_level: String,
    pub simulate: bool,
    pub listen: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            unit: TempUnit::Celsius,
            profiles_dir: PathBuf::from("profiles"),
            restart: RestartConfig::default(),
            cost: CostConfig::default(),
            log_level: "info".to_string(),
            simulate: false,
            listen: "127.0.0.1:8081".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub enabled: bool,
    /// Snapshots older than this are never restored.
    pub window_minutes: f64,
    pub state_file: PathBuf,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_minutes: 15.0,
            state_file: PathBuf::from("state.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    pub kwh_rate: f64,
    pub currency: String,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            kwh_rate: 0.1319,
            currency: "$".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ElementConfig {
    pub watts: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThrottleSetting {
    pub below_temp: f64,
    /// Either a fraction (0.8) or a percentage (80).
    pub percent: f64,
}

/// `oven` section as written in the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct OvenSettings {
    duty_cycle: Option<f64>,
    control_window: Option<f64>,
    emergency_shutoff_temp: Option<f64>,
    pid: Option<PidGains>,
    throttle: Option<ThrottleSetting>,
    seek_start: bool,
    must_catch_up: Option<bool>,
    elements: BTreeMap<String, ElementConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OvenConfig {
    pub duty_cycle: Duration,
    pub control_window: f64,
    pub emergency_shutoff_temp: f64,
    pub pid: PidGains,
    pub throttle: Option<Throttle>,
    pub seek_start: bool,
    pub must_catch_up: bool,
    pub elements: BTreeMap<String, ElementConfig>,
}

impl OvenConfig {
    /// Total connected element load in kilowatts.
    pub fn element_kw(&self) -> f64 {
        self.elements.values().map(|e| e.watts).sum::<f64>() / 1000.0
    }

    fn resolve(settings: OvenSettings) -> Result<Self, ConfigError> {
        let duty_cycle = settings.duty_cycle.ok_or(ConfigError::Missing("oven.duty_cycle"))?;
        let duty_cycle = period("oven.duty_cycle", duty_cycle)?;
        let control_window = settings
            .control_window
            .ok_or(ConfigError::Missing("oven.control_window"))?;
        if control_window.is_nan() || control_window <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "oven.control_window",
                reason: format!("must be positive, got {control_window}"),
            });
        }
        let emergency_shutoff_temp = settings
            .emergency_shutoff_temp
            .ok_or(ConfigError::Missing("oven.emergency_shutoff_temp"))?;

        let pid = settings.pid.unwrap_or_default();
        if pid.ki == 0.0 {
            return Err(ConfigError::Invalid {
                field: "oven.pid.ki",
                reason: "must be non-zero".to_string(),
            });
        }

        let throttle = match settings.throttle {
            Some(setting) => Some(Throttle {
                below_temp: setting.below_temp,
                percent: normalize_percent("oven.throttle.percent", setting.percent)?,
            }),
            None => None,
        };

        if settings.elements.is_empty() {
            return Err(ConfigError::Missing("oven.elements"));
        }

        Ok(Self {
            duty_cycle,
            control_window,
            emergency_shutoff_temp,
            pid,
            throttle,
            seek_start: settings.seek_start,
            must_catch_up: settings.must_catch_up.unwrap_or(true),
            elements: settings.elements,
        })
    }
}

/// A strictly positive, finite number of seconds that fits a `Duration`.
fn period(field: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    match Duration::try_from_secs_f64(secs) {
        Ok(duration) if !duration.is_zero() => Ok(duration),
        _ => Err(ConfigError::Invalid {
            field,
            reason: format!("must be a positive number of seconds, got {secs}"),
        }),
    }
}

/// Accept 0.8 or 80 as eighty percent.
fn normalize_percent(field: &'static str, value: f64) -> Result<f64, ConfigError> {
    let fraction = if value <= 1.0 { value } else { value / 100.0 };
    if fraction <= 0.0 || fraction > 1.0 {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("percentage out of range: {value}"),
        });
    }
    Ok(fraction)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub ignore_temp_too_high: bool,
    pub ignore_too_many_errors: bool,
    pub ignore_estop: bool,
    /// Sensor error share (percent) above which a run is aborted.
    pub error_limit_percent: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            ignore_temp_too_high: false,
            ignore_too_many_errors: false,
            ignore_estop: false,
            error_limit_percent: 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermocoupleConfig {
    pub name: String,
    #[serde(default)]
    pub offset: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Seconds between published readings.
    pub period_secs: f64,
    /// Reads taken per period; the median of these is the temperature.
    pub temperature_samples: usize,
    /// Reads used for the heat-rate average.
    pub heat_rate_samples: usize,
    pub thermocouples: Vec<ThermocoupleConfig>,
    /// Faults that are logged but do not count against sensor confidence.
    pub ignore_faults: Vec<SensorFault>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            period_secs: 2.0,
            temperature_samples: 10,
            heat_rate_samples: 60,
            thermocouples: vec![ThermocoupleConfig {
                name: "main".to_string(),
                offset: 0.0,
            }],
            ignore_faults: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorConfig {
    /// Heartbeats played without an `activity` ping before switching to SOS.
    pub heartbeat_period: u32,
    pub heartbeat_invert: bool,
    pub caution_invert: bool,
    pub verbose: bool,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_period: 2,
            heartbeat_invert: false,
            caution_invert: false,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstopConfig {
    /// Button reads high when released.
    pub invert: bool,
    pub poll_secs: f64,
}

impl Default for EstopConfig {
    fn default() -> Self {
        Self {
            invert: false,
            poll_secs: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmbientProbeConfig {
    pub label: String,
    #[serde(default)]
    pub adjustment: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AmbientConfig {
    pub period_secs: f64,
    pub probes: Vec<AmbientProbeConfig>,
    pub verbose: bool,
}

impl Default for AmbientConfig {
    fn default() -> Self {
        Self {
            period_secs: 60.0,
            probes: Vec::new(),
            verbose: false,
        }
    }
}

/// Parameters of the two-mass thermal model used when `general.simulate` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub t_env: f64,
    /// Heat capacity of the element, J/K.
    pub c_heat: f64,
    /// Heat capacity of the oven, J/K.
    pub c_oven: f64,
    /// Element power, W.
    pub p_heat: f64,
    /// Thermal resistance oven → environment, K/W.
    pub r_o_nocool: f64,
    /// Thermal resistance element → oven, K/W.
    pub r_ho_noair: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            t_env: 25.0,
            c_heat: 100.0,
            c_oven: 5000.0,
            p_heat: 5450.0,
            r_o_nocool: 1.0,
            r_ho_noair: 0.1,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct KilnConfigFile {
    general: GeneralConfig,
    oven: OvenSettings,
    safety: SafetyConfig,
    sensors: SensorConfig,
    indicators: IndicatorConfig,
    estop: EstopConfig,
    ambient: AmbientConfig,
    simulation: SimulationConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct KilnConfig {
    pub general: GeneralConfig,
    pub oven: OvenConfig,
    pub safety: SafetyConfig,
    pub sensors: SensorConfig,
    pub indicators: IndicatorConfig,
    pub estop: EstopConfig,
    pub ambient: AmbientConfig,
    pub simulation: SimulationConfig,
}

impl KilnConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let file: KilnConfigFile = serde_json::from_str(json)?;
        let config = Self {
            general: file.general,
            oven: OvenConfig::resolve(file.oven)?,
            safety: file.safety,
            sensors: file.sensors,
            indicators: file.indicators,
            estop: file.estop,
            ambient: file.ambient,
            simulation: file.simulation,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if Duration::try_from_secs_f64(self.general.restart.window_minutes * 60.0).is_err() {
            return Err(ConfigError::Invalid {
                field: "general.restart.window_minutes",
                reason: format!("{} is not a usable window", self.general.restart.window_minutes),
            });
        }
        if self.sensors.thermocouples.is_empty() {
            return Err(ConfigError::Missing("sensors.thermocouples"));
        }
        if self.sensors.temperature_samples == 0 {
            return Err(ConfigError::Invalid {
                field: "sensors.temperature_samples",
                reason: "need at least one sample per period".to_string(),
            });
        }
        period("sensors.period_secs", self.sensors.period_secs)?;
        period("estop.poll_secs", self.estop.poll_secs)?;
        period("ambient.period_secs", self.ambient.period_secs)?;
        if !(0.0..=100.0).contains(&self.safety.error_limit_percent) {
            return Err(ConfigError::Invalid {
                field: "safety.error_limit_percent",
                reason: format!("{} is not a percentage", self.safety.error_limit_percent),
            });
        }
        Ok(())
    }

    /// Snapshot freshness window.
    pub fn restart_window(&self) -> Duration {
        Duration::try_from_secs_f64(self.general.restart.window_minutes * 60.0).unwrap_or(Duration::ZERO)
    }
}
