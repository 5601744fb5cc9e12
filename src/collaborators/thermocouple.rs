use super::{Collaborator, TemperatureProbe};
use crate::bus::{EventBus, ProbeReading, TemperatureReading};
use crate::config::SensorConfig;
use crate::error::SensorFault;
use crate::profile::TempUnit;
use heapless::Deque;
use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tracing::{error, info, warn};

/// Upper bound on retained samples per probe.
pub const MAX_SAMPLES: usize = 128;
/// Upper bound on the confidence window (two periods of samples).
pub const MAX_CONFIDENCE_WINDOW: usize = 2 * MAX_SAMPLES;
const DEFAULT_PERIOD: Duration = Duration::from_secs(2);

/// Rolling window of timestamped reads for one probe.
#[derive(Debug, Clone)]
pub struct TempSamples {
    samples: Deque<(SystemTime, f64), MAX_SAMPLES>,
    temp_count: usize,
    rate_count: usize,
}

impl TempSamples {
    pub fn new(temp_count: usize, rate_count: usize) -> Self {
        Self {
            samples: Deque::new(),
            temp_count: temp_count.clamp(1, MAX_SAMPLES),
            rate_count: rate_count.clamp(1, MAX_SAMPLES),
        }
    }

    fn capacity(&self) -> usize {
        self.temp_count.max(self.rate_count)
    }

    pub fn add(&mut self, timestamp: SystemTime, temperature: f64) {
        while self.samples.len() >= self.capacity() {
            self.samples.pop_front();
        }
        // cannot fail, room was made above
        let _ = self.samples.push_back((timestamp, temperature));
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Median of the last `temp_count` reads and mean rate (degrees/hour)
    /// across the last `rate_count` reads.
    pub fn average(&self) -> ProbeReading {
        let samples: Vec<(SystemTime, f64)> = self.samples.iter().copied().collect();
        let count = samples.len();

        let mut temps: Vec<f64> = samples[count.saturating_sub(self.temp_count)..]
            .iter()
            .map(|(_, t)| *t)
            .collect();
        let temperature = median(&mut temps);

        let rate_start = 1.max((count + 1).saturating_sub(self.rate_count));
        let rates: Vec<f64> = (rate_start..count)
            .filter_map(|i| {
                let (then, before) = samples[i - 1];
                let (now, after) = samples[i];
                let secs = now.duration_since(then).ok()?.as_secs_f64();
                (secs > 0.0).then(|| (after - before) * 3600.0 / secs)
            })
            .collect();
        let heat_rate = if rates.is_empty() {
            0.0
        } else {
            rates.iter().sum::<f64>() / rates.len() as f64
        };

        ProbeReading {
            temperature,
            heat_rate,
        }
    }
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Sliding record of read successes, starting all-good.
#[derive(Debug, Clone)]
pub struct SensorConfidence {
    window: Deque<bool, MAX_CONFIDENCE_WINDOW>,
    limit: f64,
}

impl SensorConfidence {
    pub fn new(size: usize, limit: f64) -> Self {
        let mut window = Deque::new();
        for _ in 0..size.clamp(1, MAX_CONFIDENCE_WINDOW) {
            let _ = window.push_back(true);
        }
        Self { window, limit }
    }

    fn push(&mut self, ok: bool) {
        self.window.pop_front();
        let _ = self.window.push_back(ok);
    }

    pub fn good(&mut self) {
        self.push(true);
    }

    pub fn bad(&mut self) {
        self.push(false);
    }

    pub fn error_percent(&self) -> f64 {
        let errors = self.window.iter().filter(|ok| !**ok).count();
        errors as f64 / self.window.len() as f64 * 100.0
    }

    pub fn over_error_limit(&self) -> bool {
        self.error_percent() > self.limit
    }
}

/// Which chip faults are logged but still count as a good read.
#[derive(Debug, Clone, Default)]
pub struct IgnorePolicy {
    ignored: Vec<SensorFault>,
}

impl IgnorePolicy {
    pub fn new(ignored: impl IntoIterator<Item = SensorFault>) -> Self {
        Self {
            ignored: ignored.into_iter().collect(),
        }
    }

    pub fn is_ignored(&self, fault: SensorFault) -> bool {
        self.ignored.contains(&fault)
    }
}

struct Channel {
    probe: Box<dyn TemperatureProbe>,
    offset: f64,
    samples: TempSamples,
    confidence: SensorConfidence,
}

/// Reads every thermocouple several times per period and publishes one
/// combined `record_temperature` per period.
pub struct ThermocoupleSampler {
    bus: EventBus,
    channels: Vec<Channel>,
    unit: TempUnit,
    samples_per_period: usize,
    period: Duration,
    ignore: IgnorePolicy,
}

impl ThermocoupleSampler {
    pub fn new(
        config: &SensorConfig,
        unit: TempUnit,
        error_limit: f64,
        bus: EventBus,
        probes: Vec<Box<dyn TemperatureProbe>>,
    ) -> Self {
        let samples_per_period = config.temperature_samples.max(1);
        let channels = probes
            .into_iter()
            .map(|probe| {
                let offset = config
                    .thermocouples
                    .iter()
                    .find(|tc| tc.name == probe.name())
                    .map_or(0.0, |tc| tc.offset);
                Channel {
                    probe,
                    offset,
                    samples: TempSamples::new(config.temperature_samples, config.heat_rate_samples),
                    confidence: SensorConfidence::new(samples_per_period * 2, error_limit),
                }
            })
            .collect();
        Self {
            bus,
            channels,
            unit,
            samples_per_period,
            period: Duration::try_from_secs_f64(config.period_secs).unwrap_or(DEFAULT_PERIOD),
            ignore: IgnorePolicy::new(config.ignore_faults.iter().copied()),
        }
    }

    /// Read every probe once.
    pub fn sample(&mut self, timestamp: SystemTime) {
        for channel in &mut self.channels {
            match channel.probe.read_celsius() {
                Ok(raw) => {
                    let converted = match self.unit {
                        TempUnit::Celsius => raw,
                        TempUnit::Fahrenheit => raw * 9.0 / 5.0 + 32.0,
                    };
                    channel
                        .samples
                        .add(timestamp, (converted + channel.offset).ceil());
                    channel.confidence.good();
                }
                Err(e) if self.ignore.is_ignored(e.fault) => {
                    error!("problem reading temp (ignored): {}", e);
                    channel.confidence.good();
                }
                Err(e) => {
                    error!("problem reading temp: {}", e);
                    channel.confidence.bad();
                }
            }
        }
    }

    /// Combined reading: probe temperatures and rates are averaged, the
    /// worst probe's error share is reported.
    pub fn reading(&self, timestamp: SystemTime) -> TemperatureReading {
        let mut thermocouples = BTreeMap::new();
        let mut error_percent: f64 = 0.0;
        for channel in &self.channels {
            error_percent = error_percent.max(channel.confidence.error_percent());
            if !channel.samples.is_empty() {
                thermocouples.insert(channel.probe.name().to_string(), channel.samples.average());
            }
        }
        let count = thermocouples.len().max(1) as f64;
        TemperatureReading {
            temperature: thermocouples.values().map(|r| r.temperature).sum::<f64>() / count,
            heat_rate: thermocouples.values().map(|r| r.heat_rate).sum::<f64>() / count,
            thermocouples,
            error_percent,
            timestamp,
        }
    }

    pub fn publish(&self, timestamp: SystemTime) {
        for channel in self.channels.iter().filter(|c| c.confidence.over_error_limit()) {
            warn!(
                "thermocouple {} failing {:.0}% of reads",
                channel.probe.name(),
                channel.confidence.error_percent()
            );
        }
        self.bus.record_temperature(&self.reading(timestamp));
    }
}

impl Collaborator for ThermocoupleSampler {
    fn name(&self) -> &'static str {
        "thermocouple"
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn poll(&mut self) {
        let spacing = self.period / self.samples_per_period as u32;
        for i in 0..self.samples_per_period {
            let then = Instant::now();
            self.sample(SystemTime::now());
            if i + 1 < self.samples_per_period {
                if let Some(rest) = spacing.checked_sub(then.elapsed()) {
                    thread::sleep(rest);
                }
            }
        }
        if self.channels.is_empty() {
            info!("no thermocouples configured");
            return;
        }
        self.publish(SystemTime::now());
    }
}
