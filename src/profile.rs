//! Firing schedules: piecewise-linear time → temperature curves.
//!
//! Profiles are stored in Celsius so they can be shared between kilns, and
//! converted to the operator's display unit when loaded. Conversion ceils
//! towards Fahrenheit and rounds towards Celsius, so typical Fahrenheit values
//! survive a save/load cycle.

use crate::error::ProfileError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// A measured temperature must exceed the time-zero target by this much
/// before a run will seek forward in the schedule.
const SEEK_THRESHOLD_DEG: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TempUnit {
    #[default]
    #[serde(rename = "C", alias = "c")]
    Celsius,
    #[serde(rename = "F", alias = "f")]
    Fahrenheit,
}

impl TempUnit {
    pub fn symbol(self) -> &'static str {
        match self {
            TempUnit::Celsius => "C",
            TempUnit::Fahrenheit => "F",
        }
    }

    /// Convert `temp` expressed in `self` into `to`.
    pub fn convert(self, temp: f64, to: TempUnit) -> f64 {
        match (self, to) {
            (TempUnit::Celsius, TempUnit::Fahrenheit) => c_to_f(temp),
            (TempUnit::Fahrenheit, TempUnit::Celsius) => f_to_c(temp),
            _ => temp,
        }
    }
}

pub fn c_to_f(temp: f64) -> f64 {
    (temp * 9.0 / 5.0 + 32.0).ceil()
}

pub fn f_to_c(temp: f64) -> f64 {
    ((temp - 32.0) * 5.0 / 9.0).round_ties_even()
}

/// One schedule point: `time` seconds into the firing, `temperature` in the
/// owning profile's unit. Serialized as a `[time, temperature]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, f64)", into = "(f64, f64)")]
pub struct FiringSegment {
    pub time: f64,
    pub temperature: f64,
}

impl FiringSegment {
    pub fn new(time: f64, temperature: f64) -> Self {
        Self { time, temperature }
    }
}

impl From<(f64, f64)> for FiringSegment {
    fn from((time, temperature): (f64, f64)) -> Self {
        Self { time, temperature }
    }
}

impl From<FiringSegment> for (f64, f64) {
    fn from(segment: FiringSegment) -> Self {
        (segment.time, segment.temperature)
    }
}

/// Display-only summary of a segment: `(rate per hour, temperature, hold seconds)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, f64, f64)", into = "(f64, f64, f64)")]
pub struct SegmentRate {
    pub rate_per_hour: f64,
    pub temperature: f64,
    pub hold_seconds: f64,
}

impl From<(f64, f64, f64)> for SegmentRate {
    fn from((rate_per_hour, temperature, hold_seconds): (f64, f64, f64)) -> Self {
        Self { rate_per_hour, temperature, hold_seconds }
    }
}

impl From<SegmentRate> for (f64, f64, f64) {
    fn from(rate: SegmentRate) -> Self {
        (rate.rate_per_hour, rate.temperature, rate.hold_seconds)
    }
}

fn legacy_unit() -> TempUnit {
    TempUnit::Fahrenheit
}

/// On-disk / on-wire form of a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub name: String,
    #[serde(default = "legacy_unit")]
    pub temp_units: TempUnit,
    pub data: Vec<FiringSegment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rates: Option<Vec<SegmentRate>>,
}

impl ProfileRecord {
    /// Convert every temperature into `unit`. No-op when already there.
    pub fn converted(mut self, unit: TempUnit) -> Self {
        if self.temp_units == unit {
            return self;
        }
        let from = self.temp_units;
        for segment in &mut self.data {
            segment.temperature = from.convert(segment.temperature, unit);
        }
        self.temp_units = unit;
        self.rates = None;
        self
    }

    pub fn with_rates(mut self) -> Self {
        self.rates = Some(compute_rates(&self.data));
        self
    }
}

/// Derive per-segment ramp rates. A ramp followed by a flat hold at the same
/// temperature is folded into one entry carrying the hold length.
pub fn compute_rates(data: &[FiringSegment]) -> Vec<SegmentRate> {
    let mut rates = Vec::new();
    let mut skip_hold = false;

    for i in 1..data.len() {
        if skip_hold {
            skip_hold = false;
            continue;
        }
        let temp = data[i].temperature;
        let secs = data[i].time;
        let since = secs - data[i - 1].time;
        let rate = if since > 0.0 {
            (3600.0 * (temp - data[i - 1].temperature) / since).round_ties_even()
        } else {
            0.0
        };

        if rate == 0.0 {
            rates.push(SegmentRate::from((0.0, temp, since)));
        } else if i + 1 < data.len() && data[i + 1].temperature == temp {
            let hold = data[i + 1].time - secs;
            rates.push(SegmentRate::from((rate, temp, hold)));
            skip_hold = true;
        } else {
            rates.push(SegmentRate::from((rate, temp, 0.0)));
        }
    }

    rates
}

/// An immutable firing schedule. Segments are kept sorted by time; equal
/// times are allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiringProfile {
    name: String,
    unit: TempUnit,
    segments: Vec<FiringSegment>,
}

impl FiringProfile {
    pub fn new(name: impl Into<String>, unit: TempUnit, mut segments: Vec<FiringSegment>) -> Self {
        segments.sort_by(|a, b| {
            a.time
                .total_cmp(&b.time)
                .then(a.temperature.total_cmp(&b.temperature))
        });
        Self {
            name: name.into(),
            unit,
            segments,
        }
    }

    pub fn from_record(record: ProfileRecord) -> Self {
        Self::new(record.name, record.temp_units, record.data)
    }

    pub fn to_record(&self) -> ProfileRecord {
        ProfileRecord {
            name: self.name.clone(),
            temp_units: self.unit,
            data: self.segments.clone(),
            rates: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> TempUnit {
        self.unit
    }

    pub fn segments(&self) -> &[FiringSegment] {
        &self.segments
    }

    /// Length of the schedule in seconds.
    pub fn duration(&self) -> f64 {
        self.segments
            .iter()
            .map(|s| s.time)
            .fold(0.0, f64::max)
    }

    /// Scheduled temperature `time` seconds into the firing, or 0 once the
    /// schedule has finished.
    pub fn target_temperature(&self, time: f64) -> f64 {
        let (first, last) = match (self.segments.first(), self.segments.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return 0.0,
        };
        if time > self.duration() {
            return 0.0;
        }
        if time < first.time {
            return first.temperature;
        }

        match self.segments.iter().position(|s| time < s.time) {
            Some(index) => {
                let prev = &self.segments[index - 1];
                let next = &self.segments[index];
                let incline = (next.temperature - prev.temperature) / (next.time - prev.time);
                prev.temperature + (time - prev.time) * incline
            }
            None => last.temperature,
        }
    }

    /// Solve `x = (y - y1)(x2 - x1)/(y2 - y1) + x1` for the line through two
    /// points. Returns 0 when the points are out of order or the segment is
    /// not strictly rising.
    pub fn intersection_x(y: f64, p1: FiringSegment, p2: FiringSegment) -> f64 {
        if p1.time > p2.time {
            return 0.0;
        }
        if p1.temperature >= p2.temperature {
            return 0.0;
        }
        (y - p1.temperature) * (p2.time - p1.time) / (p2.temperature - p1.temperature) + p1.time
    }

    /// Schedule time at which `temperature` is reached on a rising segment,
    /// or 0 when no segment crosses it. Only an exact flat hold at
    /// `temperature` stops the scan early, so with several rising crossings
    /// the last one wins.
    pub fn next_time_for_temperature(&self, temperature: f64) -> f64 {
        let mut time = 0.0;
        for pair in self.segments.windows(2) {
            let (prev, next) = (pair[0], pair[1]);
            if next.temperature >= temperature && prev.temperature <= temperature {
                time = Self::intersection_x(temperature, prev, next);
                if time == 0.0 && prev.temperature == next.temperature {
                    time = prev.time;
                    break;
                }
            }
        }
        time
    }

    /// How far to skip into the schedule when the kiln is already hot.
    pub fn seek_offset(&self, measured: f64) -> f64 {
        let start_target = self.target_temperature(0.0);
        if measured > start_target + SEEK_THRESHOLD_DEG {
            let start_at = self.next_time_for_temperature(measured);
            info!(
                "seek start in effect, starting at {:.0} s, {:.0} deg",
                start_at, measured
            );
            return start_at;
        }
        0.0
    }

    pub fn converted(&self, unit: TempUnit) -> Self {
        Self::from_record(self.to_record().converted(unit))
    }
}

impl std::fmt::Display for FiringProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// A directory of `<name>.json` profile records.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    directory: PathBuf,
    display_unit: TempUnit,
}

impl ProfileStore {
    pub fn new(directory: impl Into<PathBuf>, display_unit: TempUnit) -> Self {
        Self {
            directory: directory.into(),
            display_unit,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// File for profile `name`. Names are plain file names; anything that
    /// could leave the profile directory is rejected.
    pub fn path_for(&self, name: &str) -> Result<PathBuf, ProfileError> {
        let plain = Path::new(name)
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)));
        if name.is_empty() || !plain || name.contains(['/', '\\']) || name.contains("..") {
            return Err(ProfileError::InvalidName(name.to_string()));
        }
        if name.ends_with(".json") {
            Ok(self.directory.join(name))
        } else {
            Ok(self.directory.join(format!("{name}.json")))
        }
    }

    /// Read a record and convert it into the display unit, rates included.
    pub fn load_record(&self, name: &str) -> Result<ProfileRecord, ProfileError> {
        let path = self.path_for(name)?;
        let contents = fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ProfileError::NotFound(name.to_string()),
            _ => ProfileError::Io(e),
        })?;
        let record: ProfileRecord = serde_json::from_str(&contents)?;
        Ok(record.converted(self.display_unit).with_rates())
    }

    pub fn load(&self, name: &str) -> Result<FiringProfile, ProfileError> {
        self.load_record(name).map(FiringProfile::from_record)
    }

    /// Every readable profile in the directory. Unreadable files are logged
    /// and skipped.
    pub fn list(&self) -> Result<Vec<ProfileRecord>, ProfileError> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.directory)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load_record(stem) {
                Ok(record) => records.push(record),
                Err(e) => error!("skipping profile {}: {}", path.display(), e),
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Persist `record` in Celsius. Refuses to overwrite unless `force`.
    pub fn save(&self, record: ProfileRecord, force: bool) -> Result<PathBuf, ProfileError> {
        let path = self.path_for(&record.name)?;
        if !force && path.exists() {
            error!("could not write, {} already exists", path.display());
            return Err(ProfileError::AlreadyExists(record.name));
        }
        let mut stored = record.converted(TempUnit::Celsius);
        stored.rates = None;
        fs::write(&path, serde_json::to_string(&stored)?)?;
        info!("wrote {}", path.display());
        Ok(path)
    }

    pub fn delete(&self, name: &str) -> Result<(), ProfileError> {
        let path = self.path_for(name)?;
        fs::remove_file(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ProfileError::NotFound(name.to_string()),
            _ => ProfileError::Io(e),
        })?;
        info!("deleted {}", path.display());
        Ok(())
    }
}
