use super::{AmbientProbe, Collaborator};
use crate::bus::{EventBus, Meta};
use crate::config::AmbientConfig;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_PERIOD: Duration = Duration::from_secs(60);

struct Labelled {
    probe: Box<dyn AmbientProbe>,
    adjustment: f64,
}

/// Room and enclosure temperatures, reported as `ambient_<label>` metrics.
pub struct AmbientSensor {
    bus: EventBus,
    probes: Vec<Labelled>,
    period: Duration,
    verbose: bool,
}

impl AmbientSensor {
    pub fn new(config: &AmbientConfig, bus: EventBus, probes: Vec<Box<dyn AmbientProbe>>) -> Self {
        let probes = probes
            .into_iter()
            .map(|probe| {
                let adjustment = config
                    .probes
                    .iter()
                    .find(|p| p.label == probe.label())
                    .map_or(0.0, |p| p.adjustment);
                Labelled { probe, adjustment }
            })
            .collect();
        Self {
            bus,
            probes,
            period: Duration::try_from_secs_f64(config.period_secs).unwrap_or(DEFAULT_PERIOD),
            verbose: config.verbose,
        }
    }

    /// Read every probe; failed reads are logged and left out.
    pub fn sample(&mut self) -> Meta {
        let mut meta = Meta::new();
        for labelled in &mut self.probes {
            let label = labelled.probe.label().to_string();
            match labelled.probe.read_celsius() {
                Ok(temp) => {
                    let temp = temp + labelled.adjustment;
                    if self.verbose {
                        info!("{:12} {:8.1}C", label, temp);
                    }
                    meta.insert(format!("ambient_{label}"), serde_json::json!(temp));
                }
                Err(e) => warn!("ambient probe {} unreadable: {}", label, e),
            }
        }
        meta
    }
}

impl Collaborator for AmbientSensor {
    fn name(&self) -> &'static str {
        "ambient"
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn poll(&mut self) {
        let meta = self.sample();
        if !meta.is_empty() {
            self.bus.record_meta(&meta);
        }
    }
}
