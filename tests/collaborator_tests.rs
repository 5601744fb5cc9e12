use kiln_controller::bus::*;
use kiln_controller::collaborators::*;
use kiln_controller::config::*;
use kiln_controller::error::{SensorError, SensorFault};
use kiln_controller::profile::TempUnit;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

struct ScriptedProbe {
    name: String,
    reads: VecDeque<Result<f64, SensorFault>>,
}

impl ScriptedProbe {
    fn boxed(name: &str, reads: Vec<Result<f64, SensorFault>>) -> Box<dyn TemperatureProbe> {
        Box::new(Self {
            name: name.to_string(),
            reads: reads.into(),
        })
    }
}

impl TemperatureProbe for ScriptedProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_celsius(&mut self) -> Result<f64, SensorError> {
        let next = self.reads.pop_front().unwrap_or(Err(SensorFault::Unknown));
        next.map_err(|fault| SensorError::new(self.name.clone(), fault))
    }
}

#[derive(Clone, Default)]
struct SharedInput(Arc<Mutex<VecDeque<bool>>>, Arc<AtomicBool>);

impl SharedInput {
    fn hold(&self, level: bool) {
        self.1.store(level, Ordering::SeqCst);
    }

    fn script(&self, levels: &[bool]) {
        self.0.lock().unwrap().extend(levels.iter().copied());
    }
}

impl DigitalInput for SharedInput {
    fn is_high(&mut self) -> bool {
        self.0
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.1.load(Ordering::SeqCst))
    }
}

#[derive(Clone, Default)]
struct SharedOutput(Arc<Mutex<Vec<bool>>>);

impl SharedOutput {
    fn levels(&self) -> Vec<bool> {
        self.0.lock().unwrap().clone()
    }
}

impl DigitalOutput for SharedOutput {
    fn set_high(&mut self, high: bool) {
        self.0.lock().unwrap().push(high);
    }
}

#[derive(Default)]
struct MetaLog(Mutex<Vec<Meta>>);

impl MetaObserver for MetaLog {
    fn record_meta(&self, meta: &Meta) {
        self.0.lock().unwrap().push(meta.clone());
    }
}

impl MetaLog {
    fn values(&self, key: &str) -> Vec<serde_json::Value> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| m.get(key).cloned())
            .collect()
    }
}

fn sensor_config(samples: usize) -> SensorConfig {
    SensorConfig {
        temperature_samples: samples,
        heat_rate_samples: samples,
        ..SensorConfig::default()
    }
}

fn at(secs: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(1_000 + secs)
}

#[test]
fn test_sampler_median_and_rate() {
    let probe = ScriptedProbe::boxed("main", vec![Ok(100.0), Ok(101.0), Ok(102.0)]);
    let mut sampler = ThermocoupleSampler::new(&sensor_config(5), TempUnit::Celsius, 30.0, EventBus::new(), vec![probe]);
    for i in 0..3 {
        sampler.sample(at(i));
    }
    let reading = sampler.reading(at(3));
    assert_eq!(reading.temperature, 101.0);
    assert_eq!(reading.heat_rate, 3600.0);
    assert_eq!(reading.error_percent, 0.0);
    assert_eq!(reading.thermocouples["main"].temperature, 101.0);
}

#[test]
fn test_sampler_applies_unit_and_offset() {
    let mut config = sensor_config(5);
    config.thermocouples[0].offset = 0.4;
    let probe = ScriptedProbe::boxed("main", vec![Ok(100.0)]);
    let mut sampler = ThermocoupleSampler::new(&config, TempUnit::Fahrenheit, 30.0, EventBus::new(), vec![probe]);
    sampler.sample(at(0));
    // 212.0 + 0.4, rounded up
    assert_eq!(sampler.reading(at(0)).temperature, 213.0);
}

#[test]
fn test_sampler_averages_probes() {
    let mut config = sensor_config(5);
    config.thermocouples = vec![
        ThermocoupleConfig {
            name: "top".to_string(),
            offset: 0.0,
        },
        ThermocoupleConfig {
            name: "bottom".to_string(),
            offset: 0.0,
        },
    ];
    let probes = vec![
        ScriptedProbe::boxed("top", vec![Ok(110.0)]),
        ScriptedProbe::boxed("bottom", vec![Ok(100.0)]),
    ];
    let mut sampler = ThermocoupleSampler::new(&config, TempUnit::Celsius, 30.0, EventBus::new(), probes);
    sampler.sample(at(0));
    let reading = sampler.reading(at(0));
    assert_eq!(reading.temperature, 105.0);
    assert_eq!(reading.thermocouples.len(), 2);
}

#[test]
fn test_sampler_counts_failed_reads() {
    let reads = vec![
        Ok(100.0),
        Err(SensorFault::ShortCircuit),
        Err(SensorFault::ShortCircuit),
        Err(SensorFault::ShortCircuit),
        Err(SensorFault::ShortCircuit),
    ];
    let probe = ScriptedProbe::boxed("main", reads);
    let mut sampler = ThermocoupleSampler::new(&sensor_config(5), TempUnit::Celsius, 30.0, EventBus::new(), vec![probe]);
    for i in 0..5 {
        sampler.sample(at(i));
    }
    let reading = sampler.reading(at(5));
    // four failures in a window of ten
    assert_eq!(reading.error_percent, 40.0);
    assert_eq!(reading.temperature, 100.0);
}

#[test]
fn test_sampler_ignored_faults_count_as_good() {
    let mut config = sensor_config(5);
    config.ignore_faults = vec![SensorFault::NotConnected];
    let reads = vec![Err(SensorFault::NotConnected); 5];
    let probe = ScriptedProbe::boxed("main", reads);
    let mut sampler = ThermocoupleSampler::new(&config, TempUnit::Celsius, 30.0, EventBus::new(), vec![probe]);
    for i in 0..5 {
        sampler.sample(at(i));
    }
    assert_eq!(sampler.reading(at(5)).error_percent, 0.0);
}

#[test]
fn test_sampler_publishes_reading() {
    let bus = EventBus::new();
    let (tx, rx) = mpsc::channel::<Event>();
    let _subs = bus.forward_to(tx);
    let probe = ScriptedProbe::boxed("main", vec![Ok(500.0)]);
    let mut sampler = ThermocoupleSampler::new(&sensor_config(5), TempUnit::Celsius, 30.0, bus, vec![probe]);
    sampler.sample(at(0));
    sampler.publish(at(1));

    match rx.try_recv().unwrap() {
        Event::Temperature(reading) => {
            assert_eq!(reading.temperature, 500.0);
            assert_eq!(reading.timestamp, at(1));
        }
        other => panic!("expected temperature, got {other:?}"),
    }
}

#[test]
fn test_ignore_policy() {
    let policy = IgnorePolicy::new([SensorFault::Voltage, SensorFault::TemperatureLow]);
    assert!(policy.is_ignored(SensorFault::Voltage));
    assert!(!policy.is_ignored(SensorFault::ShortCircuit));
    assert!(!IgnorePolicy::default().is_ignored(SensorFault::Voltage));
}

#[test]
fn test_temp_samples_rate_over_window() {
    let mut samples = TempSamples::new(10, 3);
    for (i, temp) in [100.0, 100.0, 110.0, 130.0].into_iter().enumerate() {
        samples.add(at(i as u64 * 10), temp);
    }
    // rates over the last three reads: 3600 and 7200 deg/h
    assert_eq!(samples.average().heat_rate, 5400.0);
}

fn estop(input: &SharedInput, bus: EventBus) -> EstopMonitor {
    EstopMonitor::new(&EstopConfig::default(), bus, Some(Box::new(input.clone())))
        .with_debounce_interval(Duration::ZERO)
}

#[test]
fn test_estop_release_and_press() {
    let bus = EventBus::new();
    let (tx, rx) = mpsc::channel::<Event>();
    let _subs = bus.forward_to(tx);
    let input = SharedInput::default();
    let mut monitor = estop(&input, bus);
    assert!(monitor.engaged());

    monitor.check();
    assert!(!monitor.engaged());
    match rx.try_recv().unwrap() {
        Event::ClearFailure(f) => assert_eq!(f.kind, FailureKind::EStop),
        other => panic!("expected clear, got {other:?}"),
    }

    monitor.check();
    assert!(rx.try_recv().is_err());

    input.hold(true);
    monitor.check();
    assert!(monitor.engaged());
    match rx.try_recv().unwrap() {
        Event::Failure(f) => {
            assert_eq!(f.kind, FailureKind::EStop);
            assert_eq!(f.reason, "E-stop engaged");
            assert_eq!(f.pattern, Pattern::Fail);
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
fn test_estop_bounce_is_ignored() {
    let bus = EventBus::new();
    let (tx, rx) = mpsc::channel::<Event>();
    let _subs = bus.forward_to(tx);
    let input = SharedInput::default();
    let mut monitor = estop(&input, bus);
    monitor.check();
    let _ = rx.try_recv();

    input.script(&[true, true, false]);
    monitor.check();
    assert!(!monitor.engaged());
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_estop_inverted_input() {
    let bus = EventBus::new();
    let input = SharedInput::default();
    input.hold(true);
    let config = EstopConfig {
        invert: true,
        ..EstopConfig::default()
    };
    let mut monitor = EstopMonitor::new(&config, bus, Some(Box::new(input.clone())))
        .with_debounce_interval(Duration::ZERO);
    monitor.check();
    assert!(!monitor.engaged());
    input.hold(false);
    monitor.check();
    assert!(monitor.engaged());
}

#[test]
fn test_estop_without_input_reports_released_once() {
    let bus = EventBus::new();
    let (tx, rx) = mpsc::channel::<Event>();
    let _subs = bus.forward_to(tx);
    let mut monitor = EstopMonitor::new(&EstopConfig::default(), bus, None);
    monitor.check();
    monitor.check();
    assert!(matches!(rx.try_recv(), Ok(Event::ClearFailure(_))));
    assert!(rx.try_recv().is_err());
    assert!(!monitor.engaged());
}

#[test]
fn test_heartbeat_falls_back_to_sos() {
    let bus = EventBus::new();
    let metas = Arc::new(MetaLog::default());
    let _meta = bus.subscribe_meta(metas.clone());
    let mut heartbeat = Heartbeat::new(&IndicatorConfig::default(), bus.clone(), None);

    assert_eq!(heartbeat.beat(), Pattern::Heartbeat);
    assert_eq!(heartbeat.beat(), Pattern::Heartbeat);
    assert_eq!(heartbeat.beat(), Pattern::Sos);
    assert_eq!(heartbeat.beat(), Pattern::Sos);

    bus.activity();
    assert_eq!(heartbeat.beat(), Pattern::Heartbeat);

    assert_eq!(metas.values("heartbeat"), vec!["Okay", "SOS", "Okay"]);
}

#[test]
fn test_caution_follows_failures() {
    let bus = EventBus::new();
    let metas = Arc::new(MetaLog::default());
    let _meta = bus.subscribe_meta(metas.clone());
    let caution = Caution::new(&IndicatorConfig::default(), bus.clone(), None);
    assert_eq!(caution.pattern(), Pattern::Off);

    bus.failure(&Failure::new(FailureKind::EmergencyTemperature, "too hot", Pattern::Fail2));
    assert_eq!(caution.pattern(), Pattern::Fail2);
    assert_eq!(caution.reason().as_deref(), Some("too hot"));

    bus.failure(&Failure::new(FailureKind::Other, "unspecified", Pattern::Off));
    assert_eq!(caution.pattern(), Pattern::Fail);

    bus.clear_failure(&Failure::new(FailureKind::Other, "fixed", Pattern::Off));
    assert_eq!(caution.pattern(), Pattern::Off);
    assert!(caution.reason().is_none());

    assert_eq!(metas.values("caution"), vec!["Okay", "Fail", "Fail", "Okay"]);
}

#[test]
fn test_led_respects_inversion() {
    let plain = SharedOutput::default();
    let _led = Led::new(Some(Box::new(plain.clone())), false);
    assert_eq!(plain.levels(), vec![false]);

    let inverted = SharedOutput::default();
    let _led = Led::new(Some(Box::new(inverted.clone())), true);
    assert_eq!(inverted.levels(), vec![true]);
}

#[test]
fn test_relay_heater_drives_every_output() {
    let first = SharedOutput::default();
    let second = SharedOutput::default();
    let outputs: Vec<Box<dyn DigitalOutput>> = vec![Box::new(first.clone()), Box::new(second.clone())];
    let heater = RelayHeater::new(outputs, false);
    assert!(!heater.is_on());

    heater.set_heat(true);
    assert!(heater.is_on());
    heater.set_heat(false);
    assert_eq!(first.levels(), vec![false, true, false]);
    assert_eq!(second.levels(), vec![false, true, false]);

    let inverted = SharedOutput::default();
    let outputs: Vec<Box<dyn DigitalOutput>> = vec![Box::new(inverted.clone())];
    let heater = RelayHeater::new(outputs, true);
    heater.set_heat(true);
    assert_eq!(inverted.levels(), vec![true, false]);
}

struct FixedAmbient {
    label: &'static str,
    value: Result<f64, SensorFault>,
}

impl AmbientProbe for FixedAmbient {
    fn label(&self) -> &str {
        self.label
    }

    fn read_celsius(&mut self) -> Result<f64, SensorError> {
        self.value.map_err(|fault| SensorError::new(self.label, fault))
    }
}

#[test]
fn test_ambient_reports_adjusted_labels() {
    let bus = EventBus::new();
    let metas = Arc::new(MetaLog::default());
    let _meta = bus.subscribe_meta(metas.clone());
    let config = AmbientConfig {
        probes: vec![AmbientProbeConfig {
            label: "room".to_string(),
            adjustment: 1.5,
        }],
        ..AmbientConfig::default()
    };
    let probes: Vec<Box<dyn AmbientProbe>> = vec![
        Box::new(FixedAmbient {
            label: "room",
            value: Ok(20.0),
        }),
        Box::new(FixedAmbient {
            label: "enclosure",
            value: Err(SensorFault::NotConnected),
        }),
    ];
    let mut sensor = AmbientSensor::new(&config, bus, probes);

    let meta = sensor.sample();
    assert_eq!(meta.len(), 1);
    assert_eq!(meta["ambient_room"], serde_json::json!(21.5));

    sensor.poll();
    assert_eq!(metas.values("ambient_room"), vec![serde_json::json!(21.5)]);
}

#[test]
fn test_simulated_kiln_probe() {
    let kiln = Arc::new(SimulatedKiln::new(SimulationConfig::default()));
    let mut probe = kiln.probe("main");
    assert_eq!(probe.name(), "main");
    let temp = probe.read_celsius().unwrap();
    assert!((temp - 25.0).abs() < 1.0);

    kiln.set_heat(true);
    thread::sleep(Duration::from_millis(20));
    kiln.set_heat(false);
    assert!(kiln.temperature() >= 25.0);
}

struct Ticker {
    count: Arc<AtomicUsize>,
}

impl Collaborator for Ticker {
    fn name(&self) -> &'static str {
        "ticker"
    }

    fn period(&self) -> Duration {
        Duration::from_millis(10)
    }

    fn poll(&mut self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_spawn_polls_periodically() {
    let count = Arc::new(AtomicUsize::new(0));
    let _handle = spawn(Ticker {
        count: Arc::clone(&count),
    })
    .unwrap();
    thread::sleep(Duration::from_millis(200));
    assert!(count.load(Ordering::SeqCst) >= 2);
}
