use kiln_controller::bus::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

struct Recorder {
    tag: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn new(tag: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            tag,
            log: Arc::clone(log),
        })
    }

    fn push(&self, entry: String) {
        self.log.lock().unwrap().push(format!("{}:{}", self.tag, entry));
    }
}

impl TemperatureObserver for Recorder {
    fn record_temperature(&self, reading: &TemperatureReading) {
        self.push(format!("{}", reading.temperature));
    }
}

impl FailureObserver for Recorder {
    fn failure(&self, failure: &Failure) {
        self.push(format!("fail {}", failure.reason));
    }

    fn clear_failure(&self, failure: &Failure) {
        self.push(format!("clear {}", failure.reason));
    }
}

impl Actuator for Recorder {
    fn set_heat(&self, on: bool) {
        self.push(format!("heat {on}"));
    }
}

#[derive(Default)]
struct Counter(AtomicUsize);

impl ActivityObserver for Counter {
    fn activity(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl StartObserver for Counter {
    fn on_start(&self) {
        self.0.fetch_add(10, Ordering::SeqCst);
    }
}

#[test]
fn test_publish_reaches_subscribers_in_order() {
    let bus = EventBus::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let _a = bus.subscribe_temperature(Recorder::new("a", &log));
    let _b = bus.subscribe_temperature(Recorder::new("b", &log));

    bus.record_temperature(&TemperatureReading::single(100.0, SystemTime::now()));
    bus.record_temperature(&TemperatureReading::single(101.0, SystemTime::now()));

    assert_eq!(
        *log.lock().unwrap(),
        vec!["a:100", "b:100", "a:101", "b:101"]
    );
}

#[test]
fn test_publish_without_subscribers_is_noop() {
    let bus = EventBus::new();
    bus.record_temperature(&TemperatureReading::single(100.0, SystemTime::now()));
    bus.failure(&Failure::new(FailureKind::Other, "nobody listening", Pattern::Fail));
    bus.set_heat(true);
    bus.activity();
    assert_eq!(bus.subscriber_count(EventFamily::Temperature), 0);
}

#[test]
fn test_unsubscribe_stops_delivery() {
    let bus = EventBus::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let first = bus.subscribe_actuator(Recorder::new("a", &log));
    let _second = bus.subscribe_actuator(Recorder::new("b", &log));
    assert_eq!(bus.subscriber_count(EventFamily::Actuator), 2);

    assert!(bus.unsubscribe(first));
    assert!(!bus.unsubscribe(first));
    bus.set_heat(true);

    assert_eq!(*log.lock().unwrap(), vec!["b:heat true"]);
}

#[test]
fn test_clones_share_registry() {
    let bus = EventBus::new();
    let counter = Arc::new(Counter::default());
    let _activity = bus.subscribe_activity(counter.clone());
    let _start = bus.clone().subscribe_start(counter.clone());

    let publisher = bus.clone();
    publisher.activity();
    publisher.activity();
    publisher.start();

    assert_eq!(counter.0.load(Ordering::SeqCst), 12);
}

#[test]
fn test_failure_and_clear_reach_observer() {
    let bus = EventBus::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let _sub = bus.subscribe_failure(Recorder::new("f", &log));

    bus.failure(&Failure::new(FailureKind::EStop, "E-stop engaged", Pattern::Fail));
    bus.clear_failure(&Failure::new(FailureKind::EStop, "E-stop released", Pattern::Off));

    assert_eq!(
        *log.lock().unwrap(),
        vec!["f:fail E-stop engaged", "f:clear E-stop released"]
    );
}

struct Republisher {
    bus: EventBus,
}

impl TemperatureObserver for Republisher {
    fn record_temperature(&self, reading: &TemperatureReading) {
        self.bus.record_meta_value("seen", reading.temperature);
    }
}

struct MetaLog(Mutex<Vec<Meta>>);

impl MetaObserver for MetaLog {
    fn record_meta(&self, meta: &Meta) {
        self.0.lock().unwrap().push(meta.clone());
    }
}

#[test]
fn test_subscriber_may_publish_from_callback() {
    let bus = EventBus::new();
    let metas = Arc::new(MetaLog(Mutex::new(Vec::new())));
    let _meta = bus.subscribe_meta(metas.clone());
    let _republish = bus.subscribe_temperature(Arc::new(Republisher { bus: bus.clone() }));

    bus.record_temperature(&TemperatureReading::single(42.0, SystemTime::now()));

    let seen = metas.0.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["seen"], serde_json::json!(42.0));
}

#[test]
fn test_forwarder_delivers_owned_events() {
    let bus = EventBus::new();
    let (tx, rx) = mpsc::channel::<Event>();
    let subs = bus.forward_to(tx);
    assert_eq!(subs.len(), 3);

    let reading = TemperatureReading::single(250.0, SystemTime::now());
    bus.record_temperature(&reading);
    bus.record_meta_value("ambient_room", 21.5);
    let failure = Failure::new(FailureKind::SensorConfidence, "too many errors", Pattern::Fail3);
    bus.failure(&failure);
    bus.clear_failure(&failure);

    assert_eq!(rx.try_recv().unwrap(), Event::Temperature(reading));
    match rx.try_recv().unwrap() {
        Event::Meta(meta) => assert_eq!(meta["ambient_room"], serde_json::json!(21.5)),
        other => panic!("expected meta, got {other:?}"),
    }
    assert_eq!(rx.try_recv().unwrap(), Event::Failure(failure.clone()));
    assert_eq!(rx.try_recv().unwrap(), Event::ClearFailure(failure));
    assert!(rx.try_recv().is_err());

    for sub in subs {
        assert!(bus.unsubscribe(sub));
    }
    bus.record_temperature(&TemperatureReading::single(1.0, SystemTime::now()));
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_forwarder_survives_closed_receiver() {
    let bus = EventBus::new();
    let (tx, rx) = mpsc::channel::<Event>();
    let _subs = bus.forward_to(tx);
    drop(rx);
    bus.record_temperature(&TemperatureReading::single(1.0, SystemTime::now()));
}

#[test]
fn test_pattern_serializes_lowercase() {
    assert_eq!(serde_json::to_string(&Pattern::Fail2).unwrap(), "\"fail2\"");
    assert_eq!(serde_json::to_string(&Pattern::Sos).unwrap(), "\"sos\"");
}
