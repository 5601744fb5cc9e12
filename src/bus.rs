//! Publish/subscribe registry connecting the controller and its collaborators.
//!
//! One bus is built at startup and cloned into every component. Each event
//! family has its own observer trait and subscriber list. Publishing calls
//! every subscriber of that family synchronously, in registration order, on
//! the publisher's thread; publishing with no subscribers does nothing.
//!
//! ```text
//!  thermocouple ──record_temperature──┐
//!  e-stop ────────failure/clear───────┤        ┌──────────────┐
//!  ambient ───────record_meta─────────┼──bus──▶│ ChannelForwarder ──mpsc──▶ controller thread
//!  indicators ◀───failure/activity────┤        └──────────────┘
//!  relay heater ◀──set_heat───────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::SystemTime;

/// Arbitrary named metrics merged into the status surface.
pub type Meta = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ProbeReading {
    pub temperature: f64,
    pub heat_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReading {
    pub temperature: f64,
    /// Degrees per hour.
    pub heat_rate: f64,
    pub thermocouples: BTreeMap<String, ProbeReading>,
    /// Share of failed reads in the sensor confidence window, 0..=100.
    pub error_percent: f64,
    pub timestamp: SystemTime,
}

impl TemperatureReading {
    pub fn single(temperature: f64, timestamp: SystemTime) -> Self {
        Self {
            temperature,
            heat_rate: 0.0,
            thermocouples: BTreeMap::new(),
            error_percent: 0.0,
            timestamp,
        }
    }
}

/// Indicator blink pattern requested alongside a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pattern {
    Off,
    Fail,
    Fail1,
    Fail2,
    Fail3,
    Fail4,
    Fail5,
    Fail6,
    Heartbeat,
    Sos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Measured temperature above the absolute ceiling.
    EmergencyTemperature,
    /// Too many failed sensor reads in the confidence window.
    SensorConfidence,
    EStop,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub reason: String,
    pub pattern: Pattern,
    pub kind: FailureKind,
}

impl Failure {
    pub fn new(kind: FailureKind, reason: impl Into<String>, pattern: Pattern) -> Self {
        Self {
            reason: reason.into(),
            pattern,
            kind,
        }
    }
}

pub trait TemperatureObserver: Send + Sync {
    fn record_temperature(&self, reading: &TemperatureReading);
}

pub trait MetaObserver: Send + Sync {
    fn record_meta(&self, meta: &Meta);
}

pub trait FailureObserver: Send + Sync {
    fn failure(&self, failure: &Failure);
    fn clear_failure(&self, failure: &Failure);
}

/// Liveness ping from the control loop; drives the heartbeat indicator.
pub trait ActivityObserver: Send + Sync {
    fn activity(&self);
}

pub trait StartObserver: Send + Sync {
    fn on_start(&self);
}

/// Heating element output.
pub trait Actuator: Send + Sync {
    fn set_heat(&self, on: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventFamily {
    Temperature,
    Meta,
    Failure,
    Activity,
    Start,
    Actuator,
}

/// Returned by every `subscribe_*` call; pass back to [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "dropping the handle makes the subscription permanent"]
pub struct Subscription {
    pub id: u64,
    pub family: EventFamily,
}

type Subscribers<T> = RwLock<Vec<(u64, Arc<T>)>>;

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    temperature: Subscribers<dyn TemperatureObserver>,
    meta: Subscribers<dyn MetaObserver>,
    failure: Subscribers<dyn FailureObserver>,
    activity: Subscribers<dyn ActivityObserver>,
    start: Subscribers<dyn StartObserver>,
    actuator: Subscribers<dyn Actuator>,
}

fn add<T: ?Sized>(list: &Subscribers<T>, id: u64, subscriber: Arc<T>) {
    list.write()
        .unwrap_or_else(PoisonError::into_inner)
        .push((id, subscriber));
}

fn remove<T: ?Sized>(list: &Subscribers<T>, id: u64) -> bool {
    let mut guard = list.write().unwrap_or_else(PoisonError::into_inner);
    let before = guard.len();
    guard.retain(|(sid, _)| *sid != id);
    guard.len() != before
}

/// Copy the subscriber list so callbacks run without the lock held and may
/// themselves publish or subscribe.
fn snapshot<T: ?Sized>(list: &Subscribers<T>) -> Vec<Arc<T>> {
    list.read()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|(_, s)| Arc::clone(s))
        .collect()
}

fn count<T: ?Sized>(list: &Subscribers<T>) -> usize {
    list.read().unwrap_or_else(PoisonError::into_inner).len()
}

#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Registry>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("temperature", &self.subscriber_count(EventFamily::Temperature))
            .field("meta", &self.subscriber_count(EventFamily::Meta))
            .field("failure", &self.subscriber_count(EventFamily::Failure))
            .field("activity", &self.subscriber_count(EventFamily::Activity))
            .field("actuator", &self.subscriber_count(EventFamily::Actuator))
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_subscription(&self, family: EventFamily) -> Subscription {
        Subscription {
            id: self.registry.next_id.fetch_add(1, Ordering::Relaxed),
            family,
        }
    }

    pub fn subscribe_temperature(&self, observer: Arc<dyn TemperatureObserver>) -> Subscription {
        let sub = self.next_subscription(EventFamily::Temperature);
        add(&self.registry.temperature, sub.id, observer);
        sub
    }

    pub fn subscribe_meta(&self, observer: Arc<dyn MetaObserver>) -> Subscription {
        let sub = self.next_subscription(EventFamily::Meta);
        add(&self.registry.meta, sub.id, observer);
        sub
    }

    pub fn subscribe_failure(&self, observer: Arc<dyn FailureObserver>) -> Subscription {
        let sub = self.next_subscription(EventFamily::Failure);
        add(&self.registry.failure, sub.id, observer);
        sub
    }

    pub fn subscribe_activity(&self, observer: Arc<dyn ActivityObserver>) -> Subscription {
        let sub = self.next_subscription(EventFamily::Activity);
        add(&self.registry.activity, sub.id, observer);
        sub
    }

    pub fn subscribe_start(&self, observer: Arc<dyn StartObserver>) -> Subscription {
        let sub = self.next_subscription(EventFamily::Start);
        add(&self.registry.start, sub.id, observer);
        sub
    }

    pub fn subscribe_actuator(&self, actuator: Arc<dyn Actuator>) -> Subscription {
        let sub = self.next_subscription(EventFamily::Actuator);
        add(&self.registry.actuator, sub.id, actuator);
        sub
    }

    /// Returns false when the handle was already removed.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let registry = &self.registry;
        match subscription.family {
            EventFamily::Temperature => remove(&registry.temperature, subscription.id),
            EventFamily::Meta => remove(&registry.meta, subscription.id),
            EventFamily::Failure => remove(&registry.failure, subscription.id),
            EventFamily::Activity => remove(&registry.activity, subscription.id),
            EventFamily::Start => remove(&registry.start, subscription.id),
            EventFamily::Actuator => remove(&registry.actuator, subscription.id),
        }
    }

    pub fn subscriber_count(&self, family: EventFamily) -> usize {
        let registry = &self.registry;
        match family {
            EventFamily::Temperature => count(&registry.temperature),
            EventFamily::Meta => count(&registry.meta),
            EventFamily::Failure => count(&registry.failure),
            EventFamily::Activity => count(&registry.activity),
            EventFamily::Start => count(&registry.start),
            EventFamily::Actuator => count(&registry.actuator),
        }
    }

    pub fn record_temperature(&self, reading: &TemperatureReading) {
        for observer in snapshot(&self.registry.temperature) {
            observer.record_temperature(reading);
        }
    }

    pub fn record_meta(&self, meta: &Meta) {
        for observer in snapshot(&self.registry.meta) {
            observer.record_meta(meta);
        }
    }

    /// Shorthand for a single-key `record_meta`.
    pub fn record_meta_value(&self, key: &str, value: impl Into<serde_json::Value>) {
        let mut meta = Meta::new();
        meta.insert(key.to_string(), value.into());
        self.record_meta(&meta);
    }

    pub fn failure(&self, failure: &Failure) {
        for observer in snapshot(&self.registry.failure) {
            observer.failure(failure);
        }
    }

    pub fn clear_failure(&self, failure: &Failure) {
        for observer in snapshot(&self.registry.failure) {
            observer.clear_failure(failure);
        }
    }

    pub fn activity(&self) {
        for observer in snapshot(&self.registry.activity) {
            observer.activity();
        }
    }

    pub fn start(&self) {
        for observer in snapshot(&self.registry.start) {
            observer.on_start();
        }
    }

    pub fn set_heat(&self, on: bool) {
        for actuator in snapshot(&self.registry.actuator) {
            actuator.set_heat(on);
        }
    }

    /// Subscribe a forwarder that turns temperature, meta and failure
    /// events into owned [`Event`] messages on `tx`.
    pub fn forward_to<T>(&self, tx: Sender<T>) -> Vec<Subscription>
    where
        T: From<Event> + Send + 'static,
    {
        let forwarder = Arc::new(ChannelForwarder::new(tx));
        vec![
            self.subscribe_temperature(forwarder.clone()),
            self.subscribe_meta(forwarder.clone()),
            self.subscribe_failure(forwarder),
        ]
    }
}

/// Owned copy of a bus event, as delivered to a single-writer consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Temperature(TemperatureReading),
    Meta(Meta),
    Failure(Failure),
    ClearFailure(Failure),
}

pub struct ChannelForwarder<T> {
    tx: Mutex<Sender<T>>,
}

impl<T: From<Event>> ChannelForwarder<T> {
    pub fn new(tx: Sender<T>) -> Self {
        Self { tx: Mutex::new(tx) }
    }

    fn send(&self, event: Event) {
        // A closed receiver means the consumer is gone; nothing left to notify.
        let _ = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(T::from(event));
    }
}

impl<T: From<Event> + Send> TemperatureObserver for ChannelForwarder<T> {
    fn record_temperature(&self, reading: &TemperatureReading) {
        self.send(Event::Temperature(reading.clone()));
    }
}

impl<T: From<Event> + Send> MetaObserver for ChannelForwarder<T> {
    fn record_meta(&self, meta: &Meta) {
        self.send(Event::Meta(meta.clone()));
    }
}

impl<T: From<Event> + Send> FailureObserver for ChannelForwarder<T> {
    fn failure(&self, failure: &Failure) {
        self.send(Event::Failure(failure.clone()));
    }

    fn clear_failure(&self, failure: &Failure) {
        self.send(Event::ClearFailure(failure.clone()));
    }
}
