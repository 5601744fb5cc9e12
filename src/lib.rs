//! # Kiln Controller
//!
//! A closed-loop kiln temperature controller: it follows a firing schedule
//! by switching the heating elements through a time-proportioned relay,
//! while sensor and interlock collaborators can suppress heating at any time.
//!
//! ## Features
//!
//! - **Firing profiles**: piecewise-linear schedules with interpolation and temperature seek
//! - **PID control**: saturating control window, optional low-temperature throttle
//! - **Recoverable runs**: Idle/Running/Paused lifecycle with a durable crash-recovery snapshot
//! - **Catch-up**: the schedule waits for a kiln that falls behind or runs ahead
//! - **Safety interlocks**: emergency temperature ceiling, sensor confidence, e-stop
//! - **Event bus**: typed publish/subscribe between independently scheduled components
//!
//! ## Quick Start
//!
//! ```rust
//! use kiln_controller::{FiringProfile, FiringSegment, TempUnit};
//!
//! let profile = FiringProfile::new(
//!     "bisque",
//!     TempUnit::Fahrenheit,
//!     vec![
//!         FiringSegment::new(0.0, 70.0),
//!         FiringSegment::new(3600.0, 200.0),
//!         FiringSegment::new(10800.0, 200.0),
//!     ],
//! );
//!
//! assert_eq!(profile.target_temperature(1800.0), 135.0);
//! assert_eq!(profile.target_temperature(20000.0), 0.0);
//! ```
//!
//! ## Architecture
//!
//! - [`profile`] - Firing schedules, unit conversion and profile storage
//! - [`pid`] - PID control law and duty-cycle split
//! - [`bus`] - Event bus and observer traits
//! - [`state`] - Oven state aggregate, status surface and restart snapshot
//! - [`controller`] - The control loop
//! - [`collaborators`] - Thermocouple, e-stop, indicators, ambient probes, heaters
//! - [`config`] - Startup configuration
//! - [`protocol`] - Operator command protocol

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod bus;
pub mod collaborators;
pub mod config;
pub mod controller;
pub mod error;
pub mod pid;
pub mod profile;
pub mod protocol;
pub mod state;

pub use bus::{Event, EventBus, Failure, FailureKind, Pattern, TemperatureReading};
pub use config::KilnConfig;
pub use controller::{ControlCommand, ControlSettings, Controller, Message, TickOutcome};
pub use pid::{HeatCycle, PidController, PidGains};
pub use profile::{FiringProfile, FiringSegment, ProfileRecord, ProfileStore, TempUnit};
pub use state::{Lifecycle, OvenState, OvenStatus, SnapshotStore};
