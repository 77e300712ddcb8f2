//! Quaternion attitude estimation for the flight controller.
//!
//! An Unscented Kalman Filter fuses gyro, accelerometer and magnetometer
//! samples into a unit-quaternion attitude. The estimator core lives under
//! [`drivers`]; [`tasks`] holds the periodic loop that feeds it and publishes
//! [`state::AttitudeState`] snapshots for the control loops.
#![cfg_attr(not(test), no_std)]

#[macro_use]
mod logging;
mod math;

pub mod config;
pub mod drivers;
pub mod state;
pub mod tasks;

pub use config::{AhrsConfig, ConfigError, GeomagneticReference};
pub use drivers::attitude::{AttitudeEstimator, EstimatorError, EstimatorEvent};
pub use state::{AttitudeHealth, AttitudeMailbox, AttitudeState, ImuSample};
