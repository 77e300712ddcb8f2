//! Attitude estimator: wraps the quaternion UKF with the runtime policy the
//! fast loop needs.
//!
//! Per cycle the magnetometer is hard-iron corrected, accel and mag are
//! pre-filtered and the UKF is stepped with the gyro as control input. When
//! either field vector is unusable the cycle runs as a time update only.
//!
//! A failed cycle never propagates: the sample is dropped, the filter is
//! reseeded from the coarse initializer (or the last good quaternion if the
//! sample cannot be aligned) with startup covariances, and the failure is
//! counted. After `max_consecutive_failures` in a row the estimate is flagged
//! [`AttitudeHealth::Stale`].
use core::fmt;

use heapless::Deque;

use super::ahrs::{AttitudeUkf, EulerAngles, FieldProjection, Quaternion, QuaternionKinematics};
use super::align::{self, AlignError};
use super::filter::Vector3Lpf;
use super::matrix::{Vector, ZERO_LENGTH};
use super::ukf::UkfError;
use crate::config::{AhrsConfig, ConfigError};
use crate::state::{AttitudeHealth, AttitudeState, ImuSample};

/// Events kept for the telemetry side; the oldest is dropped when full.
pub const EVENT_CAPACITY: usize = 8;

// ── Errors / events ──────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EstimatorError {
    Config(ConfigError),
    Align(AlignError),
}

impl From<ConfigError> for EstimatorError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<AlignError> for EstimatorError {
    fn from(e: AlignError) -> Self {
        Self::Align(e)
    }
}

impl fmt::Display for EstimatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "invalid configuration: {}", e),
            Self::Align(e) => write!(f, "initial alignment failed: {}", e),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EstimatorEvent {
    /// Filter reseeded after a failed cycle; `count` is the running total.
    Reset { cause: UkfError, count: u32 },
    Stale { failures: u32 },
    Converged { cycle: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StepOutcome {
    /// Full predict + correct.
    Updated,
    /// Field vectors unusable; time update only.
    Predicted,
    /// Cycle failed and the filter was reseeded.
    Reset(UkfError),
}

fn usable(v: &[f32; 3]) -> bool {
    v.iter().all(|c| c.is_finite()) && Vector::from_array(*v).norm() > ZERO_LENGTH
}

// ── Estimator ────────────────────────────────────────────────────────────────

pub struct AttitudeEstimator {
    config: AhrsConfig,
    ukf: AttitudeUkf,
    accel_lpf: Vector3Lpf,
    mag_lpf: Vector3Lpf,
    /// Raw sample of the last cycle, mag already hard-iron corrected.
    last_sample: ImuSample,
    last_good: Quaternion,
    health: AttitudeHealth,
    good_cycles: u32,
    consecutive_failures: u32,
    reset_count: u32,
    cycle: u32,
    events: Deque<EstimatorEvent, EVENT_CAPACITY>,
}

impl AttitudeEstimator {
    /// Validate `config`, align on one sample and build the filter.
    pub fn new(config: AhrsConfig, accel: [f32; 3], mag: [f32; 3]) -> Result<Self, EstimatorError> {
        config.validate()?;
        let mag = compensate(&config, mag);
        let q0 = align::coarse_quaternion(accel, mag)?;
        let projection = FieldProjection::new(config.gravity, &config.geomagnetic)?;

        let ukf = AttitudeUkf::new(
            q0.to_vector(),
            config.initial_covariance(),
            config.process_noise(),
            config.measurement_noise(),
            QuaternionKinematics { dt: config.dt },
            projection,
            config.ukf,
        );

        let e = q0.to_euler();
        log_info!(
            "attitude aligned: roll={} pitch={} yaw={}",
            e.roll,
            e.pitch,
            e.yaw
        );

        Ok(Self {
            config,
            ukf,
            accel_lpf: Vector3Lpf::new(config.prefilter),
            mag_lpf: Vector3Lpf::new(config.prefilter),
            last_sample: ImuSample {
                gyro: [0.0; 3],
                accel,
                mag,
            },
            last_good: q0,
            health: AttitudeHealth::Converging,
            good_cycles: 0,
            consecutive_failures: 0,
            reset_count: 0,
            cycle: 0,
            events: Deque::new(),
        })
    }

    /// Run one estimator cycle.
    pub fn step(&mut self, sample: &ImuSample) -> StepOutcome {
        self.cycle = self.cycle.wrapping_add(1);
        let mag = compensate(&self.config, sample.mag);
        self.last_sample = ImuSample {
            gyro: sample.gyro,
            accel: sample.accel,
            mag,
        };

        // Non-finite samples must not reach the filters' state.
        let accel = usable(&sample.accel).then(|| self.accel_lpf.filter(sample.accel));
        let mag = usable(&mag).then(|| self.mag_lpf.filter(mag));
        let u = Vector::from_array(sample.gyro);

        let result = match (accel, mag) {
            (Some(a), Some(m)) => {
                let y = Vector::from_array([a[0], a[1], a[2], m[0], m[1], m[2]]);
                self.ukf.update(&y, &u).map(|()| StepOutcome::Updated)
            }
            _ => self.ukf.predict(&u).map(|()| StepOutcome::Predicted),
        };

        match result {
            Ok(outcome) => {
                self.on_success();
                outcome
            }
            Err(e) => {
                self.recover(e);
                StepOutcome::Reset(e)
            }
        }
    }

    fn on_success(&mut self) {
        if let Ok(q) = Quaternion::from_vector(self.ukf.state()).normalized() {
            self.last_good = q;
        }
        self.consecutive_failures = 0;
        if self.health == AttitudeHealth::Healthy {
            return;
        }
        if self.health == AttitudeHealth::Stale {
            self.health = AttitudeHealth::Converging;
        }
        self.good_cycles = self.good_cycles.saturating_add(1);
        if self.good_cycles >= self.config.reconverge_cycles {
            self.health = AttitudeHealth::Healthy;
            log_info!("attitude converged at cycle {}", self.cycle);
            self.push_event(EstimatorEvent::Converged { cycle: self.cycle });
        }
    }

    fn recover(&mut self, cause: UkfError) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.reset_count = self.reset_count.saturating_add(1);
        log_warn!(
            "attitude ukf failed: {:?}, reset #{}",
            cause,
            self.reset_count
        );

        let seed = align::coarse_quaternion(self.last_sample.accel, self.last_sample.mag)
            .unwrap_or(self.last_good);
        self.ukf.reset(
            seed.to_vector(),
            self.config.initial_covariance(),
            self.config.process_noise(),
            self.config.measurement_noise(),
        );
        self.accel_lpf.reset();
        self.mag_lpf.reset();
        self.good_cycles = 0;
        self.push_event(EstimatorEvent::Reset {
            cause,
            count: self.reset_count,
        });

        if self.consecutive_failures >= self.config.max_consecutive_failures.max(1) {
            if self.health != AttitudeHealth::Stale {
                self.health = AttitudeHealth::Stale;
                log_error!(
                    "attitude stale after {} consecutive failures",
                    self.consecutive_failures
                );
                self.push_event(EstimatorEvent::Stale {
                    failures: self.consecutive_failures,
                });
            }
        } else {
            self.health = AttitudeHealth::Converging;
        }
    }

    fn push_event(&mut self, event: EstimatorEvent) {
        if self.events.is_full() {
            self.events.pop_front();
        }
        let _ = self.events.push_back(event);
    }

    pub fn pop_event(&mut self) -> Option<EstimatorEvent> {
        self.events.pop_front()
    }

    // ── Read-only accessors ──────────────────────────────────────────────────

    /// Current estimate, normalised.
    pub fn quaternion(&self) -> Quaternion {
        Quaternion::from_vector(self.ukf.state())
            .normalized()
            .unwrap_or(self.last_good)
    }

    pub fn euler(&self) -> EulerAngles {
        self.quaternion().to_euler()
    }

    pub fn health(&self) -> AttitudeHealth {
        self.health
    }

    pub fn reset_count(&self) -> u32 {
        self.reset_count
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    pub fn config(&self) -> &AhrsConfig {
        &self.config
    }

    pub fn ukf(&self) -> &AttitudeUkf {
        &self.ukf
    }

    /// Unfiltered pitch from the last accelerometer sample.
    pub fn instant_pitch(&self) -> Result<f32, AlignError> {
        align::instant_pitch(self.last_sample.accel)
    }

    /// Unfiltered roll from the last accelerometer sample.
    pub fn instant_roll(&self) -> Result<f32, AlignError> {
        align::instant_roll(self.last_sample.accel)
    }

    /// Unfiltered tilt-compensated heading from the last sample.
    pub fn instant_yaw(&self) -> Result<f32, AlignError> {
        align::instant_yaw(self.last_sample.accel, self.last_sample.mag)
    }

    pub fn snapshot(&self) -> AttitudeState {
        let quaternion = self.quaternion();
        let e = quaternion.to_euler();
        AttitudeState {
            quaternion,
            roll_rad: e.roll,
            pitch_rad: e.pitch,
            yaw_rad: e.yaw,
            health: self.health,
            reset_count: self.reset_count,
            cycle: self.cycle,
        }
    }
}

fn compensate(config: &AhrsConfig, mag: [f32; 3]) -> [f32; 3] {
    [
        mag[0] - config.hard_iron[0],
        mag[1] - config.hard_iron[1],
        mag[2] - config.hard_iron[2],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::ukf::ModelError;
    use crate::math;
    use approx::assert_abs_diff_eq;

    const LEVEL_ACCEL: [f32; 3] = [0.0, 0.0, 1.0];
    const NORTH_MAG: [f32; 3] = [1.0, 0.0, 0.0];

    fn level_sample() -> ImuSample {
        ImuSample {
            gyro: [0.0; 3],
            accel: LEVEL_ACCEL,
            mag: NORTH_MAG,
        }
    }

    fn nan_gyro_sample() -> ImuSample {
        ImuSample {
            gyro: [f32::NAN, 0.0, 0.0],
            ..level_sample()
        }
    }

    fn estimator(config: AhrsConfig) -> AttitudeEstimator {
        AttitudeEstimator::new(config, LEVEL_ACCEL, NORTH_MAG).unwrap()
    }

    #[test]
    fn test_new_aligns_level() {
        let est = estimator(AhrsConfig::default());
        assert_eq!(est.health(), AttitudeHealth::Converging);
        assert_abs_diff_eq!(est.quaternion().w, 1.0, epsilon = 1e-5);
        assert_eq!(est.reset_count(), 0);
        assert_eq!(est.snapshot().cycle, 0);
    }

    #[test]
    fn test_new_rejects_bad_input() {
        assert_eq!(
            AttitudeEstimator::new(AhrsConfig::default().with_dt(-1.0), LEVEL_ACCEL, NORTH_MAG).err(),
            Some(EstimatorError::Config(ConfigError::NonPositiveTimestep))
        );
        assert_eq!(
            AttitudeEstimator::new(AhrsConfig::default(), [0.0; 3], NORTH_MAG).err(),
            Some(EstimatorError::Align(AlignError::DegenerateAccel))
        );
        // Bias cancels the whole reading.
        let cfg = AhrsConfig::default().with_hard_iron(NORTH_MAG);
        assert_eq!(
            AttitudeEstimator::new(cfg, LEVEL_ACCEL, NORTH_MAG).err(),
            Some(EstimatorError::Align(AlignError::DegenerateMag))
        );
    }

    #[test]
    fn test_converges_and_reports_healthy() {
        let mut est = estimator(AhrsConfig::default().with_failure_policy(3, 20));
        for _ in 0..19 {
            assert_eq!(est.step(&level_sample()), StepOutcome::Updated);
        }
        assert_eq!(est.health(), AttitudeHealth::Converging);
        assert_eq!(est.pop_event(), None);

        est.step(&level_sample());
        assert_eq!(est.health(), AttitudeHealth::Healthy);
        assert_eq!(est.pop_event(), Some(EstimatorEvent::Converged { cycle: 20 }));

        let snap = est.snapshot();
        assert_eq!(snap.health, AttitudeHealth::Healthy);
        assert_eq!(snap.cycle, 20);
        assert_abs_diff_eq!(snap.roll_rad, 0.0, epsilon = 1e-3);
        assert_abs_diff_eq!(snap.pitch_rad, 0.0, epsilon = 1e-3);
        assert_abs_diff_eq!(snap.yaw_rad, 0.0, epsilon = 1e-3);
    }

    #[test]
    fn test_static_tilted_attitude_runs_without_resets() {
        let config = AhrsConfig::default();
        let projection = FieldProjection::new(config.gravity, &config.geomagnetic).unwrap();
        for (yaw, pitch, roll) in [(1.0, 0.3, 0.2), (-2.0, -0.4, 0.7)] {
            let truth = Quaternion::from_euler(yaw, pitch, roll);
            let y = projection.project(&truth);
            let sample = ImuSample {
                gyro: [0.0; 3],
                accel: [y[0], y[1], y[2]],
                mag: [y[3], y[4], y[5]],
            };
            let mut est = AttitudeEstimator::new(config, sample.accel, sample.mag).unwrap();
            for _ in 0..2000 {
                assert_eq!(est.step(&sample), StepOutcome::Updated);
            }
            assert_eq!(est.reset_count(), 0);
            assert_eq!(est.health(), AttitudeHealth::Healthy);
            let err = est.quaternion().angle_to(&truth);
            assert!(err < 5e-3, "truth {:?}: error {} rad", truth, err);
        }
    }

    #[test]
    fn test_missing_field_runs_time_update() {
        let mut est = estimator(AhrsConfig::default());
        let sample = ImuSample {
            gyro: [0.0, 0.0, 0.5],
            accel: LEVEL_ACCEL,
            mag: [0.0; 3],
        };
        assert_eq!(est.step(&sample), StepOutcome::Predicted);
        assert!(est.quaternion().z.abs() > 0.0);
        assert_eq!(est.health(), AttitudeHealth::Converging);

        let sample = ImuSample {
            accel: [f32::NAN; 3],
            ..level_sample()
        };
        assert_eq!(est.step(&sample), StepOutcome::Predicted);
        // The NaN never reached the filter state.
        assert_eq!(est.step(&level_sample()), StepOutcome::Updated);
    }

    #[test]
    fn test_failure_resets_then_goes_stale() {
        let mut est = estimator(AhrsConfig::default().with_failure_policy(3, 5));
        for _ in 0..10 {
            est.step(&level_sample());
        }
        assert_eq!(est.health(), AttitudeHealth::Healthy);
        while est.pop_event().is_some() {}

        let cause = UkfError::ProcessModel(ModelError::DegenerateQuaternion);
        assert_eq!(est.step(&nan_gyro_sample()), StepOutcome::Reset(cause));
        assert_eq!(est.health(), AttitudeHealth::Converging);
        assert_eq!(est.reset_count(), 1);
        assert_eq!(est.consecutive_failures(), 1);
        assert_eq!(est.pop_event(), Some(EstimatorEvent::Reset { cause, count: 1 }));
        // Reseeded from the level sample with startup covariance.
        assert_abs_diff_eq!(est.quaternion().w, 1.0, epsilon = 1e-5);
        assert_eq!(est.ukf().covariance()[(0, 0)], est.config().p_init);

        est.step(&nan_gyro_sample());
        est.step(&nan_gyro_sample());
        assert_eq!(est.health(), AttitudeHealth::Stale);
        assert_eq!(est.consecutive_failures(), 3);
        assert_eq!(est.pop_event(), Some(EstimatorEvent::Reset { cause, count: 2 }));
        assert_eq!(est.pop_event(), Some(EstimatorEvent::Reset { cause, count: 3 }));
        assert_eq!(est.pop_event(), Some(EstimatorEvent::Stale { failures: 3 }));
        assert_eq!(est.pop_event(), None);

        // Good data brings it back through Converging.
        assert_eq!(est.step(&level_sample()), StepOutcome::Updated);
        assert_eq!(est.health(), AttitudeHealth::Converging);
        assert_eq!(est.consecutive_failures(), 0);
        for _ in 0..4 {
            est.step(&level_sample());
        }
        assert_eq!(est.health(), AttitudeHealth::Healthy);
    }

    #[test]
    fn test_event_queue_drops_oldest() {
        let mut est = estimator(AhrsConfig::default().with_failure_policy(5, 200));
        for _ in 0..10 {
            est.step(&nan_gyro_sample());
        }
        // 10 resets plus one stale event, only the newest eight remain.
        let cause = UkfError::ProcessModel(ModelError::DegenerateQuaternion);
        assert_eq!(est.pop_event(), Some(EstimatorEvent::Reset { cause, count: 4 }));
        assert_eq!(est.pop_event(), Some(EstimatorEvent::Reset { cause, count: 5 }));
        assert_eq!(est.pop_event(), Some(EstimatorEvent::Stale { failures: 5 }));
        let mut remaining = 0;
        while est.pop_event().is_some() {
            remaining += 1;
        }
        assert_eq!(remaining, 5);
    }

    #[test]
    fn test_hard_iron_and_instant_angles() {
        let bias = [0.2, -0.1, 0.05];
        let cfg = AhrsConfig::default().with_hard_iron(bias);
        let raw_mag = [NORTH_MAG[0] + bias[0], bias[1], bias[2]];
        let mut est = AttitudeEstimator::new(cfg, LEVEL_ACCEL, raw_mag).unwrap();
        assert_abs_diff_eq!(est.instant_yaw().unwrap(), 0.0, epsilon = 1e-5);

        let roll = 0.2f32;
        let sample = ImuSample {
            gyro: [0.0; 3],
            accel: [0.0, math::sin(roll), math::cos(roll)],
            mag: raw_mag,
        };
        est.step(&sample);
        assert_abs_diff_eq!(est.instant_roll().unwrap(), roll, epsilon = 1e-5);
        assert_abs_diff_eq!(est.instant_pitch().unwrap(), 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(
            est.instant_yaw().unwrap(),
            align::instant_yaw(sample.accel, NORTH_MAG).unwrap(),
            epsilon = 1e-5
        );
    }
}
