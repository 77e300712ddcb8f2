use embassy_time::{Duration, Ticker};

use crate::config::{AhrsConfig, ConfigError};
use crate::drivers::attitude::{AttitudeEstimator, EstimatorError, StepOutcome};
use crate::state::{AttitudeMailbox, ImuSample};

// ── Loop constants ───────────────────────────────────────────────────────────

/// Estimator loop target: 1 kHz (matches the default dt).
pub const FAST_LOOP_HZ: u64 = 1000;

// ── Sensor seam ──────────────────────────────────────────────────────────────

/// Anything that can produce one calibrated IMU sample per tick.
#[allow(async_fn_in_trait)]
pub trait ImuSource {
    type Error;

    async fn read(&mut self) -> Result<ImuSample, Self::Error>;
}

// ── Calibration parameters (filled from main after static calib) ─────────────

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FastLoopConfig {
    pub ahrs: AhrsConfig,
    pub gyro_bias: [f32; 3],
    pub accel_bias: [f32; 3],
}

impl FastLoopConfig {
    fn correct(&self, raw: &ImuSample) -> ImuSample {
        let mut s = *raw;
        for i in 0..3 {
            s.gyro[i] -= self.gyro_bias[i];
            s.accel[i] -= self.accel_bias[i];
        }
        s
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CycleOutcome {
    /// Read failed; cycle skipped.
    SensorError,
    /// No estimator yet and this sample could not be aligned.
    AlignPending(EstimatorError),
    /// Estimator built from this sample.
    Aligned,
    Stepped(StepOutcome),
}

// ── Task ─────────────────────────────────────────────────────────────────────

pub struct AttitudeTask<S> {
    source: S,
    config: FastLoopConfig,
    estimator: Option<AttitudeEstimator>,
    sensor_errors: u32,
}

impl<S: ImuSource> AttitudeTask<S> {
    pub fn new(source: S, config: FastLoopConfig) -> Result<Self, ConfigError> {
        config.ahrs.validate()?;
        Ok(Self {
            source,
            config,
            estimator: None,
            sensor_errors: 0,
        })
    }

    /// Read one sample, align or step, publish.
    pub async fn poll_once(&mut self, mailbox: &AttitudeMailbox) -> CycleOutcome {
        // ── A. Read IMU ───────────────────────────────────────────────────────
        let raw = match self.source.read().await {
            Ok(s) => s,
            Err(_) => {
                self.sensor_errors = self.sensor_errors.wrapping_add(1);
                return CycleOutcome::SensorError;
            }
        };

        // ── B. Calibration correction ─────────────────────────────────────────
        let sample = self.config.correct(&raw);

        // ── C. Align or step ──────────────────────────────────────────────────
        let outcome = match self.estimator.as_mut() {
            Some(est) => CycleOutcome::Stepped(est.step(&sample)),
            None => match AttitudeEstimator::new(self.config.ahrs, sample.accel, sample.mag) {
                Ok(est) => {
                    self.estimator = Some(est);
                    CycleOutcome::Aligned
                }
                Err(e) => {
                    log_debug!("alignment pending: {:?}", e);
                    return CycleOutcome::AlignPending(e);
                }
            },
        };

        // ── D. Publish ────────────────────────────────────────────────────────
        if let Some(est) = self.estimator.as_ref() {
            mailbox.publish(est.snapshot());
        }
        outcome
    }

    /// Fixed-rate loop; never returns.
    pub async fn run(&mut self, mailbox: &AttitudeMailbox, rate_hz: u64) -> ! {
        let rate_hz = rate_hz.max(1);
        let mut ticker = Ticker::every(Duration::from_hz(rate_hz));
        let mut tick: u64 = 0;

        loop {
            ticker.next().await;
            tick = tick.wrapping_add(1);

            self.poll_once(mailbox).await;

            // Debug line once per second
            if tick % rate_hz == 0 {
                let line = mailbox.latest().debug_line();
                log_debug!("{}", line.as_str());
            }
        }
    }

    pub fn estimator(&self) -> Option<&AttitudeEstimator> {
        self.estimator.as_ref()
    }

    pub fn sensor_errors(&self) -> u32 {
        self.sensor_errors
    }
}
