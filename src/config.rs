//! Estimator configuration, fixed at startup.
//!
//! Tuning constants mirror what the board ships with; everything can be
//! overridden through the `with_*` builders before the estimator is built.
use core::fmt;

use crate::drivers::ahrs::{MEASUREMENT_DIM, STATE_DIM};
use crate::drivers::matrix::{Matrix, ZERO_LENGTH};
use crate::drivers::ukf::UkfParams;

// ── Defaults ─────────────────────────────────────────────────────────────────

/// Fixed integration step (s), 1 kHz loop.
pub const DEFAULT_DT: f32 = 0.001;
/// Initial covariance diagonal.
pub const P_INIT: f32 = 1e-2;
/// Process noise diagonal.
pub const RV_INIT: f32 = 1e-7;
/// Accelerometer measurement noise.
pub const RN_INIT_ACC: f32 = 1.5e-4;
/// Magnetometer measurement noise.
pub const RN_INIT_MAG: f32 = 1.5e-4;
/// Gravity magnitude in accelerometer units (g).
pub const GRAVITY: f32 = 1.0;
/// Consecutive failed cycles before the estimate is flagged stale.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;
/// Successful cycles after a reset before the estimate counts as converged.
pub const RECONVERGE_CYCLES: u32 = 200;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    NonPositiveTimestep,
    NonPositiveCovariance,
    InvalidSigmaScaling,
    DegenerateReference,
    InvalidFilterFactor,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonPositiveTimestep => f.write_str("timestep must be positive"),
            Self::NonPositiveCovariance => f.write_str("covariance and noise terms must be positive"),
            Self::InvalidSigmaScaling => f.write_str("invalid sigma point scaling (alpha, kappa, beta)"),
            Self::DegenerateReference => f.write_str("reference field has zero length"),
            Self::InvalidFilterFactor => f.write_str("pre-filter factor must be in (0, 1]"),
        }
    }
}

fn positive(v: f32) -> bool {
    v.is_finite() && v > 0.0
}

// ── Geomagnetic reference ────────────────────────────────────────────────────

/// Local Earth field in the navigation frame, e.g. from the WMM model for the
/// site, rotated to true north. Components and `total` share one unit; only the
/// direction and `total` are used.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeomagneticReference {
    pub north: f32,
    pub east: f32,
    pub down: f32,
    pub total: f32,
}

impl Default for GeomagneticReference {
    fn default() -> Self {
        Self {
            north: 1.0,
            east: 0.0,
            down: 0.0,
            total: 1.0,
        }
    }
}

impl GeomagneticReference {
    /// Reference whose magnitude is the Euclidean norm of the components.
    pub fn from_components(north: f32, east: f32, down: f32) -> Self {
        let total = crate::math::sqrt(north * north + east * east + down * down);
        Self {
            north,
            east,
            down,
            total,
        }
    }

    /// Normalised direction [north, east, down].
    pub fn unit_vector(&self) -> Result<[f32; 3], ConfigError> {
        let mut v = Matrix::from_array([self.north, self.east, self.down]);
        v.normalize().map_err(|_| ConfigError::DegenerateReference)?;
        Ok(v.as_array())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !positive(self.total) {
            return Err(ConfigError::DegenerateReference);
        }
        self.unit_vector().map(|_| ())
    }
}

// ── AHRS configuration ───────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AhrsConfig {
    /// Integration step (s).
    pub dt: f32,
    /// P0 = p_init * I
    pub p_init: f32,
    /// Rv = rv * I
    pub rv: f32,
    pub rn_accel: f32,
    pub rn_mag: f32,
    pub ukf: UkfParams,
    pub gravity: f32,
    pub geomagnetic: GeomagneticReference,
    /// Subtracted from every magnetometer sample.
    pub hard_iron: [f32; 3],
    /// IIR factor for the accel/mag pre-filter; 1.0 passes samples through.
    pub prefilter: f32,
    pub max_consecutive_failures: u32,
    pub reconverge_cycles: u32,
}

impl Default for AhrsConfig {
    fn default() -> Self {
        Self {
            dt: DEFAULT_DT,
            p_init: P_INIT,
            rv: RV_INIT,
            rn_accel: RN_INIT_ACC,
            rn_mag: RN_INIT_MAG,
            ukf: UkfParams::default(),
            gravity: GRAVITY,
            geomagnetic: GeomagneticReference::default(),
            hard_iron: [0.0; 3],
            prefilter: 1.0,
            max_consecutive_failures: MAX_CONSECUTIVE_FAILURES,
            reconverge_cycles: RECONVERGE_CYCLES,
        }
    }
}

impl AhrsConfig {
    pub fn with_dt(mut self, dt: f32) -> Self {
        self.dt = dt;
        self
    }

    pub fn with_initial_covariance(mut self, p_init: f32) -> Self {
        self.p_init = p_init;
        self
    }

    pub fn with_process_noise(mut self, rv: f32) -> Self {
        self.rv = rv;
        self
    }

    pub fn with_measurement_noise(mut self, rn_accel: f32, rn_mag: f32) -> Self {
        self.rn_accel = rn_accel;
        self.rn_mag = rn_mag;
        self
    }

    pub fn with_ukf_params(mut self, params: UkfParams) -> Self {
        self.ukf = params;
        self
    }

    pub fn with_gravity(mut self, gravity: f32) -> Self {
        self.gravity = gravity;
        self
    }

    pub fn with_geomagnetic(mut self, reference: GeomagneticReference) -> Self {
        self.geomagnetic = reference;
        self
    }

    pub fn with_hard_iron(mut self, bias: [f32; 3]) -> Self {
        self.hard_iron = bias;
        self
    }

    pub fn with_prefilter(mut self, factor: f32) -> Self {
        self.prefilter = factor;
        self
    }

    pub fn with_failure_policy(mut self, max_consecutive_failures: u32, reconverge_cycles: u32) -> Self {
        self.max_consecutive_failures = max_consecutive_failures;
        self.reconverge_cycles = reconverge_cycles;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !positive(self.dt) {
            return Err(ConfigError::NonPositiveTimestep);
        }
        if ![self.p_init, self.rv, self.rn_accel, self.rn_mag]
            .iter()
            .all(|&v| positive(v))
        {
            return Err(ConfigError::NonPositiveCovariance);
        }
        let scaled = self.ukf.alpha * self.ukf.alpha * (STATE_DIM as f32 + self.ukf.kappa);
        if !positive(self.ukf.alpha)
            || self.ukf.alpha > 1.0
            || !self.ukf.beta.is_finite()
            || self.ukf.beta < 0.0
            || scaled.is_nan()
            || scaled <= ZERO_LENGTH
        {
            return Err(ConfigError::InvalidSigmaScaling);
        }
        if !positive(self.gravity) {
            return Err(ConfigError::DegenerateReference);
        }
        self.geomagnetic.validate()?;
        if !positive(self.prefilter) || self.prefilter > 1.0 {
            return Err(ConfigError::InvalidFilterFactor);
        }
        Ok(())
    }

    pub fn initial_covariance(&self) -> Matrix<STATE_DIM, STATE_DIM> {
        Matrix::identity().scale(self.p_init)
    }

    pub fn process_noise(&self) -> Matrix<STATE_DIM, STATE_DIM> {
        Matrix::identity().scale(self.rv)
    }

    pub fn measurement_noise(&self) -> Matrix<MEASUREMENT_DIM, MEASUREMENT_DIM> {
        let a = self.rn_accel;
        let m = self.rn_mag;
        Matrix::from_diagonal([a, a, a, m, m, m])
    }
}
