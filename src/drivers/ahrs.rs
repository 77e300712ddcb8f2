//! Quaternion attitude models for the UKF.
//!
//! State is the unit quaternion [w, x, y, z], control is the body rate
//! (p, q, r) in rad/s and the measurement is the accelerometer followed by the
//! magnetometer, both in the body frame.
use super::matrix::{Matrix, MatrixError, Vector};
use super::ukf::{ModelError, SigmaTransform, Ukf};
use crate::config::{ConfigError, GeomagneticReference};
use crate::math;

pub const STATE_DIM: usize = 4;
pub const MEASUREMENT_DIM: usize = 6;
pub const CONTROL_DIM: usize = 3;
pub const SIGMA_COUNT: usize = 2 * STATE_DIM + 1;

pub type AttitudeUkf =
    Ukf<QuaternionKinematics, FieldProjection, STATE_DIM, MEASUREMENT_DIM, CONTROL_DIM, SIGMA_COUNT>;

// ── Quaternion ───────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Quaternion {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Default for Quaternion {
    fn default() -> Self {
        Self {
            w: 1.0,
            x: 0.0,
            y: 0.0,
            z: 0.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EulerAngles {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

impl Quaternion {
    pub const fn new(w: f32, x: f32, y: f32, z: f32) -> Self {
        Self { w, x, y, z }
    }

    pub fn from_vector(v: &Vector<STATE_DIM>) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }

    pub fn to_vector(&self) -> Vector<STATE_DIM> {
        Vector::from_array([self.w, self.x, self.y, self.z])
    }

    pub fn norm(&self) -> f32 {
        self.to_vector().norm()
    }

    pub fn normalized(&self) -> Result<Self, MatrixError> {
        let mut v = self.to_vector();
        v.normalize()?;
        Ok(Self::from_vector(&v))
    }

    /// ZYX (yaw, then pitch, then roll) composition.
    pub fn from_euler(yaw: f32, pitch: f32, roll: f32) -> Self {
        let (sy, cy) = math::sin_cos(yaw * 0.5);
        let (sp, cp) = math::sin_cos(pitch * 0.5);
        let (sr, cr) = math::sin_cos(roll * 0.5);
        Self {
            w: cy * cp * cr + sy * sp * sr,
            x: cy * cp * sr - sy * sp * cr,
            y: cy * sp * cr + sy * cp * sr,
            z: sy * cp * cr - cy * sp * sr,
        }
    }

    pub fn to_euler(&self) -> EulerAngles {
        let (q0, q1, q2, q3) = (self.w, self.x, self.y, self.z);

        // Roll (x-axis rotation)
        let sinr_cosp = 2.0 * (q0 * q1 + q2 * q3);
        let cosr_cosp = 1.0 - 2.0 * (q1 * q1 + q2 * q2);
        let roll = math::atan2(sinr_cosp, cosr_cosp);

        // Pitch (y-axis rotation), ±90° when out of range
        let sinp = 2.0 * (q0 * q2 - q3 * q1);
        let pitch = math::asin(sinp);

        // Yaw (z-axis rotation)
        let siny_cosp = 2.0 * (q0 * q3 + q1 * q2);
        let cosy_cosp = 1.0 - 2.0 * (q2 * q2 + q3 * q3);
        let yaw = math::atan2(siny_cosp, cosy_cosp);

        EulerAngles { roll, pitch, yaw }
    }

    /// Reference-to-body direction cosine matrix.
    pub fn dcm(&self) -> Matrix<3, 3> {
        let (q0, q1, q2, q3) = (self.w, self.x, self.y, self.z);
        let (q0_2, q1_2, q2_2, q3_2) = (q0 * q0, q1 * q1, q2 * q2, q3 * q3);
        Matrix::from_rows([
            [
                q0_2 + q1_2 - q2_2 - q3_2,
                2.0 * (q1 * q2 + q0 * q3),
                2.0 * (q1 * q3 - q0 * q2),
            ],
            [
                2.0 * (q1 * q2 - q0 * q3),
                q0_2 - q1_2 + q2_2 - q3_2,
                2.0 * (q2 * q3 + q0 * q1),
            ],
            [
                2.0 * (q1 * q3 + q0 * q2),
                2.0 * (q2 * q3 - q0 * q1),
                q0_2 - q1_2 - q2_2 + q3_2,
            ],
        ])
    }

    /// Total rotation angle in [0, π] (rad).
    pub fn rotation_angle(&self) -> f32 {
        2.0 * math::acos(math::abs(self.w))
    }

    /// Angle of the rotation taking `self` onto `other`, in [0, π] (rad).
    /// Both must be unit quaternions; q and −q count as the same attitude.
    pub fn angle_to(&self, other: &Self) -> f32 {
        let dot = self.w * other.w + self.x * other.x + self.y * other.y + self.z * other.z;
        2.0 * math::acos(math::abs(dot))
    }
}

// ── Process model ────────────────────────────────────────────────────────────

/// First-order quaternion integration over a fixed step, renormalised.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QuaternionKinematics {
    pub dt: f32,
}

impl QuaternionKinematics {
    /// One Euler step `q + dt/2 · Ω(ω) q`, before renormalisation.
    ///
    /// Ω is skew-symmetric, so the step only grows the norm by the factor
    /// `sqrt(1 + (dt·|ω|/2)²)`.
    pub fn integrate(&self, x: &Vector<STATE_DIM>, u: &Vector<CONTROL_DIM>) -> Vector<STATE_DIM> {
        let (q0, q1, q2, q3) = (x[0], x[1], x[2], x[3]);
        let (p, q, r) = (u[0], u[1], u[2]);
        let h = 0.5 * self.dt;

        Vector::from_array([
            q0 + h * (p * q1 + q * q2 + r * q3),
            q1 + h * (-p * q0 - r * q2 + q * q3),
            q2 + h * (-q * q0 + r * q1 - p * q3),
            q3 + h * (-r * q0 - q * q1 + p * q2),
        ])
    }
}

impl SigmaTransform<STATE_DIM, STATE_DIM, CONTROL_DIM> for QuaternionKinematics {
    fn transform(
        &self,
        x: &Vector<STATE_DIM>,
        u: &Vector<CONTROL_DIM>,
    ) -> Result<Vector<STATE_DIM>, ModelError> {
        let mut out = self.integrate(x, u);
        out.normalize().map_err(|_| ModelError::DegenerateQuaternion)?;
        Ok(out)
    }
}

// ── Measurement model ────────────────────────────────────────────────────────

/// Gravity and the local Earth field projected into the body frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FieldProjection {
    pub gravity: f32,
    /// Reference field, unit direction scaled by total intensity.
    pub magnetic: [f32; 3],
}

impl FieldProjection {
    pub fn new(gravity: f32, reference: &GeomagneticReference) -> Result<Self, ConfigError> {
        reference.validate()?;
        let unit = reference.unit_vector()?;
        Ok(Self {
            gravity,
            magnetic: [
                unit[0] * reference.total,
                unit[1] * reference.total,
                unit[2] * reference.total,
            ],
        })
    }

    /// Expected [accel, mag] for attitude `q`.
    pub fn project(&self, q: &Quaternion) -> Vector<MEASUREMENT_DIM> {
        let dcm = q.dcm();
        let m = Vector::from_array(self.magnetic);
        let mag = dcm.mul(&m);
        Vector::from_array([
            self.gravity * dcm[(0, 2)],
            self.gravity * dcm[(1, 2)],
            self.gravity * dcm[(2, 2)],
            mag[0],
            mag[1],
            mag[2],
        ])
    }
}

impl SigmaTransform<STATE_DIM, MEASUREMENT_DIM, CONTROL_DIM> for FieldProjection {
    fn transform(
        &self,
        x: &Vector<STATE_DIM>,
        _u: &Vector<CONTROL_DIM>,
    ) -> Result<Vector<MEASUREMENT_DIM>, ModelError> {
        Ok(self.project(&Quaternion::from_vector(x)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::ukf::{UkfError, UkfParams};
    use approx::assert_abs_diff_eq;

    const DT: f32 = 0.001;

    /// (yaw, pitch, roll) truths, all three angles non-zero except identity.
    const TRUTHS: [(f32, f32, f32); 4] = [
        (0.0, 0.0, 0.0),
        (1.0, 0.3, 0.2),
        (-2.0, -0.4, 0.7),
        (0.5, -0.2, 0.3),
    ];

    fn projection() -> FieldProjection {
        FieldProjection::new(1.0, &GeomagneticReference::default()).unwrap()
    }

    fn attitude_ukf(q0: Quaternion) -> AttitudeUkf {
        let rn = Matrix::from_diagonal([1.5e-4; MEASUREMENT_DIM]);
        AttitudeUkf::new(
            q0.to_vector(),
            Matrix::identity().scale(1e-2),
            Matrix::identity().scale(1e-7),
            rn,
            QuaternionKinematics { dt: DT },
            projection(),
            UkfParams::default(),
        )
    }

    /// Deterministic uniform noise in [-amplitude, amplitude].
    struct Lcg(u32);

    impl Lcg {
        fn next(&mut self, amplitude: f32) -> f32 {
            self.0 = self.0.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            ((self.0 >> 8) as f32 / (1u32 << 24) as f32 * 2.0 - 1.0) * amplitude
        }
    }

    #[test]
    fn test_process_model_keeps_unit_norm() {
        let f = QuaternionKinematics { dt: DT };
        let states = [
            [1.0, 0.0, 0.0, 0.0],
            [0.7, 0.1, -0.7, 0.1],
            [0.5, 0.5, 0.5, 0.5],
            [0.2, 0.9, 0.1, -0.3],
        ];
        let rates = [[0.0, 0.0, 0.0], [1.0, -2.0, 3.0], [30.0, 10.0, -25.0]];
        for s in states {
            for r in rates {
                let out = f.transform(&Vector::from_array(s), &Vector::from_array(r)).unwrap();
                assert_abs_diff_eq!(out.norm(), 1.0, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_integration_step_is_norm_preserving_to_first_order() {
        // Large step so a first-order norm change would dominate.
        let f = QuaternionKinematics { dt: 0.01 };
        let h = 0.5 * f.dt;
        let starts = [
            Quaternion::from_euler(1.0, 0.3, 0.2),
            Quaternion::new(0.5, 0.5, 0.5, 0.5),
            Quaternion::from_euler(-2.0, -0.4, 0.7),
        ];
        let rates = [[2.0, 0.0, 0.0], [0.0, 2.0, 0.0], [0.0, 0.0, 2.0], [-1.5, 0.0, 0.0]];
        for q in starts {
            for rate in rates {
                let omega = Vector::from_array(rate).norm();
                let out = f.integrate(&q.to_vector(), &Vector::from_array(rate));
                // |q'|² = |q|²·(1 + (h·|ω|)²) exactly for a skew-symmetric step.
                let expected = 1.0 + (h * omega) * (h * omega);
                let n = out.norm();
                assert_abs_diff_eq!(n * n, expected, epsilon = 2e-6);
            }
        }
    }

    #[test]
    fn test_process_model_rejects_zero_quaternion() {
        let f = QuaternionKinematics { dt: DT };
        assert_eq!(
            f.transform(&Vector::zeros(), &Vector::from_array([0.1, 0.2, 0.3])),
            Err(ModelError::DegenerateQuaternion)
        );
    }

    #[test]
    fn test_constant_yaw_rate_integrates_to_angle() {
        let f = QuaternionKinematics { dt: DT };
        let omega = 1.0;
        let u = Vector::from_array([0.0, 0.0, omega]);
        let mut x = Quaternion::default().to_vector();
        for _ in 0..1000 {
            x = f.transform(&x, &u).unwrap();
        }
        let q = Quaternion::from_vector(&x);
        // 1 s at 1 rad/s, pure z rotation.
        assert_abs_diff_eq!(q.rotation_angle(), omega * 1.0, epsilon = 1e-3);
        assert_abs_diff_eq!(q.x, 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(q.y, 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(q.to_euler().yaw.abs(), omega * 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_measurement_at_identity() {
        let y = projection().project(&Quaternion::default());
        assert_eq!(y.as_array(), [0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_measurement_follows_roll() {
        let h = FieldProjection::new(9.81, &GeomagneticReference::default()).unwrap();
        let roll = 0.3f32;
        let y = h.project(&Quaternion::from_euler(0.0, 0.0, roll));
        assert_abs_diff_eq!(y[0], 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(y[1], 9.81 * math::sin(roll), epsilon = 1e-4);
        assert_abs_diff_eq!(y[2], 9.81 * math::cos(roll), epsilon = 1e-4);
        // Roll about the field axis leaves a north-pointing field alone.
        assert_abs_diff_eq!(y[3], 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_euler_round_trip() {
        let cases = [
            (0.0, 0.0, 0.0),
            (0.5, 0.2, -0.3),
            (-2.0, -0.7, 1.2),
            (3.0, 1.2, -2.5),
            (-1.0, 0.0, 3.0),
        ];
        for (yaw, pitch, roll) in cases {
            let q = Quaternion::from_euler(yaw, pitch, roll);
            assert_abs_diff_eq!(q.norm(), 1.0, epsilon = 1e-6);
            let e = q.to_euler();
            assert_abs_diff_eq!(e.yaw, yaw, epsilon = 1e-4);
            assert_abs_diff_eq!(e.pitch, pitch, epsilon = 1e-4);
            assert_abs_diff_eq!(e.roll, roll, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_noisy_cycles_stay_healthy() {
        for (yaw, pitch, roll) in TRUTHS {
            let truth = Quaternion::from_euler(yaw, pitch, roll);
            let mut ukf = attitude_ukf(truth);
            let expected = projection().project(&truth);
            let mut rng = Lcg(7);
            let u = Vector::zeros();
            for _ in 0..1000 {
                let mut y = expected;
                for i in 0..MEASUREMENT_DIM {
                    y[i] += rng.next(0.01);
                }
                ukf.update(&y, &u).unwrap();
                let p = ukf.covariance();
                assert_eq!(p.max_asymmetry(), 0.0);
                assert!(p.trace() >= 0.0);
            }
            let q = Quaternion::from_vector(ukf.state()).normalized().unwrap();
            assert!(q.angle_to(&truth) < 5e-3, "truth {:?}, q = {:?}", truth, q);
        }
    }

    #[test]
    fn test_converges_from_yaw_offset() {
        for (yaw, pitch, roll) in TRUTHS {
            let truth = Quaternion::from_euler(yaw, pitch, roll);
            let start = Quaternion::from_euler(yaw + core::f32::consts::FRAC_PI_2, pitch, roll);
            let mut ukf = attitude_ukf(start);
            let y = projection().project(&truth);
            let u = Vector::zeros();
            for _ in 0..1000 {
                ukf.update(&y, &u).unwrap();
            }
            let q = Quaternion::from_vector(ukf.state()).normalized().unwrap();
            assert!(q.angle_to(&truth) < 1e-2, "truth {:?}, q = {:?}", truth, q);
        }
    }

    #[test]
    fn test_outlier_then_reconverges() {
        for (yaw, pitch, roll) in TRUTHS {
            let truth = Quaternion::from_euler(yaw, pitch, roll);
            let mut ukf = attitude_ukf(truth);
            let y = projection().project(&truth);
            let u = Vector::zeros();
            for _ in 0..500 {
                ukf.update(&y, &u).unwrap();
            }
            let mut outlier = y;
            outlier[1] += 0.5;
            ukf.update(&outlier, &u).unwrap();
            let kicked = Quaternion::from_vector(ukf.state()).normalized().unwrap();
            assert!(kicked.angle_to(&truth) > 5e-3, "truth {:?}", truth);

            for _ in 0..200 {
                ukf.update(&y, &u).unwrap();
            }
            let q = Quaternion::from_vector(ukf.state()).normalized().unwrap();
            assert!(q.angle_to(&truth) < 4e-3, "truth {:?}, q = {:?}", truth, q);
        }
    }

    #[test]
    fn test_consistent_input_never_faults_off_identity() {
        for (yaw, pitch, roll) in TRUTHS {
            let truth = Quaternion::from_euler(yaw, pitch, roll);
            let mut ukf = attitude_ukf(truth);
            let y = projection().project(&truth);
            let u = Vector::zeros();
            for cycle in 0..3000 {
                if let Err(e) = ukf.update(&y, &u) {
                    panic!("truth {:?}: cycle {} failed with {:?}", truth, cycle, e);
                }
            }
            assert!(ukf.covariance().cholesky().is_ok());
            let q = Quaternion::from_vector(ukf.state()).normalized().unwrap();
            assert!(q.angle_to(&truth) < 5e-3, "truth {:?}, q = {:?}", truth, q);
        }
    }

    #[test]
    fn test_indefinite_covariance_is_terminal_for_the_cycle() {
        let mut ukf = attitude_ukf(Quaternion::default());
        let mut p = Matrix::identity().scale(1e-2);
        p[(1, 1)] = -1e-3;
        let x0 = Quaternion::default().to_vector();
        ukf.reset(
            x0,
            p,
            Matrix::identity().scale(1e-7),
            Matrix::from_diagonal([1.5e-4; MEASUREMENT_DIM]),
        );
        let y = projection().project(&Quaternion::default());
        assert_eq!(
            ukf.update(&y, &Vector::zeros()),
            Err(UkfError::CovarianceNotPositiveDefinite)
        );
        assert_eq!(*ukf.state(), x0);
        assert_eq!(*ukf.covariance(), p);
        assert_eq!(ukf.update(&y, &Vector::zeros()), Err(UkfError::ResetRequired));
    }
}
