//! Closed-form attitude from a single accelerometer + magnetometer sample.
//!
//! Used to seed the UKF at boot and after a reset, and to provide unfiltered
//! pitch/roll/yaw for calibration routines. Tilt comes from gravity; heading
//! from the magnetometer projected onto the horizontal plane.
use core::fmt;

use super::ahrs::Quaternion;
use super::matrix::Vector;
use crate::math;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AlignError {
    DegenerateAccel,
    DegenerateMag,
}

impl fmt::Display for AlignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DegenerateAccel => f.write_str("accelerometer vector is zero or not finite"),
            Self::DegenerateMag => f.write_str("magnetometer vector is zero or not finite"),
        }
    }
}

fn unit(v: [f32; 3], err: AlignError) -> Result<[f32; 3], AlignError> {
    if !v.iter().all(|c| c.is_finite()) {
        return Err(err);
    }
    let mut n = Vector::from_array(v);
    n.normalize().map_err(|_| err)?;
    Ok(n.as_array())
}

/// (pitch, roll) in rad from the gravity direction.
pub fn tilt(accel: [f32; 3]) -> Result<(f32, f32), AlignError> {
    let [ax, ay, az] = unit(accel, AlignError::DegenerateAccel)?;
    let pitch = math::asin(ax);
    let roll = math::atan2(ay, az);
    Ok((pitch, roll))
}

/// Tilt-compensated magnetic heading (rad).
pub fn heading(accel: [f32; 3], mag: [f32; 3]) -> Result<f32, AlignError> {
    let (pitch, roll) = tilt(accel)?;
    heading_at_tilt(pitch, roll, mag)
}

fn heading_at_tilt(pitch: f32, roll: f32, mag: [f32; 3]) -> Result<f32, AlignError> {
    let [bx, by, bz] = unit(mag, AlignError::DegenerateMag)?;

    let (sp, cp) = math::sin_cos(pitch);
    let (sr, cr) = math::sin_cos(roll);
    let m_tilt_x = bx * cp + by * sr * sp + bz * cr * sp;
    let m_tilt_y = by * cr - bz * sr;
    Ok(math::atan2(m_tilt_y, m_tilt_x))
}

/// Coarse attitude quaternion (ZYX) for seeding the filter.
pub fn coarse_quaternion(accel: [f32; 3], mag: [f32; 3]) -> Result<Quaternion, AlignError> {
    let (pitch, roll) = tilt(accel)?;
    let yaw = heading_at_tilt(pitch, roll, mag)?;
    Ok(Quaternion::from_euler(yaw, pitch, roll))
}

pub fn instant_pitch(accel: [f32; 3]) -> Result<f32, AlignError> {
    tilt(accel).map(|(pitch, _)| pitch)
}

pub fn instant_roll(accel: [f32; 3]) -> Result<f32, AlignError> {
    tilt(accel).map(|(_, roll)| roll)
}

pub fn instant_yaw(accel: [f32; 3], mag: [f32; 3]) -> Result<f32, AlignError> {
    heading(accel, mag)
}
