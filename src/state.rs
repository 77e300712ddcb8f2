//! Shared state types passed between the estimator and the control loops.
//!
//! All types are `Copy`; the latest attitude is exchanged through an
//! [`AttitudeMailbox`] so readers never block the fast loop for long.
use core::cell::Cell;
use core::fmt::Write;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::drivers::ahrs::Quaternion;

// ── Data types ────────────────────────────────────────────────────────────────

/// One calibrated IMU reading. Gyro in rad/s; accel and mag in whatever units
/// the configured gravity and field magnitude use.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ImuSample {
    pub gyro: [f32; 3],
    pub accel: [f32; 3],
    pub mag: [f32; 3],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AttitudeHealth {
    /// Fresh after start or reset; not yet trusted for control.
    #[default]
    Converging,
    Healthy,
    /// Too many consecutive failed cycles.
    Stale,
}

/// Attitude snapshot published once per estimator cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AttitudeState {
    pub quaternion: Quaternion,
    pub roll_rad: f32,
    pub pitch_rad: f32,
    pub yaw_rad: f32,
    pub health: AttitudeHealth,
    pub reset_count: u32,
    pub cycle: u32,
}

impl AttitudeState {
    pub const INITIAL: Self = Self {
        quaternion: Quaternion::new(1.0, 0.0, 0.0, 0.0),
        roll_rad: 0.0,
        pitch_rad: 0.0,
        yaw_rad: 0.0,
        health: AttitudeHealth::Converging,
        reset_count: 0,
        cycle: 0,
    };

    /// Human-readable line for the USB/RTT debug stream.
    pub fn debug_line(&self) -> heapless::String<128> {
        let q = &self.quaternion;
        let mut m = heapless::String::<128>::new();
        let _ = write!(
            m,
            "[ATT] r={:.1} p={:.1} y={:.1} q=[{:.4} {:.4} {:.4} {:.4}] h={:?} rst={} n={}\r\n",
            self.roll_rad.to_degrees(),
            self.pitch_rad.to_degrees(),
            self.yaw_rad.to_degrees(),
            q.w,
            q.x,
            q.y,
            q.z,
            self.health,
            self.reset_count,
            self.cycle
        );
        m
    }
}

// ── Publication ───────────────────────────────────────────────────────────────

/// Latest-value cell. Written by the estimator task only; any number of
/// readers. Each call holds the critical section for a single copy.
pub struct AttitudeMailbox {
    inner: Mutex<CriticalSectionRawMutex, Cell<AttitudeState>>,
}

impl AttitudeMailbox {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Cell::new(AttitudeState::INITIAL)),
        }
    }

    pub fn publish(&self, state: AttitudeState) {
        self.inner.lock(|cell| cell.set(state));
    }

    pub fn latest(&self) -> AttitudeState {
        self.inner.lock(|cell| cell.get())
    }
}

impl Default for AttitudeMailbox {
    fn default() -> Self {
        Self::new()
    }
}
