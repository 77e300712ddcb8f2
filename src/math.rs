//! Scalar `f32` math shared by every build.
//!
//! Host tests and firmware call the same `libm` routines, so accuracy measured
//! in tests is the accuracy that ships.

/// Square root; zero for non-positive input.
#[inline]
pub(crate) fn sqrt(value: f32) -> f32 {
    if value <= 0.0 {
        return 0.0;
    }
    libm::sqrtf(value)
}

#[inline]
pub(crate) fn abs(x: f32) -> f32 {
    libm::fabsf(x)
}

#[inline]
pub(crate) fn sin(x: f32) -> f32 {
    libm::sinf(x)
}

#[inline]
pub(crate) fn cos(x: f32) -> f32 {
    libm::cosf(x)
}

#[inline]
pub(crate) fn sin_cos(x: f32) -> (f32, f32) {
    libm::sincosf(x)
}

/// Arcsine with the argument clamped to [-1, 1].
#[inline]
pub(crate) fn asin(x: f32) -> f32 {
    libm::asinf(x.clamp(-1.0, 1.0))
}

/// Arccosine with the argument clamped to [-1, 1].
#[inline]
pub(crate) fn acos(x: f32) -> f32 {
    libm::acosf(x.clamp(-1.0, 1.0))
}

#[inline]
pub(crate) fn atan2(y: f32, x: f32) -> f32 {
    libm::atan2f(y, x)
}
