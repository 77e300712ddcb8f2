//! Generic Unscented Kalman Filter (Van der Merwe scaled sigma points).
//!
//! `N` states, `M` measurements, `U` control inputs and `S = 2N + 1` sigma
//! points. The process and measurement models are supplied as
//! [`SigmaTransform`] implementations; the engine knows nothing about
//! quaternions.
//!
//! Update sequence:
//!   1. XSigma = [x, x + γL, x − γL]   where L·Lᵀ = P
//!   2. process UT:      x⁻, DX, P⁻ = Σ Wc·DX·DXᵀ + Rv
//!   3. measurement UT:  ŷ, DY, Py = Σ Wc·DY·DYᵀ + Rn
//!   4. Pxy = (DX ∘ Wc)·DYᵀ
//!   5. K = Pxy·Py⁻¹
//!   6. x = x⁻ + K(y − ŷ),  P = P⁻ − K·Py·Kᵀ
use core::fmt;

use super::matrix::{Matrix, Vector};
use crate::math::sqrt;

// ── Model capability ─────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ModelError {
    /// Propagated state could not be renormalised.
    DegenerateQuaternion,
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DegenerateQuaternion => f.write_str("propagated quaternion has zero length"),
        }
    }
}

/// Maps one sigma column through a model: `IN` inputs, `OUT` outputs, `U`
/// control inputs (ignored by measurement models).
pub trait SigmaTransform<const IN: usize, const OUT: usize, const U: usize> {
    fn transform(&self, x: &Vector<IN>, u: &Vector<U>) -> Result<Vector<OUT>, ModelError>;
}

// ── Errors / status ──────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UkfError {
    CovarianceNotPositiveDefinite,
    InnovationCovarianceSingular,
    ProcessModel(ModelError),
    MeasurementModel(ModelError),
    /// A previous cycle failed; call `reset` before stepping again.
    ResetRequired,
}

impl fmt::Display for UkfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CovarianceNotPositiveDefinite => f.write_str("state covariance is not positive definite"),
            Self::InnovationCovarianceSingular => f.write_str("innovation covariance is singular"),
            Self::ProcessModel(e) => write!(f, "process model failed: {:?}", e),
            Self::MeasurementModel(e) => write!(f, "measurement model failed: {:?}", e),
            Self::ResetRequired => f.write_str("filter faulted, reset required"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FilterStatus {
    Ready,
    Faulted,
}

// ── Sigma point parameters ───────────────────────────────────────────────────

/// α sets the spread, κ is the secondary scaling, β = 2 is optimal for
/// Gaussian priors.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UkfParams {
    pub alpha: f32,
    pub kappa: f32,
    pub beta: f32,
}

impl Default for UkfParams {
    fn default() -> Self {
        Self {
            alpha: 1e-2,
            kappa: 0.0,
            beta: 2.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SigmaWeights<const S: usize> {
    pub lambda: f32,
    pub gamma: f32,
    pub wm: Matrix<1, S>,
    pub wc: Matrix<1, S>,
}

impl<const S: usize> SigmaWeights<S> {
    /// Weights for `n` states. `S` must equal `2n + 1`.
    pub fn new(n: usize, params: &UkfParams) -> Self {
        // c = N + λ, formed directly to avoid cancelling against N.
        let c = params.alpha * params.alpha * (n as f32 + params.kappa);
        let lambda = c - n as f32;
        let gamma = sqrt(c);

        let mut wm = Matrix::<1, S>::zeros();
        let mut wc = Matrix::<1, S>::zeros();
        let w = 0.5 / c;
        for j in 1..S {
            wm[(0, j)] = w;
            wc[(0, j)] = w;
        }
        wm[(0, 0)] = 1.0 - n as f32 / c;
        wc[(0, 0)] = wm[(0, 0)] + (1.0 - params.alpha * params.alpha + params.beta);

        Self { lambda, gamma, wm, wc }
    }
}

// ── Unscented transform ──────────────────────────────────────────────────────

/// Push `sigma` through `model` and collect the weighted mean, the deviation
/// matrix and the weighted covariance plus `noise`.
///
/// The mean is accumulated as offsets from the centre column,
/// `ȳ = Y₀ + Σⱼ₌₁ Wmⱼ·(Yⱼ − Y₀)`. With small α the weights are large and of
/// opposite sign (Wm₀ ≈ −1e4), so summing `Wmⱼ·Yⱼ` directly loses the mean to
/// cancellation in `f32`.
#[allow(clippy::too_many_arguments)]
pub fn unscented_transform<T, const IN: usize, const OUT: usize, const U: usize, const S: usize>(
    model: &T,
    sigma: &Matrix<IN, S>,
    u: &Vector<U>,
    weights: &SigmaWeights<S>,
    noise: &Matrix<OUT, OUT>,
    out_sigma: &mut Matrix<OUT, S>,
    mean: &mut Vector<OUT>,
    deviation: &mut Matrix<OUT, S>,
    covariance: &mut Matrix<OUT, OUT>,
) -> Result<(), ModelError>
where
    T: SigmaTransform<IN, OUT, U>,
{
    let mut column = Vector::<IN>::zeros();
    for j in 0..S {
        for i in 0..IN {
            column[i] = sigma[(i, j)];
        }
        let out = model.transform(&column, u)?;
        for i in 0..OUT {
            out_sigma[(i, j)] = out[i];
        }
    }

    for i in 0..OUT {
        let centre = out_sigma[(i, 0)];
        let mut offset = 0.0;
        for j in 1..S {
            offset += weights.wm[(0, j)] * (out_sigma[(i, j)] - centre);
        }
        mean[i] = centre + offset;
    }

    for j in 0..S {
        for i in 0..OUT {
            deviation[(i, j)] = out_sigma[(i, j)] - mean[i];
        }
    }

    deviation
        .scale_columns(&weights.wc)
        .mul_into(&deviation.transpose(), covariance);
    *covariance = covariance.add(noise);
    Ok(())
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// Per-cycle scratch. Nothing in here survives a cycle.
#[derive(Clone, Copy, Debug, Default)]
pub struct Workspace<const N: usize, const M: usize, const S: usize> {
    pub x_sigma: Matrix<N, S>,
    pub x_prop: Matrix<N, S>,
    pub y_prop: Matrix<M, S>,
    pub x_mean: Vector<N>,
    pub y_mean: Vector<M>,
    pub dx: Matrix<N, S>,
    pub dy: Matrix<M, S>,
    pub p_pred: Matrix<N, N>,
    pub py: Matrix<M, M>,
    pub pxy: Matrix<N, M>,
    pub gain: Matrix<N, M>,
}

pub struct Ukf<F, H, const N: usize, const M: usize, const U: usize, const S: usize> {
    x: Vector<N>,
    p: Matrix<N, N>,
    rv: Matrix<N, N>,
    rn: Matrix<M, M>,
    weights: SigmaWeights<S>,
    f: F,
    h: H,
    status: FilterStatus,
    ws: Workspace<N, M, S>,
}

impl<F, H, const N: usize, const M: usize, const U: usize, const S: usize> Ukf<F, H, N, M, U, S>
where
    F: SigmaTransform<N, N, U>,
    H: SigmaTransform<N, M, U>,
{
    const SIGMA_COUNT_OK: () = assert!(S == 2 * N + 1, "sigma point count must be 2N + 1");

    pub fn new(
        x0: Vector<N>,
        p0: Matrix<N, N>,
        rv: Matrix<N, N>,
        rn: Matrix<M, M>,
        f: F,
        h: H,
        params: UkfParams,
    ) -> Self {
        let () = Self::SIGMA_COUNT_OK;
        Self {
            x: x0,
            p: p0,
            rv,
            rn,
            weights: SigmaWeights::new(N, &params),
            f,
            h,
            status: FilterStatus::Ready,
            ws: Workspace::default(),
        }
    }

    /// Re-seed state and noise, clearing a fault. Weights are kept.
    pub fn reset(&mut self, x0: Vector<N>, p0: Matrix<N, N>, rv: Matrix<N, N>, rn: Matrix<M, M>) {
        self.x = x0;
        self.p = p0;
        self.rv = rv;
        self.rn = rn;
        self.ws = Workspace::default();
        self.status = FilterStatus::Ready;
    }

    /// One full predict + correct cycle. x and P change only on success.
    pub fn update(&mut self, y: &Vector<M>, u: &Vector<U>) -> Result<(), UkfError> {
        if self.status == FilterStatus::Faulted {
            return Err(UkfError::ResetRequired);
        }
        let result = self.time_update(u).and_then(|()| self.measurement_update(y, u));
        self.finish(result)
    }

    /// Time update only; commits x⁻ and P⁻.
    pub fn predict(&mut self, u: &Vector<U>) -> Result<(), UkfError> {
        if self.status == FilterStatus::Faulted {
            return Err(UkfError::ResetRequired);
        }
        let result = self.time_update(u).map(|()| {
            let mut p = self.ws.p_pred;
            p.symmetrize();
            (self.ws.x_mean, p)
        });
        self.finish(result)
    }

    fn finish(&mut self, result: Result<(Vector<N>, Matrix<N, N>), UkfError>) -> Result<(), UkfError> {
        match result {
            Ok((x, p)) => {
                self.x = x;
                self.p = p;
                Ok(())
            }
            Err(e) => {
                log_debug!("ukf cycle failed: {:?}", e);
                self.status = FilterStatus::Faulted;
                Err(e)
            }
        }
    }

    /// Sigma points and process UT into the workspace.
    fn time_update(&mut self, u: &Vector<U>) -> Result<(), UkfError> {
        let l = self
            .p
            .cholesky()
            .map_err(|_| UkfError::CovarianceNotPositiveDefinite)?
            .scale(self.weights.gamma);

        let ws = &mut self.ws;
        for i in 0..N {
            let xi = self.x[i];
            ws.x_sigma[(i, 0)] = xi;
            for j in 0..N {
                ws.x_sigma[(i, 1 + j)] = xi + l[(i, j)];
                ws.x_sigma[(i, 1 + N + j)] = xi - l[(i, j)];
            }
        }

        unscented_transform(
            &self.f,
            &ws.x_sigma,
            u,
            &self.weights,
            &self.rv,
            &mut ws.x_prop,
            &mut ws.x_mean,
            &mut ws.dx,
            &mut ws.p_pred,
        )
        .map_err(UkfError::ProcessModel)
    }

    /// Measurement UT, gain and correction. Returns the candidate (x, P).
    fn measurement_update(
        &mut self,
        y: &Vector<M>,
        u: &Vector<U>,
    ) -> Result<(Vector<N>, Matrix<N, N>), UkfError> {
        let ws = &mut self.ws;
        unscented_transform(
            &self.h,
            &ws.x_prop,
            u,
            &self.weights,
            &self.rn,
            &mut ws.y_prop,
            &mut ws.y_mean,
            &mut ws.dy,
            &mut ws.py,
        )
        .map_err(UkfError::MeasurementModel)?;

        ws.dx
            .scale_columns(&self.weights.wc)
            .mul_into(&ws.dy.transpose(), &mut ws.pxy);

        let py_inv = ws
            .py
            .inverse()
            .map_err(|_| UkfError::InnovationCovarianceSingular)?;
        ws.pxy.mul_into(&py_inv, &mut ws.gain);

        let innovation = y.sub(&ws.y_mean);
        let x = ws.x_mean.add(&ws.gain.mul(&innovation));

        let mut p = ws
            .p_pred
            .sub(&ws.gain.mul(&ws.py).mul(&ws.gain.transpose()));
        p.symmetrize();
        Ok((x, p))
    }

    pub fn state(&self) -> &Vector<N> {
        &self.x
    }

    pub fn covariance(&self) -> &Matrix<N, N> {
        &self.p
    }

    pub fn weights(&self) -> &SigmaWeights<S> {
        &self.weights
    }

    pub fn status(&self) -> FilterStatus {
        self.status
    }

    pub fn process_model(&self) -> &F {
        &self.f
    }

    pub fn measurement_model(&self) -> &H {
        &self.h
    }
}
