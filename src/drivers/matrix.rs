//! Fixed-size dense matrices for the estimator.
//!
//! Dimensions live in the type, so a shape mismatch is a compile error and only
//! the numerically fallible operations (Cholesky, inversion, normalisation,
//! runtime column/block indexing) return a `Result`. Storage is a plain
//! row-major `[[f32; C]; R]` on the stack; nothing here allocates.
use core::fmt;
use core::ops::{Index, IndexMut};

use crate::math::{abs, sqrt};

/// Vectors whose Euclidean length is at or below this are treated as zero.
pub const ZERO_LENGTH: f32 = 1e-6;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MatrixError {
    /// A Cholesky pivot was zero, negative or NaN.
    NotPositiveDefinite,
    /// Gauss-Jordan elimination hit a pivot indistinguishable from zero.
    Singular,
    /// Normalisation of a (numerically) zero-length vector.
    ZeroLength,
    /// Column or block index outside the destination matrix.
    IndexOutOfBounds,
}

impl fmt::Display for MatrixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotPositiveDefinite => f.write_str("matrix is not positive definite"),
            Self::Singular => f.write_str("matrix is singular"),
            Self::ZeroLength => f.write_str("vector has zero length"),
            Self::IndexOutOfBounds => f.write_str("index outside matrix bounds"),
        }
    }
}

// ── Matrix ───────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Matrix<const R: usize, const C: usize> {
    data: [[f32; C]; R],
}

/// Column vector.
pub type Vector<const N: usize> = Matrix<N, 1>;

impl<const R: usize, const C: usize> Default for Matrix<R, C> {
    fn default() -> Self {
        Self::zeros()
    }
}

impl<const R: usize, const C: usize> Index<(usize, usize)> for Matrix<R, C> {
    type Output = f32;

    #[inline]
    fn index(&self, (r, c): (usize, usize)) -> &f32 {
        &self.data[r][c]
    }
}

impl<const R: usize, const C: usize> IndexMut<(usize, usize)> for Matrix<R, C> {
    #[inline]
    fn index_mut(&mut self, (r, c): (usize, usize)) -> &mut f32 {
        &mut self.data[r][c]
    }
}

impl<const R: usize, const C: usize> Matrix<R, C> {
    pub const fn zeros() -> Self {
        Self { data: [[0.0; C]; R] }
    }

    pub const fn from_rows(data: [[f32; C]; R]) -> Self {
        Self { data }
    }

    pub fn to_rows(&self) -> [[f32; C]; R] {
        self.data
    }

    pub fn fill_zero(&mut self) {
        self.data = [[0.0; C]; R];
    }

    pub fn copy_from(&mut self, other: &Self) {
        self.data = other.data;
    }

    pub fn add(&self, rhs: &Self) -> Self {
        let mut out = *self;
        for (row, rhs_row) in out.data.iter_mut().zip(rhs.data.iter()) {
            for (a, b) in row.iter_mut().zip(rhs_row.iter()) {
                *a += *b;
            }
        }
        out
    }

    pub fn sub(&self, rhs: &Self) -> Self {
        let mut out = *self;
        for (row, rhs_row) in out.data.iter_mut().zip(rhs.data.iter()) {
            for (a, b) in row.iter_mut().zip(rhs_row.iter()) {
                *a -= *b;
            }
        }
        out
    }

    pub fn scale(&self, k: f32) -> Self {
        let mut out = *self;
        out.scale_in_place(k);
        out
    }

    pub fn scale_in_place(&mut self, k: f32) {
        for row in self.data.iter_mut() {
            for v in row.iter_mut() {
                *v *= k;
            }
        }
    }

    /// C = A * B
    pub fn mul<const K: usize>(&self, rhs: &Matrix<C, K>) -> Matrix<R, K> {
        let mut out = Matrix::zeros();
        self.mul_into(rhs, &mut out);
        out
    }

    /// dest = A * B, overwriting every element of `dest`.
    pub fn mul_into<const K: usize>(&self, rhs: &Matrix<C, K>, dest: &mut Matrix<R, K>) {
        for i in 0..R {
            for j in 0..K {
                let mut s = 0.0f32;
                for k in 0..C {
                    s += self.data[i][k] * rhs.data[k][j];
                }
                dest.data[i][j] = s;
            }
        }
    }

    pub fn transpose(&self) -> Matrix<C, R> {
        let mut out = Matrix::zeros();
        self.transpose_into(&mut out);
        out
    }

    pub fn transpose_into(&self, dest: &mut Matrix<C, R>) {
        for i in 0..R {
            for j in 0..C {
                dest.data[j][i] = self.data[i][j];
            }
        }
    }

    /// Extract column `col` as a vector.
    pub fn column(&self, col: usize) -> Result<Vector<R>, MatrixError> {
        if col >= C {
            return Err(MatrixError::IndexOutOfBounds);
        }
        let mut out = Vector::zeros();
        for i in 0..R {
            out.data[i][0] = self.data[i][col];
        }
        Ok(out)
    }

    /// Overwrite column `col` with `v`.
    pub fn set_column(&mut self, col: usize, v: &Vector<R>) -> Result<(), MatrixError> {
        if col >= C {
            return Err(MatrixError::IndexOutOfBounds);
        }
        for i in 0..R {
            self.data[i][col] = v.data[i][0];
        }
        Ok(())
    }

    /// Copy `block` into this matrix with its top-left corner at (`row`, `col`).
    pub fn insert<const BR: usize, const BC: usize>(
        &mut self,
        row: usize,
        col: usize,
        block: &Matrix<BR, BC>,
    ) -> Result<(), MatrixError> {
        let fits = |start: usize, len: usize, limit: usize| {
            start.checked_add(len).is_some_and(|end| end <= limit)
        };
        if !fits(row, BR, R) || !fits(col, BC, C) {
            return Err(MatrixError::IndexOutOfBounds);
        }
        for i in 0..BR {
            self.data[row + i][col..col + BC].copy_from_slice(&block.data[i]);
        }
        Ok(())
    }

    /// Multiply column j by `weights[j]`.
    pub fn scale_columns(&self, weights: &Matrix<1, C>) -> Self {
        let mut out = *self;
        for row in out.data.iter_mut() {
            for (v, w) in row.iter_mut().zip(weights.data[0].iter()) {
                *v *= *w;
            }
        }
        out
    }

    pub fn max_abs(&self) -> f32 {
        let mut m = 0.0f32;
        for row in self.data.iter() {
            for v in row.iter() {
                let a = abs(*v);
                if a > m {
                    m = a;
                }
            }
        }
        m
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|row| row.iter().all(|v| v.is_finite()))
    }
}

// ── Square matrices ──────────────────────────────────────────────────────────

impl<const N: usize> Matrix<N, N> {
    pub const fn identity() -> Self {
        let mut data = [[0.0; N]; N];
        let mut i = 0;
        while i < N {
            data[i][i] = 1.0;
            i += 1;
        }
        Self { data }
    }

    pub const fn from_diagonal(diag: [f32; N]) -> Self {
        let mut data = [[0.0; N]; N];
        let mut i = 0;
        while i < N {
            data[i][i] = diag[i];
            i += 1;
        }
        Self { data }
    }

    pub fn set_identity(&mut self) {
        *self = Self::identity();
    }

    pub fn trace(&self) -> f32 {
        (0..N).map(|i| self.data[i][i]).sum()
    }

    /// Replace A by (A + Aᵀ) / 2.
    pub fn symmetrize(&mut self) {
        for i in 0..N {
            for j in (i + 1)..N {
                let mean = 0.5 * (self.data[i][j] + self.data[j][i]);
                self.data[i][j] = mean;
                self.data[j][i] = mean;
            }
        }
    }

    /// Largest |A[i][j] - A[j][i]|.
    pub fn max_asymmetry(&self) -> f32 {
        let mut m = 0.0f32;
        for i in 0..N {
            for j in (i + 1)..N {
                let d = abs(self.data[i][j] - self.data[j][i]);
                if d > m {
                    m = d;
                }
            }
        }
        m
    }

    /// Lower-triangular L with L * Lᵀ = A.
    ///
    /// Only the lower triangle of `self` is read. The factor is built in a
    /// fresh matrix and returned only when every pivot is strictly positive,
    /// so a failed decomposition never leaves a partial factor behind.
    pub fn cholesky(&self) -> Result<Self, MatrixError> {
        let mut l = Self::zeros();
        for j in 0..N {
            let mut diag = self.data[j][j];
            for k in 0..j {
                diag -= l.data[j][k] * l.data[j][k];
            }
            if diag <= 0.0 || diag.is_nan() {
                return Err(MatrixError::NotPositiveDefinite);
            }
            let ljj = sqrt(diag);
            l.data[j][j] = ljj;
            for i in (j + 1)..N {
                let mut s = self.data[i][j];
                for k in 0..j {
                    s -= l.data[i][k] * l.data[j][k];
                }
                l.data[i][j] = s / ljj;
            }
        }
        Ok(l)
    }

    /// Gauss-Jordan inverse with partial pivoting.
    pub fn inverse(&self) -> Result<Self, MatrixError> {
        let scale = self.max_abs();
        if scale == 0.0 || !scale.is_finite() {
            return Err(MatrixError::Singular);
        }
        let tolerance = f32::EPSILON * scale;

        let mut a = *self;
        let mut inv = Self::identity();
        for col in 0..N {
            let mut pivot_row = col;
            let mut pivot_abs = abs(a.data[col][col]);
            for row in (col + 1)..N {
                let v = abs(a.data[row][col]);
                if v > pivot_abs {
                    pivot_abs = v;
                    pivot_row = row;
                }
            }
            if pivot_abs <= tolerance {
                return Err(MatrixError::Singular);
            }
            if pivot_row != col {
                a.data.swap(col, pivot_row);
                inv.data.swap(col, pivot_row);
            }

            let recip = 1.0 / a.data[col][col];
            for k in 0..N {
                a.data[col][k] *= recip;
                inv.data[col][k] *= recip;
            }

            for row in 0..N {
                if row == col {
                    continue;
                }
                let factor = a.data[row][col];
                if factor == 0.0 {
                    continue;
                }
                for k in 0..N {
                    let a_pivot = a.data[col][k];
                    let inv_pivot = inv.data[col][k];
                    a.data[row][k] -= factor * a_pivot;
                    inv.data[row][k] -= factor * inv_pivot;
                }
            }
        }
        Ok(inv)
    }
}

// ── Column vectors ───────────────────────────────────────────────────────────

impl<const N: usize> Index<usize> for Matrix<N, 1> {
    type Output = f32;

    #[inline]
    fn index(&self, i: usize) -> &f32 {
        &self.data[i][0]
    }
}

impl<const N: usize> IndexMut<usize> for Matrix<N, 1> {
    #[inline]
    fn index_mut(&mut self, i: usize) -> &mut f32 {
        &mut self.data[i][0]
    }
}

impl<const N: usize> Matrix<N, 1> {
    pub const fn from_array(values: [f32; N]) -> Self {
        let mut data = [[0.0; 1]; N];
        let mut i = 0;
        while i < N {
            data[i][0] = values[i];
            i += 1;
        }
        Self { data }
    }

    pub fn as_array(&self) -> [f32; N] {
        let mut out = [0.0f32; N];
        for (o, row) in out.iter_mut().zip(self.data.iter()) {
            *o = row[0];
        }
        out
    }

    pub fn norm(&self) -> f32 {
        let sum_sq: f32 = self.data.iter().map(|row| row[0] * row[0]).sum();
        sqrt(sum_sq)
    }

    /// Scale to unit Euclidean length.
    ///
    /// A zero-length (or NaN) vector is left untouched and reported as
    /// [`MatrixError::ZeroLength`].
    pub fn normalize(&mut self) -> Result<(), MatrixError> {
        let n = self.norm();
        if n <= ZERO_LENGTH || n.is_nan() {
            return Err(MatrixError::ZeroLength);
        }
        self.scale_in_place(1.0 / n);
        Ok(())
    }
}
