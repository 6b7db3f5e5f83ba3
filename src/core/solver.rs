use crate::types::{
    CovarianceMatrix, NetworkMask, ObservationStack, PixelEstimate, StackError, StackResult,
};
use nalgebra::{DMatrix, DVector};

/// Eigenvalue floor below which a matrix is reported as not positive definite
const EIGENVALUE_TOLERANCE: f64 = 1e-6;

/// Check whether a covariance matrix is positive definite.
///
/// Intended as a cheap once-per-run diagnostic: the per-pixel Cholesky
/// factorization remains the authoritative check. Assumes a symmetric input
/// and tests that every eigenvalue clears a small positive floor.
pub fn is_positive_definite(matrix: &CovarianceMatrix) -> bool {
    let (rows, cols) = matrix.dim();
    if rows != cols || rows == 0 {
        return false;
    }
    let m = DMatrix::from_fn(rows, cols, |i, j| matrix[[i, j]]);
    m.symmetric_eigen()
        .eigenvalues
        .iter()
        .all(|&e| e > EIGENVALUE_TOLERANCE)
}

/// Estimate a robust linear velocity for a single pixel using iterative
/// weighted least squares with Danish-method outlier rejection.
///
/// The active observation set starts from the entries the network mask marks
/// usable at this pixel. Each iteration fits a one-parameter velocity model
/// (time spans as the regressor, zero intercept) weighted by the covariance
/// sub-matrix of the active observations, then discards the single worst
/// weighted residual if it exceeds `nsig`. The loop accepts as soon as all
/// weighted residuals pass, or gives up once fewer than `min_observations`
/// remain, returning the all-NaN undetermined estimate.
///
/// A covariance sub-matrix that fails Cholesky factorization signals an
/// upstream invariant violation and is returned as
/// [`StackError::NonPositiveDefinite`] rather than folded into the
/// undetermined case.
pub fn solve_pixel(
    row: usize,
    col: usize,
    obs: &ObservationStack,
    mask: &NetworkMask,
    spans: &[f64],
    vcm: &CovarianceMatrix,
    min_observations: usize,
    nsig: f64,
) -> StackResult<PixelEstimate> {
    let layers = obs.dim().0;
    let mut active: Vec<usize> = (0..layers).filter(|&k| mask[[k, row, col]]).collect();

    // A fit needs at least one observation even when the caller's pixel
    // threshold is lower.
    let pthr = min_observations.max(1);

    while active.len() >= pthr {
        let n = active.len();
        let not_pd = |what: &str| {
            StackError::NonPositiveDefinite(format!(
                "{} at pixel ({}, {}) with {} active observations",
                what, row, col, n
            ))
        };

        // Observation sub-vector, one-column design matrix of time spans and
        // the covariance sub-block restricted to the active observations.
        let y = DVector::from_iterator(n, active.iter().map(|&k| obs[[k, row, col]] as f64));
        let a = DVector::from_iterator(n, active.iter().map(|&k| spans[k]));
        let sub_vcm = DMatrix::from_fn(n, n, |i, j| vcm[[active[i], active[j]]]);

        let chol = sub_vcm
            .cholesky()
            .ok_or_else(|| not_pd("Cholesky factorization failed"))?;

        // Whiten the system by solving against the lower Cholesky factor
        // instead of forming its inverse.
        let lower = chol.l();
        let wh_a = lower
            .solve_lower_triangular(&a)
            .ok_or_else(|| not_pd("triangular solve failed"))?;
        let wh_y = lower
            .solve_lower_triangular(&y)
            .ok_or_else(|| not_pd("triangular solve failed"))?;

        // Column-pivoted QR of the whitened design matrix; with a single
        // free parameter the pivot is the identity.
        let qr = DMatrix::from_column_slice(n, 1, wh_a.as_slice()).col_piv_qr();
        let r00 = qr.r()[(0, 0)];
        if r00 == 0.0 {
            return Err(StackError::Processing(format!(
                "degenerate design matrix at pixel ({}, {}): active time spans are all zero",
                row, col
            )));
        }
        let z = qr.q().transpose() * &wh_y;
        let velocity = z[0] / r00;

        // Formal error: the single diagonal entry of inv(B^T inv(V) B).
        let gain = chol.solve(&a);
        let std_error = (1.0 / a.dot(&gain)).sqrt();

        // Residuals of the unwhitened system (model minus observations).
        let residuals = &a * velocity - &y;

        // Danish method: weight residuals by the upper Cholesky factor of
        // the inverse covariance and test the worst against the n-sigma
        // threshold.
        let weight = chol
            .inverse()
            .cholesky()
            .ok_or_else(|| not_pd("inverse covariance factorization failed"))?
            .l()
            .transpose();
        let weighted = weight * &residuals;

        let mut worst = 0;
        let mut max_ratio = 0.0_f64;
        for (i, w) in weighted.iter().enumerate() {
            if w.abs() > max_ratio {
                max_ratio = w.abs();
                worst = i;
            }
        }

        if max_ratio > nsig {
            // Discard the worst-fitting observation and refit.
            active.remove(worst);
        } else {
            return Ok(PixelEstimate {
                rate: velocity as f32,
                std_error: std_error as f32,
                samples: n as f32,
            });
        }
    }

    Ok(PixelEstimate::undetermined())
}
