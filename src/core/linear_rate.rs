use crate::core::solver;
use crate::types::{
    CovarianceMatrix, Interferogram, NetworkMask, ObservationStack, PixelEstimate, Real,
    StackError, StackProduct, StackResult,
};
use ndarray::{Array2, Array3, Zip};
use serde::{Deserialize, Serialize};

/// Parameters for linear rate estimation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearRateParams {
    /// Minimum number of coherent observations for a pixel
    pub min_observations: usize,
    /// n-sigma ratio used to threshold model-minus-observation residuals
    pub nsig: f64,
    /// Maximum allowable standard error for an accepted pixel
    pub max_std_error: Real,
    /// Dispatch rows across the worker pool instead of looping serially
    pub parallel: bool,
}

impl Default for LinearRateParams {
    fn default() -> Self {
        Self {
            min_observations: 3, // pixel threshold
            nsig: 3.0,           // 3-sigma residual rejection
            max_std_error: 2.0,  // in the rate units of the input phase
            parallel: true,
        }
    }
}

/// Pixel-by-pixel linear rate (velocity) estimator
pub struct LinearRateEstimator {
    params: LinearRateParams,
}

impl LinearRateEstimator {
    /// Create an estimator with default parameters
    pub fn new() -> Self {
        Self {
            params: LinearRateParams::default(),
        }
    }

    /// Create an estimator with custom parameters
    pub fn with_params(params: LinearRateParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &LinearRateParams {
        &self.params
    }

    /// Estimate the linear rate map for a stack of interferograms.
    ///
    /// `vcm` is the temporal variance-covariance matrix over the observation
    /// set, supplied by the upstream covariance estimation stage. `mst` is
    /// the optional per-pixel observation-network mask; when absent every
    /// non-missing observation is treated as usable, and when supplied it is
    /// intersected with actual data presence so a missing phase value can
    /// never be selected.
    ///
    /// Returns the rate, standard error and sample-count rasters. Pixels
    /// with too few coherent observations, or whose accepted fit exceeds the
    /// maximum standard error, carry NaN in all three rasters.
    pub fn estimate(
        &self,
        ifgs: &[Interferogram],
        vcm: &CovarianceMatrix,
        mst: Option<NetworkMask>,
    ) -> StackResult<StackProduct> {
        self.validate_inputs(ifgs, vcm, mst.as_ref())?;

        let (rows, cols) = ifgs[0].dim();
        log::info!(
            "Estimating linear rate for {}x{} pixels from {} interferograms",
            rows,
            cols,
            ifgs.len()
        );
        log::debug!("Estimation parameters: {:?}", self.params);

        if !solver::is_positive_definite(vcm) {
            log::warn!(
                "Temporal covariance matrix failed the positive-definite diagnostic; \
                 per-pixel factorization may fail"
            );
        }

        let (obs, presence) = build_observation_stack(ifgs);
        let spans: Vec<f64> = ifgs.iter().map(|x| x.time_span).collect();
        let mask = merge_network_mask(mst, presence);

        let row_results = if self.params.parallel {
            self.solve_rows_parallel(rows, cols, &obs, &mask, &spans, vcm)?
        } else {
            self.solve_rows_sequential(rows, cols, &obs, &mask, &spans, vcm)?
        };

        let mut product = assemble_product(rows, cols, row_results);
        self.apply_error_threshold(&mut product);

        let determined = product.rate.iter().filter(|v| !v.is_nan()).count();
        log::info!(
            "Linear rate estimation completed: {} of {} pixels determined",
            determined,
            rows * cols
        );
        Ok(product)
    }

    fn validate_inputs(
        &self,
        ifgs: &[Interferogram],
        vcm: &CovarianceMatrix,
        mst: Option<&NetworkMask>,
    ) -> StackResult<()> {
        if ifgs.is_empty() {
            return Err(StackError::ShapeMismatch(
                "at least one interferogram is required".to_string(),
            ));
        }
        if self.params.min_observations == 0 {
            return Err(StackError::Processing(
                "minimum observation count must be at least 1".to_string(),
            ));
        }

        let dim = ifgs[0].dim();
        for (k, ifg) in ifgs.iter().enumerate() {
            if ifg.dim() != dim {
                return Err(StackError::ShapeMismatch(format!(
                    "interferogram {} is {:?}, expected {:?}",
                    k,
                    ifg.dim(),
                    dim
                )));
            }
            if !ifg.time_span.is_finite() || ifg.time_span == 0.0 {
                return Err(StackError::Processing(format!(
                    "interferogram {} has degenerate time span {}",
                    k, ifg.time_span
                )));
            }
        }

        let n = ifgs.len();
        if vcm.dim() != (n, n) {
            return Err(StackError::ShapeMismatch(format!(
                "covariance matrix is {:?}, expected ({}, {})",
                vcm.dim(),
                n,
                n
            )));
        }
        if let Some(mask) = mst {
            if mask.dim() != (n, dim.0, dim.1) {
                return Err(StackError::ShapeMismatch(format!(
                    "network mask is {:?}, expected ({}, {}, {})",
                    mask.dim(),
                    n,
                    dim.0,
                    dim.1
                )));
            }
        }
        Ok(())
    }

    /// Parallel row dispatch using Rayon (if available)
    #[cfg(feature = "parallel")]
    fn solve_rows_parallel(
        &self,
        rows: usize,
        cols: usize,
        obs: &ObservationStack,
        mask: &NetworkMask,
        spans: &[f64],
        vcm: &CovarianceMatrix,
    ) -> StackResult<Vec<Vec<PixelEstimate>>> {
        use rayon::prelude::*;

        log::debug!("Dispatching {} row tasks across the worker pool", rows);

        (0..rows)
            .into_par_iter()
            .map(|row| {
                solve_row(
                    row,
                    cols,
                    obs,
                    mask,
                    spans,
                    vcm,
                    self.params.min_observations,
                    self.params.nsig,
                )
            })
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn solve_rows_parallel(
        &self,
        rows: usize,
        cols: usize,
        obs: &ObservationStack,
        mask: &NetworkMask,
        spans: &[f64],
        vcm: &CovarianceMatrix,
    ) -> StackResult<Vec<Vec<PixelEstimate>>> {
        // Fallback when the parallel feature is disabled
        self.solve_rows_sequential(rows, cols, obs, mask, spans, vcm)
    }

    fn solve_rows_sequential(
        &self,
        rows: usize,
        cols: usize,
        obs: &ObservationStack,
        mask: &NetworkMask,
        spans: &[f64],
        vcm: &CovarianceMatrix,
    ) -> StackResult<Vec<Vec<PixelEstimate>>> {
        log::debug!("Solving {} rows sequentially", rows);

        (0..rows)
            .map(|row| {
                solve_row(
                    row,
                    cols,
                    obs,
                    mask,
                    spans,
                    vcm,
                    self.params.min_observations,
                    self.params.nsig,
                )
            })
            .collect()
    }

    /// Overwrite pixels whose accepted fit is too uncertain. The sample
    /// count is invalidated together with rate and error so downstream
    /// consumers never see a count for a masked pixel.
    fn apply_error_threshold(&self, product: &mut StackProduct) {
        let maxsig = self.params.max_std_error;
        let mut masked = 0usize;
        Zip::from(&mut product.rate)
            .and(&mut product.std_error)
            .and(&mut product.samples)
            .for_each(|rate, err, samples| {
                if *err > maxsig {
                    *rate = Real::NAN;
                    *err = Real::NAN;
                    *samples = Real::NAN;
                    masked += 1;
                }
            });
        if masked > 0 {
            log::debug!(
                "{} pixels exceeded the maximum standard error {}",
                masked,
                maxsig
            );
        }
    }
}

/// Solve every pixel of one image row.
///
/// This is the unit of parallel dispatch: coarser than per-pixel work to
/// amortize scheduling overhead, with no shared mutable state between
/// columns. The first fatal pixel error aborts the row.
pub fn solve_row(
    row: usize,
    cols: usize,
    obs: &ObservationStack,
    mask: &NetworkMask,
    spans: &[f64],
    vcm: &CovarianceMatrix,
    min_observations: usize,
    nsig: f64,
) -> StackResult<Vec<PixelEstimate>> {
    let mut estimates = Vec::with_capacity(cols);
    for col in 0..cols {
        estimates.push(solver::solve_pixel(
            row,
            col,
            obs,
            mask,
            spans,
            vcm,
            min_observations,
            nsig,
        )?);
    }
    Ok(estimates)
}

/// Stack the interferogram phases into a 3D observation block, zero-filling
/// missing values, and record which cells held real data. Missing-ness is
/// carried by the presence mask from here on, never by NaN arithmetic.
fn build_observation_stack(ifgs: &[Interferogram]) -> (ObservationStack, NetworkMask) {
    let (rows, cols) = ifgs[0].dim();
    let mut obs = Array3::zeros((ifgs.len(), rows, cols));
    let mut presence = Array3::from_elem((ifgs.len(), rows, cols), false);
    for (k, ifg) in ifgs.iter().enumerate() {
        for ((i, j), &value) in ifg.phase_data.indexed_iter() {
            if !value.is_nan() {
                obs[[k, i, j]] = value;
                presence[[k, i, j]] = true;
            }
        }
    }
    (obs, presence)
}

/// Derive the usable-observation mask: the supplied network selection
/// intersected with actual data presence, or presence alone when no network
/// mask is given.
fn merge_network_mask(mst: Option<NetworkMask>, presence: NetworkMask) -> NetworkMask {
    match mst {
        None => presence,
        Some(mut mask) => {
            Zip::from(&mut mask)
                .and(&presence)
                .for_each(|m, &p| *m = *m && p);
            mask
        }
    }
}

/// Assemble per-row results into the three output rasters, in row order.
fn assemble_product(rows: usize, cols: usize, row_results: Vec<Vec<PixelEstimate>>) -> StackProduct {
    let mut rate = Array2::zeros((rows, cols));
    let mut std_error = Array2::zeros((rows, cols));
    let mut samples = Array2::zeros((rows, cols));
    for (i, row) in row_results.into_iter().enumerate() {
        for (j, est) in row.into_iter().enumerate() {
            rate[[i, j]] = est.rate;
            std_error[[i, j]] = est.std_error;
            samples[[i, j]] = est.samples;
        }
    }
    StackProduct {
        rate,
        std_error,
        samples,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_ifg(rows: usize, cols: usize, value: f32, span: f64) -> Interferogram {
        Interferogram::new(Array2::from_elem((rows, cols), value), span)
    }

    fn identity_vcm(n: usize) -> CovarianceMatrix {
        Array2::from_shape_fn((n, n), |(i, j)| if i == j { 1.0 } else { 0.0 })
    }

    fn linear_stack(rows: usize, cols: usize) -> Vec<Interferogram> {
        [1.0, 2.0, 3.0]
            .iter()
            .map(|&span| uniform_ifg(rows, cols, 0.1 * span as f32, span))
            .collect()
    }

    #[test]
    fn test_mismatched_interferogram_shapes_fail_fast() {
        let ifgs = vec![uniform_ifg(2, 2, 0.1, 1.0), uniform_ifg(2, 3, 0.2, 2.0)];
        let result = LinearRateEstimator::new().estimate(&ifgs, &identity_vcm(2), None);
        assert!(matches!(result, Err(StackError::ShapeMismatch(_))));
    }

    #[test]
    fn test_wrong_covariance_order_fails_fast() {
        let ifgs = linear_stack(2, 2);
        let result = LinearRateEstimator::new().estimate(&ifgs, &identity_vcm(2), None);
        assert!(matches!(result, Err(StackError::ShapeMismatch(_))));
    }

    #[test]
    fn test_wrong_mask_shape_fails_fast() {
        let ifgs = linear_stack(2, 2);
        let mask = Array3::from_elem((3, 2, 3), true);
        let result = LinearRateEstimator::new().estimate(&ifgs, &identity_vcm(3), Some(mask));
        assert!(matches!(result, Err(StackError::ShapeMismatch(_))));
    }

    #[test]
    fn test_degenerate_time_span_fails_fast() {
        let mut ifgs = linear_stack(2, 2);
        ifgs[1].time_span = 0.0;
        let result = LinearRateEstimator::new().estimate(&ifgs, &identity_vcm(3), None);
        assert!(matches!(result, Err(StackError::Processing(_))));
    }

    #[test]
    fn test_zero_pixel_threshold_is_rejected() {
        let ifgs = linear_stack(2, 2);
        let estimator = LinearRateEstimator::with_params(LinearRateParams {
            min_observations: 0,
            ..LinearRateParams::default()
        });
        let result = estimator.estimate(&ifgs, &identity_vcm(3), None);
        assert!(matches!(result, Err(StackError::Processing(_))));
    }

    #[test]
    fn test_missing_phase_restricts_derived_mask() {
        let mut ifgs = linear_stack(2, 2);
        ifgs[2].phase_data[[0, 0]] = f32::NAN;

        let params = LinearRateParams {
            min_observations: 3,
            parallel: false,
            ..LinearRateParams::default()
        };
        let product = LinearRateEstimator::with_params(params)
            .estimate(&ifgs, &identity_vcm(3), None)
            .unwrap();

        // Only two observations back pixel (0, 0), below the threshold.
        assert!(product.rate[[0, 0]].is_nan());
        assert!(product.samples[[0, 0]].is_nan());
        assert_eq!(product.samples[[1, 1]], 3.0);
        assert!((product.rate[[1, 1]] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_supplied_mask_is_intersected_with_presence() {
        let mut ifgs = linear_stack(1, 1);
        ifgs[2].phase_data[[0, 0]] = f32::NAN;

        // The network mask claims all three observations are usable; the
        // missing phase value must still be excluded.
        let mask = Array3::from_elem((3, 1, 1), true);
        let params = LinearRateParams {
            min_observations: 2,
            parallel: false,
            ..LinearRateParams::default()
        };
        let product = LinearRateEstimator::with_params(params)
            .estimate(&ifgs, &identity_vcm(3), Some(mask))
            .unwrap();

        assert_eq!(product.samples[[0, 0]], 2.0);
        assert!((product.rate[[0, 0]] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_error_threshold_masks_all_three_rasters() {
        let ifgs = linear_stack(2, 2);
        // Inflate observation noise so the formal error exceeds the cap.
        let vcm = Array2::from_shape_fn((3, 3), |(i, j)| if i == j { 1e6 } else { 0.0 });

        let params = LinearRateParams {
            min_observations: 2,
            max_std_error: 2.0,
            parallel: false,
            ..LinearRateParams::default()
        };
        let product = LinearRateEstimator::with_params(params)
            .estimate(&ifgs, &vcm, None)
            .unwrap();

        // sqrt(1e6 / 14) is far above the 2.0 cap.
        for value in product
            .rate
            .iter()
            .chain(product.std_error.iter())
            .chain(product.samples.iter())
        {
            assert!(value.is_nan());
        }
    }
}
