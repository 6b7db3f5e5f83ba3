use ndarray::{Array2, Array3};

/// Real-valued phase or rate data
pub type Real = f32;

/// 2D phase image (row x col), NaN marks missing pixels
pub type PhaseImage = Array2<Real>;

/// 2D output raster (row x col)
pub type Raster = Array2<Real>;

/// 3D observation stack (observation x row x col)
pub type ObservationStack = Array3<Real>;

/// 3D per-pixel observation-network mask (observation x row x col)
pub type NetworkMask = Array3<bool>;

/// Temporal variance-covariance matrix over the observation set
pub type CovarianceMatrix = Array2<f64>;

/// One interferometric observation: a co-registered phase image and the
/// temporal baseline it spans.
///
/// This is the boundary contract with the upstream raster-loading and
/// correction stages; phase values are expected in consistent units
/// (e.g. millimetres) with NaN marking missing data.
#[derive(Debug, Clone)]
pub struct Interferogram {
    /// Phase values (row x col), NaN for missing pixels
    pub phase_data: PhaseImage,
    /// Temporal span covered by this interferogram, in years
    pub time_span: f64,
}

impl Interferogram {
    pub fn new(phase_data: PhaseImage, time_span: f64) -> Self {
        Self {
            phase_data,
            time_span,
        }
    }

    /// Image dimensions as (rows, cols)
    pub fn dim(&self) -> (usize, usize) {
        self.phase_data.dim()
    }
}

/// Estimate for a single pixel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelEstimate {
    /// Linear deformation rate (velocity)
    pub rate: Real,
    /// Formal standard error of the rate
    pub std_error: Real,
    /// Number of observations used in the accepted fit.
    /// Stored as a float so the undetermined sentinel is the same NaN
    /// that marks rate and error.
    pub samples: Real,
}

impl PixelEstimate {
    /// Sentinel for a pixel where no reliable rate could be determined
    pub fn undetermined() -> Self {
        Self {
            rate: Real::NAN,
            std_error: Real::NAN,
            samples: Real::NAN,
        }
    }

    /// True if this pixel produced an accepted fit
    pub fn is_determined(&self) -> bool {
        !self.rate.is_nan()
    }
}

/// Full-grid estimation result: rate, standard error and sample-count
/// rasters sharing the input image extent.
#[derive(Debug, Clone)]
pub struct StackProduct {
    pub rate: Raster,
    pub std_error: Raster,
    pub samples: Raster,
}

/// Error types for rate estimation
#[derive(Debug, thiserror::Error)]
pub enum StackError {
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Covariance matrix is not positive definite: {0}")]
    NonPositiveDefinite(String),

    #[error("Processing error: {0}")]
    Processing(String),
}

/// Result type for rate estimation operations
pub type StackResult<T> = Result<T, StackError>;
