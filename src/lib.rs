//! StackRate: A Fast, Modular InSAR Linear Rate Estimator
//!
//! This library estimates a per-pixel linear deformation rate (velocity) and
//! its uncertainty from a stack of co-registered interferometric phase
//! images, using an iterative weighted least-squares fit over a
//! time-spanning observation network with Danish-method outlier rejection.
//!
//! Raster I/O, network construction and covariance estimation live in the
//! surrounding pipeline; this crate consumes their outputs as plain numeric
//! arrays and produces plain numeric rasters.

pub mod core;
pub mod types;

// Re-export main types and functions for easier access
pub use types::{
    CovarianceMatrix, Interferogram, NetworkMask, ObservationStack, PhaseImage, PixelEstimate,
    Raster, Real, StackError, StackProduct, StackResult,
};

pub use core::{LinearRateEstimator, LinearRateParams};
